use log::debug;

use super::exec::{marker, Ctx, Engine};
use super::opcode::Opcode;
use super::operands::Op;
use super::{Contract, ExecError};
use crate::common::Address;
use crate::ledger::LedgerIndex;
use crate::register::{Object, RegisterType, Standard, State, StateTag};
use crate::store::{Flags, RegisterStore};
use crate::stream::Stream;

/// The register records left in a contract by its execution.
struct Undo {
    pre: Option<State>,
    post: u64,
}

impl Undo {
    fn read(register: &Stream, with_pre: bool) -> Result<Self, ExecError> {
        if register.is_empty() {
            return Err(ExecError::NotExecuted)
        }
        let mut s = register.clone();
        s.reset();
        let pre = if with_pre {
            let tag: u8 = s.read()?;
            if tag != StateTag::PreState as u8 {
                return Err(ExecError::PreStateMissing)
            }
            Some(s.read::<State>()?)
        } else {
            None
        };
        let tag: u8 = s.read()?;
        if tag != StateTag::PostState as u8 {
            return Err(ExecError::BadTag(tag))
        }
        let post = s.read()?;
        s.expect_end()?;
        Ok(Self { pre, post })
    }

    fn pre(&self) -> Result<&State, ExecError> {
        self.pre.as_ref().ok_or(ExecError::PreStateMissing)
    }
}

impl<S: RegisterStore, L: LedgerIndex> Engine<S, L> {
    /// Reverse a previously executed contract. On success the register stream is cleared, so
    /// the contract reads as never executed.
    pub fn rollback(
        &self, contract: &mut Contract, flags: Flags,
    ) -> Result<(), ExecError> {
        contract.reset();
        let op = Op::decode(&mut contract.ops)?;
        let ctx = Ctx::new(contract, flags);
        let with_pre =
            op.mutates() && op.primitive().opcode() != Opcode::Create;
        let undo = Undo::read(&contract.register, with_pre)?;
        self.store.txn_begin();
        match self.revert(&op, &ctx, &undo) {
            Ok(()) => {
                self.store.txn_commit()?;
                contract.register = Stream::new();
                debug!(
                    "rolled back {:?} of {}:{} ({:?})",
                    op.opcode(),
                    ctx.txid,
                    ctx.index,
                    flags
                );
                Ok(())
            }
            Err(e) => {
                self.store.txn_abort();
                Err(e)
            }
        }
    }

    fn revert(
        &self, op: &Op, ctx: &Ctx, undo: &Undo,
    ) -> Result<(), ExecError> {
        let flags = ctx.flags;
        match op {
            Op::Write { address, .. } | Op::Append { address, .. } => {
                self.restore(address, undo, ctx)
            }
            Op::Create {
                address,
                kind,
                data,
            } => {
                if self.read(address, flags)?.checksum != undo.post {
                    return Err(ExecError::PostStateMismatch)
                }
                if *kind == RegisterType::Object {
                    let obj = Object::from_bytes(data)?;
                    if obj.standard() == Standard::Token {
                        let id = obj.get_u256("token")?;
                        self.store.erase_identifier(&id, flags)?;
                    }
                }
                self.store.erase_state(address, flags)?;
                Ok(())
            }
            Op::Transfer { address, to } => {
                self.restore(address, undo, ctx)?;
                self.store.erase_event(to, &ctx.txid, ctx.index, flags)?;
                Ok(())
            }
            Op::Claim {
                txid,
                contract,
                address,
            } => {
                self.restore(address, undo, ctx)?;
                self.store.erase_proof(address, txid, *contract, flags)?;
                Ok(())
            }
            Op::Debit { from, to, .. } => {
                self.restore(from, undo, ctx)?;
                let owner = self.read(to, flags)?.owner;
                self.store.erase_event(&owner, &ctx.txid, ctx.index, flags)?;
                Ok(())
            }
            Op::Credit {
                txid,
                contract,
                proof,
                to,
                amount,
            } => {
                self.restore(to, undo, ctx)?;
                let remain = self
                    .read_claimed(txid, *contract, flags)?
                    .and_then(|claimed| claimed.checked_sub(*amount))
                    .ok_or(ExecError::ClaimUnderflow)?;
                if self.store.has_proof(proof, txid, *contract, flags) {
                    self.store.erase_proof(proof, txid, *contract, flags)?;
                }
                if remain == 0 {
                    self.store.erase_claimed(txid, *contract, flags)?;
                } else {
                    self.store.write_claimed(txid, *contract, remain, flags)?;
                }
                Ok(())
            }
            Op::Trust { .. } | Op::Stake { .. } | Op::Unstake { .. } => {
                let current = self.read_trust(ctx)?;
                if current.checksum != undo.post {
                    return Err(ExecError::PostStateMismatch)
                }
                self.store.write_trust(&ctx.caller, undo.pre()?, flags)?;
                Ok(())
            }
            Op::Genesis { address, .. } => {
                self.restore(address, undo, ctx)?;
                self.store.erase_trust(&ctx.caller, flags)?;
                Ok(())
            }
            Op::Legacy { from, .. } => self.restore(from, undo, ctx),
            Op::Coinbase { .. } | Op::Authorize { .. } => {
                if undo.post != marker(Flags::Mempool) &&
                    undo.post != marker(Flags::Block)
                {
                    return Err(ExecError::PostStateMismatch)
                }
                Ok(())
            }
            Op::Condition(inner) => self.revert(inner, ctx, undo),
            Op::Validate {
                txid,
                contract,
                op: inner,
            } => {
                if !self.store.has_validated(txid, *contract, flags) {
                    return Err(ExecError::NotExecuted)
                }
                self.revert(inner, ctx, undo)?;
                self.store.erase_validated(txid, *contract, flags)?;
                Ok(())
            }
        }
    }

    /// Put the recorded pre-state back, provided the register still holds the recorded
    /// post-state.
    fn restore(
        &self, addr: &Address, undo: &Undo, ctx: &Ctx,
    ) -> Result<(), ExecError> {
        let pre = undo.pre()?;
        if self.read(addr, ctx.flags)?.checksum != undo.post {
            return Err(ExecError::PostStateMismatch)
        }
        self.store.write_state(addr, pre, ctx.flags)?;
        Ok(())
    }
}
