use std::sync::Arc;

use log::debug;

use super::operands::Op;
use super::params::Config;
use super::{Contract, ExecError};
use crate::common::{Address, Genesis, TxHash, U256};
use crate::ledger::LedgerIndex;
use crate::register::{
    Object, ObjectError, RegisterType, Standard, State, StateTag, Value,
};
use crate::store::{Flags, RegisterStore, StoreError};
use crate::stream::Stream;

/// Register records of one contract. A contract with an empty register stream gets fresh
/// records; one that already carries them (relayed, or replayed from a block) has every record
/// checked against the store instead.
enum Tape {
    Build(Stream),
    Verify(Stream),
}

impl Tape {
    fn new(register: &Stream) -> Self {
        if register.is_empty() {
            Tape::Build(Stream::new())
        } else {
            let mut s = register.clone();
            s.reset();
            Tape::Verify(s)
        }
    }

    fn pre_state(&mut self, state: &State) -> Result<(), ExecError> {
        match self {
            Tape::Build(s) => {
                s.write(&(StateTag::PreState as u8)).write(state);
            }
            Tape::Verify(s) => {
                let tag: u8 = s.read()?;
                if tag != StateTag::PreState as u8 {
                    return Err(ExecError::PreStateMissing)
                }
                if &s.read::<State>()? != state {
                    return Err(ExecError::PreStateMismatch)
                }
            }
        }
        Ok(())
    }

    fn post_state(&mut self, state: &State) -> Result<(), ExecError> {
        match self {
            Tape::Build(s) => {
                s.write(&(StateTag::PostState as u8)).write(&state.checksum);
            }
            Tape::Verify(s) => {
                let tag: u8 = s.read()?;
                if tag != StateTag::PostState as u8 {
                    return Err(ExecError::BadTag(tag))
                }
                if s.read::<u64>()? != state.checksum {
                    return Err(ExecError::PostStateMismatch)
                }
            }
        }
        Ok(())
    }

    /// Bare `POSTSTATE` record of a contract that touches no register. A pool marker may be
    /// replayed once into a block; any other repeat is rejected.
    fn mark(&mut self, flags: Flags) -> Result<(), ExecError> {
        match self {
            Tape::Build(s) => {
                s.write(&(StateTag::PostState as u8)).write(&marker(flags));
            }
            Tape::Verify(s) => {
                let tag: u8 = s.read()?;
                if tag != StateTag::PostState as u8 {
                    return Err(ExecError::BadTag(tag))
                }
                let found: u64 = s.read()?;
                s.expect_end()?;
                if flags == Flags::Mempool || found != marker(Flags::Mempool) {
                    return Err(ExecError::AlreadyExecuted)
                }
                let mut s = Stream::new();
                s.write(&(StateTag::PostState as u8))
                    .write(&marker(Flags::Block));
                *self = Tape::Build(s);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Stream, ExecError> {
        match self {
            Tape::Build(s) => Ok(s),
            Tape::Verify(mut s) => {
                s.expect_end()?;
                s.reset();
                Ok(s)
            }
        }
    }
}

/// Checksum slot of a bare marker record: the context it was written in.
pub(super) fn marker(flags: Flags) -> u64 {
    match flags {
        Flags::Mempool => 0,
        Flags::Block => 1,
    }
}

/// What a handler knows about the contract being evaluated.
pub(super) struct Ctx {
    pub caller: Genesis,
    pub txid: TxHash,
    pub index: u32,
    pub timestamp: u64,
    pub flags: Flags,
}

impl Ctx {
    pub(super) fn new(contract: &Contract, flags: Flags) -> Self {
        Self {
            caller: contract.caller.clone(),
            txid: contract.txid.clone(),
            index: contract.index,
            timestamp: contract.timestamp,
            flags,
        }
    }
}

/// Applies and reverses contracts against a register store. The store and the transaction index
/// are shared handles, so one engine per evaluation context is cheap to build.
pub struct Engine<S, L> {
    pub(super) store: Arc<S>,
    pub(super) ledger: Arc<L>,
    pub(super) config: Config,
}

impl<S: RegisterStore, L: LedgerIndex> Engine<S, L> {
    pub fn new(store: Arc<S>, ledger: Arc<L>, config: Config) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply one contract. All store writes happen inside one batch that is aborted on any
    /// failure, so a failed contract leaves nothing behind.
    pub fn execute(
        &self, contract: &mut Contract, flags: Flags,
    ) -> Result<(), ExecError> {
        contract.reset();
        let op = Op::decode(&mut contract.ops)?;
        let ctx = Ctx::new(contract, flags);
        let mut tape = Tape::new(&contract.register);
        self.store.txn_begin();
        let res = self
            .apply(&op, &ctx, &mut tape)
            .and_then(|_| tape.finish());
        match res {
            Ok(register) => {
                self.store.txn_commit()?;
                contract.register = register;
                debug!(
                    "executed {:?} of {}:{} ({:?})",
                    op.opcode(),
                    ctx.txid,
                    ctx.index,
                    flags
                );
                Ok(())
            }
            Err(e) => {
                self.store.txn_abort();
                debug!(
                    "{:?} of {}:{} failed: {}",
                    op.opcode(),
                    ctx.txid,
                    ctx.index,
                    e
                );
                Err(e)
            }
        }
    }

    fn apply(&self, op: &Op, ctx: &Ctx, tape: &mut Tape) -> Result<(), ExecError> {
        match op {
            Op::Write { address, data } => self.write(address, data, ctx, tape),
            Op::Create {
                address,
                kind,
                data,
            } => self.create(address, *kind, data, ctx, tape),
            Op::Append { address, data } => {
                self.append(address, data, ctx, tape)
            }
            Op::Transfer { address, to } => {
                self.transfer(address, to, ctx, tape)
            }
            Op::Claim {
                txid,
                contract,
                address,
            } => self.claim(txid, *contract, address, ctx, tape),
            Op::Debit { from, to, amount } => {
                self.debit(from, to, *amount, ctx, tape)
            }
            Op::Credit {
                txid,
                contract,
                proof,
                to,
                amount,
            } => self.credit(txid, *contract, proof, to, *amount, ctx, tape),
            Op::Coinbase { amount, .. } => match amount {
                0 => Err(ExecError::ZeroAmount),
                _ => tape.mark(ctx.flags),
            },
            Op::Trust { score, reward, .. } => {
                self.trust(*score, *reward, ctx, tape)
            }
            Op::Genesis { address, reward } => {
                self.genesis(address, *reward, ctx, tape)
            }
            Op::Stake { amount } => self.stake(*amount, ctx, tape),
            Op::Unstake { amount, penalty } => {
                self.unstake(*amount, *penalty, ctx, tape)
            }
            Op::Authorize { genesis, .. } => {
                if !self.config.private_mode {
                    return Err(ExecError::PrivateModeOnly)
                }
                if genesis != &ctx.caller {
                    return Err(ExecError::AuthorizeMismatch)
                }
                tape.mark(ctx.flags)
            }
            Op::Legacy {
                from,
                amount,
                script,
            } => self.legacy(from, *amount, script, ctx, tape),
            Op::Condition(inner) => self.apply(inner, ctx, tape),
            Op::Validate {
                txid,
                contract,
                op: inner,
            } => {
                let source =
                    self.ledger.read_contract(txid, *contract, ctx.flags)?;
                if !matches!(source.decode()?, Op::Condition(_)) {
                    return Err(ExecError::BadSource("condition"))
                }
                if self.store.has_validated(txid, *contract, ctx.flags) {
                    return Err(ExecError::AlreadyValidated)
                }
                self.apply(inner, ctx, tape)?;
                self.store.write_validated(txid, *contract, ctx.flags)?;
                Ok(())
            }
        }
    }

    pub(super) fn read(
        &self, addr: &Address, flags: Flags,
    ) -> Result<State, ExecError> {
        match self.store.read_state(addr, flags) {
            Ok(state) => Ok(state),
            Err(StoreError::NotFound(_)) => {
                Err(ExecError::MissingRegister(addr.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_owned(&self, addr: &Address, ctx: &Ctx) -> Result<State, ExecError> {
        let state = self.read(addr, ctx.flags)?;
        if !state.is_owned_by(&ctx.caller) {
            return Err(ExecError::NotOwner(addr.clone()))
        }
        Ok(state)
    }

    pub(super) fn read_trust(&self, ctx: &Ctx) -> Result<State, ExecError> {
        if !self.store.has_trust(&ctx.caller, ctx.flags) {
            return Err(ExecError::TrustMissing)
        }
        let state = self.store.read_trust(&ctx.caller, ctx.flags)?;
        if state.object()?.standard() != Standard::Trust {
            return Err(ExecError::NotStandard("trust"))
        }
        Ok(state)
    }

    pub(super) fn read_claimed(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<Option<u64>, ExecError> {
        match self.store.read_claimed(txid, contract, flags) {
            Ok(n) => Ok(Some(n)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update_object<F>(&self, state: &State, f: F) -> Result<State, ExecError>
    where
        F: FnOnce(&mut Object) -> Result<(), ObjectError>,
    {
        let mut obj = state.object()?;
        f(&mut obj)?;
        let mut post = state.clone();
        post.data = obj.to_bytes();
        Ok(post)
    }

    fn seal(&self, post: &mut State, ctx: &Ctx) {
        post.modified = ctx.timestamp;
        post.set_checksum();
    }

    /// Record `pre`, then write `post` and record its checksum.
    fn commit(
        &self, addr: &Address, pre: &State, mut post: State, ctx: &Ctx,
        tape: &mut Tape,
    ) -> Result<(), ExecError> {
        tape.pre_state(pre)?;
        self.seal(&mut post, ctx);
        self.store.write_state(addr, &post, ctx.flags)?;
        tape.post_state(&post)
    }

    fn commit_trust(
        &self, pre: &State, mut post: State, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        tape.pre_state(pre)?;
        self.seal(&mut post, ctx);
        self.store.write_trust(&ctx.caller, &post, ctx.flags)?;
        tape.post_state(&post)
    }

    fn write(
        &self, addr: &Address, data: &[u8], ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let pre = self.read_owned(addr, ctx)?;
        let post = match pre.kind {
            RegisterType::Raw => {
                let mut post = pre.clone();
                post.data = data.to_vec();
                post
            }
            RegisterType::Object => {
                if pre.object()?.standard() != Standard::Base {
                    return Err(ExecError::NotStandard("non-standard"))
                }
                // a sequence of (name, value) updates
                let mut updates = Stream::from_bytes(data.to_vec());
                let mut obj = pre.object()?;
                while !updates.at_end() {
                    let name: String = updates.read()?;
                    let value: Value = updates.read()?;
                    obj.set(&name, value)?;
                }
                let mut post = pre.clone();
                post.data = obj.to_bytes();
                post
            }
            kind => return Err(ExecError::WrongType(kind)),
        };
        self.commit(addr, &pre, post, ctx, tape)
    }

    fn append(
        &self, addr: &Address, data: &[u8], ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let pre = self.read_owned(addr, ctx)?;
        match pre.kind {
            RegisterType::Raw | RegisterType::Append => (),
            kind => return Err(ExecError::WrongType(kind)),
        }
        let mut post = pre.clone();
        post.data.extend_from_slice(data);
        self.commit(addr, &pre, post, ctx, tape)
    }

    fn create(
        &self, addr: &Address, kind: RegisterType, data: &[u8], ctx: &Ctx,
        tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let flags = ctx.flags;
        if self.store.has_state(addr, flags) {
            return Err(ExecError::AddressInUse(addr.clone()))
        }
        match kind {
            RegisterType::System => return Err(ExecError::WrongType(kind)),
            RegisterType::Object => {
                let obj = Object::from_bytes(data)?;
                match obj.standard() {
                    Standard::Token => {
                        let id = obj.get_u256("token")?;
                        if id.is_zero() || self.store.has_identifier(&id, flags)
                        {
                            return Err(ExecError::IdentifierInUse)
                        }
                        if obj.get_u64("balance")? != obj.get_u64("supply")? {
                            return Err(ExecError::SupplyMismatch)
                        }
                        self.store.write_identifier(&id, addr, flags)?;
                    }
                    Standard::Account => {
                        if obj.get_u64("balance")? != 0 {
                            return Err(ExecError::NonEmptyAccount)
                        }
                        let id = obj.get_u256("token")?;
                        if !id.is_zero() && !self.store.has_identifier(&id, flags)
                        {
                            return Err(ExecError::UnknownToken)
                        }
                    }
                    Standard::Trust => {
                        for field in ["balance", "trust", "stake"] {
                            if obj.get_u64(field)? != 0 {
                                return Err(ExecError::NonEmptyAccount)
                            }
                        }
                        if !obj.get_u256("token")?.is_zero() {
                            return Err(ExecError::TokenMismatch)
                        }
                    }
                    Standard::Base => (),
                }
            }
            _ => (),
        }
        let state =
            State::new(kind, ctx.caller.clone(), ctx.timestamp, data.to_vec());
        self.store.write_state(addr, &state, flags)?;
        tape.post_state(&state)
    }

    fn transfer(
        &self, addr: &Address, to: &Genesis, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let pre = self.read_owned(addr, ctx)?;
        match pre.kind {
            RegisterType::Readonly | RegisterType::System => {
                return Err(ExecError::WrongType(pre.kind))
            }
            RegisterType::Object => {
                if pre.object()?.standard() == Standard::Trust {
                    return Err(ExecError::NotStandard("transferable"))
                }
            }
            _ => (),
        }
        let mut post = pre.clone();
        post.owner = Genesis::zero().clone();
        self.commit(addr, &pre, post, ctx, tape)?;
        self.store.write_event(to, &ctx.txid, ctx.index, ctx.flags)?;
        Ok(())
    }

    fn claim(
        &self, txid: &TxHash, n: u32, addr: &Address, ctx: &Ctx,
        tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let flags = ctx.flags;
        let source = self.ledger.read_contract(txid, n, flags)?;
        let recipient = match source.decode()? {
            Op::Transfer { address, to } if &address == addr => to,
            _ => return Err(ExecError::BadSource("transfer")),
        };
        // the recipient claims, or the sender claims back
        if ctx.caller != recipient && &ctx.caller != source.caller() {
            return Err(ExecError::NotRecipient)
        }
        if self.store.has_proof(addr, txid, n, flags) {
            return Err(ExecError::AlreadyClaimed)
        }
        let pre = self.read(addr, flags)?;
        if !pre.owner.is_zero() {
            return Err(ExecError::NotPending)
        }
        let mut post = pre.clone();
        post.owner = ctx.caller.clone();
        self.commit(addr, &pre, post, ctx, tape)?;
        self.store.write_proof(addr, txid, n, flags)?;
        Ok(())
    }

    fn debit(
        &self, from: &Address, to: &Address, amount: u64, ctx: &Ctx,
        tape: &mut Tape,
    ) -> Result<(), ExecError> {
        if amount == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let pre = self.read_owned(from, ctx)?;
        let obj = pre.object()?;
        if !obj.standard().has_balance() {
            return Err(ExecError::NotStandard("account"))
        }
        let balance = obj.get_u64("balance")?;
        if balance < amount {
            return Err(ExecError::InsufficientBalance { balance, amount })
        }
        let dest = self.read(to, ctx.flags)?;
        let post = self.update_object(&pre, |o| o.sub_u64("balance", amount))?;
        self.commit(from, &pre, post, ctx, tape)?;
        self.store
            .write_event(&dest.owner, &ctx.txid, ctx.index, ctx.flags)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn credit(
        &self, txid: &TxHash, n: u32, proof: &Address, to: &Address,
        amount: u64, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let flags = ctx.flags;
        if amount == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let source = self.ledger.read_contract(txid, n, flags)?;
        let (limit, token) = match source.decode()? {
            Op::Debit {
                from,
                to: dest,
                amount: debited,
            } => {
                if &from != proof {
                    return Err(ExecError::BadSource("debit"))
                }
                let claim_back = to == &from && &ctx.caller == source.caller();
                if &dest != to && !claim_back {
                    return Err(ExecError::NotRecipient)
                }
                let token = self.read(&from, flags)?.object()?.get_u256("token")?;
                (debited, token)
            }
            Op::Coinbase {
                genesis,
                amount: mined,
                ..
            } => {
                if genesis != ctx.caller || proof != &Address::from(&genesis) {
                    return Err(ExecError::NotRecipient)
                }
                (mined, U256::zero())
            }
            _ => return Err(ExecError::BadSource("debit")),
        };
        if self.store.has_proof(proof, txid, n, flags) {
            return Err(ExecError::AlreadyClaimed)
        }
        let claimed = self.read_claimed(txid, n, flags)?.unwrap_or(0);
        let total = claimed
            .checked_add(amount)
            .filter(|total| *total <= limit)
            .ok_or(ExecError::ClaimOverflow {
                claimed,
                amount,
                limit,
            })?;
        let pre = self.read_owned(to, ctx)?;
        let obj = pre.object()?;
        if !obj.standard().has_balance() {
            return Err(ExecError::NotStandard("account"))
        }
        if obj.get_u256("token")? != token {
            return Err(ExecError::TokenMismatch)
        }
        let post = self.update_object(&pre, |o| o.add_u64("balance", amount))?;
        self.commit(to, &pre, post, ctx, tape)?;
        self.store.write_claimed(txid, n, total, flags)?;
        if total == limit {
            self.store.write_proof(proof, txid, n, flags)?;
        }
        Ok(())
    }

    fn trust(
        &self, score: u64, reward: u64, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        let pre = self.read_trust(ctx)?;
        if pre.object()?.get_u64("stake")? == 0 {
            return Err(ExecError::NoStake)
        }
        let post = self.update_object(&pre, |o| {
            o.set("trust", Value::U64(score))?;
            o.add_u64("balance", reward)
        })?;
        self.commit_trust(&pre, post, ctx, tape)
    }

    fn genesis(
        &self, addr: &Address, reward: u64, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        if self.store.has_trust(&ctx.caller, ctx.flags) {
            return Err(ExecError::TrustIndexed)
        }
        let pre = self.read_owned(addr, ctx)?;
        let obj = pre.object()?;
        if obj.standard() != Standard::Trust {
            return Err(ExecError::NotStandard("trust"))
        }
        if obj.get_u64("trust")? != 0 || obj.get_u64("stake")? != 0 {
            return Err(ExecError::TrustNotEmpty)
        }
        let balance = obj.get_u64("balance")?;
        if balance == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let post = self.update_object(&pre, |o| {
            o.set("stake", Value::U64(balance))?;
            o.set("balance", Value::U64(reward))
        })?;
        self.commit(addr, &pre, post, ctx, tape)?;
        self.store.index_trust(&ctx.caller, addr, ctx.flags)?;
        Ok(())
    }

    fn stake(
        &self, amount: u64, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        if amount == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let pre = self.read_trust(ctx)?;
        let balance = pre.object()?.get_u64("balance")?;
        if balance < amount {
            return Err(ExecError::InsufficientBalance { balance, amount })
        }
        let post = self.update_object(&pre, |o| {
            o.sub_u64("balance", amount)?;
            o.add_u64("stake", amount)
        })?;
        self.commit_trust(&pre, post, ctx, tape)
    }

    fn unstake(
        &self, amount: u64, penalty: u64, ctx: &Ctx, tape: &mut Tape,
    ) -> Result<(), ExecError> {
        if amount == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let pre = self.read_trust(ctx)?;
        let obj = pre.object()?;
        let stake = obj.get_u64("stake")?;
        if stake < amount {
            return Err(ExecError::InsufficientStake { stake, amount })
        }
        let trust = obj.get_u64("trust")?;
        if trust < penalty {
            return Err(ExecError::InsufficientTrust { trust, penalty })
        }
        let post = self.update_object(&pre, |o| {
            o.sub_u64("stake", amount)?;
            o.add_u64("balance", amount)?;
            o.sub_u64("trust", penalty)
        })?;
        self.commit_trust(&pre, post, ctx, tape)
    }

    fn legacy(
        &self, from: &Address, amount: u64, script: &[u8], ctx: &Ctx,
        tape: &mut Tape,
    ) -> Result<(), ExecError> {
        if script.is_empty() {
            return Err(ExecError::EmptyScript)
        }
        if amount == 0 {
            return Err(ExecError::ZeroAmount)
        }
        let pre = self.read_owned(from, ctx)?;
        let obj = pre.object()?;
        if !obj.standard().has_balance() {
            return Err(ExecError::NotStandard("account"))
        }
        if !obj.get_u256("token")?.is_zero() {
            return Err(ExecError::TokenMismatch)
        }
        let balance = obj.get_u64("balance")?;
        if balance < amount {
            return Err(ExecError::InsufficientBalance { balance, amount })
        }
        let post = self.update_object(&pre, |o| o.sub_u64("balance", amount))?;
        self.commit(from, &pre, post, ctx, tape)
    }
}
