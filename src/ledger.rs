//! Transactions and the sigchain index.
//!
//! Every genesis id owns a singly linked list of transactions (its sigchain). The index keeps the
//! first and last hash of each chain, and every indexed transaction points forward to its
//! successor through `next_tx`, so that the chain can be walked and unwound in both directions.

use std::collections::HashMap;

use log::{debug, info, warn};
use parking_lot::RwLock;
use primitive_types::H256;

use crate::common::{unified_timestamp, Genesis, TxHash};
use crate::core::params::{MAX_CONTRACTS, TX_VERSION};
use crate::core::{Contract, Engine, ExecError, Op, Opcode};
use crate::guarded::{Credentials, Guarded};
use crate::store::{Flags, RegisterStore, StoreError};
use crate::stream::Stream;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transaction has no contracts")]
    Empty,
    #[error("too many contracts ({0})")]
    TooManyContracts(usize),
    #[error("first transaction needs sequence 0 and a null previous hash")]
    FirstMismatch,
    #[error("unsupported transaction version {0}")]
    Version(u32),
    #[error("sigchain broken: expected {expected}, found {found}")]
    Broken { expected: TxHash, found: TxHash },
    #[error("sigchain sequence exhausted")]
    Exhausted,
    #[error("credentials are sealed")]
    Sealed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxStatus {
    Pending,
    Accepted,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transaction {
    pub version: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub genesis: Genesis,
    pub prev: TxHash,
    /// Commitment to the key that signs the next transaction of the sigchain.
    pub next_hash: H256,
    pub contracts: Vec<Contract>,
    pub status: TxStatus,
    /// Forward link, set once the successor is indexed.
    pub next_tx: TxHash,
}

impl Transaction {
    pub fn new(
        genesis: Genesis, sequence: u32, prev: TxHash, timestamp: u64,
    ) -> Self {
        Self {
            version: TX_VERSION,
            sequence,
            timestamp,
            genesis,
            prev,
            next_hash: H256::zero(),
            contracts: Vec::new(),
            status: TxStatus::Pending,
            next_tx: TxHash::zero().clone(),
        }
    }

    pub fn push(&mut self, op: &Op) -> &mut Self {
        self.contracts.push(Contract::from_op(op));
        self
    }

    /// Keccak-512 over the header and the operation streams. Register streams are left out, so
    /// executing the contracts never changes the hash.
    pub fn hash(&self) -> TxHash {
        let mut s = Stream::new();
        s.write(&self.version)
            .write(&self.sequence)
            .write(&self.timestamp)
            .write(&self.genesis)
            .write(&self.prev)
            .write_raw(self.next_hash.as_bytes());
        for contract in self.contracts.iter() {
            s.write(contract.ops().as_bytes());
        }
        TxHash::hash(s.as_bytes())
    }

    /// Bind the transaction context into every contract.
    pub fn bind(&mut self) {
        let hash = self.hash();
        for (i, contract) in self.contracts.iter_mut().enumerate() {
            contract.bind(&self.genesis, self.timestamp, &hash, i as u32);
        }
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.prev.is_zero() && self.sequence == 0
    }

    fn leading(&self) -> Option<Opcode> {
        self.contracts.first().and_then(|c| c.opcode())
    }

    pub fn is_coinbase(&self) -> bool {
        self.leading() == Some(Opcode::Coinbase)
    }

    pub fn is_coinstake(&self) -> bool {
        self.leading() == Some(Opcode::Trust)
    }

    pub fn is_legacy(&self) -> bool {
        self.contracts
            .iter()
            .any(|c| c.opcode() == Some(Opcode::Legacy))
    }

    /// Structural rules that need no state.
    pub fn check(&self) -> Result<(), LedgerError> {
        if self.version != TX_VERSION {
            return Err(LedgerError::Version(self.version))
        }
        if self.contracts.is_empty() {
            return Err(LedgerError::Empty)
        }
        if self.contracts.len() > MAX_CONTRACTS {
            return Err(LedgerError::TooManyContracts(self.contracts.len()))
        }
        if self.prev.is_zero() != (self.sequence == 0) {
            return Err(LedgerError::FirstMismatch)
        }
        for contract in self.contracts.iter() {
            contract.decode()?;
        }
        Ok(())
    }

    /// Execute all contracts or none: a failing contract rolls back the ones before it.
    pub fn connect<S: RegisterStore, L: LedgerIndex>(
        &mut self, engine: &Engine<S, L>, flags: Flags,
    ) -> Result<(), LedgerError> {
        self.bind();
        let hash = self.hash();
        for i in 0..self.contracts.len() {
            if let Err(e) = engine.execute(&mut self.contracts[i], flags) {
                warn!("contract {} of {} failed: {}", i, hash, e);
                for j in (0..i).rev() {
                    if let Err(e) = engine.rollback(&mut self.contracts[j], flags)
                    {
                        warn!("cannot roll back contract {} of {}: {}", j, hash, e);
                    }
                }
                return Err(e.into())
            }
        }
        debug!("connected {} ({:?})", hash, flags);
        Ok(())
    }

    /// Roll back all contracts in reverse order, stopping at the first failure.
    pub fn disconnect<S: RegisterStore, L: LedgerIndex>(
        &mut self, engine: &Engine<S, L>, flags: Flags,
    ) -> Result<(), LedgerError> {
        self.bind();
        for contract in self.contracts.iter_mut().rev() {
            engine.rollback(contract, flags)?;
        }
        debug!("disconnected {} ({:?})", self.hash(), flags);
        Ok(())
    }

    /// Commit the transaction to the sigchain index.
    pub fn index<L: LedgerIndex + ?Sized>(
        &mut self, ledger: &L, hash: &TxHash,
    ) -> Result<(), LedgerError> {
        self.status = TxStatus::Accepted;
        if self.is_first() {
            ledger.write_first(&self.genesis, hash)?;
        } else {
            let last = ledger.read_last(&self.genesis)?;
            if last != self.prev {
                return Err(LedgerError::Broken {
                    expected: last,
                    found: self.prev.clone(),
                })
            }
            let mut prev = ledger.read_tx(&self.prev, Flags::Block)?;
            prev.next_tx = hash.clone();
            ledger.write_tx(&self.prev, &prev)?;
        }
        ledger.write_tx(hash, self)?;
        ledger.write_last(&self.genesis, hash)?;
        info!("indexed {} (sequence {})", hash, self.sequence);
        Ok(())
    }

    /// Reverse of [Transaction::index]; only the last transaction of a sigchain can be deleted.
    pub fn delete<L: LedgerIndex + ?Sized>(
        &mut self, ledger: &L, hash: &TxHash,
    ) -> Result<(), LedgerError> {
        let last = ledger.read_last(&self.genesis)?;
        if &last != hash {
            return Err(LedgerError::Broken {
                expected: last,
                found: hash.clone(),
            })
        }
        if self.is_first() {
            ledger.erase_first(&self.genesis)?;
            ledger.erase_last(&self.genesis)?;
        } else {
            let mut prev = ledger.read_tx(&self.prev, Flags::Block)?;
            prev.next_tx = TxHash::zero().clone();
            ledger.write_tx(&self.prev, &prev)?;
            ledger.write_last(&self.genesis, &self.prev)?;
        }
        ledger.erase_tx(hash)?;
        self.status = TxStatus::Pending;
        info!("deleted {} (sequence {})", hash, self.sequence);
        Ok(())
    }

    /// Start the next transaction of `genesis`'s sigchain, or its first one.
    pub fn create<L: LedgerIndex + ?Sized>(
        ledger: &L, genesis: &Genesis, credentials: &Guarded<Credentials>,
    ) -> Result<Self, LedgerError> {
        let (sequence, prev) = match ledger.read_last(genesis) {
            Ok(last) => {
                let tx = ledger.read_tx(&last, Flags::Block)?;
                let sequence =
                    tx.sequence.checked_add(1).ok_or(LedgerError::Exhausted)?;
                (sequence, last)
            }
            Err(StoreError::NotFound(_)) => (0, TxHash::zero().clone()),
            Err(e) => return Err(e.into()),
        };
        let mut tx = Self::new(
            genesis.clone(),
            sequence,
            prev,
            unified_timestamp(),
        );
        let access = credentials.access();
        tx.next_hash = access
            .get()
            .generate(sequence.wrapping_add(1))
            .ok_or(LedgerError::Sealed)?;
        Ok(tx)
    }
}

/// The transaction index.
pub trait LedgerIndex: Send + Sync {
    fn read_tx(
        &self, hash: &TxHash, flags: Flags,
    ) -> Result<Transaction, StoreError>;
    fn write_tx(&self, hash: &TxHash, tx: &Transaction)
        -> Result<(), StoreError>;
    fn erase_tx(&self, hash: &TxHash) -> Result<(), StoreError>;
    fn has_tx(&self, hash: &TxHash, flags: Flags) -> bool;

    fn read_last(&self, genesis: &Genesis) -> Result<TxHash, StoreError>;
    fn write_last(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError>;
    fn erase_last(&self, genesis: &Genesis) -> Result<(), StoreError>;

    fn read_first(&self, genesis: &Genesis) -> Result<TxHash, StoreError>;
    fn write_first(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError>;
    fn erase_first(&self, genesis: &Genesis) -> Result<(), StoreError>;

    /// Contract `n` of transaction `txid`, bound to its transaction.
    fn read_contract(
        &self, txid: &TxHash, n: u32, flags: Flags,
    ) -> Result<Contract, StoreError> {
        let tx = self.read_tx(txid, flags)?;
        let mut contract = tx
            .contracts
            .get(n as usize)
            .cloned()
            .ok_or(StoreError::NotFound("contract"))?;
        contract.bind(&tx.genesis, tx.timestamp, txid, n);
        Ok(contract)
    }
}

#[derive(Default)]
struct MemLedgerInner {
    txs: HashMap<TxHash, Transaction>,
    last: HashMap<Genesis, TxHash>,
    first: HashMap<Genesis, TxHash>,
}

/// In-memory [LedgerIndex].
#[derive(Default)]
pub struct MemLedger(RwLock<MemLedgerInner>);

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn erase<K, V>(
    map: &mut HashMap<K, V>, key: &K, what: &'static str,
) -> Result<(), StoreError>
where
    K: std::hash::Hash + Eq,
{
    map.remove(key).map(|_| ()).ok_or(StoreError::NotFound(what))
}

impl LedgerIndex for MemLedger {
    fn read_tx(
        &self, hash: &TxHash, _flags: Flags,
    ) -> Result<Transaction, StoreError> {
        self.0
            .read()
            .txs
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound("transaction"))
    }

    fn write_tx(
        &self, hash: &TxHash, tx: &Transaction,
    ) -> Result<(), StoreError> {
        self.0.write().txs.insert(hash.clone(), tx.clone());
        Ok(())
    }

    fn erase_tx(&self, hash: &TxHash) -> Result<(), StoreError> {
        erase(&mut self.0.write().txs, hash, "transaction")
    }

    fn has_tx(&self, hash: &TxHash, _flags: Flags) -> bool {
        self.0.read().txs.contains_key(hash)
    }

    fn read_last(&self, genesis: &Genesis) -> Result<TxHash, StoreError> {
        self.0
            .read()
            .last
            .get(genesis)
            .cloned()
            .ok_or(StoreError::NotFound("last"))
    }

    fn write_last(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError> {
        self.0.write().last.insert(genesis.clone(), hash.clone());
        Ok(())
    }

    fn erase_last(&self, genesis: &Genesis) -> Result<(), StoreError> {
        erase(&mut self.0.write().last, genesis, "last")
    }

    fn read_first(&self, genesis: &Genesis) -> Result<TxHash, StoreError> {
        self.0
            .read()
            .first
            .get(genesis)
            .cloned()
            .ok_or(StoreError::NotFound("first"))
    }

    fn write_first(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError> {
        self.0.write().first.insert(genesis.clone(), hash.clone());
        Ok(())
    }

    fn erase_first(&self, genesis: &Genesis) -> Result<(), StoreError> {
        erase(&mut self.0.write().first, genesis, "first")
    }
}
