//! Pool of pending transactions.
//!
//! A transaction is admitted once its contracts executed cleanly against the pending overlay of
//! the register store (`Flags::Mempool`). Transactions that arrive before their predecessor wait
//! as orphans keyed by the missing hash and are promoted once it shows up. A predecessor can be
//! built on at most once, which is tracked by the conflict set.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;

use crate::common::{unified_timestamp, Genesis, TxHash};
use crate::core::{Config, Engine, ExecError};
use crate::ledger::{LedgerError, LedgerIndex, Transaction};
use crate::store::{Flags, RegisterStore, StoreError};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InvKind {
    Transaction,
    Block,
}

/// The node a transaction was relayed from.
pub trait Peer {
    /// Ask for a missing item. Fire-and-forget.
    fn request(&self, kind: InvKind, hash: &TxHash);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Admission {
    Accepted,
    Orphaned,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction version inactive until {0}")]
    Inactive(u64),
    #[error("transaction {0} already known")]
    Exists(TxHash),
    #[error("coinbase transaction not accepted")]
    Coinbase,
    #[error("coinstake transaction not accepted")]
    Coinstake,
    #[error("timestamp {0} too far in the future")]
    Future(u64),
    #[error("previous transaction {0} already claimed")]
    Conflict(TxHash),
    #[error("genesis does not match the previous transaction")]
    Chain,
    #[error("sequence {found} does not follow {prev}")]
    Sequence { prev: u32, found: u32 },
    #[error("invalid transaction: {0}")]
    Invalid(LedgerError),
    #[error("execution failed: {0}")]
    Exec(ExecError),
}

impl From<LedgerError> for MempoolError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Exec(e) => MempoolError::Exec(e),
            e => MempoolError::Invalid(e),
        }
    }
}

#[derive(Default)]
struct PoolMaps {
    ledger: HashMap<TxHash, Transaction>,
    /// Orphans keyed by the hash they are waiting for.
    orphans: HashMap<TxHash, (TxHash, Transaction)>,
    /// Predecessors already built on by a pooled transaction.
    conflicts: HashSet<TxHash>,
    legacy: HashSet<TxHash>,
}

type SharedPool = Arc<ReentrantMutex<RefCell<PoolMaps>>>;

/// Transaction index seen by contracts executed in the pool: pooled transactions shadow the disk
/// index for `Flags::Mempool` lookups.
pub struct PoolLedger<L> {
    disk: Arc<L>,
    pool: SharedPool,
}

impl<L: LedgerIndex> PoolLedger<L> {
    fn pooled(&self, hash: &TxHash, flags: Flags) -> Option<Transaction> {
        match flags {
            Flags::Mempool => self.pool.lock().borrow().ledger.get(hash).cloned(),
            Flags::Block => None,
        }
    }
}

impl<L: LedgerIndex> LedgerIndex for PoolLedger<L> {
    fn read_tx(
        &self, hash: &TxHash, flags: Flags,
    ) -> Result<Transaction, StoreError> {
        match self.pooled(hash, flags) {
            Some(tx) => Ok(tx),
            None => self.disk.read_tx(hash, flags),
        }
    }

    fn write_tx(
        &self, hash: &TxHash, tx: &Transaction,
    ) -> Result<(), StoreError> {
        self.disk.write_tx(hash, tx)
    }

    fn erase_tx(&self, hash: &TxHash) -> Result<(), StoreError> {
        self.disk.erase_tx(hash)
    }

    fn has_tx(&self, hash: &TxHash, flags: Flags) -> bool {
        self.pooled(hash, flags).is_some() || self.disk.has_tx(hash, flags)
    }

    fn read_last(&self, genesis: &Genesis) -> Result<TxHash, StoreError> {
        self.disk.read_last(genesis)
    }

    fn write_last(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError> {
        self.disk.write_last(genesis, hash)
    }

    fn erase_last(&self, genesis: &Genesis) -> Result<(), StoreError> {
        self.disk.erase_last(genesis)
    }

    fn read_first(&self, genesis: &Genesis) -> Result<TxHash, StoreError> {
        self.disk.read_first(genesis)
    }

    fn write_first(
        &self, genesis: &Genesis, hash: &TxHash,
    ) -> Result<(), StoreError> {
        self.disk.write_first(genesis, hash)
    }

    fn erase_first(&self, genesis: &Genesis) -> Result<(), StoreError> {
        self.disk.erase_first(genesis)
    }
}

pub struct Mempool<S, L> {
    engine: Engine<S, PoolLedger<L>>,
    disk: Arc<L>,
    pool: SharedPool,
    config: Config,
}

impl<S: RegisterStore, L: LedgerIndex> Mempool<S, L> {
    pub fn new(store: Arc<S>, disk: Arc<L>, config: Config) -> Self {
        let pool: SharedPool =
            Arc::new(ReentrantMutex::new(RefCell::new(PoolMaps::default())));
        let view = Arc::new(PoolLedger {
            disk: disk.clone(),
            pool: pool.clone(),
        });
        Self {
            engine: Engine::new(store, view, config.clone()),
            disk,
            pool,
            config,
        }
    }

    /// The engine pooled transactions are executed with. Its pool view takes the pool lock from
    /// inside a store batch, so callers must hold the pool lock first.
    pub(crate) fn engine(&self) -> &Engine<S, PoolLedger<L>> {
        &self.engine
    }

    /// Insert without any validation. Returns false if the hash is already pooled.
    pub fn add_unchecked(&self, tx: Transaction) -> bool {
        let hash = tx.hash();
        let guard = self.pool.lock();
        let mut maps = guard.borrow_mut();
        if maps.ledger.contains_key(&hash) {
            return false
        }
        if tx.is_legacy() {
            maps.legacy.insert(hash.clone());
        }
        if !tx.is_first() {
            maps.conflicts.insert(tx.prev.clone());
        }
        maps.ledger.insert(hash, tx);
        true
    }

    /// Validate and execute `tx` in the pending context. A transaction whose predecessor is not
    /// known yet is kept as an orphan and the predecessor is requested from `origin`.
    pub fn accept(
        &self, tx: Transaction, origin: Option<&dyn Peer>,
    ) -> Result<Admission, MempoolError> {
        let hash = tx.hash();
        let admission = self.accept_one(hash.clone(), tx, origin)?;
        if admission == Admission::Accepted {
            self.promote(hash)
        }
        Ok(admission)
    }

    fn accept_one(
        &self, hash: TxHash, mut tx: Transaction, origin: Option<&dyn Peer>,
    ) -> Result<Admission, MempoolError> {
        let now = unified_timestamp();
        if now < self.config.activation_timestamp {
            return Err(MempoolError::Inactive(self.config.activation_timestamp))
        }
        // held until the transaction is in, the engine re-enters it through the pool view
        let guard = self.pool.lock();
        {
            let maps = guard.borrow();
            if self.disk.has_tx(&hash, Flags::Block) ||
                maps.ledger.contains_key(&hash) ||
                maps.orphans.values().any(|(h, _)| h == &hash)
            {
                return Err(MempoolError::Exists(hash))
            }
        }
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase)
        }
        if tx.is_coinstake() {
            return Err(MempoolError::Coinstake)
        }
        if tx.timestamp > now.saturating_add(self.config.max_drift) {
            return Err(MempoolError::Future(tx.timestamp))
        }

        if tx.is_first() {
            if self.disk.read_first(&tx.genesis).is_ok() ||
                self.has_genesis(&tx.genesis)
            {
                return Err(MempoolError::Conflict(TxHash::zero().clone()))
            }
        } else {
            let pooled = guard.borrow().ledger.get(&tx.prev).cloned();
            let prev = match pooled {
                Some(prev) => prev,
                None => match self.disk.read_tx(&tx.prev, Flags::Block) {
                    Ok(prev) => {
                        // only the tail of the indexed sigchain can be extended
                        if self.disk.read_last(&tx.genesis).ok().as_ref() !=
                            Some(&tx.prev)
                        {
                            return Err(MempoolError::Conflict(tx.prev.clone()))
                        }
                        prev
                    }
                    Err(StoreError::NotFound(_)) => {
                        let prev = tx.prev.clone();
                        let mut maps = guard.borrow_mut();
                        if maps.orphans.contains_key(&prev) {
                            return Err(MempoolError::Conflict(prev))
                        }
                        maps.orphans.insert(prev.clone(), (hash.clone(), tx));
                        drop(maps);
                        if let Some(peer) = origin {
                            peer.request(InvKind::Transaction, &prev);
                        }
                        debug!("orphan {} waits for {}", hash, prev);
                        return Ok(Admission::Orphaned)
                    }
                    Err(e) => return Err(LedgerError::from(e).into()),
                },
            };
            if prev.genesis != tx.genesis {
                return Err(MempoolError::Chain)
            }
            if prev.sequence.checked_add(1) != Some(tx.sequence) {
                return Err(MempoolError::Sequence {
                    prev: prev.sequence,
                    found: tx.sequence,
                })
            }
            if !guard.borrow_mut().conflicts.insert(tx.prev.clone()) {
                return Err(MempoolError::Conflict(tx.prev.clone()))
            }
        }

        if let Err(e) = tx
            .check()
            .and_then(|_| tx.connect(&self.engine, Flags::Mempool))
        {
            if !tx.is_first() {
                guard.borrow_mut().conflicts.remove(&tx.prev);
            }
            debug!("rejected {}: {}", hash, e);
            return Err(e.into())
        }

        let mut maps = guard.borrow_mut();
        if tx.is_legacy() {
            maps.legacy.insert(hash.clone());
        }
        info!("accepted {} (sequence {})", hash, tx.sequence);
        maps.ledger.insert(hash, tx);
        Ok(Admission::Accepted)
    }

    /// Promote the orphans waiting on `accepted`, and transitively on those promoted.
    fn promote(&self, accepted: TxHash) {
        let mut q = VecDeque::new();
        q.push_back(accepted);
        while let Some(parent) = q.pop_front() {
            let orphan = self.pool.lock().borrow_mut().orphans.remove(&parent);
            if let Some((hash, tx)) = orphan {
                match self.accept_one(hash.clone(), tx, None) {
                    Ok(Admission::Accepted) => {
                        debug!("promoted orphan {}", hash);
                        q.push_back(hash)
                    }
                    Ok(Admission::Orphaned) => (),
                    Err(e) => warn!("dropped orphan {}: {}", hash, e),
                }
            }
        }
    }

    pub fn get(&self, hash: &TxHash) -> Option<Transaction> {
        self.pool.lock().borrow().ledger.get(hash).cloned()
    }

    pub fn has(&self, hash: &TxHash) -> bool {
        self.pool.lock().borrow().ledger.contains_key(hash)
    }

    pub fn has_genesis(&self, genesis: &Genesis) -> bool {
        self.pool
            .lock()
            .borrow()
            .ledger
            .values()
            .any(|tx| &tx.genesis == genesis)
    }

    pub fn size(&self) -> usize {
        self.pool.lock().borrow().ledger.len()
    }

    pub fn orphans(&self) -> usize {
        self.pool.lock().borrow().orphans.len()
    }

    /// Pooled transactions of `genesis` in sequence order, cut at the first broken link.
    pub fn get_chain(&self, genesis: &Genesis) -> Vec<(TxHash, Transaction)> {
        let mut chain: Vec<(TxHash, Transaction)> = self
            .pool
            .lock()
            .borrow()
            .ledger
            .iter()
            .filter(|(_, tx)| &tx.genesis == genesis)
            .map(|(h, tx)| (h.clone(), tx.clone()))
            .collect();
        chain.sort_by_key(|(_, tx)| tx.sequence);
        for i in 1..chain.len() {
            let (ref prev_hash, ref prev) = chain[i - 1];
            let tx = &chain[i].1;
            if &tx.prev != prev_hash ||
                prev.sequence.checked_add(1) != Some(tx.sequence)
            {
                warn!(
                    "sigchain of {} broken at sequence {}",
                    genesis, tx.sequence
                );
                chain.truncate(i);
                break
            }
        }
        chain
    }

    pub fn get_last(&self, genesis: &Genesis) -> Option<(TxHash, Transaction)> {
        self.get_chain(genesis).pop()
    }

    /// Evict a transaction, releasing its claim on its predecessor.
    pub fn remove(&self, hash: &TxHash) -> bool {
        let guard = self.pool.lock();
        let mut maps = guard.borrow_mut();
        match maps.ledger.remove(hash) {
            Some(tx) => {
                maps.conflicts.remove(&tx.prev);
                maps.legacy.remove(hash);
                debug!("removed {}", hash);
                true
            }
            None => false,
        }
    }

    /// Roll back the pending effects of a pooled transaction and evict it. Only the tail of a
    /// pooled sigchain can be evicted.
    pub fn evict(&self, hash: &TxHash) -> Result<bool, MempoolError> {
        let guard = self.pool.lock();
        let pooled = guard.borrow().ledger.get(hash).cloned();
        let mut tx = match pooled {
            Some(tx) => tx,
            None => return Ok(false),
        };
        if guard.borrow().conflicts.contains(hash) {
            return Err(MempoolError::Conflict(hash.clone()))
        }
        tx.disconnect(self.engine(), Flags::Mempool)?;
        info!("evicted {}", hash);
        Ok(self.remove(hash))
    }

    /// Up to `limit` pooled hashes, grouped by genesis and ordered along each sigchain.
    pub fn list(&self, limit: usize, legacy_only: bool) -> Vec<TxHash> {
        let (geneses, legacy) = {
            let guard = self.pool.lock();
            let maps = guard.borrow();
            let geneses: BTreeSet<Genesis> =
                maps.ledger.values().map(|tx| tx.genesis.clone()).collect();
            (geneses, maps.legacy.clone())
        };
        let mut list = Vec::new();
        for genesis in geneses.iter() {
            for (hash, _) in self.get_chain(genesis) {
                if list.len() >= limit {
                    return list
                }
                if legacy_only && !legacy.contains(&hash) {
                    continue
                }
                list.push(hash);
            }
        }
        list
    }
}
