//! Register store interface and its in-memory implementation.
//!
//! Every call carries [Flags]: `Block` reads and writes the durable state, while `Mempool` works
//! on a pending overlay that shadows the durable state (erases leave a tombstone). A batch opened
//! by [RegisterStore::txn_begin] stages the writes of the calling thread so that they become
//! visible to other readers all at once on [RegisterStore::txn_commit], or vanish on
//! [RegisterStore::txn_abort].

use std::collections::HashMap;
use std::thread::ThreadId;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::{Address, Genesis, TxHash, U256};
use crate::register::State;

/// Evaluation context of a store operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Flags {
    Block,
    Mempool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage fault: {0}")]
    Fault(String),
}

pub trait RegisterStore: Send + Sync {
    fn read_state(
        &self, addr: &Address, flags: Flags,
    ) -> Result<State, StoreError>;
    fn write_state(
        &self, addr: &Address, state: &State, flags: Flags,
    ) -> Result<(), StoreError>;
    fn erase_state(&self, addr: &Address, flags: Flags)
        -> Result<(), StoreError>;
    fn has_state(&self, addr: &Address, flags: Flags) -> bool;

    /// Point the trust index of `genesis` at the trust account `addr`.
    fn index_trust(
        &self, genesis: &Genesis, addr: &Address, flags: Flags,
    ) -> Result<(), StoreError>;
    fn has_trust(&self, genesis: &Genesis, flags: Flags) -> bool;
    fn read_trust(
        &self, genesis: &Genesis, flags: Flags,
    ) -> Result<State, StoreError>;
    /// Write the trust account through the trust index.
    fn write_trust(
        &self, genesis: &Genesis, state: &State, flags: Flags,
    ) -> Result<(), StoreError>;
    /// Remove the trust index only, the account register stays.
    fn erase_trust(
        &self, genesis: &Genesis, flags: Flags,
    ) -> Result<(), StoreError>;

    fn write_event(
        &self, owner: &Genesis, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;
    fn erase_event(
        &self, owner: &Genesis, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;
    fn read_events(&self, owner: &Genesis, flags: Flags) -> Vec<(TxHash, u32)>;

    fn read_claimed(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<u64, StoreError>;
    fn write_claimed(
        &self, txid: &TxHash, contract: u32, amount: u64, flags: Flags,
    ) -> Result<(), StoreError>;
    fn erase_claimed(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;

    fn write_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;
    fn has_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> bool;
    fn erase_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;

    /// Reserve a token identifier for the token register at `addr`.
    fn write_identifier(
        &self, id: &U256, addr: &Address, flags: Flags,
    ) -> Result<(), StoreError>;
    fn has_identifier(&self, id: &U256, flags: Flags) -> bool;
    fn erase_identifier(&self, id: &U256, flags: Flags)
        -> Result<(), StoreError>;

    /// Mark the CONDITION at `(txid, contract)` as consumed by a VALIDATE.
    fn write_validated(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;
    fn has_validated(&self, txid: &TxHash, contract: u32, flags: Flags)
        -> bool;
    fn erase_validated(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError>;

    fn txn_begin(&self);
    fn txn_commit(&self) -> Result<(), StoreError>;
    fn txn_abort(&self);
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum Key {
    State(Address),
    Trust(Genesis),
    Events(Genesis),
    Claimed(TxHash, u32),
    Proof(Address, TxHash, u32),
    Identifier(U256),
    Validated(TxHash, u32),
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum Entry {
    State(State),
    Pointer(Address),
    Events(Vec<(TxHash, u32)>),
    Amount(u64),
    Marker,
}

/// Committed content of a [MemRegisterStore].
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Layers {
    durable: HashMap<Key, Entry>,
    pending: HashMap<Key, Option<Entry>>,
}

impl Layers {
    fn get(&self, key: &Key, flags: Flags) -> Option<&Entry> {
        match flags {
            Flags::Block => self.durable.get(key),
            Flags::Mempool => match self.pending.get(key) {
                Some(e) => e.as_ref(),
                None => self.durable.get(key),
            },
        }
    }

    fn apply(&mut self, key: Key, value: Option<Entry>, flags: Flags) {
        match flags {
            Flags::Block => {
                // a newer overlay value stays visible to the pool
                if self.pending.get(&key) == Some(&value) {
                    self.pending.remove(&key);
                }
                match value {
                    Some(e) => self.durable.insert(key, e),
                    None => self.durable.remove(&key),
                };
            }
            Flags::Mempool => {
                // an overlay entry equal to the durable one is dropped
                if self.durable.get(&key) == value.as_ref() {
                    self.pending.remove(&key);
                } else {
                    self.pending.insert(key, value);
                }
            }
        }
    }

    fn only(&self, key: &Key) -> Layers {
        let mut view = Layers::default();
        if let Some(e) = self.durable.get(key) {
            view.durable.insert(key.clone(), e.clone());
        }
        if let Some(e) = self.pending.get(key) {
            view.pending.insert(key.clone(), e.clone());
        }
        view
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

struct Batch {
    owner: ThreadId,
    ops: Vec<(Key, Option<Entry>, Flags)>,
}

/// In-memory [RegisterStore].
#[derive(Default)]
pub struct MemRegisterStore {
    layers: RwLock<Layers>,
    batch: Mutex<Option<Batch>>,
    idle: Condvar,
}

impl MemRegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the committed content, for comparing store states.
    pub fn snapshot(&self) -> Layers {
        self.layers.read().clone()
    }

    fn get(&self, key: &Key, flags: Flags) -> Option<Entry> {
        let me = std::thread::current().id();
        if let Some(batch) = self.batch.lock().as_ref() {
            if batch.owner == me && batch.ops.iter().any(|(k, ..)| k == key) {
                // replay the staged ops for this key over its committed entries
                let mut view = self.layers.read().only(key);
                for (k, v, f) in batch.ops.iter() {
                    if k == key {
                        view.apply(k.clone(), v.clone(), *f);
                    }
                }
                return view.get(key, flags).cloned()
            }
        }
        self.layers.read().get(key, flags).cloned()
    }

    fn put(&self, key: Key, value: Option<Entry>, flags: Flags) {
        let me = std::thread::current().id();
        if let Some(batch) = self.batch.lock().as_mut() {
            if batch.owner == me {
                batch.ops.push((key, value, flags));
                return
            }
        }
        self.layers.write().apply(key, value, flags)
    }

    fn events(&self, owner: &Genesis, flags: Flags) -> Vec<(TxHash, u32)> {
        match self.get(&Key::Events(owner.clone()), flags) {
            Some(Entry::Events(v)) => v,
            _ => Vec::new(),
        }
    }
}

impl RegisterStore for MemRegisterStore {
    fn read_state(
        &self, addr: &Address, flags: Flags,
    ) -> Result<State, StoreError> {
        match self.get(&Key::State(addr.clone()), flags) {
            Some(Entry::State(s)) => Ok(s),
            _ => Err(StoreError::NotFound("register")),
        }
    }

    fn write_state(
        &self, addr: &Address, state: &State, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("write_state({}, {:?})", addr, flags);
        self.put(
            Key::State(addr.clone()),
            Some(Entry::State(state.clone())),
            flags,
        );
        Ok(())
    }

    fn erase_state(
        &self, addr: &Address, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("erase_state({}, {:?})", addr, flags);
        self.put(Key::State(addr.clone()), None, flags);
        Ok(())
    }

    fn has_state(&self, addr: &Address, flags: Flags) -> bool {
        self.get(&Key::State(addr.clone()), flags).is_some()
    }

    fn index_trust(
        &self, genesis: &Genesis, addr: &Address, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("index_trust({}, {}, {:?})", genesis, addr, flags);
        self.put(
            Key::Trust(genesis.clone()),
            Some(Entry::Pointer(addr.clone())),
            flags,
        );
        Ok(())
    }

    fn has_trust(&self, genesis: &Genesis, flags: Flags) -> bool {
        self.get(&Key::Trust(genesis.clone()), flags).is_some()
    }

    fn read_trust(
        &self, genesis: &Genesis, flags: Flags,
    ) -> Result<State, StoreError> {
        match self.get(&Key::Trust(genesis.clone()), flags) {
            Some(Entry::Pointer(addr)) => self.read_state(&addr, flags),
            _ => Err(StoreError::NotFound("trust index")),
        }
    }

    fn write_trust(
        &self, genesis: &Genesis, state: &State, flags: Flags,
    ) -> Result<(), StoreError> {
        match self.get(&Key::Trust(genesis.clone()), flags) {
            Some(Entry::Pointer(addr)) => self.write_state(&addr, state, flags),
            _ => Err(StoreError::NotFound("trust index")),
        }
    }

    fn erase_trust(
        &self, genesis: &Genesis, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("erase_trust({}, {:?})", genesis, flags);
        self.put(Key::Trust(genesis.clone()), None, flags);
        Ok(())
    }

    fn write_event(
        &self, owner: &Genesis, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        let mut events = self.events(owner, flags);
        events.push((txid.clone(), contract));
        self.put(Key::Events(owner.clone()), Some(Entry::Events(events)), flags);
        Ok(())
    }

    fn erase_event(
        &self, owner: &Genesis, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        let mut events = self.events(owner, flags);
        let pos = events
            .iter()
            .rposition(|(t, n)| t == txid && *n == contract)
            .ok_or(StoreError::NotFound("event"))?;
        events.remove(pos);
        let value = if events.is_empty() {
            None
        } else {
            Some(Entry::Events(events))
        };
        self.put(Key::Events(owner.clone()), value, flags);
        Ok(())
    }

    fn read_events(&self, owner: &Genesis, flags: Flags) -> Vec<(TxHash, u32)> {
        self.events(owner, flags)
    }

    fn read_claimed(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<u64, StoreError> {
        match self.get(&Key::Claimed(txid.clone(), contract), flags) {
            Some(Entry::Amount(n)) => Ok(n),
            _ => Err(StoreError::NotFound("claimed amount")),
        }
    }

    fn write_claimed(
        &self, txid: &TxHash, contract: u32, amount: u64, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("write_claimed({}, {}, {}, {:?})", txid, contract, amount, flags);
        self.put(
            Key::Claimed(txid.clone(), contract),
            Some(Entry::Amount(amount)),
            flags,
        );
        Ok(())
    }

    fn erase_claimed(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(Key::Claimed(txid.clone(), contract), None, flags);
        Ok(())
    }

    fn write_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        debug!("write_proof({}, {}, {}, {:?})", proof, txid, contract, flags);
        self.put(
            Key::Proof(proof.clone(), txid.clone(), contract),
            Some(Entry::Marker),
            flags,
        );
        Ok(())
    }

    fn has_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> bool {
        self.get(&Key::Proof(proof.clone(), txid.clone(), contract), flags)
            .is_some()
    }

    fn erase_proof(
        &self, proof: &Address, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(Key::Proof(proof.clone(), txid.clone(), contract), None, flags);
        Ok(())
    }

    fn write_identifier(
        &self, id: &U256, addr: &Address, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(
            Key::Identifier(*id),
            Some(Entry::Pointer(addr.clone())),
            flags,
        );
        Ok(())
    }

    fn has_identifier(&self, id: &U256, flags: Flags) -> bool {
        self.get(&Key::Identifier(*id), flags).is_some()
    }

    fn erase_identifier(
        &self, id: &U256, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(Key::Identifier(*id), None, flags);
        Ok(())
    }

    fn write_validated(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(
            Key::Validated(txid.clone(), contract),
            Some(Entry::Marker),
            flags,
        );
        Ok(())
    }

    fn has_validated(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> bool {
        self.get(&Key::Validated(txid.clone(), contract), flags)
            .is_some()
    }

    fn erase_validated(
        &self, txid: &TxHash, contract: u32, flags: Flags,
    ) -> Result<(), StoreError> {
        self.put(Key::Validated(txid.clone(), contract), None, flags);
        Ok(())
    }

    fn txn_begin(&self) {
        let me = std::thread::current().id();
        let mut batch = self.batch.lock();
        while batch.is_some() {
            self.idle.wait(&mut batch);
        }
        *batch = Some(Batch {
            owner: me,
            ops: Vec::new(),
        });
    }

    fn txn_commit(&self) -> Result<(), StoreError> {
        let me = std::thread::current().id();
        let mut batch = self.batch.lock();
        let staged = match batch.take() {
            Some(b) if b.owner == me => b,
            other => {
                *batch = other;
                return Err(StoreError::Fault("commit without a batch".into()))
            }
        };
        {
            let mut layers = self.layers.write();
            for (key, value, flags) in staged.ops.into_iter() {
                layers.apply(key, value, flags);
            }
        }
        drop(batch);
        self.idle.notify_one();
        Ok(())
    }

    fn txn_abort(&self) {
        let me = std::thread::current().id();
        let mut batch = self.batch.lock();
        if batch.as_ref().map(|b| b.owner == me).unwrap_or(false) {
            *batch = None;
            drop(batch);
            self.idle.notify_one();
        }
    }
}

#[test]
fn test_mempool_overlay() {
    let store = MemRegisterStore::new();
    let addr = Address::hash(b"reg");
    let owner = Genesis::hash(b"owner");
    let s0 = State::new(crate::register::RegisterType::Raw, owner, 1, vec![0]);
    let mut s1 = s0.clone();
    s1.data = vec![1];
    store.write_state(&addr, &s0, Flags::Block).unwrap();
    store.write_state(&addr, &s1, Flags::Mempool).unwrap();
    assert_eq!(store.read_state(&addr, Flags::Block).unwrap(), s0);
    assert_eq!(store.read_state(&addr, Flags::Mempool).unwrap(), s1);

    store.erase_state(&addr, Flags::Mempool).unwrap();
    assert!(!store.has_state(&addr, Flags::Mempool));
    assert!(store.has_state(&addr, Flags::Block));

    // restoring the durable value leaves no overlay behind
    store.write_state(&addr, &s0, Flags::Mempool).unwrap();
    assert_eq!(store.snapshot().pending_len(), 0);
}

#[test]
fn test_batch_abort_and_commit() {
    let store = MemRegisterStore::new();
    let txid = TxHash::hash(b"tx");
    store.txn_begin();
    store.write_claimed(&txid, 0, 10, Flags::Block).unwrap();
    assert_eq!(store.read_claimed(&txid, 0, Flags::Block), Ok(10));
    store.txn_abort();
    assert!(store.read_claimed(&txid, 0, Flags::Block).is_err());

    store.txn_begin();
    store.write_claimed(&txid, 0, 10, Flags::Mempool).unwrap();
    store.write_claimed(&txid, 0, 10, Flags::Block).unwrap();
    assert_eq!(store.read_claimed(&txid, 0, Flags::Mempool), Ok(10));
    store.txn_commit().unwrap();
    assert_eq!(store.read_claimed(&txid, 0, Flags::Block), Ok(10));
    assert_eq!(store.snapshot().pending_len(), 0);
    assert!(store.txn_commit().is_err());
}

#[test]
fn test_block_write_keeps_newer_overlay() {
    let store = MemRegisterStore::new();
    let txid = TxHash::hash(b"tx");
    let owner = Genesis::hash(b"bob");
    store.write_claimed(&txid, 0, 10, Flags::Mempool).unwrap();
    store.write_claimed(&txid, 0, 30, Flags::Mempool).unwrap();
    store.write_event(&owner, &txid, 0, Flags::Mempool).unwrap();
    store.write_event(&owner, &txid, 1, Flags::Mempool).unwrap();

    // the block carries only the first of the pooled writes
    store.txn_begin();
    store.write_claimed(&txid, 0, 10, Flags::Block).unwrap();
    store.write_event(&owner, &txid, 0, Flags::Block).unwrap();
    assert_eq!(store.read_claimed(&txid, 0, Flags::Mempool), Ok(30));
    store.txn_commit().unwrap();
    assert_eq!(store.read_claimed(&txid, 0, Flags::Block), Ok(10));
    assert_eq!(store.read_claimed(&txid, 0, Flags::Mempool), Ok(30));
    assert_eq!(store.read_events(&owner, Flags::Block).len(), 1);
    assert_eq!(store.read_events(&owner, Flags::Mempool).len(), 2);

    store.write_claimed(&txid, 0, 30, Flags::Block).unwrap();
    store.write_event(&owner, &txid, 1, Flags::Block).unwrap();
    assert_eq!(store.snapshot().pending_len(), 0);
}

#[test]
fn test_batch_hidden_from_other_threads() {
    let store = std::sync::Arc::new(MemRegisterStore::new());
    let id = U256::from(9);
    store.txn_begin();
    store
        .write_identifier(&id, &Address::zero(), Flags::Block)
        .unwrap();
    let s = store.clone();
    let seen = std::thread::spawn(move || s.has_identifier(&id, Flags::Block))
        .join()
        .unwrap();
    assert!(!seen);
    store.txn_commit().unwrap();
    assert!(store.has_identifier(&id, Flags::Block));
}

#[test]
fn test_events() {
    let store = MemRegisterStore::new();
    let owner = Genesis::hash(b"bob");
    let txid = TxHash::hash(b"debit");
    store.write_event(&owner, &txid, 0, Flags::Mempool).unwrap();
    store.write_event(&owner, &txid, 1, Flags::Mempool).unwrap();
    assert_eq!(store.read_events(&owner, Flags::Mempool).len(), 2);
    assert!(store.read_events(&owner, Flags::Block).is_empty());
    store.erase_event(&owner, &txid, 0, Flags::Mempool).unwrap();
    store.erase_event(&owner, &txid, 1, Flags::Mempool).unwrap();
    assert_eq!(
        store.erase_event(&owner, &txid, 1, Flags::Mempool),
        Err(StoreError::NotFound("event"))
    );
    assert_eq!(store.snapshot().pending_len(), 0);
}
