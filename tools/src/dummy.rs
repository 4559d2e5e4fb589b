use log::info;
use parking_lot::Mutex;

use regledger::common::{Address, Genesis, TxHash, U256};
use regledger::mempool::{InvKind, Peer};
use regledger::register::{Object, RegisterType, State, Value};
use regledger::store::{Flags, RegisterStore};

/// A peer that remembers what it was asked for.
#[derive(Default)]
pub struct DummyPeer {
    requests: Mutex<Vec<(InvKind, TxHash)>>,
}

impl DummyPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(InvKind, TxHash)> {
        self.requests.lock().clone()
    }
}

impl Peer for DummyPeer {
    fn request(&self, kind: InvKind, hash: &TxHash) {
        info!("request({:?}, {})", kind, hash);
        self.requests.lock().push((kind, hash.clone()))
    }
}

/// Write an object register straight into the durable state.
pub fn seed_object<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, owner: &Genesis, obj: &Object,
) -> State {
    info!("seed_object({:x}, {})", addr, owner);
    let state = State::new(RegisterType::Object, owner.clone(), 0, obj.to_bytes());
    store.write_state(addr, &state, Flags::Block).unwrap();
    state
}

pub fn seed_account<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, owner: &Genesis, balance: u64,
) -> State {
    seed_object(store, addr, owner, &Object::account(U256::zero(), balance))
}

/// A token register holding its whole supply, with its identifier reserved.
pub fn seed_token<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, owner: &Genesis, id: U256, supply: u64,
) -> State {
    let state = seed_object(store, addr, owner, &Object::token(id, supply, 2));
    store.write_identifier(&id, addr, Flags::Block).unwrap();
    state
}

/// An unindexed trust account funded with `balance`.
pub fn seed_trust<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, owner: &Genesis, balance: u64,
) -> State {
    let mut obj = Object::trust();
    obj.set("balance", Value::U64(balance)).unwrap();
    seed_object(store, addr, owner, &obj)
}

pub fn read_u64<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, field: &str, flags: Flags,
) -> u64 {
    store
        .read_state(addr, flags)
        .unwrap()
        .object()
        .unwrap()
        .get_u64(field)
        .unwrap()
}

pub fn balance<S: RegisterStore + ?Sized>(
    store: &S, addr: &Address, flags: Flags,
) -> u64 {
    read_u64(store, addr, "balance", flags)
}
