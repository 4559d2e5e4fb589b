//! Logical indexes kept next to the register store: the registers each genesis holds, the
//! transfers waiting to be claimed, the transaction history of each register, and the orderbook.
//! None of it takes part in consensus, so a failed index update is logged and skipped.

use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::common::{Address, Genesis, Shutdown, TxHash, U256};
use crate::core::Op;
use crate::ledger::{LedgerError, Transaction};
use crate::store::{Flags, RegisterStore, StoreError};

/// Token pair an order trades between.
pub type Market = (U256, U256);

pub trait LogicalStore: Send + Sync {
    fn push_register(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError>;
    fn erase_register(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError>;
    fn list_registers(&self, genesis: &Genesis) -> Vec<Address>;

    fn write_transfer(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError>;
    fn erase_transfer(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError>;
    fn list_transfers(&self, genesis: &Genesis) -> Vec<Address>;

    fn push_transaction(
        &self, addr: &Address, hash: &TxHash,
    ) -> Result<(), StoreError>;
    /// Pop the most recent history entry of `addr`.
    fn erase_transaction(&self, addr: &Address) -> Result<(), StoreError>;
    fn list_transactions(&self, addr: &Address) -> Vec<TxHash>;

    /// Append an order to `market`, returning its sequence number.
    fn push_order(
        &self, market: &Market, txid: &TxHash, contract: u32,
    ) -> Result<u64, StoreError>;
    fn read_order_sequence(&self, market: &Market) -> u64;
    fn read_order(
        &self, market: &Market, sequence: u64,
    ) -> Result<(TxHash, u32), StoreError>;
}

#[derive(Default)]
struct MemLogicalInner {
    registers: HashMap<Genesis, Vec<Address>>,
    transfers: HashMap<Genesis, Vec<Address>>,
    history: HashMap<Address, Vec<TxHash>>,
    orders: HashMap<Market, Vec<(TxHash, u32)>>,
}

fn remove_item<K, V>(
    map: &mut HashMap<K, Vec<V>>, key: &K, item: &V, what: &'static str,
) -> Result<(), StoreError>
where
    K: std::hash::Hash + Eq,
    V: PartialEq,
{
    let list = map.get_mut(key).ok_or(StoreError::NotFound(what))?;
    let pos = list
        .iter()
        .position(|v| v == item)
        .ok_or(StoreError::NotFound(what))?;
    list.remove(pos);
    if list.is_empty() {
        map.remove(key);
    }
    Ok(())
}

/// In-memory [LogicalStore].
#[derive(Default)]
pub struct MemLogical(Mutex<MemLogicalInner>);

impl MemLogical {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogicalStore for MemLogical {
    fn push_register(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError> {
        let mut inner = self.0.lock();
        let list = inner.registers.entry(genesis.clone()).or_default();
        if !list.contains(addr) {
            list.push(addr.clone())
        }
        Ok(())
    }

    fn erase_register(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError> {
        remove_item(&mut self.0.lock().registers, genesis, addr, "register")
    }

    fn list_registers(&self, genesis: &Genesis) -> Vec<Address> {
        self.0
            .lock()
            .registers
            .get(genesis)
            .cloned()
            .unwrap_or_default()
    }

    fn write_transfer(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError> {
        let mut inner = self.0.lock();
        let list = inner.transfers.entry(genesis.clone()).or_default();
        if !list.contains(addr) {
            list.push(addr.clone())
        }
        Ok(())
    }

    fn erase_transfer(
        &self, genesis: &Genesis, addr: &Address,
    ) -> Result<(), StoreError> {
        remove_item(&mut self.0.lock().transfers, genesis, addr, "transfer")
    }

    fn list_transfers(&self, genesis: &Genesis) -> Vec<Address> {
        self.0
            .lock()
            .transfers
            .get(genesis)
            .cloned()
            .unwrap_or_default()
    }

    fn push_transaction(
        &self, addr: &Address, hash: &TxHash,
    ) -> Result<(), StoreError> {
        self.0
            .lock()
            .history
            .entry(addr.clone())
            .or_default()
            .push(hash.clone());
        Ok(())
    }

    fn erase_transaction(&self, addr: &Address) -> Result<(), StoreError> {
        let mut inner = self.0.lock();
        let list = inner
            .history
            .get_mut(addr)
            .ok_or(StoreError::NotFound("history"))?;
        list.pop();
        if list.is_empty() {
            inner.history.remove(addr);
        }
        Ok(())
    }

    fn list_transactions(&self, addr: &Address) -> Vec<TxHash> {
        self.0.lock().history.get(addr).cloned().unwrap_or_default()
    }

    fn push_order(
        &self, market: &Market, txid: &TxHash, contract: u32,
    ) -> Result<u64, StoreError> {
        // sequence is the index of the pushed record
        let mut inner = self.0.lock();
        let orders = inner.orders.entry(*market).or_default();
        orders.push((txid.clone(), contract));
        Ok(orders.len() as u64 - 1)
    }

    fn read_order_sequence(&self, market: &Market) -> u64 {
        self.0
            .lock()
            .orders
            .get(market)
            .map(|o| o.len() as u64)
            .unwrap_or(0)
    }

    fn read_order(
        &self, market: &Market, sequence: u64,
    ) -> Result<(TxHash, u32), StoreError> {
        self.0
            .lock()
            .orders
            .get(market)
            .and_then(|o| o.get(sequence as usize))
            .cloned()
            .ok_or(StoreError::NotFound("order"))
    }
}

/// Orders of `market` whose CONDITION has (`executed`) or has not been validated yet. Stops early
/// with a partial list once `shutdown` is set.
pub fn list_orders<G, S>(
    logical: &G, store: &S, market: &Market, executed: bool,
    shutdown: &Shutdown,
) -> Vec<(TxHash, u32)>
where
    G: LogicalStore + ?Sized,
    S: RegisterStore + ?Sized,
{
    let mut orders = Vec::new();
    for sequence in 0..logical.read_order_sequence(market) {
        if shutdown.is_set() {
            debug!("order listing interrupted at {}", sequence);
            break
        }
        match logical.read_order(market, sequence) {
            Ok((txid, contract)) => {
                if store.has_validated(&txid, contract, Flags::Block) == executed
                {
                    orders.push((txid, contract))
                }
            }
            Err(e) => warn!("order {} unreadable: {}", sequence, e),
        }
    }
    orders
}

/// Update the logical indexes for a confirmed transaction.
pub fn index_registers<G: LogicalStore + ?Sized>(
    logical: &G, tx: &Transaction, hash: &TxHash,
) {
    for (i, contract) in tx.contracts.iter().enumerate() {
        let res = contract
            .decode()
            .map_err(LedgerError::from)
            .and_then(|op| index_op(logical, op.primitive(), &tx.genesis, hash));
        if let Err(e) = res {
            warn!("cannot index contract {} of {}: {}", i, hash, e);
        }
    }
}

/// Reverse of [index_registers], walking the contracts backwards.
pub fn deindex_registers<G: LogicalStore + ?Sized>(
    logical: &G, tx: &Transaction, hash: &TxHash,
) {
    for (i, contract) in tx.contracts.iter().enumerate().rev() {
        let res = contract
            .decode()
            .map_err(LedgerError::from)
            .and_then(|op| deindex_op(logical, op.primitive(), &tx.genesis));
        if let Err(e) = res {
            warn!("cannot deindex contract {} of {}: {}", i, hash, e);
        }
    }
}

fn touched(op: &Op) -> Option<&Address> {
    match op {
        Op::Write { address, .. } |
        Op::Append { address, .. } |
        Op::Create { address, .. } |
        Op::Transfer { address, .. } |
        Op::Claim { address, .. } |
        Op::Genesis { address, .. } => Some(address),
        Op::Debit { from, .. } | Op::Legacy { from, .. } => Some(from),
        Op::Credit { to, .. } => Some(to),
        _ => None,
    }
}

fn index_op<G: LogicalStore + ?Sized>(
    logical: &G, op: &Op, caller: &Genesis, hash: &TxHash,
) -> Result<(), LedgerError> {
    // history first: deindex_op pops it first
    if let Some(addr) = touched(op) {
        logical.push_transaction(addr, hash)?;
    }
    match op {
        Op::Create { address, .. } => logical.push_register(caller, address)?,
        Op::Transfer { address, to } => {
            logical.erase_register(caller, address)?;
            logical.write_transfer(to, address)?;
        }
        Op::Claim { address, .. } => {
            logical.erase_transfer(caller, address)?;
            logical.push_register(caller, address)?;
        }
        _ => (),
    }
    Ok(())
}

fn deindex_op<G: LogicalStore + ?Sized>(
    logical: &G, op: &Op, caller: &Genesis,
) -> Result<(), LedgerError> {
    if let Some(addr) = touched(op) {
        logical.erase_transaction(addr)?;
    }
    match op {
        Op::Create { address, .. } => logical.erase_register(caller, address)?,
        Op::Transfer { address, to } => {
            logical.erase_transfer(to, address)?;
            logical.push_register(caller, address)?;
        }
        Op::Claim { address, .. } => {
            logical.erase_register(caller, address)?;
            logical.write_transfer(caller, address)?;
        }
        _ => (),
    }
    Ok(())
}

#[test]
fn test_history_pops_last() {
    let logical = MemLogical::new();
    let addr = Address::hash(b"a");
    logical.push_transaction(&addr, &TxHash::hash(b"1")).unwrap();
    logical.push_transaction(&addr, &TxHash::hash(b"2")).unwrap();
    logical.erase_transaction(&addr).unwrap();
    assert_eq!(logical.list_transactions(&addr), vec![TxHash::hash(b"1")]);
    logical.erase_transaction(&addr).unwrap();
    assert!(logical.erase_transaction(&addr).is_err());
}

#[test]
fn test_order_sequence() {
    let logical = MemLogical::new();
    let market = (U256::from(1), U256::from(2));
    assert_eq!(logical.read_order_sequence(&market), 0);
    assert_eq!(logical.push_order(&market, &TxHash::hash(b"a"), 0), Ok(0));
    assert_eq!(logical.push_order(&market, &TxHash::hash(b"b"), 3), Ok(1));
    assert_eq!(logical.read_order_sequence(&market), 2);
    assert_eq!(
        logical.read_order(&market, 1),
        Ok((TxHash::hash(b"b"), 3))
    );
    assert!(logical.read_order(&(U256::zero(), U256::zero()), 0).is_err());
}
