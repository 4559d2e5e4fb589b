use rand::Rng;

use regledger::common::{unified_timestamp, Address, Genesis, TxHash};
use regledger::core::Op;
use regledger::ledger::Transaction;

/// Builds consecutive transactions of one sigchain.
pub struct ChainBuilder {
    genesis: Genesis,
    sequence: u32,
    prev: TxHash,
    timestamp: u64,
}

impl ChainBuilder {
    pub fn new(genesis: Genesis) -> Self {
        Self {
            genesis,
            sequence: 0,
            prev: TxHash::zero().clone(),
            timestamp: unified_timestamp(),
        }
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    /// Pin the timestamp of the following transactions.
    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The next transaction, carrying one contract per op.
    pub fn next(&mut self, ops: &[Op]) -> (TxHash, Transaction) {
        let mut tx = Transaction::new(
            self.genesis.clone(),
            self.sequence,
            self.prev.clone(),
            self.timestamp,
        );
        for op in ops {
            tx.push(op);
        }
        let hash = tx.hash();
        self.sequence += 1;
        self.prev = hash.clone();
        (hash, tx)
    }
}

/// `count` debits of random size from `from` to `to`, adding up to at most `budget`.
pub fn random_debits<R: Rng>(
    rng: &mut R, from: &Address, to: &Address, count: usize, budget: u64,
) -> Vec<Op> {
    let share = (budget / count.max(1) as u64).max(1);
    (0..count)
        .map(|_| Op::Debit {
            from: from.clone(),
            to: to.clone(),
            amount: rng.gen_range(1..=share),
        })
        .collect()
}
