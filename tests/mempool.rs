use std::sync::Arc;

use regledger::common::*;
use regledger::core::{Config, Engine, ExecError, Op};
use regledger::ledger::{LedgerIndex, MemLedger, Transaction};
use regledger::mempool::{Admission, InvKind, Mempool, MempoolError};
use regledger::register::{Object, RegisterType};
use regledger::store::{Flags, MemRegisterStore, RegisterStore, StoreError};
use regledger_tools::chain::ChainBuilder;
use regledger_tools::dummy::*;

struct Env {
    store: Arc<MemRegisterStore>,
    disk: Arc<MemLedger>,
    pool: Mempool<MemRegisterStore, MemLedger>,
    /// Connects blocks against the same store.
    block: Engine<MemRegisterStore, MemLedger>,
}

fn setup(config: Config) -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemRegisterStore::new());
    let disk = Arc::new(MemLedger::new());
    let pool = Mempool::new(store.clone(), disk.clone(), config.clone());
    let block = Engine::new(store.clone(), disk.clone(), config);
    Env {
        store,
        disk,
        pool,
        block,
    }
}

fn debit(from: &Address, to: &Address, amount: u64) -> Op {
    Op::Debit {
        from: from.clone(),
        to: to.clone(),
        amount,
    }
}

fn raw(name: &str) -> Op {
    Op::Create {
        address: Address::hash(name.as_bytes()),
        kind: RegisterType::Raw,
        data: name.as_bytes().to_vec(),
    }
}

#[test]
fn test_accept_chain() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let mut chain = ChainBuilder::new(alice.clone());
    let (h0, t0) = chain.next(&[raw("a0")]);
    let (h1, t1) = chain.next(&[raw("a1"), raw("a2")]);

    assert_eq!(env.pool.accept(t0.clone(), None), Ok(Admission::Accepted));
    assert_eq!(
        env.pool.accept(t0, None),
        Err(MempoolError::Exists(h0.clone()))
    );
    assert_eq!(env.pool.accept(t1, None), Ok(Admission::Accepted));
    assert_eq!(env.pool.size(), 2);
    assert!(env.pool.has_genesis(&alice));

    // executed against the overlay only
    let a2 = Address::hash(b"a2");
    assert!(env.store.has_state(&a2, Flags::Mempool));
    assert!(!env.store.has_state(&a2, Flags::Block));
    let pooled = env.pool.get(&h1).unwrap();
    assert!(pooled.contracts.iter().all(|c| c.is_executed()));

    let chain: Vec<TxHash> =
        env.pool.get_chain(&alice).into_iter().map(|(h, _)| h).collect();
    assert_eq!(chain, vec![h0, h1.clone()]);
    assert_eq!(env.pool.get_last(&alice).map(|(h, _)| h), Some(h1));
}

#[test]
fn test_reject() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let mut chain = ChainBuilder::new(alice.clone());
    let (h0, t0) = chain.next(&[raw("a0")]);
    env.pool.accept(t0, None).unwrap();

    // a second first transaction
    let mut again = ChainBuilder::new(alice.clone());
    let (_, other) = again.next(&[raw("b0")]);
    assert_eq!(
        env.pool.accept(other, None),
        Err(MempoolError::Conflict(TxHash::zero().clone()))
    );

    // two successors of one transaction
    let (_, t1) = chain.next(&[raw("a1")]);
    let mut fork = Transaction::new(alice.clone(), 1, h0.clone(), t1.timestamp);
    fork.push(&raw("fork"));
    env.pool.accept(t1, None).unwrap();
    assert_eq!(
        env.pool.accept(fork, None),
        Err(MempoolError::Conflict(h0.clone()))
    );

    let mut skip = Transaction::new(alice.clone(), 5, h0.clone(), 0);
    skip.push(&raw("skip"));
    assert_eq!(
        env.pool.accept(skip, None),
        Err(MempoolError::Sequence { prev: 0, found: 5 })
    );
    let mut foreign =
        Transaction::new(Genesis::hash(b"bob"), 1, h0.clone(), 0);
    foreign.push(&raw("foreign"));
    assert_eq!(env.pool.accept(foreign, None), Err(MempoolError::Chain));

    let miner = Genesis::hash(b"miner");
    let (_, coinbase) = ChainBuilder::new(miner.clone()).next(&[Op::Coinbase {
        genesis: miner,
        amount: 1,
        nonce: 0,
    }]);
    assert_eq!(env.pool.accept(coinbase, None), Err(MempoolError::Coinbase));

    let ahead = unified_timestamp() + 3600;
    let (_, future) = ChainBuilder::new(Genesis::hash(b"carol"))
        .at(ahead)
        .next(&[raw("c0")]);
    assert_eq!(
        env.pool.accept(future, None),
        Err(MempoolError::Future(ahead))
    );

    // a failing contract undoes the ones before it
    let (_, bad) =
        ChainBuilder::new(Genesis::hash(b"dave")).next(&[raw("d0"), raw("a0")]);
    assert_eq!(
        env.pool.accept(bad, None),
        Err(MempoolError::Exec(ExecError::AddressInUse(Address::hash(b"a0"))))
    );
    assert!(!env.store.has_state(&Address::hash(b"d0"), Flags::Mempool));
    assert_eq!(env.pool.size(), 2);
}

#[test]
fn test_inactive() {
    let config = Config {
        activation_timestamp: u64::MAX,
        ..Default::default()
    };
    let env = setup(config);
    let (_, t0) = ChainBuilder::new(Genesis::hash(b"alice")).next(&[raw("a0")]);
    assert_eq!(
        env.pool.accept(t0, None),
        Err(MempoolError::Inactive(u64::MAX))
    );
}

#[test]
fn test_orphans() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let mut chain = ChainBuilder::new(alice);
    let (h0, t0) = chain.next(&[raw("a0")]);
    let (h1, t1) = chain.next(&[raw("a1")]);
    let (h2, t2) = chain.next(&[raw("a2")]);

    let peer = DummyPeer::new();
    assert_eq!(env.pool.accept(t2, Some(&peer)), Ok(Admission::Orphaned));
    assert_eq!(env.pool.accept(t1, Some(&peer)), Ok(Admission::Orphaned));
    assert_eq!(
        peer.requests(),
        vec![
            (InvKind::Transaction, h1.clone()),
            (InvKind::Transaction, h0.clone())
        ]
    );
    assert_eq!(env.pool.orphans(), 2);
    assert_eq!(env.pool.size(), 0);

    // the parent pulls in the whole chain
    assert_eq!(env.pool.accept(t0, Some(&peer)), Ok(Admission::Accepted));
    assert_eq!(env.pool.orphans(), 0);
    assert!(env.pool.has(&h1) && env.pool.has(&h2));
    assert!(env.store.has_state(&Address::hash(b"a2"), Flags::Mempool));
}

#[test]
fn test_list_and_remove() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let bob = Genesis::hash(b"bob");
    let mut ca = ChainBuilder::new(alice.clone());
    let (a0, t) = ca.next(&[raw("a0")]);
    assert!(env.pool.add_unchecked(t.clone()));
    assert!(!env.pool.add_unchecked(t));
    let (_, a1) = ca.next(&[raw("a1")]);
    let (a2, a2_tx) = ca.next(&[raw("a2")]);
    // a1 never arrives
    env.pool.add_unchecked(a2_tx.clone());

    let mut cb = ChainBuilder::new(bob.clone());
    let (b0, t) = cb.next(&[Op::Legacy {
        from: Address::hash(b"b"),
        amount: 1,
        script: vec![0x51],
    }]);
    env.pool.add_unchecked(t);

    assert_eq!(env.pool.get_chain(&alice).len(), 1);
    assert_eq!(env.pool.get_last(&alice).map(|(h, _)| h), Some(a0.clone()));
    let all = env.pool.list(10, false);
    assert_eq!(all.len(), 2);
    assert!(all.contains(&a0) && all.contains(&b0));
    assert!(!all.contains(&a2));
    assert_eq!(env.pool.list(10, true), vec![b0.clone()]);
    assert_eq!(env.pool.list(1, false).len(), 1);

    assert!(env.pool.remove(&b0));
    assert!(!env.pool.remove(&b0));
    assert!(env.pool.list(10, true).is_empty());

    // a2 still holds its claim on the missing a1
    assert_eq!(a2_tx.prev, a1.hash());
    assert!(env.pool.remove(&a2));
    assert_eq!(env.pool.size(), 1);
}

#[test]
fn test_debit_credit_in_pool() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    let trust = Address::hash(b"trust");
    seed_account(env.store.as_ref(), &a, &alice, 1000);
    seed_trust(env.store.as_ref(), &trust, &alice, 10);

    let mut chain = ChainBuilder::new(alice.clone());
    let (h0, t0) = chain.next(&[
        Op::Genesis {
            address: trust,
            reward: 0,
        },
        Op::Create {
            address: b.clone(),
            kind: RegisterType::Object,
            data: Object::account(U256::zero(), 0).to_bytes(),
        },
    ]);
    let (h1, t1) = chain.next(&[Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount: 100,
    }]);
    env.pool.accept(t0, None).unwrap();
    env.pool.accept(t1, None).unwrap();

    let credit = |amount| Op::Credit {
        txid: h1.clone(),
        contract: 0,
        proof: a.clone(),
        to: b.clone(),
        amount,
    };
    let (_, greedy) = chain.next(&[credit(160)]);
    assert_eq!(
        env.pool.accept(greedy, None),
        Err(MempoolError::Exec(ExecError::ClaimOverflow {
            claimed: 0,
            amount: 160,
            limit: 100
        }))
    );

    // the failed attempt released its predecessor
    let mut t2 =
        Transaction::new(alice.clone(), 2, h1.clone(), unified_timestamp());
    t2.push(&credit(60));
    let h2 = t2.hash();
    env.pool.accept(t2, None).unwrap();

    let store = env.store.as_ref();
    assert_eq!(store.read_claimed(&h1, 0, Flags::Mempool), Ok(60));
    assert_eq!(balance(store, &a, Flags::Mempool), 900);
    assert_eq!(balance(store, &b, Flags::Mempool), 60);
    assert_eq!(balance(store, &a, Flags::Block), 1000);

    // unwind the tail of the chain
    assert_eq!(env.pool.evict(&h1), Err(MempoolError::Conflict(h1.clone())));
    for hash in [&h2, &h1] {
        assert_eq!(env.pool.evict(hash), Ok(true));
    }
    assert_eq!(env.pool.evict(&h2), Ok(false));
    assert_eq!(
        store.read_claimed(&h1, 0, Flags::Mempool),
        Err(StoreError::NotFound("claimed amount"))
    );
    assert_eq!(balance(store, &a, Flags::Mempool), 1000);
    assert!(env.pool.has(&h0));
    assert!(env.store.has_trust(&alice, Flags::Mempool));
    assert!(!env.store.has_trust(&alice, Flags::Block));
    assert!(env.disk.is_empty());
}

#[test]
fn test_extend_disk_tail() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let mut chain = ChainBuilder::new(alice.clone());
    let (h0, mut t0) = chain.next(&[raw("a0")]);
    let (_, t1) = chain.next(&[raw("a1")]);
    let (_, t2) = chain.next(&[raw("a2")]);

    // t0 is already in a block
    t0.connect(&env.block, Flags::Block).unwrap();
    t0.index(env.disk.as_ref(), &h0).unwrap();
    assert_eq!(env.disk.read_last(&alice), Ok(h0.clone()));
    assert_eq!(
        env.pool.accept(t0.clone(), None),
        Err(MempoolError::Exists(h0))
    );

    assert_eq!(env.pool.accept(t1, None), Ok(Admission::Accepted));
    assert_eq!(env.pool.accept(t2, None), Ok(Admission::Accepted));
    assert!(env.store.has_state(&Address::hash(b"a0"), Flags::Block));
    assert!(!env.store.has_state(&Address::hash(b"a1"), Flags::Block));
}

#[test]
fn test_block_commits_first_of_two_debits() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let bob = Genesis::hash(b"bob");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    seed_account(env.store.as_ref(), &a, &alice, 1000);
    seed_account(env.store.as_ref(), &b, &bob, 0);

    let mut chain = ChainBuilder::new(alice.clone());
    let (h0, t0) = chain.next(&[debit(&a, &b, 100)]);
    let (h1, t1) = chain.next(&[debit(&a, &b, 100)]);
    env.pool.accept(t0, None).unwrap();
    env.pool.accept(t1, None).unwrap();

    // the block carries only t0, replayed from the pool
    let mut t0 = env.pool.get(&h0).unwrap();
    t0.connect(&env.block, Flags::Block).unwrap();
    t0.index(env.disk.as_ref(), &h0).unwrap();
    assert!(env.pool.remove(&h0));

    let store = env.store.as_ref();
    assert_eq!(balance(store, &a, Flags::Block), 900);
    assert_eq!(balance(store, &a, Flags::Mempool), 800);
    assert_eq!(store.read_events(&bob, Flags::Block).len(), 1);
    assert_eq!(store.read_events(&bob, Flags::Mempool).len(), 2);

    // t1 still holds 100 of the durable 900
    let (_, t2) = chain.next(&[debit(&a, &b, 850)]);
    assert_eq!(
        env.pool.accept(t2, None),
        Err(MempoolError::Exec(ExecError::InsufficientBalance {
            balance: 800,
            amount: 850
        }))
    );

    assert_eq!(env.pool.evict(&h1), Ok(true));
    assert_eq!(balance(store, &a, Flags::Mempool), 900);
    assert_eq!(store.read_events(&bob, Flags::Mempool).len(), 1);
    assert_eq!(env.store.snapshot().pending_len(), 0);
}

#[test]
fn test_racing_successors() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let (h0, t0) = ChainBuilder::new(alice.clone()).next(&[raw("a0")]);
    env.pool.accept(t0, None).unwrap();

    let forks: Vec<Transaction> = (0..16)
        .map(|i| {
            let mut tx =
                Transaction::new(alice.clone(), 1, h0.clone(), unified_timestamp());
            tx.push(&raw(&format!("fork{}", i)));
            tx
        })
        .collect();
    let pool = &env.pool;
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = forks
            .into_iter()
            .map(|tx| s.spawn(move || pool.accept(tx, None)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for r in results.iter().filter(|r| r.is_err()) {
        assert_eq!(r, &Err(MempoolError::Conflict(h0.clone())));
    }
    assert_eq!(env.pool.size(), 2);
    assert_eq!(env.pool.get_chain(&alice).len(), 2);
}
