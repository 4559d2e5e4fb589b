use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

use regledger::common::*;
use regledger::core::{Config, Contract, Engine, ExecError, Op};
use regledger::ledger::{LedgerIndex, MemLedger, Transaction};
use regledger::register::{Object, RegisterType, State, Value};
use regledger::store::{Flags, MemRegisterStore, RegisterStore};
use regledger::stream::Stream;
use regledger_tools::chain::{random_debits, ChainBuilder};
use regledger_tools::dummy::*;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Env {
    store: Arc<MemRegisterStore>,
    ledger: Arc<MemLedger>,
    engine: Engine<MemRegisterStore, MemLedger>,
}

fn setup(config: Config) -> Env {
    init();
    let store = Arc::new(MemRegisterStore::new());
    let ledger = Arc::new(MemLedger::new());
    let engine = Engine::new(store.clone(), ledger.clone(), config);
    Env {
        store,
        ledger,
        engine,
    }
}

fn contract(caller: &Genesis, op: Op, index: u32) -> Contract {
    let mut c = Contract::from_op(&op);
    c.bind(caller, 1000, &TxHash::hash(b"local"), index);
    c
}

/// Execute `op` and roll it back, checking the store comes back exactly as it was. Returns the
/// contract executed once more, with its register records.
fn round_trip(env: &Env, caller: &Genesis, op: Op, flags: Flags) -> Contract {
    let before = env.store.snapshot();
    let mut c = contract(caller, op, 0);
    env.engine.execute(&mut c, flags).unwrap();
    env.engine.rollback(&mut c, flags).unwrap();
    assert_eq!(env.store.snapshot(), before);
    assert!(!c.is_executed());
    env.engine.execute(&mut c, flags).unwrap();
    c
}

/// Connect `tx` in the durable context and put it in the transaction index.
fn confirm(env: &Env, hash: &TxHash, mut tx: Transaction) -> Transaction {
    tx.connect(&env.engine, Flags::Block).unwrap();
    env.ledger.write_tx(hash, &tx).unwrap();
    tx
}

fn seed_raw(env: &Env, addr: &Address, owner: &Genesis, data: &[u8]) {
    let state = State::new(RegisterType::Raw, owner.clone(), 0, data.to_vec());
    env.store.write_state(addr, &state, Flags::Block).unwrap();
}

#[test]
fn test_register_primitives() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let raw = Address::hash(b"raw");
    let c = round_trip(
        &env,
        &alice,
        Op::Create {
            address: raw.clone(),
            kind: RegisterType::Raw,
            data: b"hello".to_vec(),
        },
        Flags::Block,
    );
    // a create records its post-state only
    assert_eq!(c.register().len(), 1 + 8);
    round_trip(
        &env,
        &alice,
        Op::Write {
            address: raw.clone(),
            data: b"bye".to_vec(),
        },
        Flags::Block,
    );
    round_trip(
        &env,
        &alice,
        Op::Append {
            address: raw.clone(),
            data: b"!".to_vec(),
        },
        Flags::Block,
    );
    let state = env.store.read_state(&raw, Flags::Block).unwrap();
    assert_eq!(state.data, b"bye!");
    assert_eq!(state.modified, 1000);
    assert!(state.is_valid());

    let mut c = contract(
        &Genesis::hash(b"mallory"),
        Op::Write {
            address: raw.clone(),
            data: Vec::new(),
        },
        1,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::NotOwner(raw.clone()))
    );
    let mut c = contract(
        &alice,
        Op::Create {
            address: raw.clone(),
            kind: RegisterType::Raw,
            data: Vec::new(),
        },
        1,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::AddressInUse(raw))
    );
    let mut c = contract(
        &alice,
        Op::Create {
            address: Address::hash(b"sys"),
            kind: RegisterType::System,
            data: Vec::new(),
        },
        1,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::WrongType(RegisterType::System))
    );
}

#[test]
fn test_object_write() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let addr = Address::hash(b"note");
    let obj = Object::new()
        .with("note", Value::String("draft".into()), true)
        .with("serial", Value::U32(7), false);
    round_trip(
        &env,
        &alice,
        Op::Create {
            address: addr.clone(),
            kind: RegisterType::Object,
            data: obj.to_bytes(),
        },
        Flags::Block,
    );

    let mut updates = Stream::new();
    updates
        .write(&"note".to_string())
        .write(&Value::String("final".into()));
    round_trip(
        &env,
        &alice,
        Op::Write {
            address: addr.clone(),
            data: updates.into_inner(),
        },
        Flags::Block,
    );
    let obj = env.store.read_state(&addr, Flags::Block).unwrap().object().unwrap();
    assert_eq!(obj.get("note"), Some(&Value::String("final".into())));

    let mut updates = Stream::new();
    updates.write(&"serial".to_string()).write(&Value::U32(8));
    let mut c = contract(
        &alice,
        Op::Write {
            address: addr.clone(),
            data: updates.into_inner(),
        },
        1,
    );
    assert!(matches!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::Object(_))
    ));

    // balances only move through DEBIT and CREDIT
    let account = Address::hash(b"account");
    seed_account(env.store.as_ref(), &account, &alice, 10);
    let mut updates = Stream::new();
    updates.write(&"balance".to_string()).write(&Value::U64(1_000_000));
    let mut c = contract(
        &alice,
        Op::Write {
            address: account,
            data: updates.into_inner(),
        },
        2,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::NotStandard("non-standard"))
    );
}

#[test]
fn test_create_token_and_account() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let id = U256::from(77);
    let token = Address::hash(b"token");
    round_trip(
        &env,
        &alice,
        Op::Create {
            address: token.clone(),
            kind: RegisterType::Object,
            data: Object::token(id, 1000, 2).to_bytes(),
        },
        Flags::Block,
    );
    assert!(env.store.has_identifier(&id, Flags::Block));

    // identifier is taken now
    let mut c = contract(
        &alice,
        Op::Create {
            address: Address::hash(b"token2"),
            kind: RegisterType::Object,
            data: Object::token(id, 5, 0).to_bytes(),
        },
        1,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::IdentifierInUse)
    );

    round_trip(
        &env,
        &alice,
        Op::Create {
            address: Address::hash(b"holder"),
            kind: RegisterType::Object,
            data: Object::account(id, 0).to_bytes(),
        },
        Flags::Block,
    );
    let mut c = contract(
        &alice,
        Op::Create {
            address: Address::hash(b"stray"),
            kind: RegisterType::Object,
            data: Object::account(U256::from(78), 0).to_bytes(),
        },
        2,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::UnknownToken)
    );
    let mut c = contract(
        &alice,
        Op::Create {
            address: Address::hash(b"rich"),
            kind: RegisterType::Object,
            data: Object::account(U256::zero(), 5).to_bytes(),
        },
        3,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::NonEmptyAccount)
    );
}

#[test]
fn test_transfer_and_claim() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let bob = Genesis::hash(b"bob");
    let reg = Address::hash(b"deed");
    seed_raw(&env, &reg, &alice, b"deed");

    let mut chain = ChainBuilder::new(alice.clone());
    let (h, tx) = chain.next(&[Op::Transfer {
        address: reg.clone(),
        to: bob.clone(),
    }]);
    confirm(&env, &h, tx);
    let state = env.store.read_state(&reg, Flags::Block).unwrap();
    assert!(state.owner.is_zero());
    assert_eq!(env.store.read_events(&bob, Flags::Block), vec![(h.clone(), 0)]);

    let claim = Op::Claim {
        txid: h.clone(),
        contract: 0,
        address: reg.clone(),
    };
    let mut c = contract(&Genesis::hash(b"carol"), claim.clone(), 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::NotRecipient)
    );
    round_trip(&env, &bob, claim.clone(), Flags::Block);
    assert!(env.store.read_state(&reg, Flags::Block).unwrap().is_owned_by(&bob));
    assert!(env.store.has_proof(&reg, &h, 0, Flags::Block));

    let mut c = contract(&alice, claim, 1);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::AlreadyClaimed)
    );
}

#[test]
fn test_debit_credit_conservation() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let bob = Genesis::hash(b"bob");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    seed_account(env.store.as_ref(), &a, &alice, 1000);
    seed_account(env.store.as_ref(), &b, &bob, 0);

    let mut chain = ChainBuilder::new(alice.clone());
    let (h, tx) = chain.next(&[Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount: 100,
    }]);
    confirm(&env, &h, tx);
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 900);
    assert_eq!(env.store.read_events(&bob, Flags::Block), vec![(h.clone(), 0)]);

    let credit = |to: &Address, amount| Op::Credit {
        txid: h.clone(),
        contract: 0,
        proof: a.clone(),
        to: to.clone(),
        amount,
    };
    round_trip(&env, &bob, credit(&b, 60), Flags::Block);
    assert_eq!(env.store.read_claimed(&h, 0, Flags::Block), Ok(60));

    let mut c = contract(&bob, credit(&b, 50), 1);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::ClaimOverflow {
            claimed: 60,
            amount: 50,
            limit: 100
        })
    );
    assert_eq!(env.store.read_claimed(&h, 0, Flags::Block), Ok(60));
    assert_eq!(balance(env.store.as_ref(), &b, Flags::Block), 60);

    // the sender takes the rest back
    let c = round_trip(&env, &alice, credit(&a, 40), Flags::Block);
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 940);
    assert!(env.store.has_proof(&a, &h, 0, Flags::Block));
    let mut c2 = contract(&bob, credit(&b, 1), 2);
    assert_eq!(
        env.engine.execute(&mut c2, Flags::Block),
        Err(ExecError::AlreadyClaimed)
    );

    // undoing the final credit reopens the debit
    let mut c = c;
    env.engine.rollback(&mut c, Flags::Block).unwrap();
    assert!(!env.store.has_proof(&a, &h, 0, Flags::Block));
    assert_eq!(env.store.read_claimed(&h, 0, Flags::Block), Ok(60));
}

#[test]
fn test_coinbase_credit() {
    let env = setup(Config::default());
    let miner = Genesis::hash(b"miner");
    let wallet = Address::hash(b"wallet");
    seed_account(env.store.as_ref(), &wallet, &miner, 0);
    let mut chain = ChainBuilder::new(miner.clone());
    let (h, tx) = chain.next(&[Op::Coinbase {
        genesis: miner.clone(),
        amount: 50,
        nonce: 1,
    }]);
    let tx = confirm(&env, &h, tx);
    assert!(tx.is_coinbase());
    assert!(tx.contracts[0].is_executed());

    let credit = Op::Credit {
        txid: h.clone(),
        contract: 0,
        proof: Address::from(&miner),
        to: wallet.clone(),
        amount: 50,
    };
    let mut c = contract(&Genesis::hash(b"thief"), credit.clone(), 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::NotRecipient)
    );
    round_trip(&env, &miner, credit, Flags::Block);
    assert_eq!(balance(env.store.as_ref(), &wallet, Flags::Block), 50);
}

#[test]
fn test_trust_lifecycle() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let trust = Address::hash(b"trust");
    let store = env.store.as_ref();
    seed_trust(store, &trust, &alice, 500);

    let mut c = contract(&alice, Op::Stake { amount: 1 }, 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::TrustMissing)
    );

    round_trip(
        &env,
        &alice,
        Op::Genesis {
            address: trust.clone(),
            reward: 5,
        },
        Flags::Block,
    );
    assert!(store.has_trust(&alice, Flags::Block));
    assert_eq!(read_u64(store, &trust, "stake", Flags::Block), 500);
    assert_eq!(balance(store, &trust, Flags::Block), 5);

    let mut c = contract(
        &alice,
        Op::Genesis {
            address: trust.clone(),
            reward: 5,
        },
        1,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::TrustIndexed)
    );

    round_trip(&env, &alice, Op::Stake { amount: 5 }, Flags::Block);
    assert_eq!(read_u64(store, &trust, "stake", Flags::Block), 505);
    round_trip(
        &env,
        &alice,
        Op::Unstake {
            amount: 100,
            penalty: 0,
        },
        Flags::Block,
    );
    round_trip(
        &env,
        &alice,
        Op::Trust {
            last: TxHash::zero().clone(),
            score: 10,
            reward: 3,
        },
        Flags::Block,
    );
    assert_eq!(read_u64(store, &trust, "trust", Flags::Block), 10);
    assert_eq!(balance(store, &trust, Flags::Block), 103);
    assert_eq!(read_u64(store, &trust, "stake", Flags::Block), 405);

    let mut c = contract(
        &alice,
        Op::Unstake {
            amount: 1,
            penalty: 11,
        },
        2,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::InsufficientTrust {
            trust: 10,
            penalty: 11
        })
    );
    let mut c = contract(&alice, Op::Stake { amount: 104 }, 3);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::InsufficientBalance {
            balance: 103,
            amount: 104
        })
    );
}

#[test]
fn test_authorize() {
    let alice = Genesis::hash(b"alice");
    let op = Op::Authorize {
        txid: TxHash::hash(b"session"),
        genesis: alice.clone(),
    };
    let env = setup(Config::default());
    let mut c = contract(&alice, op.clone(), 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::PrivateModeOnly)
    );

    let config: Config =
        serde_json::from_str(r#"{"privateMode": true}"#).unwrap();
    let env = setup(config);
    let c = round_trip(&env, &alice, op.clone(), Flags::Block);
    assert!(c.is_executed());

    // a pooled authorize replays into a block exactly once
    let mut pooled = contract(&alice, op.clone(), 1);
    env.engine.execute(&mut pooled, Flags::Mempool).unwrap();
    let mut twice = pooled.clone();
    assert_eq!(
        env.engine.execute(&mut twice, Flags::Mempool),
        Err(ExecError::AlreadyExecuted)
    );
    env.engine.execute(&mut pooled, Flags::Block).unwrap();
    assert_eq!(
        env.engine.execute(&mut pooled, Flags::Block),
        Err(ExecError::AlreadyExecuted)
    );
    env.engine.rollback(&mut pooled, Flags::Block).unwrap();
    assert!(!pooled.is_executed());

    let mut c = contract(&Genesis::hash(b"bob"), op, 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::AuthorizeMismatch)
    );
}

#[test]
fn test_condition_validate() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let bob = Genesis::hash(b"bob");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    seed_account(env.store.as_ref(), &a, &alice, 100);
    seed_account(env.store.as_ref(), &b, &bob, 20);

    let mut chain = ChainBuilder::new(alice.clone());
    let (cond, tx) = chain.next(&[Op::Condition(Box::new(Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount: 10,
    }))]);
    confirm(&env, &cond, tx);
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 90);

    let validate = Op::Validate {
        txid: cond.clone(),
        contract: 0,
        op: Box::new(Op::Debit {
            from: b.clone(),
            to: a.clone(),
            amount: 5,
        }),
    };
    round_trip(&env, &bob, validate.clone(), Flags::Block);
    assert!(env.store.has_validated(&cond, 0, Flags::Block));
    assert_eq!(balance(env.store.as_ref(), &b, Flags::Block), 15);
    let mut c = contract(&bob, validate, 1);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::AlreadyValidated)
    );

    // a plain debit is no condition
    let (plain, tx) = chain.next(&[Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount: 1,
    }]);
    confirm(&env, &plain, tx);
    let mut c = contract(
        &bob,
        Op::Validate {
            txid: plain,
            contract: 0,
            op: Box::new(Op::Stake { amount: 1 }),
        },
        2,
    );
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::BadSource("condition"))
    );
}

#[test]
fn test_legacy() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let a = Address::hash(b"A");
    seed_account(env.store.as_ref(), &a, &alice, 30);
    let legacy = |script: &[u8]| Op::Legacy {
        from: a.clone(),
        amount: 20,
        script: script.to_vec(),
    };
    let mut c = contract(&alice, legacy(b""), 0);
    assert_eq!(
        env.engine.execute(&mut c, Flags::Block),
        Err(ExecError::EmptyScript)
    );
    round_trip(&env, &alice, legacy(b"\x76\xa9"), Flags::Block);
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 10);
}

#[test]
fn test_pending_then_block() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    let store = env.store.as_ref();
    seed_account(store, &a, &alice, 1000);
    seed_account(store, &b, &Genesis::hash(b"bob"), 0);

    let debit = Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount: 100,
    };
    let mut c = round_trip(&env, &alice, debit, Flags::Mempool);
    // the durable state is untouched
    assert_eq!(balance(store, &a, Flags::Mempool), 900);
    assert_eq!(balance(store, &a, Flags::Block), 1000);
    let records = c.register().clone();

    // executing again sees its own result: the recorded pre-state no longer matches
    let mut again = c.clone();
    assert_eq!(
        env.engine.execute(&mut again, Flags::Mempool),
        Err(ExecError::PreStateMismatch)
    );

    // block replay verifies the records against the durable state
    env.engine.execute(&mut c, Flags::Block).unwrap();
    assert_eq!(c.register(), &records);
    assert_eq!(balance(store, &a, Flags::Block), 900);

    env.engine.rollback(&mut c, Flags::Block).unwrap();
    assert_eq!(balance(store, &a, Flags::Block), 1000);
    assert_eq!(
        env.engine.rollback(&mut c, Flags::Block),
        Err(ExecError::NotExecuted)
    );
}

#[test]
fn test_rollback_guards() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    seed_account(env.store.as_ref(), &a, &alice, 1000);
    seed_account(env.store.as_ref(), &b, &alice, 0);

    let mut never = contract(&alice, Op::Stake { amount: 1 }, 0);
    assert_eq!(
        env.engine.rollback(&mut never, Flags::Block),
        Err(ExecError::NotExecuted)
    );

    // a coinbase touches no register but still records its execution
    let coinbase = Op::Condition(Box::new(Op::Coinbase {
        genesis: alice.clone(),
        amount: 5,
        nonce: 0,
    }));
    let mut cb = contract(&alice, coinbase, 2);
    assert_eq!(
        env.engine.rollback(&mut cb, Flags::Block),
        Err(ExecError::NotExecuted)
    );
    env.engine.execute(&mut cb, Flags::Block).unwrap();
    let mut again = cb.clone();
    assert_eq!(
        env.engine.execute(&mut again, Flags::Block),
        Err(ExecError::AlreadyExecuted)
    );
    env.engine.rollback(&mut cb, Flags::Block).unwrap();
    assert_eq!(
        env.engine.rollback(&mut cb, Flags::Block),
        Err(ExecError::NotExecuted)
    );

    let debit = |amount| Op::Debit {
        from: a.clone(),
        to: b.clone(),
        amount,
    };
    let mut first = contract(&alice, debit(1), 0);
    let mut second = contract(&alice, debit(2), 1);
    env.engine.execute(&mut first, Flags::Block).unwrap();
    env.engine.execute(&mut second, Flags::Block).unwrap();
    // out of order: the register no longer holds the first post-state
    assert_eq!(
        env.engine.rollback(&mut first, Flags::Block),
        Err(ExecError::PostStateMismatch)
    );
    env.engine.rollback(&mut second, Flags::Block).unwrap();
    env.engine.rollback(&mut first, Flags::Block).unwrap();
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 1000);
    assert!(env.store.read_events(&alice, Flags::Block).is_empty());
}

#[test]
fn test_random_debits_unwind() {
    let env = setup(Config::default());
    let alice = Genesis::hash(b"alice");
    let a = Address::hash(b"A");
    let b = Address::hash(b"B");
    seed_account(env.store.as_ref(), &a, &alice, 10_000);
    seed_account(env.store.as_ref(), &b, &Genesis::hash(b"bob"), 0);
    let before = env.store.snapshot();

    let mut rng = StdRng::seed_from_u64(7);
    let ops = random_debits(&mut rng, &a, &b, 20, 10_000);
    let total: u64 = ops
        .iter()
        .map(|op| match op {
            Op::Debit { amount, .. } => *amount,
            _ => 0,
        })
        .sum();
    let mut chain = ChainBuilder::new(alice.clone());
    let (_, mut tx) = chain.next(&ops);
    tx.connect(&env.engine, Flags::Block).unwrap();
    assert_eq!(balance(env.store.as_ref(), &a, Flags::Block), 10_000 - total);
    tx.disconnect(&env.engine, Flags::Block).unwrap();
    assert_eq!(env.store.snapshot(), before);
}
