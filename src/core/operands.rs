//! Fixed-layout operands of every opcode.
//!
//! | opcode    | layout (bytes)                                              |
//! |-----------|-------------------------------------------------------------|
//! | WRITE     | address 32, data var                                        |
//! | CREATE    | address 32, type 1, data var                                |
//! | APPEND    | address 32, data var                                        |
//! | TRANSFER  | address 32, recipient 32                                    |
//! | CLAIM     | txid 64, contract 4, address 32                             |
//! | DEBIT     | from 32, to 32, amount 8                                    |
//! | CREDIT    | txid 64, contract 4, proof 32, to 32, amount 8              |
//! | COINBASE  | genesis 32, amount 8, nonce 8                               |
//! | TRUST     | last 64, score 8, reward 8                                  |
//! | GENESIS   | address 32, reward 8                                        |
//! | STAKE     | amount 8                                                    |
//! | UNSTAKE   | amount 8, penalty 8                                         |
//! | AUTHORIZE | txid 64, genesis 32                                         |
//! | LEGACY    | from 32, amount 8, script var                               |
//! | CONDITION | wrapped primitive                                           |
//! | VALIDATE  | txid 64, contract 4, wrapped primitive                      |

use num_traits::FromPrimitive;

use super::opcode::Opcode;
use super::ExecError;
use crate::common::{Address, Genesis, TxHash};
use crate::register::RegisterType;
use crate::stream::{Stream, StreamError};

/// A decoded operation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Op {
    Write {
        address: Address,
        data: Vec<u8>,
    },
    Create {
        address: Address,
        kind: RegisterType,
        data: Vec<u8>,
    },
    Append {
        address: Address,
        data: Vec<u8>,
    },
    Transfer {
        address: Address,
        to: Genesis,
    },
    Claim {
        txid: TxHash,
        contract: u32,
        address: Address,
    },
    Debit {
        from: Address,
        to: Address,
        amount: u64,
    },
    Credit {
        txid: TxHash,
        contract: u32,
        proof: Address,
        to: Address,
        amount: u64,
    },
    Coinbase {
        genesis: Genesis,
        amount: u64,
        nonce: u64,
    },
    Trust {
        last: TxHash,
        score: u64,
        reward: u64,
    },
    Genesis {
        address: Address,
        reward: u64,
    },
    Stake {
        amount: u64,
    },
    Unstake {
        amount: u64,
        penalty: u64,
    },
    Authorize {
        txid: TxHash,
        genesis: Genesis,
    },
    Legacy {
        from: Address,
        amount: u64,
        script: Vec<u8>,
    },
    Condition(Box<Op>),
    Validate {
        txid: TxHash,
        contract: u32,
        op: Box<Op>,
    },
}

impl Op {
    /// Decode exactly one operation, rejecting trailing bytes.
    pub fn decode(s: &mut Stream) -> Result<Self, ExecError> {
        let op = Self::decode_one(s, false)?;
        s.expect_end()?;
        Ok(op)
    }

    fn decode_one(s: &mut Stream, nested: bool) -> Result<Self, ExecError> {
        let raw: u8 = s.read()?;
        let opcode =
            Opcode::from_u8(raw).ok_or(ExecError::UnknownOpcode(raw))?;
        Ok(match opcode {
            Opcode::Write => Op::Write {
                address: s.read()?,
                data: s.read()?,
            },
            Opcode::Create => {
                let address = s.read()?;
                let tag: u8 = s.read()?;
                let kind = RegisterType::from_u8(tag)
                    .ok_or(StreamError::InvalidTag(tag))?;
                Op::Create {
                    address,
                    kind,
                    data: s.read()?,
                }
            }
            Opcode::Append => Op::Append {
                address: s.read()?,
                data: s.read()?,
            },
            Opcode::Transfer => Op::Transfer {
                address: s.read()?,
                to: s.read()?,
            },
            Opcode::Claim => Op::Claim {
                txid: s.read()?,
                contract: s.read()?,
                address: s.read()?,
            },
            Opcode::Debit => Op::Debit {
                from: s.read()?,
                to: s.read()?,
                amount: s.read()?,
            },
            Opcode::Credit => Op::Credit {
                txid: s.read()?,
                contract: s.read()?,
                proof: s.read()?,
                to: s.read()?,
                amount: s.read()?,
            },
            Opcode::Coinbase => Op::Coinbase {
                genesis: s.read()?,
                amount: s.read()?,
                nonce: s.read()?,
            },
            Opcode::Trust => Op::Trust {
                last: s.read()?,
                score: s.read()?,
                reward: s.read()?,
            },
            Opcode::Genesis => Op::Genesis {
                address: s.read()?,
                reward: s.read()?,
            },
            Opcode::Stake => Op::Stake { amount: s.read()? },
            Opcode::Unstake => Op::Unstake {
                amount: s.read()?,
                penalty: s.read()?,
            },
            Opcode::Authorize => Op::Authorize {
                txid: s.read()?,
                genesis: s.read()?,
            },
            Opcode::Legacy => Op::Legacy {
                from: s.read()?,
                amount: s.read()?,
                script: s.read()?,
            },
            Opcode::Condition | Opcode::Validate if nested => {
                return Err(ExecError::NestedCondition)
            }
            Opcode::Condition => {
                Op::Condition(Box::new(Self::decode_one(s, true)?))
            }
            Opcode::Validate => Op::Validate {
                txid: s.read()?,
                contract: s.read()?,
                op: Box::new(Self::decode_one(s, true)?),
            },
        })
    }

    pub fn encode(&self, s: &mut Stream) {
        s.write(&(self.opcode() as u8));
        match self {
            Op::Write { address, data } | Op::Append { address, data } => {
                s.write(address).write(data);
            }
            Op::Create {
                address,
                kind,
                data,
            } => {
                s.write(address).write(&(*kind as u8)).write(data);
            }
            Op::Transfer { address, to } => {
                s.write(address).write(to);
            }
            Op::Claim {
                txid,
                contract,
                address,
            } => {
                s.write(txid).write(contract).write(address);
            }
            Op::Debit { from, to, amount } => {
                s.write(from).write(to).write(amount);
            }
            Op::Credit {
                txid,
                contract,
                proof,
                to,
                amount,
            } => {
                s.write(txid)
                    .write(contract)
                    .write(proof)
                    .write(to)
                    .write(amount);
            }
            Op::Coinbase {
                genesis,
                amount,
                nonce,
            } => {
                s.write(genesis).write(amount).write(nonce);
            }
            Op::Trust {
                last,
                score,
                reward,
            } => {
                s.write(last).write(score).write(reward);
            }
            Op::Genesis { address, reward } => {
                s.write(address).write(reward);
            }
            Op::Stake { amount } => {
                s.write(amount);
            }
            Op::Unstake { amount, penalty } => {
                s.write(amount).write(penalty);
            }
            Op::Authorize { txid, genesis } => {
                s.write(txid).write(genesis);
            }
            Op::Legacy {
                from,
                amount,
                script,
            } => {
                s.write(from).write(amount).write(script);
            }
            Op::Condition(op) => op.encode(s),
            Op::Validate { txid, contract, op } => {
                s.write(txid).write(contract);
                op.encode(s)
            }
        }
    }

    pub fn to_stream(&self) -> Stream {
        let mut s = Stream::new();
        self.encode(&mut s);
        s
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Op::Write { .. } => Opcode::Write,
            Op::Create { .. } => Opcode::Create,
            Op::Append { .. } => Opcode::Append,
            Op::Transfer { .. } => Opcode::Transfer,
            Op::Claim { .. } => Opcode::Claim,
            Op::Debit { .. } => Opcode::Debit,
            Op::Credit { .. } => Opcode::Credit,
            Op::Coinbase { .. } => Opcode::Coinbase,
            Op::Trust { .. } => Opcode::Trust,
            Op::Genesis { .. } => Opcode::Genesis,
            Op::Stake { .. } => Opcode::Stake,
            Op::Unstake { .. } => Opcode::Unstake,
            Op::Authorize { .. } => Opcode::Authorize,
            Op::Legacy { .. } => Opcode::Legacy,
            Op::Condition(_) => Opcode::Condition,
            Op::Validate { .. } => Opcode::Validate,
        }
    }

    /// The primitive carried by a CONDITION or VALIDATE, or the operation itself.
    pub fn primitive(&self) -> &Op {
        match self {
            Op::Condition(op) | Op::Validate { op, .. } => op,
            op => op,
        }
    }

    #[inline]
    pub fn mutates(&self) -> bool {
        self.primitive().opcode().mutates()
    }
}

#[test]
fn test_operand_widths() {
    let debit = Op::Debit {
        from: Address::hash(b"a"),
        to: Address::hash(b"b"),
        amount: 100,
    };
    assert_eq!(debit.to_stream().len(), 1 + 32 + 32 + 8);
    let transfer = Op::Transfer {
        address: Address::hash(b"a"),
        to: Genesis::hash(b"bob"),
    };
    assert_eq!(transfer.to_stream().len(), 1 + 32 + 32);
    let credit = Op::Credit {
        txid: TxHash::hash(b"t"),
        contract: 0,
        proof: Address::hash(b"a"),
        to: Address::hash(b"b"),
        amount: 60,
    };
    let mut s = credit.to_stream();
    assert_eq!(s.len(), 1 + 64 + 4 + 32 + 32 + 8);
    assert_eq!(Op::decode(&mut s).unwrap(), credit);
}

#[test]
fn test_decode_failures() {
    let mut s = Stream::from_bytes(vec![0xee]);
    assert!(matches!(Op::decode(&mut s), Err(ExecError::UnknownOpcode(0xee))));

    let mut s = Op::Stake { amount: 5 }.to_stream();
    s.write(&0u8);
    assert!(matches!(
        Op::decode(&mut s),
        Err(ExecError::Stream(StreamError::Trailing(1)))
    ));

    // truncated DEBIT
    let mut bytes = Op::Debit {
        from: Address::zero().clone(),
        to: Address::zero().clone(),
        amount: 1,
    }
    .to_stream()
    .into_inner();
    bytes.truncate(70);
    assert!(matches!(
        Op::decode(&mut Stream::from_bytes(bytes)),
        Err(ExecError::Stream(StreamError::Truncated { .. }))
    ));

    let nested = Op::Condition(Box::new(Op::Condition(Box::new(Op::Stake {
        amount: 1,
    }))));
    assert!(matches!(
        Op::decode(&mut nested.to_stream()),
        Err(ExecError::NestedCondition)
    ));
}

#[test]
fn test_wrapped_primitive() {
    let op = Op::Validate {
        txid: TxHash::zero().clone(),
        contract: 2,
        op: Box::new(Op::Stake { amount: 3 }),
    };
    assert_eq!(op.primitive().opcode(), Opcode::Stake);
    assert!(op.mutates());
    assert!(!Op::Condition(Box::new(Op::Authorize {
        txid: TxHash::zero().clone(),
        genesis: Genesis::zero().clone(),
    }))
    .mutates());
    assert_eq!(Op::decode(&mut op.to_stream()).unwrap(), op);
}
