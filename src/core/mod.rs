use num_traits::FromPrimitive;

mod exec;
pub mod opcode;
pub mod operands;
pub mod params;
mod rollback;

use crate::common::{Address, Genesis, TxHash};
use crate::register::{ObjectError, RegisterType};
use crate::store::StoreError;
use crate::stream::{Stream, StreamError};
pub use exec::Engine;
pub use opcode::Opcode;
pub use operands::Op;
pub use params::Config;

/// One operation of a transaction: the operation stream plus the register stream holding the
/// pre-state and post-state records written when it was first executed. The transaction binds
/// the caller, timestamp, hash and position before execution.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Contract {
    ops: Stream,
    register: Stream,
    caller: Genesis,
    timestamp: u64,
    txid: TxHash,
    index: u32,
}

impl Contract {
    pub fn new(ops: Stream) -> Self {
        Self {
            ops,
            ..Default::default()
        }
    }

    pub fn from_op(op: &Op) -> Self {
        Self::new(op.to_stream())
    }

    pub fn bind(
        &mut self, caller: &Genesis, timestamp: u64, txid: &TxHash, index: u32,
    ) {
        self.caller = caller.clone();
        self.timestamp = timestamp;
        self.txid = txid.clone();
        self.index = index;
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.ops.reset();
        self.register.reset();
    }

    #[inline(always)]
    pub fn ops(&self) -> &Stream {
        &self.ops
    }

    #[inline(always)]
    pub fn register(&self) -> &Stream {
        &self.register
    }

    #[inline(always)]
    pub fn caller(&self) -> &Genesis {
        &self.caller
    }

    #[inline(always)]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline(always)]
    pub fn txid(&self) -> &TxHash {
        &self.txid
    }

    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Peek at the leading opcode without decoding the operands.
    pub fn opcode(&self) -> Option<Opcode> {
        self.ops.as_bytes().first().and_then(|b| Opcode::from_u8(*b))
    }

    pub fn decode(&self) -> Result<Op, ExecError> {
        let mut ops = self.ops.clone();
        ops.reset();
        Op::decode(&mut ops)
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        !self.register.is_empty()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    // structural
    #[error("malformed contract: {0}")]
    Stream(#[from] StreamError),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("conditions cannot be nested")]
    NestedCondition,

    // preconditions
    #[error("{0}")]
    Object(#[from] ObjectError),
    #[error("register {0} already exists")]
    AddressInUse(Address),
    #[error("register {0} does not exist")]
    MissingRegister(Address),
    #[error("caller does not own register {0}")]
    NotOwner(Address),
    #[error("operation not allowed on {0:?} register")]
    WrongType(RegisterType),
    #[error("register is not a {0} object")]
    NotStandard(&'static str),
    #[error("balance {balance} is less than {amount}")]
    InsufficientBalance { balance: u64, amount: u64 },
    #[error("stake {stake} is less than {amount}")]
    InsufficientStake { stake: u64, amount: u64 },
    #[error("trust {trust} is less than penalty {penalty}")]
    InsufficientTrust { trust: u64, penalty: u64 },
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("new account must start with an empty balance")]
    NonEmptyAccount,
    #[error("token balance must equal its supply")]
    SupplyMismatch,
    #[error("token identifier already reserved")]
    IdentifierInUse,
    #[error("unknown token identifier")]
    UnknownToken,
    #[error("token mismatch")]
    TokenMismatch,
    #[error("referenced contract is not a valid {0}")]
    BadSource(&'static str),
    #[error("caller is not the recipient")]
    NotRecipient,
    #[error("register is not pending transfer")]
    NotPending,
    #[error("already claimed")]
    AlreadyClaimed,
    #[error("claim of {amount} overflows: {claimed} of {limit} claimed")]
    ClaimOverflow { claimed: u64, amount: u64, limit: u64 },
    #[error("trust account already indexed")]
    TrustIndexed,
    #[error("trust account has no stake")]
    NoStake,
    #[error("trust account not indexed")]
    TrustMissing,
    #[error("trust account already has trust or stake")]
    TrustNotEmpty,
    #[error("condition already validated")]
    AlreadyValidated,
    #[error("authorize requires private mode")]
    PrivateModeOnly,
    #[error("authorize genesis does not match caller")]
    AuthorizeMismatch,
    #[error("empty legacy script")]
    EmptyScript,
    #[error("pre-state does not match register")]
    PreStateMismatch,
    #[error("post-state checksum mismatch")]
    PostStateMismatch,
    #[error("contract already executed")]
    AlreadyExecuted,

    // rollback
    #[error("register stream not in pre-state")]
    PreStateMissing,
    #[error("unexpected register tag {0:#04x}")]
    BadTag(u8),
    #[error("contract was never executed")]
    NotExecuted,
    #[error("claimed amount underflow")]
    ClaimUnderflow,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[test]
fn test_contract_peek() {
    let c = Contract::from_op(&Op::Stake { amount: 1 });
    assert_eq!(c.opcode(), Some(Opcode::Stake));
    assert!(!c.is_executed());
    assert_eq!(Contract::default().opcode(), None);
    assert_eq!(c.decode().unwrap(), Op::Stake { amount: 1 });
}
