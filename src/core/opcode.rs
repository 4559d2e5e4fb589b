#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // register primitives
    Write = 0x01,
    Create = 0x02,
    Append = 0x03,
    Transfer = 0x04,
    Claim = 0x05,

    // financial primitives
    Debit = 0x10,
    Credit = 0x11,
    Coinbase = 0x12,
    Trust = 0x13,
    Genesis = 0x14,
    Stake = 0x15,
    Unstake = 0x16,
    Legacy = 0x17,

    // access control
    Authorize = 0x20,

    // conditional wrappers
    Condition = 0x30,
    Validate = 0x31,
}

impl Opcode {
    /// Whether executing the opcode records register states in the contract. The others leave
    /// only a bare `POSTSTATE` marker.
    pub fn mutates(&self) -> bool {
        use Opcode::*;
        match self {
            Write | Create | Append | Transfer | Claim | Debit | Credit |
            Trust | Genesis | Stake | Unstake | Legacy => true,
            Coinbase | Authorize => false,
            // decided by the wrapped primitive
            Condition | Validate => false,
        }
    }
}
