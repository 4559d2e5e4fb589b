pub mod chain;
pub mod dummy;
use num_traits::FromPrimitive;

use regledger::core::Op;
use regledger::stream::Stream;

pub fn opcode_to_str(opcode: u8) -> Option<&'static str> {
    let opcode: Option<regledger::core::Opcode> =
        FromPrimitive::from_u8(opcode);
    use regledger::core::Opcode::*;
    opcode.map(|opcode| match opcode {
        Write => "Write",
        Create => "Create",
        Append => "Append",
        Transfer => "Transfer",
        Claim => "Claim",
        Debit => "Debit",
        Credit => "Credit",
        Coinbase => "Coinbase",
        Trust => "Trust",
        Genesis => "Genesis",
        Stake => "Stake",
        Unstake => "Unstake",
        Legacy => "Legacy",
        Authorize => "Authorize",
        Condition => "Condition",
        Validate => "Validate",
    })
}

fn operands(op: &Op) -> Vec<String> {
    let bytes = |b: &[u8]| format!("0x{}", hex::encode(b));
    match op {
        Op::Write { address, data } | Op::Append { address, data } => {
            vec![format!("0x{:x}", address), bytes(data)]
        }
        Op::Create {
            address,
            kind,
            data,
        } => vec![format!("0x{:x}", address), format!("{:?}", kind), bytes(data)],
        Op::Transfer { address, to } => {
            vec![format!("0x{:x}", address), format!("0x{:x}", to)]
        }
        Op::Claim {
            txid,
            contract,
            address,
        } => vec![
            format!("0x{:x}:{}", txid, contract),
            format!("0x{:x}", address),
        ],
        Op::Debit { from, to, amount } => vec![
            format!("0x{:x}", from),
            format!("0x{:x}", to),
            amount.to_string(),
        ],
        Op::Credit {
            txid,
            contract,
            proof,
            to,
            amount,
        } => vec![
            format!("0x{:x}:{}", txid, contract),
            format!("0x{:x}", proof),
            format!("0x{:x}", to),
            amount.to_string(),
        ],
        Op::Coinbase {
            genesis,
            amount,
            nonce,
        } => vec![
            format!("0x{:x}", genesis),
            amount.to_string(),
            nonce.to_string(),
        ],
        Op::Trust {
            last,
            score,
            reward,
        } => vec![
            format!("0x{:x}", last),
            score.to_string(),
            reward.to_string(),
        ],
        Op::Genesis { address, reward } => {
            vec![format!("0x{:x}", address), reward.to_string()]
        }
        Op::Stake { amount } => vec![amount.to_string()],
        Op::Unstake { amount, penalty } => {
            vec![amount.to_string(), penalty.to_string()]
        }
        Op::Authorize { txid, genesis } => {
            vec![format!("0x{:x}", txid), format!("0x{:x}", genesis)]
        }
        Op::Legacy {
            from,
            amount,
            script,
        } => vec![format!("0x{:x}", from), amount.to_string(), bytes(script)],
        Op::Condition(_) => Vec::new(),
        Op::Validate { txid, contract, .. } => {
            vec![format!("0x{:x}:{}", txid, contract)]
        }
    }
}

/// Render the operation stream of one contract. Undecodable input is dumped as hex with a
/// trailing `?`.
pub fn disasm(ops: &[u8], line_breaks: bool) -> String {
    let op = match Op::decode(&mut Stream::from_bytes(ops.to_vec())) {
        Ok(op) => op,
        Err(_) => return format!("0x{}?", hex::encode(ops)),
    };
    let mut asm = Vec::new();
    let mut next = Some(&op);
    while let Some(op) = next {
        let mut line = vec![opcode_to_str(op.opcode() as u8)
            .unwrap_or("?")
            .to_string()];
        line.extend(operands(op));
        asm.push(line.join(" "));
        next = match op {
            Op::Condition(inner) | Op::Validate { op: inner, .. } => {
                Some(inner.as_ref())
            }
            _ => None,
        };
    }
    asm.join(if line_breaks { "\n  " } else { " " })
}
