//! # regledger: state transitions of a register ledger
//!
//! - regledger applies and reverses the operations of a register-based ledger (write, create,
//!   transfer, debit, credit, staking and friends) against a key-value register store, and keeps
//!   the pool of pending transactions that feeds it.
//!
//! - Every applied operation can be undone exactly. That is what makes chain reorganization
//!   possible, and it is the property the whole crate is organized around.
//!
//! # Overview
//! Each module does one thing and can be used on its own:
//!
//! - [stream]: the byte cursor over one operation's payload, with the fixed-width codecs of the
//!   wire format.
//! - [register]: the versioned state of one register and the typed object model layered over
//!   its payload.
//! - [store]: the register store interface with its two evaluation contexts, plus an in-memory
//!   implementation.
//! - [core]: contracts, the operation decoder and the [Engine](core/struct.Engine.html) that
//!   executes and rolls back contracts.
//! - [ledger]: transactions, their hashing, and the per-genesis sigchain index.
//! - [mempool]: admission of pending transactions, orphans and conflicts.
//! - [logical]: secondary indexes that are not part of consensus (register lists, pending
//!   transfers, history, orderbook).
//! - [guarded]: scoped access to sealed secret material.
//!
//! Executing a transaction takes a few steps:
//!
//! - Build a store and a transaction index ([MemRegisterStore](store/struct.MemRegisterStore.html)
//!   and [MemLedger](ledger/struct.MemLedger.html) for the in-memory flavor).
//! - Create an [Engine](core/struct.Engine.html) over them.
//! - Call [Transaction::connect](ledger/struct.Transaction.html#method.connect) to execute all of
//!   its contracts, or none.
//!
//! # On Undo Records
//! A contract carries two byte streams: the operation stream, which is what gets hashed and
//! signed, and the register stream, which the engine fills on first execution with the state of
//! the touched register before the operation (`PRESTATE`) and the checksum of the state after it
//! (`POSTSTATE`). There is no separate journal:
//!
//! - Rollback reads the pre-state straight from the contract, checks that the register still
//!   holds the recorded post-state, and writes the pre-state back.
//!
//! - A contract relayed by another node, or replayed when a block arrives, already carries its
//!   records. The engine then verifies instead of recording: the embedded pre-state has to match
//!   the store byte for byte and the resulting checksum has to match the embedded one.
//!
//! - Secondary records an operation leaves behind (events, proofs, claimed amounts, the trust
//!   index, token identifiers, validated conditions) are derived from the operands, so rollback
//!   recomputes them instead of storing them.
//!
//! # Evaluation Contexts
//! Every store call carries [Flags](store/enum.Flags.html). `Block` works on the durable state,
//! `Mempool` on a pending overlay that shadows it:
//!
//! ```notrust
//!        [ Mempool::accept ]                 [ block commit ]
//!                |                                  |
//!      connect(Flags::Mempool)            connect(Flags::Block)
//!                |                                  |
//!                v                                  v
//!        [ pending overlay ] -- shadows -->  [ durable state ]
//!                             (erase leaves a tombstone)
//! ```
//!
//! A block write drops the overlay entry of the same key, so once a pooled transaction is
//! committed with its block the overlay holds nothing for it anymore.

#[macro_use] extern crate num_derive;

#[macro_use]
pub mod common;
pub mod core;
pub mod guarded;
pub mod ledger;
pub mod logical;
pub mod mempool;
pub mod register;
pub mod store;
pub mod stream;
