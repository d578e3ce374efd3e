//! Data model for the round-and-period BFT application engine.
//!
//! This crate is the wire/data-model layer: payloads, transactions,
//! blocks, the append-only blockchain, consensus parameters and the
//! error taxonomy. The engine itself (`round-abci`) builds on top of
//! these types.

pub mod block;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payload;
pub mod transaction;

pub use block::{Block, BlockHeader, Blockchain};
pub use config::{threshold, ConsensusParams, EngineConfig};
pub use error::EngineError;
pub use ledger::{LedgerKind, LedgerRecover};
pub use payload::{is_registered, register_payload_kind, Payload, PayloadData, ROUND_COUNT_DEFAULT};
pub use transaction::Transaction;
