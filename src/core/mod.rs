//! Core ledger functionality
//!
//! Blocks and signed transactions with their canonical hashing, the
//! proof-of-work search, and the ledger engine that mines, stores and
//! replaces the chain.

pub mod block;
pub mod blockchain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, ChainDecision, ChainPolicy, ChainSettings, Ingested};
pub use proof_of_work::{Difficulty, ProofOfWork};
pub use transaction::{Transaction, TransactionData};
