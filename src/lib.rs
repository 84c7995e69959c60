//! # Gossip Ledger - A Minimal Gossiping Proof-of-Work Ledger
//!
//! Every node keeps its own copy of a hash-linked chain of blocks. Signed
//! transactions are gossiped to all nodes; once enough of them are buffered a
//! node mines a block and broadcasts its whole chain, and everyone adopts the
//! longest chain they see.
//!
//! ## What's Here
//! - **Ledger**: canonical block hashing, proof-of-work, transaction buffering
//!   and the longest-chain replacement rule
//! - **Registry**: the set of known nodes, with this node's own address
//! - **Transports**: a mesh of direct publisher/subscriber links, or shared
//!   topics on a broker (the crate ships one, see `network::broker`)
//! - **Gossip**: the node, transaction and chain reception protocols plus the
//!   bootstrap sequence a node runs when it joins
//!
//! ## How the Code Is Organized
//! - `core/`: blocks, transactions, proof-of-work and the blockchain itself
//! - `network/`: nodes, transports, gossip, bootstrap and the control API
//! - `storage/`: the sled-backed store for blocks, transactions and nodes
//! - `config/`: node settings from TOML and environment variables
//! - `utils/`: hashing, signatures, timestamps and encodings
//! - `cli/`: command-line interface of the node binary
//!
//! ## Where to Start
//! 1. `main.rs` shows how a node is put together
//! 2. `core/blockchain.rs` holds mining and chain replacement
//! 3. `network/gossip.rs` holds what happens to each received message

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt};
pub use config::{Settings, TransportKind};
pub use crate::core::{
    Block, Blockchain, ChainDecision, ChainPolicy, ChainSettings, Difficulty, Ingested,
    ProofOfWork, Transaction, TransactionData,
};
pub use error::{LedgerError, Result};
pub use network::{
    bootstrap, BootstrapOutcome, BrokerTransport, ChainReception, ControlClient, ControlRequest,
    ControlResponse, ControlServer, Gossip, LogBroker, MeshPorts, MeshTransport, Node,
    NodeReception, NodeRegistry, PeerClient, Registration, Topic, TransactionReception,
    Transport,
};
pub use storage::Store;
pub use utils::{canonical_json, current_timestamp, sha256_hex, KeyPair};
