//! Error handling for the ledger node
//!
//! Failures that a caller may want to branch on get their own variant. Message
//! level rejections (bad signatures, malformed announcements) are not errors;
//! they are reported through the reception outcome enums in `network::gossip`.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Store unavailable, constraint violation or failed sled transaction
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    /// An operation needed a chain head but the store holds no block yet
    #[error("Chain not bootstrapped: no block stored yet")]
    ChainNotBootstrapped,
    /// Point-to-point calls between nodes (control API)
    #[error("Network error: {0}")]
    Network(String),
    /// Publish/subscribe backend failures
    #[error("Transport error: {0}")]
    Transport(String),
    /// Fatal join failure; the node must not keep starting
    #[error("Bootstrap aborted: {0}")]
    Bootstrap(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for LedgerError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LedgerError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LedgerError {
    fn from(err: toml::de::Error) -> Self {
        LedgerError::Config(err.to_string())
    }
}
