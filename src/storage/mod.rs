//! Data storage and persistence
//!
//! A single sled database holding the chain, the transaction buffer and the
//! node registry.

pub mod store;

pub use store::Store;
