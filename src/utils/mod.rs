//! Utility functions and helpers
//!
//! Digest, signature and timestamp primitives plus the storage and canonical
//! wire encodings shared by blocks, transactions and nodes.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, decode_public_key, decode_signature, encode_public_key, encode_signature,
    format_timestamp, secp256k1_sha256_verify, sha256_digest, sha256_hex, KeyPair,
    TIMESTAMP_FORMAT,
};

pub use serialization::{canonical_json, deserialize, serialize};
