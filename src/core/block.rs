use crate::error::{LedgerError, Result};
use crate::utils::serialization::stringified;
use crate::utils::{format_timestamp, sha256_hex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Predecessor marker carried by the genesis block
pub const GENESIS_PREV_HASH: &str = "000000000";
/// Nonce every block starts from; the genesis block keeps it
pub const NONCE_SEED: u64 = 456;
pub const GENESIS_DATA: &str = "This is the genesis block";
/// Hash placeholder of a block that has not been sealed yet
pub const UNHASHED: &str = "non-hashed";

/// A hash linked unit of the ledger.
///
/// Fields are declared in lexicographic order so the serialized dict form is
/// already canonical. On the wire every field is a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    data: String,
    hash: String,
    #[serde(with = "stringified")]
    id: u64,
    #[serde(with = "stringified")]
    nonce: u64,
    prev_hash: String,
    timestamp: String,
}

// Everything except the hash, in canonical key order
#[derive(Serialize)]
struct HashInput<'a> {
    data: &'a str,
    id: u64,
    nonce: u64,
    prev_hash: &'a str,
    timestamp: &'a str,
}

impl Block {
    pub fn new(
        id: u64,
        prev_hash: String,
        nonce: u64,
        data: String,
        timestamp: &DateTime<Utc>,
    ) -> Block {
        Block {
            data,
            hash: UNHASHED.to_string(),
            id,
            nonce,
            prev_hash,
            timestamp: format_timestamp(timestamp),
        }
    }

    /// Genesis block for the given creation time, hash already sealed
    pub fn genesis(timestamp: &DateTime<Utc>) -> Result<Block> {
        let mut block = Block::new(
            1,
            GENESIS_PREV_HASH.to_string(),
            NONCE_SEED,
            GENESIS_DATA.to_string(),
            timestamp,
        );
        block.seal()?;
        Ok(block)
    }

    /// SHA-256 over the canonical JSON of every field but `hash`
    pub fn calculate_hash(&self) -> Result<String> {
        let input = HashInput {
            data: &self.data,
            id: self.id,
            nonce: self.nonce,
            prev_hash: &self.prev_hash,
            timestamp: &self.timestamp,
        };
        let encoded = serde_json::to_vec(&input)
            .map_err(|e| LedgerError::Serialization(format!("Failed to encode block: {e}")))?;
        Ok(sha256_hex(&encoded))
    }

    pub fn seal(&mut self) -> Result<()> {
        self.hash = self.calculate_hash()?;
        Ok(())
    }

    /// True when the stored hash matches a fresh computation
    pub fn has_valid_hash(&self) -> bool {
        match self.calculate_hash() {
            Ok(hash) => hash == self.hash,
            Err(_) => false,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.id == 1 && self.prev_hash == GENESIS_PREV_HASH
    }

    pub(crate) fn increment_nonce(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }

    pub fn get_id(&self) -> u64 {
        self.id
    }

    pub fn get_prev_hash(&self) -> &str {
        self.prev_hash.as_str()
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_data(&self) -> &str {
        self.data.as_str()
    }

    pub fn get_timestamp(&self) -> &str {
        self.timestamp.as_str()
    }

    pub fn get_hash(&self) -> &str {
        self.hash.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 4, 21, 18, 30, 0).unwrap()
    }

    #[test]
    fn test_bare_block() {
        let block = Block::new(
            2,
            GENESIS_PREV_HASH.to_string(),
            NONCE_SEED,
            "some data".to_string(),
            &fixed_time(),
        );
        assert_eq!(block.get_prev_hash(), "000000000");
        assert_eq!(block.get_nonce(), 456);
        assert_eq!(block.get_timestamp(), "2022-04-21T18:30:00Z");
        assert_eq!(block.get_hash(), UNHASHED);
        assert_eq!(block.get_data(), "some data");
    }

    #[test]
    fn test_hash_ignores_current_hash_field() {
        let mut block = Block::genesis(&fixed_time()).unwrap();
        let sealed = block.get_hash().to_string();
        block.hash = UNHASHED.to_string();
        assert_eq!(block.calculate_hash().unwrap(), sealed);
    }

    #[test]
    fn test_mutation_invalidates_hash() {
        let block = Block::genesis(&fixed_time()).unwrap();
        assert!(block.has_valid_hash());

        let mut tampered = block.clone();
        tampered.data = "other data".to_string();
        assert!(!tampered.has_valid_hash());

        let mut tampered = block.clone();
        tampered.increment_nonce();
        assert!(!tampered.has_valid_hash());

        let mut tampered = block.clone();
        tampered.prev_hash = "111111111".to_string();
        assert!(!tampered.has_valid_hash());

        let mut tampered = block;
        tampered.id = 9;
        tampered.timestamp = "2022-04-21T18:30:01Z".to_string();
        assert!(!tampered.has_valid_hash());
    }

    #[test]
    fn test_genesis_hash_is_reproducible() {
        let ts = Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap();
        let first = Block::genesis(&ts).unwrap();
        let second = Block::genesis(&ts).unwrap();
        assert_eq!(first.get_hash(), second.get_hash());
        assert!(first.is_genesis());
        // regression value for the canonical encoding
        assert_eq!(
            first.get_hash(),
            "5561fec1cecb2a39d5a638bfb94ba72beb3bf412a17c8ff658dc575ed5866f1a"
        );
    }

    #[test]
    fn test_wire_form_uses_strings() {
        let block = Block::genesis(&fixed_time()).unwrap();
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["id"], "1");
        assert_eq!(value["nonce"], "456");
        assert_eq!(value["prev_hash"], GENESIS_PREV_HASH);

        let decoded: Block = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, block);
    }
}
