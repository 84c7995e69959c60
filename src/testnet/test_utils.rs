//! Test utilities for ledger testing

use crate::core::{Blockchain, ChainPolicy, ChainSettings, Difficulty, Transaction};
use crate::storage::Store;
use crate::utils::KeyPair;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

/// Address every fixture node runs as
pub const THIS_NODE: &str = "172.17.0.2";

/// 2012-01-01T00:00:00Z, the timestamp of the reference genesis block
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap()
}

pub fn test_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// A signed transaction whose notes carry `notes`
pub fn signed_transaction(key_pair: &KeyPair, notes: &str) -> Transaction {
    let data = json!({
        "full_names": "fullNames Test String",
        "practice_number": "1234567890",
        "notes": notes,
    });
    Transaction::new_signed(key_pair, data).unwrap()
}

/// First node settings with an easy difficulty
pub fn test_settings(mining_threshold: usize) -> ChainSettings {
    ChainSettings {
        this_node: THIS_NODE.to_string(),
        first_node: THIS_NODE.to_string(),
        difficulty: Difficulty::zeroes(2),
        mining_threshold,
        policy: ChainPolicy::Longest,
    }
}

/// A blockchain over a temporary store; no genesis block yet
pub fn create_test_blockchain(mining_threshold: usize) -> Blockchain {
    Blockchain::new(Store::temporary().unwrap(), test_settings(mining_threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_are_usable() {
        let blockchain = create_test_blockchain(4);
        assert_eq!(blockchain.block_count(), 0);
        assert!(blockchain.get_settings().is_first_node());

        let transaction = signed_transaction(&test_key_pair(), "fixture");
        assert!(transaction.is_valid());
        assert!(transaction.get_transaction_data_string().contains("fixture"));
    }
}
