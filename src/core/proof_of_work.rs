use crate::core::Block;
use crate::error::{LedgerError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Required leading prefix of a block hash, e.g. `"0000"`.
///
/// Only lowercase hex digits are accepted: a digest can never start with
/// anything else, so such a prefix would never be met.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Difficulty(String);

impl Difficulty {
    pub fn new(prefix: &str) -> Result<Difficulty> {
        if let Some(bad) = prefix.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(LedgerError::Config(format!(
                "Difficulty prefix {prefix:?} contains {bad:?}; only lowercase hex digits can match a hash"
            )));
        }
        Ok(Difficulty(prefix.to_string()))
    }

    pub fn zeroes(count: usize) -> Difficulty {
        Difficulty("0".repeat(count))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_met_by(&self, hash: &str) -> bool {
        hash.starts_with(self.0.as_str())
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::zeroes(4)
    }
}

impl FromStr for Difficulty {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Difficulty::new(s)
    }
}

impl TryFrom<String> for Difficulty {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Difficulty::new(&value)
    }
}

impl From<Difficulty> for String {
    fn from(value: Difficulty) -> Self {
        value.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ProofOfWork {
    difficulty: Difficulty,
}

impl ProofOfWork {
    pub fn new(difficulty: Difficulty) -> ProofOfWork {
        ProofOfWork { difficulty }
    }

    pub fn difficulty(&self) -> &Difficulty {
        &self.difficulty
    }

    /// Validate proof-of-work for a block: intact hash that meets the prefix
    pub fn validate(&self, block: &Block) -> bool {
        block.has_valid_hash() && self.difficulty.is_met_by(block.get_hash())
    }

    /// Increment the nonce until the block hash meets the difficulty.
    ///
    /// There is no iteration cap; the loop ends only when a nonce is found.
    pub fn run(&self, block: &mut Block) -> Result<()> {
        let start_nonce = block.get_nonce();
        loop {
            block.seal()?;
            if self.difficulty.is_met_by(block.get_hash()) {
                break;
            }
            block.increment_nonce();
        }
        debug!(
            "Nonce search for block {} took {} attempts",
            block.get_id(),
            block.get_nonce().wrapping_sub(start_nonce) + 1
        );
        info!(
            "New block mined: {} (difficulty {:?})",
            block.get_hash(),
            self.difficulty.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::NONCE_SEED;
    use chrono::{TimeZone, Utc};

    fn create_test_block() -> Block {
        let ts = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
        Block::new(2, "abc".to_string(), NONCE_SEED, "[]".to_string(), &ts)
    }

    #[test]
    fn test_run_meets_difficulty() {
        let pow = ProofOfWork::new(Difficulty::zeroes(2));
        let mut block = create_test_block();
        pow.run(&mut block).unwrap();

        assert!(block.get_hash().starts_with("00"));
        assert!(block.has_valid_hash());
        assert!(pow.validate(&block));
        assert!(block.get_nonce() >= NONCE_SEED);
    }

    #[test]
    fn test_empty_difficulty_accepts_first_nonce() {
        let pow = ProofOfWork::new(Difficulty::new("").unwrap());
        let mut block = create_test_block();
        pow.run(&mut block).unwrap();
        assert_eq!(block.get_nonce(), NONCE_SEED);
    }

    #[test]
    fn test_validate_rejects_tampered_block() {
        let pow = ProofOfWork::new(Difficulty::zeroes(1));
        let mut block = create_test_block();
        pow.run(&mut block).unwrap();
        block.increment_nonce();
        assert!(!pow.validate(&block));
    }

    #[test]
    fn test_difficulty_rejects_non_hex() {
        assert!(Difficulty::new("000").is_ok());
        assert!(Difficulty::new("0a").is_ok());
        assert!(Difficulty::new("00z").is_err());
        assert!(Difficulty::new("0A").is_err());
        assert!("zz".parse::<Difficulty>().is_err());
    }

    #[test]
    fn test_difficulty_serde_validates() {
        let parsed: Difficulty = serde_json::from_str("\"000\"").unwrap();
        assert_eq!(parsed, Difficulty::zeroes(3));
        assert!(serde_json::from_str::<Difficulty>("\"xyz\"").is_err());
    }
}
