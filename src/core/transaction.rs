use crate::error::{LedgerError, Result};
use crate::utils::serialization::{canonical_json, lenient_id};
use crate::utils::{format_timestamp, secp256k1_sha256_verify, KeyPair};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The signed content of a transaction. Keys sort as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    pub data: Value,
    pub timestamp: String,
    pub transaction_id: String,
}

/// A signed payload waiting to be folded into a block.
///
/// `valid` is only ever trusted when this process computed it; a receiver
/// always re-verifies with [`Transaction::revalidate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    #[serde(default, with = "lenient_id")]
    id: Option<u64>,
    public_key: String,
    signature: String,
    transaction_data_string: String,
    #[serde(default)]
    valid: bool,
}

impl Transaction {
    /// Wrap `data` with a fresh id and timestamp and sign it
    pub fn new_signed(key_pair: &KeyPair, data: Value) -> Result<Transaction> {
        Self::new_signed_with(key_pair, data, &Utc::now(), Uuid::new_v4())
    }

    pub fn new_signed_with(
        key_pair: &KeyPair,
        data: Value,
        timestamp: &DateTime<Utc>,
        transaction_id: Uuid,
    ) -> Result<Transaction> {
        let content = TransactionData {
            data,
            timestamp: format_timestamp(timestamp),
            transaction_id: transaction_id.simple().to_string(),
        };
        let transaction_data_string = canonical_json(&content)?;
        let signature = key_pair.sign(transaction_data_string.as_bytes());
        let mut transaction = Transaction {
            id: None,
            public_key: key_pair.public_key(),
            signature,
            transaction_data_string,
            valid: false,
        };
        transaction.revalidate();
        if !transaction.valid {
            return Err(LedgerError::Crypto(
                "Freshly signed transaction failed verification".to_string(),
            ));
        }
        Ok(transaction)
    }

    /// Build an unverified transaction from received parts
    pub fn from_parts(
        id: Option<u64>,
        public_key: String,
        transaction_data_string: String,
        signature: String,
    ) -> Transaction {
        Transaction {
            id,
            public_key,
            signature,
            transaction_data_string,
            valid: false,
        }
    }

    pub fn verify(&self) -> bool {
        secp256k1_sha256_verify(
            &self.public_key,
            &self.signature,
            self.transaction_data_string.as_bytes(),
        )
    }

    /// Replace any claimed validity with a local verification result
    pub fn revalidate(&mut self) -> bool {
        self.valid = self.verify();
        self.valid
    }

    pub fn content(&self) -> Result<TransactionData> {
        serde_json::from_str(&self.transaction_data_string).map_err(|e| {
            LedgerError::InvalidTransaction(format!("Transaction data is not valid JSON: {e}"))
        })
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }

    pub fn get_id(&self) -> Option<u64> {
        self.id
    }

    pub fn get_public_key(&self) -> &str {
        self.public_key.as_str()
    }

    pub fn get_signature(&self) -> &str {
        self.signature.as_str()
    }

    pub fn get_transaction_data_string(&self) -> &str {
        self.transaction_data_string.as_str()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
