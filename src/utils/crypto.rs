use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ring::digest::{Context, SHA256};
use std::fs;
use std::path::Path;
use zeroize::Zeroize;

/// Fixed UTC layout used by block and transaction timestamps
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

const SCALAR_LEN: usize = 32;

pub fn current_timestamp() -> String {
    format_timestamp(&Utc::now())
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(sha256_digest(data).as_slice())
}

/// secp256k1 signing key used to author transactions. The key clears its
/// own scalar when dropped.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        KeyPair {
            signing_key: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<KeyPair> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| LedgerError::Crypto(format!("Invalid secret key: {e}")))?;
        Ok(KeyPair { signing_key })
    }

    /// Load a hex encoded secret from `path`
    pub fn load(path: &Path) -> Result<KeyPair> {
        let mut text = fs::read_to_string(path)?;
        let decoded = HEXLOWER_PERMISSIVE
            .decode(text.trim().as_bytes())
            .map_err(|e| LedgerError::Crypto(format!("Key file {} is not hex: {e}", path.display())));
        text.zeroize();
        let mut secret = decoded?;
        let key_pair = Self::from_secret_bytes(&secret);
        secret.zeroize();
        key_pair
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut secret = self.signing_key.to_bytes().to_vec();
        let mut text = HEXLOWER.encode(&secret);
        let written = fs::write(path, text.as_bytes());
        secret.zeroize();
        text.zeroize();
        written.map_err(LedgerError::from)
    }

    pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
        if path.exists() {
            return Self::load(path);
        }
        let key_pair = Self::generate();
        key_pair.save(path)?;
        log::info!("Generated a new key pair at {}", path.display());
        Ok(key_pair)
    }

    /// Uncompressed SEC1 point as lowercase hex (`04 || X || Y`)
    pub fn public_key(&self) -> String {
        encode_public_key(self.signing_key.verifying_key())
    }

    /// ECDSA over SHA-256, returned as the `[r, s]` hex pair
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing_key.sign(message);
        encode_signature(&signature)
    }
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    HEXLOWER.encode(key.to_encoded_point(false).as_bytes())
}

pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = HEXLOWER_PERMISSIVE
        .decode(encoded.trim().as_bytes())
        .map_err(|e| LedgerError::Crypto(format!("Public key is not hex: {e}")))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| LedgerError::Crypto(format!("Public key is not a secp256k1 point: {e}")))
}

pub fn encode_signature(signature: &Signature) -> String {
    let (r, s) = signature.split_bytes();
    serde_json::json!([HEXLOWER.encode(&r), HEXLOWER.encode(&s)]).to_string()
}

pub fn decode_signature(encoded: &str) -> Result<Signature> {
    let pair: [String; 2] = serde_json::from_str(encoded)
        .map_err(|e| LedgerError::Crypto(format!("Signature is not an [r, s] pair: {e}")))?;
    let mut bytes = Vec::with_capacity(SCALAR_LEN * 2);
    for scalar in &pair {
        let decoded = HEXLOWER_PERMISSIVE
            .decode(scalar.as_bytes())
            .map_err(|e| LedgerError::Crypto(format!("Signature scalar is not hex: {e}")))?;
        if decoded.len() != SCALAR_LEN {
            return Err(LedgerError::Crypto(format!(
                "Signature scalar has {} bytes, expected {SCALAR_LEN}",
                decoded.len()
            )));
        }
        bytes.extend(decoded);
    }
    Signature::from_slice(&bytes)
        .map_err(|e| LedgerError::Crypto(format!("Invalid signature scalars: {e}")))
}

/// Verify an encoded signature over `message` under an encoded public key.
/// Anything that fails to decode counts as an invalid signature.
pub fn secp256k1_sha256_verify(public_key: &str, signature: &str, message: &[u8]) -> bool {
    let key = match decode_public_key(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match decode_signature(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    key.verify(message, &signature).is_ok()
}
