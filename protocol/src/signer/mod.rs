//! # Relayer Signing Keys
//!
//! The relayer signs mint transactions with a managed secp256k1 key. Key
//! material is fetched through the [`KeySigner`] capability, held in memory
//! as a [`RelayerKey`] and shared read-only through the [`SignerCache`].
//!
//! The core never logs or persists key material: `RelayerKey`'s `Debug`
//! prints only the key name and its address.
//!
//! ```text
//! cache.rs — TTL cache with explicit invalidation
//! local.rs — environment, key-file and static signers
//! ```

pub mod cache;
pub mod local;

use std::fmt;

use async_trait::async_trait;
use credmint_contracts::Address;
use k256::ecdsa::SigningKey;
use thiserror::Error;

use crate::chain::transaction::{address_of, SignedTx, UnsignedTx};

pub use cache::{SignerCache, SignerCacheStats};
pub use local::{EnvKeySigner, FileKeySigner, StaticKeySigner};

/// Errors from fetching or using a signing key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    /// The key source could not produce the key right now. The relayer skips
    /// the credential and tries again next pass.
    #[error("signer '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    /// The key source returned something that is not a secp256k1 secret.
    #[error("signer '{name}' holds an invalid key: {reason}")]
    InvalidKey { name: String, reason: String },

    #[error("signing failed: {0}")]
    Signing(String),
}

impl SignerError {
    pub fn unavailable(name: &str, reason: impl fmt::Display) -> Self {
        SignerError::Unavailable {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_key(name: &str, reason: impl fmt::Display) -> Self {
        SignerError::InvalidKey {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// RelayerKey
// ---------------------------------------------------------------------------

/// A named secp256k1 signing key and its Ethereum address.
#[derive(Clone)]
pub struct RelayerKey {
    name: String,
    key: SigningKey,
    address: Address,
}

impl RelayerKey {
    pub fn new(name: impl Into<String>, key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self {
            name: name.into(),
            key,
            address,
        }
    }

    /// Generates a fresh key from the OS random source.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Parses a 32-byte secret in hex, with or without `0x`.
    pub fn from_hex(name: &str, secret: &str) -> Result<Self, SignerError> {
        let trimmed = secret.trim();
        let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(body).map_err(|e| SignerError::invalid_key(name, e))?;
        if bytes.len() != 32 {
            return Err(SignerError::invalid_key(
                name,
                format!("expected 32 bytes, got {}", bytes.len()),
            ));
        }
        let key = SigningKey::from_slice(&bytes).map_err(|e| SignerError::invalid_key(name, e))?;
        Ok(Self::new(name, key))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the chain will see as the transaction sender.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a legacy transaction over its EIP-155 hash.
    pub fn sign_transaction(&self, tx: UnsignedTx) -> Result<SignedTx, SignerError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&tx.signing_hash())
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(tx.into_signed(&signature, recovery_id))
    }

    /// Hex secret for writing a key file. Only the key-file signer calls this.
    pub(crate) fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }
}

impl fmt::Debug for RelayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerKey")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// KeySigner
// ---------------------------------------------------------------------------

/// A source of managed signing keys.
#[async_trait]
pub trait KeySigner: Send + Sync {
    /// Fetches the key called `key_name`.
    async fn get_signer(&self, key_name: &str) -> Result<RelayerKey, SignerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::U256;

    const SECRET: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn debug_never_prints_secret() {
        let key = RelayerKey::from_hex("relayer", SECRET).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(SECRET));
        assert!(!rendered.contains(&SECRET[..16]));
    }

    #[test]
    fn from_hex_accepts_prefix_and_whitespace() {
        let a = RelayerKey::from_hex("k", SECRET).unwrap();
        let b = RelayerKey::from_hex("k", &format!("  0x{SECRET}\n")).unwrap();
        assert_eq!(a.address(), b.address());
        // Address of the well-known test key above.
        assert_eq!(
            a.address().to_string().to_lowercase(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
    }

    #[test]
    fn from_hex_rejects_bad_secrets() {
        assert!(matches!(
            RelayerKey::from_hex("k", "zz"),
            Err(SignerError::InvalidKey { .. })
        ));
        assert!(matches!(
            RelayerKey::from_hex("k", "0x1234"),
            Err(SignerError::InvalidKey { .. })
        ));
        assert!(RelayerKey::from_hex("k", &"00".repeat(32)).is_err());
    }

    #[test]
    fn signed_tx_recovers_to_key_address() {
        let key = RelayerKey::generate("relayer");
        let tx = UnsignedTx {
            nonce: 3,
            gas_price: 1_000_000_000,
            gas_limit: 300_000,
            to: Address::ZERO,
            value: U256::zero(),
            data: vec![1, 2, 3],
            chain_id: 31_337,
        };
        let signed = key.sign_transaction(tx).unwrap();
        assert_eq!(signed.recover_sender().unwrap(), key.address());
    }
}
