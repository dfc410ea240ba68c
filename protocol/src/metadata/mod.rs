//! # Metadata Publishing
//!
//! Credential metadata is stored off-chain on a content-addressed network;
//! the chain only carries `ipfs://<content address>`. Publishing is
//! retry-safe: the same payload always maps to the same address. The relayer
//! still publishes at most once per credential because it checkpoints the
//! address before touching the chain.
//!
//! ```text
//! http.rs   — pinning service over HTTP (reqwest, bearer token)
//! memory.rs — in-process store computing CIDv0 addresses (devnet, tests)
//! ```

pub mod http;
pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::METADATA_URI_SCHEME;

pub use http::HttpPinningPublisher;
pub use memory::InMemoryPublisher;

/// Publishing failures. Every variant is retried on the next relayer pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),

    #[error("publisher rejected payload: {0}")]
    Rejected(String),

    #[error("publisher returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("metadata payload is not valid JSON: {0}")]
    InvalidPayload(String),
}

// ---------------------------------------------------------------------------
// ContentAddress
// ---------------------------------------------------------------------------

/// A content identifier returned by the storage network (a CID).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Validates a bare CID. A leading `ipfs://` is stripped.
    pub fn parse(raw: &str) -> Result<Self, PublishError> {
        let trimmed = raw.trim();
        let cid = trimmed.strip_prefix(METADATA_URI_SCHEME).unwrap_or(trimmed);
        if cid.is_empty() || cid.len() > 128 || !cid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PublishError::InvalidResponse(format!(
                "'{raw}' is not a content address"
            )));
        }
        Ok(Self(cid.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Metadata URI passed to the mint call.
    pub fn uri(&self) -> String {
        format!("{METADATA_URI_SCHEME}{}", self.0)
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self.0)
    }
}

impl FromStr for ContentAddress {
    type Err = PublishError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// MetadataPublisher
// ---------------------------------------------------------------------------

/// Durable storage for credential metadata.
#[async_trait]
pub trait MetadataPublisher: Send + Sync {
    /// Stores `payload` (a JSON document) and returns its content address.
    async fn publish(&self, payload: &str) -> Result<ContentAddress, PublishError>;
}

/// Parses a metadata payload, rejecting anything that is not JSON.
pub fn parse_payload(payload: &str) -> Result<serde_json::Value, PublishError> {
    serde_json::from_str(payload).map_err(|e| PublishError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_prefixes_scheme() {
        let addr = ContentAddress::parse("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").unwrap();
        assert_eq!(addr.uri(), "ipfs://QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG");
    }

    #[test]
    fn parse_strips_scheme_once() {
        let addr = ContentAddress::parse("ipfs://bafyabc").unwrap();
        assert_eq!(addr.as_str(), "bafyabc");
        assert_eq!(addr.uri(), "ipfs://bafyabc");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ContentAddress::parse("").is_err());
        assert!(ContentAddress::parse("ipfs://").is_err());
        assert!(ContentAddress::parse("Qm abc").is_err());
        assert!(ContentAddress::parse("../etc/passwd").is_err());
    }

    #[test]
    fn payload_must_be_json() {
        assert!(parse_payload(r#"{"name":"Diploma"}"#).is_ok());
        assert!(matches!(
            parse_payload("not json"),
            Err(PublishError::InvalidPayload(_))
        ));
    }
}
