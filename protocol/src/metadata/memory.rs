//! In-process metadata store.
//!
//! Computes real CIDv0 addresses (`base58(0x12 0x20 || sha256(bytes))`) so
//! devnet credentials carry the same URI shape as production ones.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{parse_payload, ContentAddress, MetadataPublisher, PublishError};

/// Multihash code for sha2-256.
const SHA2_256_CODE: u8 = 0x12;

/// Digest length prefix for a 32-byte sha2-256 multihash.
const SHA2_256_LEN: u8 = 0x20;

/// CIDv0 of `bytes`.
pub fn cid_v0(bytes: &[u8]) -> ContentAddress {
    let mut multihash = Vec::with_capacity(34);
    multihash.push(SHA2_256_CODE);
    multihash.push(SHA2_256_LEN);
    multihash.extend_from_slice(&Sha256::digest(bytes));
    ContentAddress(bs58::encode(multihash).into_string())
}

/// Keeps published documents in memory.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    documents: Mutex<HashMap<ContentAddress, String>>,
    faults: Mutex<VecDeque<PublishError>>,
    publishes: AtomicU64,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `publish` call fail with `error`.
    pub fn fail_next(&self, error: PublishError) {
        self.faults.lock().push_back(error);
    }

    /// Calls to `publish`, including failed ones.
    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn get(&self, address: &ContentAddress) -> Option<String> {
        self.documents.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataPublisher for InMemoryPublisher {
    async fn publish(&self, payload: &str) -> Result<ContentAddress, PublishError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.faults.lock().pop_front() {
            return Err(error);
        }
        parse_payload(payload)?;

        let address = cid_v0(payload.as_bytes());
        self.documents
            .lock()
            .insert(address.clone(), payload.to_string());
        debug!(content_address = %address, bytes = payload.len(), "metadata stored in memory");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_v0_known_vector() {
        // Multihash of sha256("").
        assert_eq!(
            cid_v0(b"").as_str(),
            "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n"
        );
    }

    #[test]
    fn cid_v0_hello() {
        assert_eq!(
            cid_v0(b"hello").as_str(),
            "QmRN6wdp1S2A5EtjW9A3M1vKSBuQQGcgvuhoMUoEz4iiT5"
        );
    }

    #[test]
    fn cid_v0_shape() {
        let cid = cid_v0(br#"{"name":"Diploma"}"#);
        assert_eq!(cid.as_str().len(), 46);
        assert!(cid.as_str().starts_with("Qm"));
    }

    #[tokio::test]
    async fn publish_is_deterministic() {
        let publisher = InMemoryPublisher::new();
        let a = publisher.publish(r#"{"a":1}"#).await.unwrap();
        let b = publisher.publish(r#"{"a":1}"#).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(publisher.len(), 1);
        assert_eq!(publisher.publish_count(), 2);
        assert_eq!(publisher.get(&a).as_deref(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn injected_failure_then_success() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(PublishError::Unavailable("pinning node down".into()));
        assert!(publisher.publish("{}").await.is_err());
        assert!(publisher.publish("{}").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_non_json() {
        let publisher = InMemoryPublisher::new();
        assert!(matches!(
            publisher.publish("<xml/>").await,
            Err(PublishError::InvalidPayload(_))
        ));
        assert!(publisher.is_empty());
    }
}
