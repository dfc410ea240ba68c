//! In-process cache of relayer signing keys.
//!
//! Fetching a managed key can mean a round trip to a key service, so the
//! pipeline goes through [`SignerCache`] instead of the [`KeySigner`]
//! directly. Entries expire after a TTL and can be invalidated explicitly,
//! e.g. after a key rotation.
//!
//! An invalidation that races with a fetch wins: the fetched key is returned
//! to that caller but not cached, so the next caller fetches again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use super::{KeySigner, RelayerKey, SignerError};

#[derive(Clone)]
struct CachedSigner {
    key: Arc<RelayerKey>,
    fetched_at: Instant,
}

/// Hit and miss counters, for the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignerCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL cache in front of a [`KeySigner`].
pub struct SignerCache {
    source: Arc<dyn KeySigner>,
    ttl: Duration,
    entries: DashMap<String, CachedSigner>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SignerCache {
    pub fn new(source: Arc<dyn KeySigner>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the key called `name`, fetching it when absent or expired.
    pub async fn get(&self, name: &str) -> Result<Arc<RelayerKey>, SignerError> {
        if let Some(entry) = self.entries.get(name) {
            if entry.fetched_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&entry.key));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let generation = self.generation.load(Ordering::Acquire);
        let key = Arc::new(self.source.get_signer(name).await?);

        if self.generation.load(Ordering::Acquire) == generation {
            self.entries.insert(
                name.to_string(),
                CachedSigner {
                    key: Arc::clone(&key),
                    fetched_at: Instant::now(),
                },
            );
            debug!(key_name = name, address = %key.address(), "signer cached");
        } else {
            debug!(key_name = name, "signer cache invalidated during fetch; not caching");
        }
        Ok(key)
    }

    /// Drops one cached key.
    pub fn invalidate(&self, name: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if self.entries.remove(name).is_some() {
            info!(key_name = name, "signer invalidated");
        }
    }

    /// Drops every cached key.
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = self.entries.len();
        self.entries.clear();
        info!(dropped, "signer cache cleared");
    }

    pub fn stats(&self) -> SignerCacheStats {
        SignerCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl std::fmt::Debug for SignerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}
