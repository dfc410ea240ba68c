//! # CredMintDB — Persistent Storage Engine
//!
//! The persistence layer for the issuance pipeline, built on sled's embedded
//! key-value store. All on-disk data flows through this module.
//!
//! ## Tree Layout
//!
//! | Tree                 | Key                                   | Value                  |
//! |----------------------|---------------------------------------|------------------------|
//! | `accounts`           | account id (16B)                      | `bincode(Account)`     |
//! | `ledger_entries`     | account id (16B) ‖ sequence (8B BE)   | `bincode(LedgerEntry)` |
//! | `payment_refs`       | payment reference (UTF-8)             | entry key (24B)        |
//! | `credential_refunds` | credential id (16B)                   | entry key (24B)        |
//! | `credentials`        | credential id (16B)                   | `bincode(Credential)`  |
//! | `credential_status`  | status (1B) ‖ created ms (8B BE) ‖ id | empty                  |
//! | `credential_claims`  | credential id (16B)                   | `bincode(ClaimRecord)` |
//! | `metadata`           | key (UTF-8)                           | value (bytes)          |
//!
//! Sequences and timestamps are stored big-endian so that sled's
//! lexicographic ordering matches numeric ordering. Ledger history and the
//! oldest-first status scans are plain range scans.
//!
//! ## Atomicity
//!
//! Ledger commits and credential transitions each touch several trees. They
//! run as sled multi-tree transactions: the row, its indexes and its
//! uniqueness markers land together or not at all.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("database schema version {found} is not supported (expected {expected})")]
    SchemaMismatch { found: u32, expected: u32 },
}

pub type DbResult<T> = Result<T, DbError>;

/// Bincode-encodes a row.
pub fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Decodes a bincode row.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree holding the on-disk layout version.
const META_SCHEMA_VERSION: &[u8] = b"schema_version";

/// Layout version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// CredMintDB
// ---------------------------------------------------------------------------

/// Persistent storage engine for the issuance pipeline.
///
/// Wraps a sled `Db` and hands out its named trees to the ledger and the
/// credential repository, which own the row formats.
///
/// # Thread Safety
///
/// sled trees support concurrent reads and serialized writes, and cloning
/// a `Tree` is a reference-count bump. `CredMintDB` is cheap to clone and
/// can be shared freely between the ledger, the repository and both
/// periodic tasks.
#[derive(Debug, Clone)]
pub struct CredMintDB {
    db: Db,
    accounts: Tree,
    ledger_entries: Tree,
    payment_refs: Tree,
    credential_refunds: Tree,
    credentials: Tree,
    credential_status: Tree,
    credential_claims: Tree,
    metadata: Tree,
}

impl CredMintDB {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is removed when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let this = Self {
            accounts: db.open_tree("accounts")?,
            ledger_entries: db.open_tree("ledger_entries")?,
            payment_refs: db.open_tree("payment_refs")?,
            credential_refunds: db.open_tree("credential_refunds")?,
            credentials: db.open_tree("credentials")?,
            credential_status: db.open_tree("credential_status")?,
            credential_claims: db.open_tree("credential_claims")?,
            metadata: db.open_tree("metadata")?,
            db,
        };
        this.check_schema()?;
        Ok(this)
    }

    /// Stamps a fresh database with [`SCHEMA_VERSION`], or refuses one
    /// written by an incompatible build.
    fn check_schema(&self) -> DbResult<()> {
        let ours = SCHEMA_VERSION.to_be_bytes();
        match self
            .metadata
            .compare_and_swap(META_SCHEMA_VERSION, None as Option<&[u8]>, Some(&ours[..]))?
        {
            Ok(()) => Ok(()),
            Err(cas) => {
                let found = cas
                    .current
                    .as_deref()
                    .and_then(|b| <[u8; 4]>::try_from(b).ok())
                    .map(u32::from_be_bytes)
                    .unwrap_or(0);
                if found == SCHEMA_VERSION {
                    Ok(())
                } else {
                    Err(DbError::SchemaMismatch {
                        found,
                        expected: SCHEMA_VERSION,
                    })
                }
            }
        }
    }

    // -- Trees ---------------------------------------------------------------

    pub fn accounts(&self) -> &Tree {
        &self.accounts
    }

    pub fn ledger_entries(&self) -> &Tree {
        &self.ledger_entries
    }

    pub fn payment_refs(&self) -> &Tree {
        &self.payment_refs
    }

    pub fn credential_refunds(&self) -> &Tree {
        &self.credential_refunds
    }

    pub fn credentials(&self) -> &Tree {
        &self.credentials
    }

    pub fn credential_status(&self) -> &Tree {
        &self.credential_status
    }

    pub fn credential_claims(&self) -> &Tree {
        &self.credential_claims
    }

    // -- Metadata ------------------------------------------------------------

    /// Reads a raw metadata value.
    pub fn get_meta(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self.metadata.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Writes a raw metadata value.
    pub fn put_meta(&self, key: &str, value: &[u8]) -> DbResult<()> {
        self.metadata.insert(key.as_bytes(), value)?;
        Ok(())
    }

    // -- Utility -------------------------------------------------------------

    /// Number of credit accounts.
    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Number of credentials ever issued.
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Bytes used on disk.
    pub fn size_on_disk(&self) -> DbResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    /// Blocks until all pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
