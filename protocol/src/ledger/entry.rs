//! Account and ledger entry records.
//!
//! Both are persisted with bincode. Entries are append-only: once written,
//! a [`LedgerEntry`] is never updated or deleted, and the account's balance
//! is always the sum of its entries' amounts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::amount::Credits;
use crate::credential::CredentialId;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of an issuer's credit account. One account per issuer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Storage key of the account row.
    pub fn key(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a single ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// EntryType
// ---------------------------------------------------------------------------

/// Why the balance moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Credits bought by the issuer. Carries a unique payment reference.
    Purchase,
    /// Credits reserved for a credential at issuance time.
    Deduct,
    /// Credits returned for a credential that failed. At most one per
    /// credential.
    Refund,
    /// Operator correction, positive or negative.
    Adjustment,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Purchase => "PURCHASE",
            EntryType::Deduct => "DEDUCT",
            EntryType::Refund => "REFUND",
            EntryType::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// An issuer's credit account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Never negative.
    pub credit_balance: Credits,
    /// Bumped with every entry. Entry `n` of the account has sequence `n`.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A freshly onboarded account with a zero balance.
    pub fn open(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            credit_balance: Credits::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// An immutable record of one balance change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    /// Signed: negative for DEDUCT and for downward adjustments.
    pub amount: Credits,
    /// Account balance right after this entry. Never negative.
    pub balance_after: Credits,
    /// Set for DEDUCT and REFUND entries.
    pub credential_id: Option<CredentialId>,
    /// Unique across the ledger when present.
    pub payment_reference: Option<String>,
    /// Free-form operator note, used for adjustments.
    pub memo: Option<String>,
    /// Per-account commit order, starting at 1.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Storage key: account id followed by the big-endian sequence, so a
    /// prefix scan yields the account's entries in commit order.
    pub fn key(&self) -> [u8; 24] {
        entry_key(&self.account_id, self.sequence)
    }
}

pub(crate) fn entry_key(account: &AccountId, sequence: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&account.key());
    key[16..].copy_from_slice(&sequence.to_be_bytes());
    key
}

/// The parts of an entry chosen by the caller; the store fills in the id,
/// the resulting balance, the sequence and the timestamp on commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEntry {
    pub entry_type: EntryType,
    pub amount: Credits,
    pub credential_id: Option<CredentialId>,
    pub payment_reference: Option<String>,
    pub memo: Option<String>,
}

impl NewEntry {
    pub fn purchase(amount: Credits, payment_reference: impl Into<String>) -> Self {
        Self {
            entry_type: EntryType::Purchase,
            amount,
            credential_id: None,
            payment_reference: Some(payment_reference.into()),
            memo: None,
        }
    }

    /// `negated` is the reservation already flipped to a negative amount.
    pub fn deduct(negated: Credits, credential_id: Option<CredentialId>) -> Self {
        Self {
            entry_type: EntryType::Deduct,
            amount: negated,
            credential_id,
            payment_reference: None,
            memo: None,
        }
    }

    pub fn refund(amount: Credits, credential_id: CredentialId) -> Self {
        Self {
            entry_type: EntryType::Refund,
            amount,
            credential_id: Some(credential_id),
            payment_reference: None,
            memo: None,
        }
    }

    pub fn adjustment(amount: Credits, memo: impl Into<String>) -> Self {
        Self {
            entry_type: EntryType::Adjustment,
            amount,
            credential_id: None,
            payment_reference: None,
            memo: Some(memo.into()),
        }
    }
}
