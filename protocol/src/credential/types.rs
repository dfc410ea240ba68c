//! Credential rows and their lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use credmint_contracts::Address;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::TxHash;
use crate::ledger::{AccountId, Credits, EntryId};
use crate::metadata::ContentAddress;

// ---------------------------------------------------------------------------
// CredentialId
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialId(Uuid);

impl CredentialId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Storage key of the credential row.
    pub fn key(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub(crate) fn from_key(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl Default for CredentialId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CredentialId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// CredentialStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a credential.
///
/// ```text
///   QUEUED ──► PENDING ──► CONFIRMED ──► REVOKED
///      │          │
///      └──────────┴──► FAILED (credits refunded)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    /// Credits reserved, waiting for the relayer.
    Queued,
    /// Mint transaction broadcast, waiting for finality.
    Pending,
    /// Minted and final.
    Confirmed,
    /// Will never be minted. Credits are refunded.
    Failed,
    /// Revoked by an administrator after confirmation.
    Revoked,
}

impl CredentialStatus {
    pub const ALL: [CredentialStatus; 5] = [
        CredentialStatus::Queued,
        CredentialStatus::Pending,
        CredentialStatus::Confirmed,
        CredentialStatus::Failed,
        CredentialStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Queued => "QUEUED",
            CredentialStatus::Pending => "PENDING",
            CredentialStatus::Confirmed => "CONFIRMED",
            CredentialStatus::Failed => "FAILED",
            CredentialStatus::Revoked => "REVOKED",
        }
    }

    /// Leading byte of status index keys.
    pub(crate) fn code(&self) -> u8 {
        match self {
            CredentialStatus::Queued => 1,
            CredentialStatus::Pending => 2,
            CredentialStatus::Confirmed => 3,
            CredentialStatus::Failed => 4,
            CredentialStatus::Revoked => 5,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: CredentialStatus) -> bool {
        use CredentialStatus::*;
        matches!(
            (self, next),
            (Queued, Pending)
                | (Queued, Failed)
                | (Pending, Confirmed)
                | (Pending, Failed)
                | (Confirmed, Revoked)
        )
    }

    /// No further pipeline work happens in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CredentialStatus::Confirmed | CredentialStatus::Failed | CredentialStatus::Revoked
        )
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CredentialStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown credential status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// SignedSubmission
// ---------------------------------------------------------------------------

/// The signed mint transaction, checkpointed before every broadcast.
///
/// Keeping the raw bytes means a restarted relayer can rebroadcast the very
/// same transaction (same hash) instead of signing a second one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSubmission {
    pub sender: Address,
    pub nonce: u64,
    pub gas_price_wei: u128,
    pub raw_tx: Vec<u8>,
    pub tx_hash: TxHash,
    /// Hashes of earlier signed versions. Any of them may still be mined.
    pub previous_hashes: Vec<TxHash>,
    /// Some broadcast ended without a definite answer from the node, so the
    /// transaction may be in a mempool.
    pub ambiguous: bool,
    pub signed_at: DateTime<Utc>,
}

impl SignedSubmission {
    /// Current hash first, then the replaced ones, newest first.
    pub fn all_hashes(&self) -> Vec<TxHash> {
        let mut hashes = Vec::with_capacity(self.previous_hashes.len() + 1);
        hashes.push(self.tx_hash);
        hashes.extend(self.previous_hashes.iter().rev().copied());
        hashes
    }

    /// Hashes to carry into the next signed version.
    pub fn lineage(&self) -> Vec<TxHash> {
        let mut hashes = self.previous_hashes.clone();
        hashes.push(self.tx_hash);
        hashes
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A credential from issuance request to on-chain finality.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub issuer_id: AccountId,
    pub recipient_address: Address,
    /// JSON object, stored as text.
    pub metadata_payload: String,
    /// Permanent content address of the published metadata.
    pub content_address: Option<ContentAddress>,
    pub chain_tx_hash: Option<TxHash>,
    pub token_id: Option<U256>,
    pub status: CredentialStatus,
    /// Credits deducted at issuance; the refund amount on failure.
    pub cost: Credits,
    /// Relayer submission attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub submission: Option<SignedSubmission>,
    /// When the row entered PENDING.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the pending-timeout policy first flagged the row.
    pub escalated_at: Option<DateTime<Utc>>,
    /// REFUND entry written for a FAILED row.
    pub refund_entry: Option<EntryId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A new QUEUED credential.
    pub fn queued(
        issuer_id: AccountId,
        recipient_address: Address,
        metadata_payload: String,
        cost: Credits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CredentialId::new(),
            issuer_id,
            recipient_address,
            metadata_payload,
            content_address: None,
            chain_tx_hash: None,
            token_id: None,
            status: CredentialStatus::Queued,
            cost,
            attempts: 0,
            last_error: None,
            submission: None,
            submitted_at: None,
            escalated_at: None,
            refund_entry: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
        }
    }

    /// Every hash this credential was ever broadcast under.
    pub fn known_hashes(&self) -> Vec<TxHash> {
        match &self.submission {
            Some(submission) => submission.all_hashes(),
            None => self.chain_tx_hash.into_iter().collect(),
        }
    }

    /// Token id in decimal, as displayed to users.
    pub fn token_id_decimal(&self) -> Option<String> {
        self.token_id.map(|id| id.to_string())
    }
}
