//! # Credential Repository
//!
//! Owns credential rows and enforces the lifecycle. Every write goes through
//! one sled transaction spanning the row tree and the status index, so the
//! index never disagrees with a row.
//!
//! ```text
//! credentials        id                              -> Credential (bincode)
//! credential_status  [status][created_ms BE][id]     -> ()
//! credential_claims  id                              -> ClaimRecord (bincode)
//! ```
//!
//! Status changes are checked against
//! [`CredentialStatus::can_transition_to`]; an illegal one is rejected and
//! nothing is written. Checkpoints (`record_*`) never change the status and
//! are only accepted in the status they belong to.
//!
//! ## Claims
//!
//! Workers claim rows before processing them. A claim is a lease stored with
//! compare-and-swap: a live lease held by someone else makes
//! [`CredentialRepository::claim`] return `None` and the caller skips the
//! row. An expired lease can be taken over. Dropping the
//! [`CredentialClaim`] releases it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{IVec, Tree};
use tracing::{debug, warn};

use super::error::CredentialError;
use super::types::{Credential, CredentialId, CredentialStatus, SignedSubmission};
use crate::chain::TxHash;
use crate::ledger::EntryId;
use crate::metadata::ContentAddress;
use crate::storage::db::{decode, encode};
use crate::storage::CredMintDB;

/// Status index entries carry no value.
const INDEX_VALUE: &[u8] = &[];

fn index_key(status: CredentialStatus, created_at: DateTime<Utc>, id: &CredentialId) -> [u8; 25] {
    let mut key = [0u8; 25];
    key[0] = status.code();
    key[1..9].copy_from_slice(&(created_at.timestamp_millis().max(0) as u64).to_be_bytes());
    key[9..].copy_from_slice(&id.key());
    key
}

fn abort(e: impl Into<CredentialError>) -> ConflictableTransactionError<CredentialError> {
    ConflictableTransactionError::Abort(e.into())
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Status counts
// ---------------------------------------------------------------------------

/// Number of credentials per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub revoked: u64,
}

impl StatusCounts {
    pub fn get(&self, status: CredentialStatus) -> u64 {
        match status {
            CredentialStatus::Queued => self.queued,
            CredentialStatus::Pending => self.pending,
            CredentialStatus::Confirmed => self.confirmed,
            CredentialStatus::Failed => self.failed,
            CredentialStatus::Revoked => self.revoked,
        }
    }

    fn set(&mut self, status: CredentialStatus, count: u64) {
        let slot = match status {
            CredentialStatus::Queued => &mut self.queued,
            CredentialStatus::Pending => &mut self.pending,
            CredentialStatus::Confirmed => &mut self.confirmed,
            CredentialStatus::Failed => &mut self.failed,
            CredentialStatus::Revoked => &mut self.revoked,
        };
        *slot = count;
    }

    pub fn total(&self) -> u64 {
        self.queued + self.pending + self.confirmed + self.failed + self.revoked
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// A stored lease on a credential row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub owner: String,
    pub expires_at_ms: i64,
}

impl ClaimRecord {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// An exclusive, time-limited hold on one credential row. Released on drop
/// unless another worker took it over after expiry.
pub struct CredentialClaim {
    id: CredentialId,
    tree: Tree,
    held: IVec,
    owner: String,
}

impl CredentialClaim {
    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Extends the lease. Fails with [`CredentialError::Claimed`] if the
    /// lease expired and someone else took the row.
    pub fn renew(&mut self, lease: Duration) -> Result<(), CredentialError> {
        let record = ClaimRecord {
            owner: self.owner.clone(),
            expires_at_ms: Utc::now().timestamp_millis().saturating_add(lease_millis(lease)),
        };
        let bytes = IVec::from(encode(&record)?);
        match self
            .tree
            .compare_and_swap(self.id.key(), Some(&self.held), Some(bytes.clone()))?
        {
            Ok(()) => {
                self.held = bytes;
                Ok(())
            }
            Err(_) => Err(CredentialError::Claimed(self.id)),
        }
    }
}

impl Drop for CredentialClaim {
    fn drop(&mut self) {
        match self
            .tree
            .compare_and_swap(self.id.key(), Some(&self.held), None::<IVec>)
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(credential = %self.id, "claim was taken over before release"),
            Err(e) => warn!(credential = %self.id, error = %e, "failed to release claim"),
        }
    }
}

impl std::fmt::Debug for CredentialClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialClaim")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

/// A claimed row and its state at claim time.
#[derive(Debug)]
pub struct ClaimedCredential {
    pub claim: CredentialClaim,
    pub credential: Credential,
}

// ---------------------------------------------------------------------------
// CredentialRepository
// ---------------------------------------------------------------------------

/// Persistence and lifecycle enforcement for credentials.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    db: CredMintDB,
}

impl CredentialRepository {
    pub fn new(db: CredMintDB) -> Self {
        Self { db }
    }

    /// Stores a new QUEUED credential.
    pub fn insert(&self, credential: &Credential) -> Result<(), CredentialError> {
        if credential.status != CredentialStatus::Queued {
            return Err(CredentialError::WrongStatus {
                id: credential.id,
                status: credential.status,
                operation: "insert",
            });
        }
        let key = credential.id.key();
        let index = index_key(credential.status, credential.created_at, &credential.id);
        let bytes = encode(credential)?;

        let outcome = (self.db.credentials(), self.db.credential_status()).transaction(
            |(rows, statuses)| {
                if rows.get(key)?.is_some() {
                    return Err(abort(CredentialError::AlreadyExists(credential.id)));
                }
                rows.insert(&key[..], bytes.as_slice())?;
                statuses.insert(&index[..], INDEX_VALUE)?;
                Ok(())
            },
        );
        match outcome {
            Ok(()) => {
                self.db.flush()?;
                debug!(credential = %credential.id, issuer = %credential.issuer_id, "credential queued");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &CredentialId) -> Result<Credential, CredentialError> {
        match self.db.credentials().get(id.key())? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(CredentialError::NotFound(*id)),
        }
    }

    /// Applies `mutate` to the row inside one transaction. `mutate` returns
    /// `None` to leave the row untouched.
    fn update<F>(&self, id: &CredentialId, mutate: F) -> Result<Credential, CredentialError>
    where
        F: Fn(&Credential) -> Result<Option<Credential>, CredentialError>,
    {
        let key = id.key();
        let outcome = (self.db.credentials(), self.db.credential_status()).transaction(
            |(rows, statuses)| {
                let bytes = rows
                    .get(key)?
                    .ok_or_else(|| abort(CredentialError::NotFound(*id)))?;
                let before: Credential = decode(&bytes).map_err(abort)?;
                let Some(mut after) = mutate(&before).map_err(abort)? else {
                    return Ok(before);
                };

                if after.status != before.status {
                    if !before.status.can_transition_to(after.status) {
                        return Err(abort(CredentialError::IllegalTransition {
                            id: *id,
                            from: before.status,
                            to: after.status,
                        }));
                    }
                    let old = index_key(before.status, before.created_at, id);
                    let new = index_key(after.status, after.created_at, id);
                    statuses.remove(&old[..])?;
                    statuses.insert(&new[..], INDEX_VALUE)?;
                }

                after.updated_at = Utc::now();
                let encoded = encode(&after).map_err(abort)?;
                rows.insert(&key[..], encoded)?;
                Ok(after)
            },
        );

        match outcome {
            Ok(credential) => {
                self.db.flush()?;
                Ok(credential)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Moves the row to `to`, applying `apply` to the new version.
    fn transition<F>(
        &self,
        id: &CredentialId,
        to: CredentialStatus,
        apply: F,
    ) -> Result<Credential, CredentialError>
    where
        F: Fn(&mut Credential) -> Result<(), CredentialError>,
    {
        let updated = self.update(id, |current| {
            if !current.status.can_transition_to(to) {
                return Err(CredentialError::IllegalTransition {
                    id: *id,
                    from: current.status,
                    to,
                });
            }
            let mut next = current.clone();
            next.status = to;
            apply(&mut next)?;
            Ok(Some(next))
        })?;
        debug!(credential = %id, status = %to, "credential transitioned");
        Ok(updated)
    }

    /// Writes a checkpoint allowed only in `status`. `apply` returns false
    /// when there is nothing to change.
    fn checkpoint<F>(
        &self,
        id: &CredentialId,
        status: CredentialStatus,
        operation: &'static str,
        apply: F,
    ) -> Result<Credential, CredentialError>
    where
        F: Fn(&mut Credential) -> bool,
    {
        self.update(id, |current| {
            if current.status != status {
                return Err(CredentialError::WrongStatus {
                    id: *id,
                    status: current.status,
                    operation,
                });
            }
            let mut next = current.clone();
            Ok(apply(&mut next).then_some(next))
        })
    }

    // -- QUEUED checkpoints -------------------------------------------------

    /// Records the published metadata address. Only the first address is
    /// kept; later calls return the row unchanged.
    pub fn record_publication(
        &self,
        id: &CredentialId,
        address: &ContentAddress,
    ) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Queued, "record publication", |c| {
            if c.content_address.is_some() {
                return false;
            }
            c.content_address = Some(address.clone());
            true
        })
    }

    /// Checkpoints a signed transaction before it is broadcast.
    pub fn record_signed(
        &self,
        id: &CredentialId,
        submission: &SignedSubmission,
    ) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Queued, "record signed transaction", |c| {
            // Ambiguity is sticky across re-signs: an earlier broadcast may
            // still be out there.
            let ambiguous = c.submission.as_ref().is_some_and(|s| s.ambiguous);
            let mut submission = submission.clone();
            submission.ambiguous |= ambiguous;
            c.submission = Some(submission);
            true
        })
    }

    /// Records a failed submission attempt.
    pub fn record_attempt(
        &self,
        id: &CredentialId,
        attempts: u32,
        error: &str,
        ambiguous: bool,
    ) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Queued, "record attempt", |c| {
            c.attempts = attempts;
            c.last_error = Some(error.to_string());
            if ambiguous {
                if let Some(submission) = c.submission.as_mut() {
                    submission.ambiguous = true;
                }
            }
            true
        })
    }

    // -- PENDING checkpoints ------------------------------------------------

    /// Records a same-nonce replacement broadcast by escalation.
    pub fn record_replacement(
        &self,
        id: &CredentialId,
        submission: &SignedSubmission,
    ) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Pending, "record replacement", |c| {
            c.chain_tx_hash = Some(submission.tx_hash);
            c.submission = Some(submission.clone());
            true
        })
    }

    /// Marks the row as escalated. The first escalation time is kept.
    pub fn record_escalation(&self, id: &CredentialId) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Pending, "record escalation", |c| {
            if c.escalated_at.is_some() {
                return false;
            }
            c.escalated_at = Some(Utc::now());
            true
        })
    }

    // -- Transitions --------------------------------------------------------

    /// QUEUED -> PENDING once the node accepted `tx_hash`.
    pub fn mark_submitted(
        &self,
        id: &CredentialId,
        tx_hash: TxHash,
    ) -> Result<Credential, CredentialError> {
        self.transition(id, CredentialStatus::Pending, |c| {
            if c.content_address.is_none() {
                return Err(CredentialError::Incomplete {
                    id: c.id,
                    field: "content_address",
                });
            }
            c.chain_tx_hash = Some(tx_hash);
            c.submitted_at = Some(Utc::now());
            Ok(())
        })
    }

    /// PENDING -> CONFIRMED with the mined hash and token id.
    pub fn mark_confirmed(
        &self,
        id: &CredentialId,
        tx_hash: TxHash,
        token_id: U256,
    ) -> Result<Credential, CredentialError> {
        self.transition(id, CredentialStatus::Confirmed, |c| {
            c.chain_tx_hash = Some(tx_hash);
            c.token_id = Some(token_id);
            c.confirmed_at = Some(Utc::now());
            Ok(())
        })
    }

    /// QUEUED or PENDING -> FAILED. The caller refunds afterwards.
    pub fn mark_failed(&self, id: &CredentialId, reason: &str) -> Result<Credential, CredentialError> {
        self.transition(id, CredentialStatus::Failed, |c| {
            c.last_error = Some(reason.to_string());
            Ok(())
        })
    }

    /// Links a FAILED row to its REFUND entry. Idempotent.
    pub fn mark_refunded(
        &self,
        id: &CredentialId,
        entry: EntryId,
    ) -> Result<Credential, CredentialError> {
        self.checkpoint(id, CredentialStatus::Failed, "record refund", |c| {
            if c.refund_entry.is_some() {
                return false;
            }
            c.refund_entry = Some(entry);
            true
        })
    }

    /// CONFIRMED -> REVOKED.
    pub fn revoke(&self, id: &CredentialId) -> Result<Credential, CredentialError> {
        self.transition(id, CredentialStatus::Revoked, |_| Ok(()))
    }

    // -- Queries ------------------------------------------------------------

    fn ids_with_status(
        &self,
        status: CredentialStatus,
    ) -> impl Iterator<Item = Result<CredentialId, CredentialError>> {
        self.db
            .credential_status()
            .scan_prefix([status.code()])
            .keys()
            .map(|key| {
                let key = key?;
                CredentialId::from_key(&key[9..]).ok_or_else(|| {
                    CredentialError::Storage(crate::storage::DbError::Serialization(
                        "malformed status index key".into(),
                    ))
                })
            })
    }

    /// Up to `limit` credentials in `status`, oldest first.
    pub fn list_by_status(
        &self,
        status: CredentialStatus,
        limit: usize,
    ) -> Result<Vec<Credential>, CredentialError> {
        self.ids_with_status(status)
            .take(limit)
            .map(|id| self.get(&id?))
            .collect()
    }

    /// FAILED credentials that have no refund recorded yet, oldest first.
    pub fn list_unrefunded_failed(&self, limit: usize) -> Result<Vec<Credential>, CredentialError> {
        let mut out = Vec::new();
        for id in self.ids_with_status(CredentialStatus::Failed) {
            if out.len() >= limit {
                break;
            }
            let credential = self.get(&id?)?;
            if credential.refund_entry.is_none() {
                out.push(credential);
            }
        }
        Ok(out)
    }

    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in CredentialStatus::ALL {
            let n = self
                .db
                .credential_status()
                .scan_prefix([status.code()])
                .count();
            counts.set(status, n as u64);
        }
        counts
    }

    // -- Claims -------------------------------------------------------------

    /// Claims a row for `lease`. Returns `None` when another owner holds a
    /// live lease or wins the race for it.
    pub fn claim(
        &self,
        id: &CredentialId,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<CredentialClaim>, CredentialError> {
        let tree = self.db.credential_claims().clone();
        let now = Utc::now().timestamp_millis();

        let current = tree.get(id.key())?;
        if let Some(bytes) = &current {
            let held: ClaimRecord = decode(bytes)?;
            if held.is_live(now) {
                debug!(credential = %id, owner = %held.owner, "row claimed elsewhere; skipping");
                return Ok(None);
            }
        }

        let record = ClaimRecord {
            owner: owner.to_string(),
            expires_at_ms: now.saturating_add(lease_millis(lease)),
        };
        let bytes = IVec::from(encode(&record)?);
        match tree.compare_and_swap(id.key(), current, Some(bytes.clone()))? {
            Ok(()) => Ok(Some(CredentialClaim {
                id: *id,
                tree,
                held: bytes,
                owner: record.owner,
            })),
            Err(_) => Ok(None),
        }
    }

    /// Claims up to `limit` rows currently in `status`, oldest first. Rows
    /// claimed elsewhere are skipped; rows that left `status` before the
    /// claim landed are released again.
    pub fn claim_batch(
        &self,
        status: CredentialStatus,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedCredential>, CredentialError> {
        let mut claimed = Vec::new();
        for id in self.ids_with_status(status) {
            if claimed.len() >= limit {
                break;
            }
            let id = id?;
            let Some(claim) = self.claim(&id, owner, lease)? else {
                continue;
            };
            let credential = self.get(&id)?;
            if credential.status == status {
                claimed.push(ClaimedCredential { claim, credential });
            }
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AccountId, Credits};
    use credmint_contracts::Address;

    fn repo() -> CredentialRepository {
        CredentialRepository::new(CredMintDB::open_temporary().unwrap())
    }

    fn queued() -> Credential {
        Credential::queued(
            AccountId::new(),
            Address::ZERO,
            r#"{"name":"Ada"}"#.to_string(),
            Credits::from_minor(100),
        )
    }

    fn cid() -> ContentAddress {
        ContentAddress::parse("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").unwrap()
    }

    fn stored(repo: &CredentialRepository) -> CredentialId {
        let c = queued();
        repo.insert(&c).unwrap();
        c.id
    }

    #[test]
    fn insert_and_get() {
        let repo = repo();
        let c = queued();
        repo.insert(&c).unwrap();
        assert_eq!(repo.get(&c.id).unwrap(), c);
        assert!(matches!(
            repo.insert(&c),
            Err(CredentialError::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.get(&CredentialId::new()),
            Err(CredentialError::NotFound(_))
        ));
    }

    #[test]
    fn full_lifecycle_moves_index() {
        let repo = repo();
        let id = stored(&repo);
        assert_eq!(repo.count_by_status().queued, 1);

        repo.record_publication(&id, &cid()).unwrap();
        let hash = TxHash::new([9; 32]);
        let c = repo.mark_submitted(&id, hash).unwrap();
        assert_eq!(c.status, CredentialStatus::Pending);
        assert_eq!(c.chain_tx_hash, Some(hash));
        assert!(c.submitted_at.is_some());

        let c = repo.mark_confirmed(&id, hash, U256::from(42u64)).unwrap();
        assert_eq!(c.token_id, Some(U256::from(42u64)));
        assert!(c.confirmed_at.is_some());

        repo.revoke(&id).unwrap();
        let counts = repo.count_by_status();
        assert_eq!(counts.revoked, 1);
        assert_eq!(counts.total(), 1);
    }

    #[test]
    fn illegal_transition_rejected_and_row_untouched() {
        let repo = repo();
        let id = stored(&repo);
        let before = repo.get(&id).unwrap();

        let err = repo
            .mark_confirmed(&id, TxHash::new([1; 32]), U256::one())
            .unwrap_err();
        assert!(matches!(
            err,
            CredentialError::IllegalTransition {
                from: CredentialStatus::Queued,
                to: CredentialStatus::Confirmed,
                ..
            }
        ));
        assert!(repo.revoke(&id).is_err());
        assert_eq!(repo.get(&id).unwrap(), before);
        assert_eq!(repo.count_by_status().queued, 1);
    }

    #[test]
    fn submission_requires_content_address() {
        let repo = repo();
        let id = stored(&repo);
        assert!(matches!(
            repo.mark_submitted(&id, TxHash::new([1; 32])),
            Err(CredentialError::Incomplete { .. })
        ));
    }

    #[test]
    fn publication_recorded_once() {
        let repo = repo();
        let id = stored(&repo);
        repo.record_publication(&id, &cid()).unwrap();
        let other = ContentAddress::parse("QmRN6wdp1S2A5EtjW9A3M1vKSBuQQGcgvuhoMUoEz4iiT5").unwrap();
        let c = repo.record_publication(&id, &other).unwrap();
        assert_eq!(c.content_address, Some(cid()));
    }

    #[test]
    fn checkpoints_check_status() {
        let repo = repo();
        let id = stored(&repo);
        assert!(matches!(
            repo.record_escalation(&id),
            Err(CredentialError::WrongStatus { .. })
        ));
        repo.mark_failed(&id, "boom").unwrap();
        assert!(matches!(
            repo.record_attempt(&id, 1, "late", false),
            Err(CredentialError::WrongStatus { .. })
        ));
    }

    #[test]
    fn ambiguity_is_sticky() {
        let repo = repo();
        let id = stored(&repo);
        let submission = |hash: u8| SignedSubmission {
            sender: Address::ZERO,
            nonce: 0,
            gas_price_wei: 1,
            raw_tx: vec![hash],
            tx_hash: TxHash::new([hash; 32]),
            previous_hashes: vec![],
            ambiguous: false,
            signed_at: Utc::now(),
        };
        repo.record_signed(&id, &submission(1)).unwrap();
        repo.record_attempt(&id, 1, "timeout", true).unwrap();
        let c = repo.record_signed(&id, &submission(2)).unwrap();
        assert!(c.submission.unwrap().ambiguous);
        assert_eq!(c.attempts, 1);
    }

    #[test]
    fn refund_link_is_idempotent() {
        let repo = repo();
        let id = stored(&repo);
        repo.mark_failed(&id, "reverted").unwrap();
        assert_eq!(repo.list_unrefunded_failed(10).unwrap().len(), 1);

        let first = EntryId::new();
        repo.mark_refunded(&id, first).unwrap();
        let c = repo.mark_refunded(&id, EntryId::new()).unwrap();
        assert_eq!(c.refund_entry, Some(first));
        assert!(repo.list_unrefunded_failed(10).unwrap().is_empty());
    }

    #[test]
    fn list_oldest_first_with_limit() {
        let repo = repo();
        let base = Utc::now() - chrono::Duration::hours(1);
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut c = queued();
            c.created_at = base + chrono::Duration::seconds(i);
            repo.insert(&c).unwrap();
            ids.push(c.id);
        }
        let listed: Vec<_> = repo
            .list_by_status(CredentialStatus::Queued, 3)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, ids[..3]);
        assert!(repo
            .list_by_status(CredentialStatus::Pending, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let repo = repo();
        let id = stored(&repo);
        let lease = Duration::from_secs(60);

        let claim = repo.claim(&id, "relayer-a", lease).unwrap().unwrap();
        assert_eq!(claim.owner(), "relayer-a");
        assert!(repo.claim(&id, "relayer-b", lease).unwrap().is_none());

        drop(claim);
        assert!(repo.claim(&id, "relayer-b", lease).unwrap().is_some());
    }

    #[test]
    fn expired_claim_can_be_taken_over() {
        let repo = repo();
        let id = stored(&repo);

        let mut stale = repo.claim(&id, "crashed", Duration::ZERO).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let fresh = repo
            .claim(&id, "survivor", Duration::from_secs(60))
            .unwrap()
            .unwrap();

        assert!(matches!(
            stale.renew(Duration::from_secs(60)),
            Err(CredentialError::Claimed(_))
        ));
        // Dropping the stale claim must not release the survivor's lease.
        drop(stale);
        assert!(repo.claim(&id, "third", Duration::from_secs(60)).unwrap().is_none());
        drop(fresh);
    }

    #[test]
    fn claim_batch_skips_claimed_rows() {
        let repo = repo();
        let a = stored(&repo);
        let b = stored(&repo);
        let lease = Duration::from_secs(60);

        let _held = repo.claim(&a, "other", lease).unwrap().unwrap();
        let batch = repo
            .claim_batch(CredentialStatus::Queued, "relayer", lease, 10)
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].credential.id, b);
    }
}
