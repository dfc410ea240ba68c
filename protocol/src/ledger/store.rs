//! # Ledger Store
//!
//! Row-level persistence for accounts and ledger entries, built around one
//! rule: **the only way to change a balance is to commit an
//! [`AccountGuard`]**.
//!
//! [`LedgerStore::lock_for_update`] takes the account's exclusive lock and
//! reads a snapshot of the row. [`AccountGuard::commit`] then writes the
//! updated account, the new entry and its uniqueness markers (payment
//! reference, per-credential refund) in one sled transaction across four
//! trees. The lock is released when the guard is dropped, committed or not.
//!
//! ```text
//!   lock_for_update(id) ──► AccountGuard { lock, snapshot }
//!                                │
//!                 inspect snapshot, decide
//!                                │
//!                          commit(NewEntry)
//!                                │
//!        ┌────────── sled transaction ───────────┐
//!        │ accounts        row == snapshot?       │
//!        │ payment_refs    reference unused?      │
//!        │ credential_refunds  no refund yet?     │
//!        │ ledger_entries  append entry           │
//!        └────────────────────────────────────────┘
//! ```
//!
//! Locks live in an in-process registry, so all writers must share one
//! `LedgerStore` (clone it, it is reference counted). The transaction
//! re-checks the row against the snapshot anyway; a mismatch surfaces as
//! [`LedgerError::ConcurrentModification`] rather than a lost update.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::IVec;
use tracing::debug;

use super::amount::Credits;
use super::entry::{entry_key, Account, AccountId, EntryId, EntryType, LedgerEntry, NewEntry};
use super::error::LedgerError;
use crate::credential::CredentialId;
use crate::storage::db::{decode, encode};
use crate::storage::CredMintDB;

/// Why a commit transaction aborted.
#[derive(Debug)]
enum Conflict {
    SnapshotMoved,
    DuplicatePayment(String),
    RefundExists(IVec),
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Persistence and locking for credit accounts.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    db: CredMintDB,
    locks: Arc<DashMap<AccountId, Arc<Mutex<()>>>>,
}

impl LedgerStore {
    pub fn new(db: CredMintDB) -> Self {
        Self {
            db,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Creates the account row if it does not exist yet. Returns the stored
    /// row either way.
    pub fn create_account(&self, id: AccountId) -> Result<(Account, bool), LedgerError> {
        let fresh = Account::open(id);
        let bytes = encode(&fresh)?;
        match self
            .db
            .accounts()
            .compare_and_swap(id.key(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.db.flush()?;
                Ok((fresh, true))
            }
            Err(cas) => match cas.current {
                Some(existing) => Ok((decode(&existing)?, false)),
                None => Err(LedgerError::ConcurrentModification(id)),
            },
        }
    }

    /// Reads an account without locking it.
    pub fn get_account(&self, id: &AccountId) -> Result<Option<Account>, LedgerError> {
        match self.db.accounts().get(id.key())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Takes the account's exclusive lock and snapshots the row.
    ///
    /// Blocks while another guard for the same account is alive.
    pub fn lock_for_update(&self, id: &AccountId) -> Result<AccountGuard<'_>, LedgerError> {
        let mutex = self.locks.entry(*id).or_default().value().clone();
        let lock = mutex.lock_arc();

        let snapshot_bytes = self
            .db
            .accounts()
            .get(id.key())?
            .ok_or(LedgerError::AccountNotFound(*id))?;
        let snapshot: Account = decode(&snapshot_bytes)?;

        Ok(AccountGuard {
            store: self,
            snapshot,
            snapshot_bytes,
            _lock: lock,
        })
    }

    /// All entries of an account, newest first.
    pub fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.db
            .ledger_entries()
            .scan_prefix(id.key())
            .rev()
            .map(|item| -> Result<LedgerEntry, LedgerError> {
                let (_, bytes) = item?;
                Ok(decode(&bytes)?)
            })
            .collect()
    }

    /// The REFUND entry recorded for a credential, if any.
    pub fn find_refund(
        &self,
        credential: &CredentialId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.db.credential_refunds().get(credential.key())? {
            Some(entry_key) => self.entry_at(&entry_key),
            None => Ok(None),
        }
    }

    /// The PURCHASE entry recorded under a payment reference, if any.
    pub fn find_payment(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.db.payment_refs().get(reference.as_bytes())? {
            Some(entry_key) => self.entry_at(&entry_key),
            None => Ok(None),
        }
    }

    fn entry_at(&self, key: &[u8]) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.db.ledger_entries().get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// AccountGuard
// ---------------------------------------------------------------------------

/// Exclusive hold on one account plus the row as it was when locked.
pub struct AccountGuard<'a> {
    store: &'a LedgerStore,
    snapshot: Account,
    snapshot_bytes: IVec,
    _lock: ArcMutexGuard<RawMutex, ()>,
}

impl std::fmt::Debug for AccountGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountGuard")
            .field("account", &self.snapshot.id)
            .field("version", &self.snapshot.version)
            .finish()
    }
}

impl AccountGuard<'_> {
    /// The account row as read under the lock.
    pub fn account(&self) -> &Account {
        &self.snapshot
    }

    pub fn balance(&self) -> Credits {
        self.snapshot.credit_balance
    }

    /// Appends `new` to the account and applies it to the balance, atomically.
    ///
    /// A REFUND for a credential that already has one is not an error: the
    /// existing entry is returned and nothing is written.
    pub fn commit(self, new: NewEntry) -> Result<LedgerEntry, LedgerError> {
        let account_id = self.snapshot.id;
        let balance_after = self
            .snapshot
            .credit_balance
            .checked_add(new.amount)
            .ok_or(LedgerError::Overflow(account_id))?;
        if balance_after.is_negative() {
            return Err(LedgerError::InsufficientCredits {
                account: account_id,
                available: self.snapshot.credit_balance,
                requested: new.amount.checked_neg().unwrap_or(new.amount),
            });
        }

        let now = Utc::now();
        let sequence = self.snapshot.version + 1;
        let entry = LedgerEntry {
            id: EntryId::new(),
            account_id,
            entry_type: new.entry_type,
            amount: new.amount,
            balance_after,
            credential_id: new.credential_id,
            payment_reference: new.payment_reference,
            memo: new.memo,
            sequence,
            created_at: now,
        };
        let updated = Account {
            credit_balance: balance_after,
            version: sequence,
            updated_at: now,
            ..self.snapshot.clone()
        };

        let account_key = account_id.key();
        let row_key = entry_key(&account_id, sequence);
        let account_bytes = encode(&updated)?;
        let entry_bytes = encode(&entry)?;
        let refund_key = match (entry.entry_type, entry.credential_id) {
            (EntryType::Refund, Some(credential)) => Some(credential.key()),
            _ => None,
        };

        let db = &self.store.db;
        let outcome = (
            db.accounts(),
            db.ledger_entries(),
            db.payment_refs(),
            db.credential_refunds(),
        )
            .transaction(|(accounts, entries, payments, refunds)| {
                if accounts.get(account_key)?.as_ref() != Some(&self.snapshot_bytes) {
                    return Err(ConflictableTransactionError::Abort(Conflict::SnapshotMoved));
                }
                if let Some(reference) = &entry.payment_reference {
                    if payments.get(reference.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            Conflict::DuplicatePayment(reference.clone()),
                        ));
                    }
                    payments.insert(reference.as_bytes(), &row_key[..])?;
                }
                if let Some(key) = refund_key {
                    if let Some(existing) = refunds.get(key)? {
                        return Err(ConflictableTransactionError::Abort(
                            Conflict::RefundExists(existing),
                        ));
                    }
                    refunds.insert(&key[..], &row_key[..])?;
                }
                accounts.insert(&account_key[..], account_bytes.as_slice())?;
                entries.insert(&row_key[..], entry_bytes.as_slice())?;
                Ok(())
            });

        match outcome {
            Ok(()) => {
                db.flush()?;
                debug!(
                    account = %account_id,
                    entry_type = %entry.entry_type,
                    amount = %entry.amount,
                    balance_after = %entry.balance_after,
                    sequence,
                    "ledger entry committed"
                );
                Ok(entry)
            }
            Err(TransactionError::Abort(Conflict::SnapshotMoved)) => {
                Err(LedgerError::ConcurrentModification(account_id))
            }
            Err(TransactionError::Abort(Conflict::DuplicatePayment(reference))) => {
                Err(LedgerError::DuplicatePayment(reference))
            }
            Err(TransactionError::Abort(Conflict::RefundExists(key))) => self
                .store
                .entry_at(&key)?
                .ok_or(LedgerError::ConcurrentModification(account_id)),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_account() -> (LedgerStore, AccountId) {
        let store = LedgerStore::new(CredMintDB::open_temporary().unwrap());
        let id = AccountId::new();
        store.create_account(id).unwrap();
        (store, id)
    }

    #[test]
    fn create_account_is_idempotent() {
        let (store, id) = store_with_account();
        let (again, created) = store.create_account(id).unwrap();
        assert!(!created);
        assert_eq!(again.id, id);
    }

    #[test]
    fn lock_for_update_unknown_account() {
        let store = LedgerStore::new(CredMintDB::open_temporary().unwrap());
        let err = store.lock_for_update(&AccountId::new()).unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[test]
    fn commit_updates_row_and_appends_entry() {
        let (store, id) = store_with_account();
        let guard = store.lock_for_update(&id).unwrap();
        let entry = guard
            .commit(NewEntry::purchase(Credits::from_minor(500), "pay-1"))
            .unwrap();

        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.balance_after, Credits::from_minor(500));
        let account = store.get_account(&id).unwrap().unwrap();
        assert_eq!(account.credit_balance, Credits::from_minor(500));
        assert_eq!(account.version, 1);
        assert_eq!(store.find_payment("pay-1").unwrap(), Some(entry));
    }

    #[test]
    fn commit_refuses_negative_balance() {
        let (store, id) = store_with_account();
        let guard = store.lock_for_update(&id).unwrap();
        let err = guard
            .commit(NewEntry::deduct(Credits::from_minor(-1), None))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredits { .. }));
        assert!(store.history(&id).unwrap().is_empty());
    }

    #[test]
    fn second_refund_returns_first() {
        let (store, id) = store_with_account();
        let credential = CredentialId::new();
        let first = store
            .lock_for_update(&id)
            .unwrap()
            .commit(NewEntry::refund(Credits::from_minor(100), credential))
            .unwrap();
        let second = store
            .lock_for_update(&id)
            .unwrap()
            .commit(NewEntry::refund(Credits::from_minor(100), credential))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.history(&id).unwrap().len(), 1);
        let account = store.get_account(&id).unwrap().unwrap();
        assert_eq!(account.credit_balance, Credits::from_minor(100));
    }

    #[test]
    fn stale_snapshot_detected() {
        let (store, id) = store_with_account();
        let guard = store.lock_for_update(&id).unwrap();

        // Write the row behind the guard's back.
        let mut tampered = guard.account().clone();
        tampered.version = 41;
        store
            .db
            .accounts()
            .insert(id.key(), encode(&tampered).unwrap())
            .unwrap();

        let err = guard
            .commit(NewEntry::purchase(Credits::from_minor(1), "pay-x"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrentModification(_)));
        assert!(store.find_payment("pay-x").unwrap().is_none());
    }

    #[test]
    fn history_is_newest_first() {
        let (store, id) = store_with_account();
        for i in 0..3 {
            store
                .lock_for_update(&id)
                .unwrap()
                .commit(NewEntry::purchase(Credits::from_minor(10), format!("p{i}")))
                .unwrap();
        }
        let sequences: Vec<u64> = store.history(&id).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 2, 1]);
    }

    #[test]
    fn guard_excludes_other_threads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let (store, id) = store_with_account();
        let released = Arc::new(AtomicBool::new(false));
        let guard = store.lock_for_update(&id).unwrap();

        let handle = {
            let store = store.clone();
            let released = Arc::clone(&released);
            std::thread::spawn(move || {
                let _g = store.lock_for_update(&id).unwrap();
                assert!(released.load(Ordering::SeqCst));
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);
        handle.join().unwrap();
    }
}
