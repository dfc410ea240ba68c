//! # Credit Ledger
//!
//! Issuers prepay for mints. Every balance change is an append-only
//! [`LedgerEntry`], and every change goes through
//! [`LedgerStore::lock_for_update`], so two concurrent reservations can
//! never both spend the last unit of credit: the second one waits for the
//! first to commit, then sees the reduced balance.
//!
//! | Operation      | Entry        | Amount   | Notes                                 |
//! |----------------|--------------|----------|---------------------------------------|
//! | `purchase`     | PURCHASE     | `+x`     | payment reference must be unique      |
//! | `reserve[_for]`| DEDUCT       | `-x`     | fails with `InsufficientCredits`      |
//! | `refund`       | REFUND       | `+x`     | at most one per credential            |
//! | `adjust`       | ADJUSTMENT   | `±x`     | operator correction with a memo       |
//!
//! All calls are synchronous and short; they are safe to make from async
//! request handlers and from the pipeline tasks alike.

use tracing::{info, warn};

use super::amount::Credits;
use super::entry::{Account, AccountId, LedgerEntry, NewEntry};
use super::error::LedgerError;
use super::store::LedgerStore;
use crate::credential::CredentialId;
use crate::storage::CredMintDB;

/// Result of [`CreditLedger::verify_account`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAudit {
    pub account_id: AccountId,
    pub balance: Credits,
    /// Sum of all entry amounts.
    pub entry_sum: Credits,
    pub entry_count: usize,
    /// Sequences run 1..=version without gaps.
    pub sequence_contiguous: bool,
}

impl AccountAudit {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.entry_sum && self.sequence_contiguous
    }
}

/// The issuer credit ledger. Clone freely; clones share the lock registry.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    store: LedgerStore,
}

impl CreditLedger {
    pub fn new(db: CredMintDB) -> Self {
        Self {
            store: LedgerStore::new(db),
        }
    }

    /// The underlying store, for callers that need a raw lock.
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Onboards an issuer. Opening an existing account returns it unchanged.
    pub fn open_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let (account, created) = self.store.create_account(id)?;
        if created {
            info!(account = %id, "credit account opened");
        }
        Ok(account)
    }

    /// Reserves `amount` credits without tying them to a credential.
    pub fn reserve(&self, id: &AccountId, amount: Credits) -> Result<LedgerEntry, LedgerError> {
        self.deduct(id, amount, None)
    }

    /// Reserves `amount` credits for `credential`. The DEDUCT entry records
    /// the credential so a later refund can be traced back to it.
    pub fn reserve_for(
        &self,
        id: &AccountId,
        amount: Credits,
        credential: CredentialId,
    ) -> Result<LedgerEntry, LedgerError> {
        self.deduct(id, amount, Some(credential))
    }

    fn deduct(
        &self,
        id: &AccountId,
        amount: Credits,
        credential: Option<CredentialId>,
    ) -> Result<LedgerEntry, LedgerError> {
        require_positive(amount)?;
        let negated = amount.checked_neg().ok_or(LedgerError::InvalidAmount(amount))?;

        let guard = self.store.lock_for_update(id)?;
        let available = guard.balance();
        if available < amount {
            return Err(LedgerError::InsufficientCredits {
                account: *id,
                available,
                requested: amount,
            });
        }
        guard.commit(NewEntry::deduct(negated, credential))
    }

    /// Returns `amount` credits for a failed credential.
    ///
    /// Idempotent per credential: if a REFUND for `credential` already
    /// exists it is returned and the balance is left alone.
    pub fn refund(
        &self,
        id: &AccountId,
        amount: Credits,
        credential: CredentialId,
    ) -> Result<LedgerEntry, LedgerError> {
        require_positive(amount)?;

        let guard = self.store.lock_for_update(id)?;
        if let Some(existing) = self.store.find_refund(&credential)? {
            if existing.account_id != *id {
                warn!(
                    credential = %credential,
                    account = %id,
                    refunded_to = %existing.account_id,
                    "credential already refunded to a different account"
                );
            }
            return Ok(existing);
        }
        let entry = guard.commit(NewEntry::refund(amount, credential))?;
        info!(
            account = %id,
            credential = %credential,
            amount = %amount,
            balance = %entry.balance_after,
            "credits refunded"
        );
        Ok(entry)
    }

    /// Records a credit purchase. A reused payment reference is rejected with
    /// [`LedgerError::DuplicatePayment`], even across accounts.
    pub fn purchase(
        &self,
        id: &AccountId,
        amount: Credits,
        payment_reference: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        require_positive(amount)?;
        let reference = payment_reference.trim();
        if reference.is_empty() {
            return Err(LedgerError::MissingPaymentReference);
        }

        let guard = self.store.lock_for_update(id)?;
        if self.store.find_payment(reference)?.is_some() {
            return Err(LedgerError::DuplicatePayment(reference.to_string()));
        }
        let entry = guard.commit(NewEntry::purchase(amount, reference))?;
        info!(
            account = %id,
            amount = %amount,
            balance = %entry.balance_after,
            payment_reference = reference,
            "credits purchased"
        );
        Ok(entry)
    }

    /// Operator correction. Negative adjustments may not overdraw.
    pub fn adjust(
        &self,
        id: &AccountId,
        amount: Credits,
        memo: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let guard = self.store.lock_for_update(id)?;
        let entry = guard.commit(NewEntry::adjustment(amount, memo))?;
        warn!(
            account = %id,
            amount = %amount,
            balance = %entry.balance_after,
            memo,
            "manual ledger adjustment"
        );
        Ok(entry)
    }

    /// Current balance.
    pub fn balance(&self, id: &AccountId) -> Result<Credits, LedgerError> {
        self.store
            .get_account(id)?
            .map(|a| a.credit_balance)
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    /// The account row.
    pub fn account(&self, id: &AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(id)?
            .ok_or(LedgerError::AccountNotFound(*id))
    }

    /// Every entry of the account, newest first.
    pub fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        // Distinguish "no entries yet" from "no such account".
        self.account(id)?;
        self.store.history(id)
    }

    /// The REFUND entry for a credential, if one was recorded.
    pub fn find_refund(&self, credential: &CredentialId) -> Result<Option<LedgerEntry>, LedgerError> {
        self.store.find_refund(credential)
    }

    /// Recomputes the balance from the entries and compares it to the row.
    pub fn verify_account(&self, id: &AccountId) -> Result<AccountAudit, LedgerError> {
        let guard = self.store.lock_for_update(id)?;
        let entries = self.store.history(id)?;

        let mut sum = Credits::ZERO;
        for entry in &entries {
            sum = sum
                .checked_add(entry.amount)
                .ok_or(LedgerError::Overflow(*id))?;
        }
        let version = guard.account().version;
        let sequence_contiguous = entries.len() as u64 == version
            && entries
                .iter()
                .zip((1..=version).rev())
                .all(|(entry, expected)| entry.sequence == expected);

        Ok(AccountAudit {
            account_id: *id,
            balance: guard.balance(),
            entry_sum: sum,
            entry_count: entries.len(),
            sequence_contiguous,
        })
    }
}

fn require_positive(amount: Credits) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryType;

    fn ledger() -> (CreditLedger, AccountId) {
        let ledger = CreditLedger::new(CredMintDB::open_temporary().unwrap());
        let id = AccountId::new();
        ledger.open_account(id).unwrap();
        (ledger, id)
    }

    fn c(minor: i64) -> Credits {
        Credits::from_minor(minor)
    }

    #[test]
    fn purchase_then_reserve() {
        let (ledger, id) = ledger();
        ledger.purchase(&id, c(300), "stripe_pi_1").unwrap();
        let entry = ledger.reserve(&id, c(100)).unwrap();

        assert_eq!(entry.entry_type, EntryType::Deduct);
        assert_eq!(entry.amount, c(-100));
        assert_eq!(entry.balance_after, c(200));
        assert_eq!(ledger.balance(&id).unwrap(), c(200));
    }

    #[test]
    fn reserve_beyond_balance_fails_cleanly() {
        let (ledger, id) = ledger();
        ledger.purchase(&id, c(50), "p").unwrap();
        let err = ledger.reserve(&id, c(51)).unwrap_err();
        match err {
            LedgerError::InsufficientCredits {
                available,
                requested,
                ..
            } => {
                assert_eq!(available, c(50));
                assert_eq!(requested, c(51));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.balance(&id).unwrap(), c(50));
        assert_eq!(ledger.history(&id).unwrap().len(), 1);
    }

    #[test]
    fn reserve_exact_balance_reaches_zero() {
        let (ledger, id) = ledger();
        ledger.purchase(&id, c(100), "p").unwrap();
        ledger.reserve(&id, c(100)).unwrap();
        assert_eq!(ledger.balance(&id).unwrap(), Credits::ZERO);
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let (ledger, id) = ledger();
        assert!(matches!(
            ledger.purchase(&id, Credits::ZERO, "p"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.reserve(&id, c(-5)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.refund(&id, Credits::ZERO, CredentialId::new()),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.adjust(&id, Credits::ZERO, "noop"),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn duplicate_payment_reference_rejected_across_accounts() {
        let (ledger, alice) = ledger();
        let bob = AccountId::new();
        ledger.open_account(bob).unwrap();

        ledger.purchase(&alice, c(100), "pay-42").unwrap();
        let err = ledger.purchase(&bob, c(100), "pay-42").unwrap_err();
        assert!(matches!(err, LedgerError::DuplicatePayment(ref r) if r == "pay-42"));
        assert_eq!(ledger.balance(&bob).unwrap(), Credits::ZERO);
    }

    #[test]
    fn blank_payment_reference_rejected() {
        let (ledger, id) = ledger();
        assert!(matches!(
            ledger.purchase(&id, c(100), "  "),
            Err(LedgerError::MissingPaymentReference)
        ));
    }

    #[test]
    fn refund_twice_credits_once() {
        let (ledger, id) = ledger();
        ledger.purchase(&id, c(100), "p").unwrap();
        let credential = CredentialId::new();
        ledger.reserve_for(&id, c(100), credential).unwrap();

        let first = ledger.refund(&id, c(100), credential).unwrap();
        let second = ledger.refund(&id, c(100), credential).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.balance(&id).unwrap(), c(100));
        let refunds = ledger
            .history(&id)
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == EntryType::Refund)
            .count();
        assert_eq!(refunds, 1);
        assert_eq!(ledger.find_refund(&credential).unwrap(), Some(first));
    }

    #[test]
    fn negative_adjustment_cannot_overdraw() {
        let (ledger, id) = ledger();
        ledger.adjust(&id, c(500), "goodwill").unwrap();
        assert!(matches!(
            ledger.adjust(&id, c(-501), "clawback"),
            Err(LedgerError::InsufficientCredits { .. })
        ));
        let entry = ledger.adjust(&id, c(-500), "clawback").unwrap();
        assert_eq!(entry.memo.as_deref(), Some("clawback"));
        assert_eq!(entry.balance_after, Credits::ZERO);
    }

    #[test]
    fn unknown_account() {
        let ledger = CreditLedger::new(CredMintDB::open_temporary().unwrap());
        let ghost = AccountId::new();
        assert!(matches!(ledger.balance(&ghost), Err(LedgerError::AccountNotFound(_))));
        assert!(matches!(ledger.history(&ghost), Err(LedgerError::AccountNotFound(_))));
        assert!(matches!(
            ledger.purchase(&ghost, c(1), "p"),
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[test]
    fn balance_equals_entry_sum_after_mixed_activity() {
        let (ledger, id) = ledger();
        ledger.purchase(&id, c(1_000), "p1").unwrap();
        let cred = CredentialId::new();
        ledger.reserve_for(&id, c(250), cred).unwrap();
        ledger.reserve(&id, c(125)).unwrap();
        ledger.refund(&id, c(250), cred).unwrap();
        ledger.adjust(&id, c(-5), "fee").unwrap();
        let _ = ledger.reserve(&id, c(100_000));

        let audit = ledger.verify_account(&id).unwrap();
        assert!(audit.is_consistent(), "{audit:?}");
        assert_eq!(audit.balance, c(870));
        assert_eq!(audit.entry_count, 5);
    }

    #[test]
    fn concurrent_reserves_spend_each_credit_once() {
        use std::sync::Arc;

        let (ledger, id) = ledger();
        ledger.purchase(&id, c(100), "p").unwrap();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.reserve(&id, c(100)).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(ledger.balance(&id).unwrap(), Credits::ZERO);
        assert!(ledger.verify_account(&id).unwrap().is_consistent());
    }
}
