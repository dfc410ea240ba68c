//! Failing a credential and giving the issuer their credits back.
//!
//! The two steps are separate writes: the FAILED transition, then the
//! refund linked back onto the row. A crash in between leaves a FAILED row
//! without `refund_entry`, which the watcher's sweep finds and finishes.
//! The ledger refund is idempotent per credential, so finishing twice is
//! harmless.

use tracing::info;

use super::PipelineError;
use crate::credential::{Credential, CredentialId, CredentialRepository};
use crate::ledger::CreditLedger;

/// Moves the credential to FAILED and refunds its cost.
pub fn fail_and_refund(
    credentials: &CredentialRepository,
    ledger: &CreditLedger,
    id: &CredentialId,
    reason: &str,
) -> Result<Credential, PipelineError> {
    let failed = credentials.mark_failed(id, reason)?;
    info!(credential = %id, reason, "credential failed");
    refund_failed(credentials, ledger, &failed)
}

/// Refunds a FAILED credential and records the entry on the row.
pub fn refund_failed(
    credentials: &CredentialRepository,
    ledger: &CreditLedger,
    credential: &Credential,
) -> Result<Credential, PipelineError> {
    let entry = ledger.refund(&credential.issuer_id, credential.cost, credential.id)?;
    let updated = credentials.mark_refunded(&credential.id, entry.id)?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStatus;
    use crate::ledger::{AccountId, Credits, EntryType};
    use crate::storage::CredMintDB;
    use credmint_contracts::Address;

    #[test]
    fn fail_and_refund_restores_balance_once() {
        let db = CredMintDB::open_temporary().unwrap();
        let ledger = CreditLedger::new(db.clone());
        let credentials = CredentialRepository::new(db);
        let issuer = AccountId::new();
        ledger.open_account(issuer).unwrap();
        ledger
            .purchase(&issuer, Credits::from_minor(100), "pay-1")
            .unwrap();

        let credential = Credential::queued(
            issuer,
            Address::ZERO,
            "{}".to_string(),
            Credits::from_minor(100),
        );
        ledger
            .reserve_for(&issuer, credential.cost, credential.id)
            .unwrap();
        credentials.insert(&credential).unwrap();

        let failed = fail_and_refund(&credentials, &ledger, &credential.id, "reverted").unwrap();
        assert_eq!(failed.status, CredentialStatus::Failed);
        assert!(failed.refund_entry.is_some());
        assert_eq!(ledger.balance(&issuer).unwrap(), Credits::from_minor(100));

        // A second settlement attempt changes nothing.
        refund_failed(&credentials, &ledger, &failed).unwrap();
        assert_eq!(ledger.balance(&issuer).unwrap(), Credits::from_minor(100));
        let refunds = ledger
            .history(&issuer)
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == EntryType::Refund)
            .count();
        assert_eq!(refunds, 1);
    }
}
