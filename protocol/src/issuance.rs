//! Request-handler-facing operations.
//!
//! [`IssuanceService`] is the only place a credential is created: it
//! reserves the mint cost first and queues the credential second, so a
//! QUEUED row always has its credits already deducted. If the row cannot
//! be written the reservation is refunded on the spot.

use thiserror::Error;
use tracing::{error, info};

use crate::credential::{
    Credential, CredentialError, CredentialId, CredentialRepository, StatusCounts,
};
use crate::ledger::{Account, AccountId, CreditLedger, Credits, LedgerEntry, LedgerError};
use crate::metadata::parse_payload;
use credmint_contracts::Address;

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("metadata payload rejected: {0}")]
    InvalidPayload(String),

    #[error("recipient must not be the zero address")]
    ZeroRecipient,

    #[error("mint cost must be positive, got {0}")]
    InvalidMintCost(Credits),
}

#[derive(Debug, Clone)]
pub struct IssuanceService {
    ledger: CreditLedger,
    credentials: CredentialRepository,
    mint_cost: Credits,
}

impl IssuanceService {
    pub fn new(
        ledger: CreditLedger,
        credentials: CredentialRepository,
        mint_cost: Credits,
    ) -> Result<Self, IssuanceError> {
        if !mint_cost.is_positive() {
            return Err(IssuanceError::InvalidMintCost(mint_cost));
        }
        Ok(Self {
            ledger,
            credentials,
            mint_cost,
        })
    }

    pub fn mint_cost(&self) -> Credits {
        self.mint_cost
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn credentials(&self) -> &CredentialRepository {
        &self.credentials
    }

    /// Reserves the mint cost and queues a credential for the relayer.
    pub fn issue(
        &self,
        issuer: &AccountId,
        recipient: Address,
        metadata_payload: &str,
    ) -> Result<Credential, IssuanceError> {
        if recipient == Address::ZERO {
            return Err(IssuanceError::ZeroRecipient);
        }
        let document = parse_payload(metadata_payload)
            .map_err(|e| IssuanceError::InvalidPayload(e.to_string()))?;
        if !document.is_object() {
            return Err(IssuanceError::InvalidPayload(
                "expected a JSON object".to_string(),
            ));
        }

        let credential = Credential::queued(
            *issuer,
            recipient,
            metadata_payload.to_string(),
            self.mint_cost,
        );
        self.ledger
            .reserve_for(issuer, self.mint_cost, credential.id)?;

        if let Err(e) = self.credentials.insert(&credential) {
            error!(
                credential = %credential.id,
                issuer = %issuer,
                error = %e,
                "failed to queue credential; refunding reservation"
            );
            if let Err(refund) = self.ledger.refund(issuer, self.mint_cost, credential.id) {
                error!(
                    credential = %credential.id,
                    issuer = %issuer,
                    error = %refund,
                    "refund after failed queueing also failed"
                );
            }
            return Err(e.into());
        }

        info!(
            credential = %credential.id,
            issuer = %issuer,
            recipient = %recipient,
            cost = %self.mint_cost,
            "credential queued"
        );
        Ok(credential)
    }

    pub fn get_credential(&self, id: &CredentialId) -> Result<Credential, IssuanceError> {
        Ok(self.credentials.get(id)?)
    }

    pub fn open_account(&self, id: AccountId) -> Result<Account, IssuanceError> {
        Ok(self.ledger.open_account(id)?)
    }

    pub fn purchase(
        &self,
        id: &AccountId,
        amount: Credits,
        payment_reference: &str,
    ) -> Result<LedgerEntry, IssuanceError> {
        Ok(self.ledger.purchase(id, amount, payment_reference)?)
    }

    pub fn balance(&self, id: &AccountId) -> Result<Credits, IssuanceError> {
        Ok(self.ledger.balance(id)?)
    }

    /// Ledger entries, newest first.
    pub fn history(&self, id: &AccountId) -> Result<Vec<LedgerEntry>, IssuanceError> {
        Ok(self.ledger.history(id)?)
    }

    /// CONFIRMED -> REVOKED. No ledger effect.
    pub fn revoke(&self, id: &CredentialId) -> Result<Credential, IssuanceError> {
        let revoked = self.credentials.revoke(id)?;
        info!(credential = %id, "credential revoked");
        Ok(revoked)
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.credentials.count_by_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStatus;
    use crate::ledger::EntryType;
    use crate::storage::CredMintDB;

    fn service(cost: i64) -> IssuanceService {
        let db = CredMintDB::open_temporary().unwrap();
        IssuanceService::new(
            CreditLedger::new(db.clone()),
            CredentialRepository::new(db),
            Credits::from_minor(cost),
        )
        .unwrap()
    }

    fn recipient() -> Address {
        "0x00000000000000000000000000000000000000d0".parse().unwrap()
    }

    fn funded(service: &IssuanceService, minor: i64) -> AccountId {
        let issuer = AccountId::new();
        service.open_account(issuer).unwrap();
        service
            .purchase(&issuer, Credits::from_minor(minor), &format!("pay-{issuer}"))
            .unwrap();
        issuer
    }

    #[test]
    fn issue_reserves_then_queues() {
        let service = service(100);
        let issuer = funded(&service, 100);

        let credential = service
            .issue(&issuer, recipient(), r#"{"name":"Ada"}"#)
            .unwrap();
        assert_eq!(credential.status, CredentialStatus::Queued);
        assert_eq!(service.balance(&issuer).unwrap(), Credits::ZERO);

        let history = service.history(&issuer).unwrap();
        assert_eq!(history[0].entry_type, EntryType::Deduct);
        assert_eq!(history[0].credential_id, Some(credential.id));
        assert_eq!(service.get_credential(&credential.id).unwrap(), credential);
        assert_eq!(service.status_counts().queued, 1);
    }

    #[test]
    fn insufficient_credits_queue_nothing() {
        let service = service(100);
        let issuer = funded(&service, 50);

        let err = service
            .issue(&issuer, recipient(), r#"{"name":"Ada"}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            IssuanceError::Ledger(LedgerError::InsufficientCredits { .. })
        ));
        assert_eq!(service.status_counts().total(), 0);
        assert_eq!(service.balance(&issuer).unwrap(), Credits::from_minor(50));
    }

    #[test]
    fn bad_requests_are_rejected_before_reserving() {
        let service = service(100);
        let issuer = funded(&service, 100);

        assert!(matches!(
            service.issue(&issuer, recipient(), "not json"),
            Err(IssuanceError::InvalidPayload(_))
        ));
        assert!(matches!(
            service.issue(&issuer, recipient(), "[1,2]"),
            Err(IssuanceError::InvalidPayload(_))
        ));
        assert!(matches!(
            service.issue(&issuer, Address::ZERO, "{}"),
            Err(IssuanceError::ZeroRecipient)
        ));
        assert_eq!(service.balance(&issuer).unwrap(), Credits::from_minor(100));
    }

    #[test]
    fn concurrent_issues_spend_the_last_credit_once() {
        let service = service(100);
        let issuer = funded(&service, 100);

        let successes = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let service = &service;
                    scope.spawn(move || {
                        service
                            .issue(&issuer, recipient(), &format!(r#"{{"n":{i}}}"#))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(successes, 1);
        assert_eq!(service.balance(&issuer).unwrap(), Credits::ZERO);
        assert_eq!(service.status_counts().queued, 1);
    }

    #[test]
    fn only_confirmed_credentials_can_be_revoked() {
        let service = service(100);
        let issuer = funded(&service, 100);
        let credential = service.issue(&issuer, recipient(), "{}").unwrap();

        assert!(matches!(
            service.revoke(&credential.id),
            Err(IssuanceError::Credential(CredentialError::IllegalTransition { .. }))
        ));
    }

    #[test]
    fn mint_cost_must_be_positive() {
        let db = CredMintDB::open_temporary().unwrap();
        let result = IssuanceService::new(
            CreditLedger::new(db.clone()),
            CredentialRepository::new(db),
            Credits::ZERO,
        );
        assert!(matches!(result, Err(IssuanceError::InvalidMintCost(_))));
    }
}
