//! # Confirmation Watcher
//!
//! Decides finality for PENDING credentials and reconciles refunds.
//!
//! | Receipt                          | Result                              |
//! |----------------------------------|-------------------------------------|
//! | none, younger than timeout       | stays PENDING                       |
//! | none, older than timeout         | escalation policy                   |
//! | reverted                         | FAILED + refund                     |
//! | success, depth < minimum         | stays PENDING                       |
//! | success, mint event decoded      | CONFIRMED with token id             |
//! | success, no mint event           | FAILED + refund                     |
//!
//! Every hash the relayer or an escalation ever signed for the credential
//! is checked, since any of them may be the one that got mined.
//!
//! After the finality checks each pass sweeps FAILED rows that never got
//! their refund written.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use primitive_types::U256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{PassReport, PeriodicTask};
use super::settle::{fail_and_refund, refund_failed};
use super::submit::{NonceChoice, Submitter};
use super::{with_timeout, PipelineError};
use crate::chain::{ChainClient, ReceiptStatus, TxHash};
use crate::config::{ChainConfig, EscalationPolicy, WatcherConfig};
use crate::credential::{
    ClaimedCredential, Credential, CredentialError, CredentialRepository, CredentialStatus,
};
use crate::ledger::CreditLedger;
use crate::signer::{SignerCache, SignerError};

/// What happened to one PENDING credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Confirmed(U256),
    /// FAILED and refunded.
    Failed,
    /// Mined but not deep enough yet.
    Waiting { confirmations: u64 },
    /// No receipt yet, still inside the pending timeout.
    Unmined,
    /// Past the pending timeout and flagged. `first` is false when an
    /// earlier pass already flagged it.
    Flagged { first: bool },
    /// Past the pending timeout; a same-nonce replacement was broadcast.
    Resubmitted(TxHash),
}

pub struct Watcher {
    owner: String,
    credentials: CredentialRepository,
    ledger: CreditLedger,
    signers: Arc<SignerCache>,
    submitter: Submitter,
    config: WatcherConfig,
}

impl Watcher {
    pub fn new(
        credentials: CredentialRepository,
        ledger: CreditLedger,
        signers: Arc<SignerCache>,
        chain: Arc<dyn ChainClient>,
        chain_config: ChainConfig,
        config: WatcherConfig,
    ) -> Self {
        let submitter = Submitter::new(
            chain,
            chain_config,
            config.call_timeout,
            config.gas_bump_percent,
        );
        Self {
            owner: format!("watcher-{}", Uuid::new_v4()),
            credentials,
            ledger,
            signers,
            submitter,
            config,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Checks one claimed PENDING credential against chain height `height`.
    pub async fn check(
        &self,
        claimed: ClaimedCredential,
        height: u64,
    ) -> Result<WatchOutcome, PipelineError> {
        let ClaimedCredential {
            claim: _claim,
            credential,
        } = claimed;
        let id = credential.id;
        let hashes = known_hashes(&credential)?;

        let Some(receipt) = self.submitter.find_receipt(&hashes).await? else {
            return self.on_unmined(&credential, &hashes).await;
        };

        if receipt.status == ReceiptStatus::Reverted {
            let reason = format!("transaction {} reverted", receipt.tx_hash);
            fail_and_refund(&self.credentials, &self.ledger, &id, &reason)?;
            return Ok(WatchOutcome::Failed);
        }

        let confirmations = receipt.confirmations(height);
        if confirmations < self.config.min_confirmations {
            debug!(
                credential = %id,
                tx_hash = %receipt.tx_hash,
                confirmations,
                required = self.config.min_confirmations,
                "waiting for confirmations"
            );
            return Ok(WatchOutcome::Waiting { confirmations });
        }

        let chain = self.submitter.config();
        match chain
            .mint_abi
            .decode_minted(&chain.registry_address, &receipt.logs)
        {
            Ok(event) => {
                if let Some(recipient) = event.recipient {
                    if recipient != credential.recipient_address {
                        warn!(
                            credential = %id,
                            expected = %credential.recipient_address,
                            actual = %recipient,
                            "mint event names a different recipient"
                        );
                    }
                }
                self.credentials
                    .mark_confirmed(&id, receipt.tx_hash, event.token_id)?;
                info!(
                    credential = %id,
                    tx_hash = %receipt.tx_hash,
                    token_id = %event.token_id,
                    confirmations,
                    "credential confirmed"
                );
                Ok(WatchOutcome::Confirmed(event.token_id))
            }
            Err(e) => {
                let reason = format!("receipt {} has no usable mint event: {e}", receipt.tx_hash);
                fail_and_refund(&self.credentials, &self.ledger, &id, &reason)?;
                Ok(WatchOutcome::Failed)
            }
        }
    }

    async fn on_unmined(
        &self,
        credential: &Credential,
        hashes: &[TxHash],
    ) -> Result<WatchOutcome, PipelineError> {
        let since = credential
            .submission
            .as_ref()
            .map(|s| s.signed_at)
            .or(credential.submitted_at)
            .unwrap_or(credential.updated_at);
        let age = (Utc::now() - since).to_std().unwrap_or_default();
        if age < self.config.pending_timeout {
            return Ok(WatchOutcome::Unmined);
        }

        match self.config.escalation {
            EscalationPolicy::Flag => self.flag(credential, age),
            EscalationPolicy::Resubmit => self.resubmit(credential, age).await,
            EscalationPolicy::FailIfDropped => self.fail_if_dropped(credential, hashes, age).await,
        }
    }

    fn flag(&self, credential: &Credential, age: Duration) -> Result<WatchOutcome, PipelineError> {
        let first = credential.escalated_at.is_none();
        if first {
            self.credentials.record_escalation(&credential.id)?;
            warn!(
                credential = %credential.id,
                tx_hash = ?credential.chain_tx_hash,
                pending_secs = age.as_secs(),
                "credential pending past timeout; flagged for review"
            );
        }
        Ok(WatchOutcome::Flagged { first })
    }

    async fn resubmit(
        &self,
        credential: &Credential,
        age: Duration,
    ) -> Result<WatchOutcome, PipelineError> {
        let id = credential.id;
        let (Some(previous), Some(content)) = (&credential.submission, &credential.content_address)
        else {
            return self.flag(credential, age);
        };

        let name = self.config.relayer_key_name.as_str();
        let signer = match with_timeout(self.config.call_timeout, self.signers.get(name), || {
            SignerError::unavailable(name, "key service timed out")
        })
        .await
        {
            Ok(signer) => signer,
            Err(e) => {
                warn!(credential = %id, error = %e, "cannot resubmit without the relayer key");
                return self.flag(credential, age);
            }
        };
        // A different key would sign a second, independent mint.
        if previous.sender != signer.address() {
            warn!(
                credential = %id,
                sender = %previous.sender,
                "relayer key rotated since submission; not resubmitting"
            );
            return self.flag(credential, age);
        }

        let replacement = match self
            .submitter
            .sign_version(credential, content, &signer, NonceChoice::Replace)
            .await
        {
            Ok(signed) => signed,
            Err(e) => {
                warn!(credential = %id, error = ?e, "could not sign replacement");
                return self.flag(credential, age);
            }
        };

        // Checkpoint first: once broadcast, the replacement may be the hash
        // that gets mined.
        self.credentials.record_replacement(&id, &replacement)?;
        let accepted = match self.submitter.broadcast(&replacement).await {
            Ok(_) => true,
            Err(e) if e.is_ambiguous() => {
                warn!(credential = %id, error = %e, "replacement broadcast outcome unknown");
                true
            }
            Err(e) => {
                warn!(credential = %id, error = %e, "replacement rejected");
                false
            }
        };
        if !accepted {
            return self.flag(credential, age);
        }

        self.credentials.record_escalation(&id)?;
        info!(
            credential = %id,
            replaced = %previous.tx_hash,
            tx_hash = %replacement.tx_hash,
            nonce = replacement.nonce,
            gas_price_wei = %replacement.gas_price_wei,
            "replacement broadcast"
        );
        Ok(WatchOutcome::Resubmitted(replacement.tx_hash))
    }

    async fn fail_if_dropped(
        &self,
        credential: &Credential,
        hashes: &[TxHash],
        age: Duration,
    ) -> Result<WatchOutcome, PipelineError> {
        let Some(submission) = &credential.submission else {
            return self.flag(credential, age);
        };
        let mined_nonce = match self.submitter.latest_nonce(&submission.sender).await {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(credential = %credential.id, error = %e, "confirmed nonce unavailable");
                return self.flag(credential, age);
            }
        };
        if mined_nonce <= submission.nonce {
            return self.flag(credential, age);
        }

        // The nonce is used. Only refund if none of our versions used it.
        if self.submitter.find_receipt(hashes).await?.is_some() {
            return Ok(WatchOutcome::Unmined);
        }
        let reason = format!(
            "nonce {} consumed by another transaction; mint can no longer land",
            submission.nonce
        );
        fail_and_refund(&self.credentials, &self.ledger, &credential.id, &reason)?;
        Ok(WatchOutcome::Failed)
    }

    async fn check_pending(&self, height: u64, report: &mut PassReport) {
        let batch = match self.credentials.claim_batch(
            CredentialStatus::Pending,
            &self.owner,
            self.config.claim_lease,
            self.config.batch_size,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to claim pending credentials");
                report.errors += 1;
                return;
            }
        };
        report.claimed += batch.len();

        for claimed in batch {
            let id = claimed.credential.id;
            match self.check(claimed, height).await {
                Ok(WatchOutcome::Confirmed(_)) => report.confirmed += 1,
                Ok(WatchOutcome::Failed) => {
                    report.failed += 1;
                    report.refunded += 1;
                }
                Ok(WatchOutcome::Resubmitted(_)) | Ok(WatchOutcome::Flagged { first: true }) => {
                    report.escalated += 1
                }
                Ok(
                    WatchOutcome::Waiting { .. }
                    | WatchOutcome::Unmined
                    | WatchOutcome::Flagged { first: false },
                ) => report.skipped += 1,
                Err(PipelineError::Chain(e)) => {
                    warn!(credential = %id, error = %e, "chain lookup failed; retrying next pass");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(credential = %id, error = %e, "watcher failed to process credential");
                    report.errors += 1;
                }
            }
        }
    }

    /// Refunds FAILED rows whose refund was never recorded.
    fn sweep_refunds(&self, report: &mut PassReport) {
        let unrefunded = match self.credentials.list_unrefunded_failed(self.config.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to list unrefunded credentials");
                report.errors += 1;
                return;
            }
        };

        for row in unrefunded {
            match self.reconcile(&row) {
                Ok(true) => {
                    report.refunded += 1;
                    info!(credential = %row.id, issuer = %row.issuer_id, "refund reconciled");
                }
                Ok(false) => {}
                Err(e) => {
                    error!(credential = %row.id, error = %e, "refund reconciliation failed");
                    report.errors += 1;
                }
            }
        }
    }

    fn reconcile(&self, row: &Credential) -> Result<bool, PipelineError> {
        let Some(_claim) = self
            .credentials
            .claim(&row.id, &self.owner, self.config.claim_lease)?
        else {
            return Ok(false);
        };
        let current = self.credentials.get(&row.id)?;
        if current.status != CredentialStatus::Failed || current.refund_entry.is_some() {
            return Ok(false);
        }
        refund_failed(&self.credentials, &self.ledger, &current)?;
        Ok(true)
    }
}

/// Every hash that may have been mined for the credential.
fn known_hashes(credential: &Credential) -> Result<Vec<TxHash>, CredentialError> {
    let mut hashes = credential
        .submission
        .as_ref()
        .map(|s| s.all_hashes())
        .unwrap_or_default();
    if let Some(current) = credential.chain_tx_hash {
        if !hashes.contains(&current) {
            hashes.insert(0, current);
        }
    }
    if hashes.is_empty() {
        return Err(CredentialError::Incomplete {
            id: credential.id,
            field: "chain_tx_hash",
        });
    }
    Ok(hashes)
}

#[async_trait]
impl PeriodicTask for Watcher {
    fn name(&self) -> &'static str {
        "watcher"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> PassReport {
        let mut report = PassReport::default();
        match self.submitter.block_height().await {
            Ok(height) => self.check_pending(height, &mut report).await,
            Err(e) => {
                warn!(error = %e, "block height unavailable; skipping finality checks");
                report.errors += 1;
            }
        }
        self.sweep_refunds(&mut report);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;
    use crate::config::RelayerConfig;
    use crate::ledger::{AccountId, Credits};
    use crate::metadata::InMemoryPublisher;
    use crate::pipeline::Relayer;
    use crate::signer::local::StaticKeySigner;
    use crate::signer::RelayerKey;
    use crate::storage::CredMintDB;
    use credmint_contracts::{Address, MintAbi};

    struct Harness {
        relayer: Relayer,
        credentials: CredentialRepository,
        ledger: CreditLedger,
        signers: Arc<SignerCache>,
        chain: Arc<SimulatedChain>,
        chain_config: ChainConfig,
        issuer: AccountId,
    }

    fn harness() -> Harness {
        let db = CredMintDB::open_temporary().unwrap();
        let credentials = CredentialRepository::new(db.clone());
        let ledger = CreditLedger::new(db);
        let chain_config = ChainConfig {
            registry_address: "0x00000000000000000000000000000000000000c0".parse().unwrap(),
            ..ChainConfig::default()
        };
        let chain = Arc::new(SimulatedChain::new(
            chain_config.chain_id,
            chain_config.registry_address,
            MintAbi::default(),
        ));
        let keys = Arc::new(StaticKeySigner::new().with_key(RelayerKey::generate("relayer")));
        let signers = Arc::new(SignerCache::new(keys, Duration::from_secs(60)));

        let issuer = AccountId::new();
        ledger.open_account(issuer).unwrap();
        ledger
            .purchase(&issuer, Credits::from_minor(500), "pay-1")
            .unwrap();

        let relayer = Relayer::new(
            credentials.clone(),
            ledger.clone(),
            Arc::new(InMemoryPublisher::new()),
            signers.clone(),
            chain.clone(),
            chain_config.clone(),
            RelayerConfig::default(),
        );
        Harness {
            relayer,
            credentials,
            ledger,
            signers,
            chain,
            chain_config,
            issuer,
        }
    }

    impl Harness {
        fn watcher(&self, config: WatcherConfig) -> Watcher {
            self.watcher_with_chain(self.chain_config.clone(), config)
        }

        fn watcher_with_chain(&self, chain_config: ChainConfig, config: WatcherConfig) -> Watcher {
            Watcher::new(
                self.credentials.clone(),
                self.ledger.clone(),
                self.signers.clone(),
                self.chain.clone(),
                chain_config,
                config,
            )
        }

        /// Queues one credential and lets the relayer submit it.
        async fn submitted(&self) -> Credential {
            let credential = Credential::queued(
                self.issuer,
                "0x00000000000000000000000000000000000000d0".parse::<Address>().unwrap(),
                r#"{"name":"Grace Hopper"}"#.to_string(),
                Credits::from_minor(100),
            );
            self.ledger
                .reserve_for(&self.issuer, credential.cost, credential.id)
                .unwrap();
            self.credentials.insert(&credential).unwrap();
            assert_eq!(self.relayer.run_once().await.submitted, 1);
            self.credentials.get(&credential.id).unwrap()
        }

        fn status(&self, credential: &Credential) -> CredentialStatus {
            self.credentials.get(&credential.id).unwrap().status
        }
    }

    fn escalating(policy: EscalationPolicy) -> WatcherConfig {
        WatcherConfig {
            pending_timeout: Duration::ZERO,
            escalation: policy,
            min_confirmations: 1,
            ..WatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn confirms_after_minimum_depth() {
        let h = harness();
        let c = h.submitted().await;
        let watcher = h.watcher(WatcherConfig::default());

        h.chain.mine_block();
        let report = watcher.run_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.status(&c), CredentialStatus::Pending);

        h.chain.mine_blocks(11);
        assert_eq!(watcher.run_once().await.skipped, 1);

        h.chain.mine_block();
        let report = watcher.run_once().await;
        assert_eq!(report.confirmed, 1);

        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.status, CredentialStatus::Confirmed);
        assert_eq!(stored.token_id, Some(U256::one()));
        assert!(stored.confirmed_at.is_some());
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(400));
    }

    #[tokio::test]
    async fn revert_fails_and_refunds() {
        let h = harness();
        h.chain.revert_next_mint();
        let c = h.submitted().await;
        h.chain.mine_block();

        let report = h.watcher(WatcherConfig::default()).run_once().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.refunded, 1);
        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.status, CredentialStatus::Failed);
        assert!(stored.last_error.unwrap().contains("reverted"));
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(500));
    }

    #[tokio::test]
    async fn missing_mint_event_fails_and_refunds() {
        let h = harness();
        let c = h.submitted().await;
        h.chain.mine_blocks(2);

        let other_event = ChainConfig {
            mint_abi: MintAbi::new("mint(address,string)", "Issued(uint256,address)").unwrap(),
            ..h.chain_config.clone()
        };
        let watcher = h.watcher_with_chain(
            other_event,
            WatcherConfig {
                min_confirmations: 1,
                ..WatcherConfig::default()
            },
        );
        assert_eq!(watcher.run_once().await.failed, 1);
        assert_eq!(h.status(&c), CredentialStatus::Failed);
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(500));
    }

    #[tokio::test]
    async fn unmined_within_timeout_stays_pending() {
        let h = harness();
        let c = h.submitted().await;
        let report = h.watcher(WatcherConfig::default()).run_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.escalated, 0);
        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.status, CredentialStatus::Pending);
        assert!(stored.escalated_at.is_none());
    }

    #[tokio::test]
    async fn flag_policy_escalates_once() {
        let h = harness();
        let c = h.submitted().await;
        let watcher = h.watcher(escalating(EscalationPolicy::Flag));

        assert_eq!(watcher.run_once().await.escalated, 1);
        let first = h.credentials.get(&c.id).unwrap().escalated_at.unwrap();

        assert_eq!(watcher.run_once().await.escalated, 0);
        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.escalated_at, Some(first));
        assert_eq!(stored.status, CredentialStatus::Pending);
    }

    #[tokio::test]
    async fn resubmit_policy_replaces_and_confirms_replacement() {
        let h = harness();
        let c = h.submitted().await;
        let original = c.chain_tx_hash.unwrap();
        let watcher = h.watcher(escalating(EscalationPolicy::Resubmit));

        let report = watcher.run_once().await;
        assert_eq!(report.escalated, 1);
        let stored = h.credentials.get(&c.id).unwrap();
        let replacement = stored.chain_tx_hash.unwrap();
        assert_ne!(replacement, original);
        assert!(h.chain.is_pending(&replacement));
        assert!(!h.chain.is_pending(&original));
        assert_eq!(stored.submission.unwrap().previous_hashes, vec![original]);

        h.chain.mine_blocks(2);
        assert_eq!(watcher.run_once().await.confirmed, 1);
        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.chain_tx_hash, Some(replacement));
        assert_eq!(h.chain.minted_count(), 1);
    }

    #[tokio::test]
    async fn fail_if_dropped_waits_until_nonce_is_used() {
        let h = harness();
        let c = h.submitted().await;
        let watcher = h.watcher(escalating(EscalationPolicy::FailIfDropped));

        // Still in the mempool: only flagged.
        assert_eq!(watcher.run_once().await.escalated, 1);
        assert_eq!(h.status(&c), CredentialStatus::Pending);

        let submission = c.submission.clone().unwrap();
        assert!(h.chain.drop_pending(&submission.tx_hash));
        h.chain.advance_nonce(&submission.sender);

        let report = watcher.run_once().await;
        assert_eq!(report.failed, 1);
        let stored = h.credentials.get(&c.id).unwrap();
        assert_eq!(stored.status, CredentialStatus::Failed);
        assert!(stored.refund_entry.is_some());
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(500));
    }

    #[tokio::test]
    async fn sweep_refunds_failed_rows_once() {
        let h = harness();
        let c = Credential::queued(
            h.issuer,
            Address::ZERO,
            "{}".to_string(),
            Credits::from_minor(100),
        );
        h.ledger.reserve_for(&h.issuer, c.cost, c.id).unwrap();
        h.credentials.insert(&c).unwrap();
        // Crash between the FAILED transition and the refund.
        h.credentials.mark_failed(&c.id, "relayer crashed").unwrap();
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(400));

        let watcher = h.watcher(WatcherConfig::default());
        assert_eq!(watcher.run_once().await.refunded, 1);
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(500));
        assert!(h.credentials.get(&c.id).unwrap().refund_entry.is_some());

        assert_eq!(watcher.run_once().await.refunded, 0);
        assert_eq!(h.ledger.balance(&h.issuer).unwrap(), Credits::from_minor(500));
    }
}
