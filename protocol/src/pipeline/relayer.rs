//! # Relayer Worker
//!
//! Drains QUEUED credentials and moves each to PENDING at most once.
//!
//! ```text
//!  claim row ─► publish metadata ─► checkpoint address
//!      │            (skipped when the address is already stored)
//!      ▼
//!  signer cache ─► earlier hash mined? ──yes──► PENDING
//!      │                 │ no
//!      ▼                 ▼
//!  sign version ─► checkpoint raw tx ─► broadcast ──ok──► PENDING
//!                        ▲                   │ transient
//!                        └─ backoff, bump ◄──┘
//!                                            │ permanent / exhausted
//!                                            ▼
//!                          ambiguous broadcast? ─yes─► PENDING (parked)
//!                                            │ no
//!                                            ▼
//!                                   FAILED + refund
//! ```
//!
//! Every signed version is checkpointed before it is broadcast, so a
//! restarted relayer rebroadcasts the stored bytes instead of producing a
//! second transaction for the same credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{PassReport, PeriodicTask};
use super::settle::fail_and_refund;
use super::submit::{NonceChoice, NonceLane, PrepareError, Submitter};
use super::{with_timeout, PipelineError};
use crate::chain::{ChainClient, ChainError, TxHash};
use crate::config::{ChainConfig, RelayerConfig};
use crate::credential::{
    ClaimedCredential, Credential, CredentialClaim, CredentialRepository, CredentialStatus,
};
use crate::ledger::CreditLedger;
use crate::metadata::{ContentAddress, MetadataPublisher, PublishError};
use crate::signer::{RelayerKey, SignerCache, SignerError};

/// What happened to one QUEUED credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Broadcast accepted (or an earlier version found mined); now PENDING.
    Submitted(TxHash),
    /// Retries ran out after a broadcast that may have landed; now PENDING
    /// so the watcher decides.
    Parked(TxHash),
    /// FAILED and refunded.
    Failed,
    /// Left QUEUED for a later pass.
    Skipped(&'static str),
}

pub struct Relayer {
    owner: String,
    credentials: CredentialRepository,
    ledger: CreditLedger,
    publisher: Arc<dyn MetadataPublisher>,
    signers: Arc<SignerCache>,
    submitter: Submitter,
    config: RelayerConfig,
}

impl Relayer {
    pub fn new(
        credentials: CredentialRepository,
        ledger: CreditLedger,
        publisher: Arc<dyn MetadataPublisher>,
        signers: Arc<SignerCache>,
        chain: Arc<dyn ChainClient>,
        chain_config: ChainConfig,
        config: RelayerConfig,
    ) -> Self {
        let submitter = Submitter::new(
            chain,
            chain_config,
            config.call_timeout,
            config.gas_bump_percent,
        );
        Self {
            owner: format!("relayer-{}", Uuid::new_v4()),
            credentials,
            ledger,
            publisher,
            signers,
            submitter,
            config,
        }
    }

    /// Shares nonce selection with other relayers using the same key.
    pub fn with_nonce_lane(mut self, lane: NonceLane) -> Self {
        self.submitter = self.submitter.with_lane(lane);
        self
    }

    /// Claim owner recorded on rows this relayer holds.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &RelayerConfig {
        &self.config
    }

    /// Advances one claimed QUEUED credential.
    pub async fn process(
        &self,
        claimed: ClaimedCredential,
        report: &mut PassReport,
    ) -> Result<RelayOutcome, PipelineError> {
        let ClaimedCredential {
            mut claim,
            mut credential,
        } = claimed;
        let id = credential.id;

        if let Err(e) = claim.renew(self.config.claim_lease) {
            warn!(credential = %id, error = %e, "claim expired before processing");
            return Ok(RelayOutcome::Skipped("claim lost"));
        }

        let content = match credential.content_address.clone() {
            Some(content) => content,
            None => match self.publish(&credential).await {
                Ok(address) => {
                    credential = self.credentials.record_publication(&id, &address)?;
                    info!(credential = %id, content_address = %address, "metadata published");
                    credential.content_address.clone().unwrap_or(address)
                }
                Err(e) => {
                    warn!(credential = %id, error = %e, "metadata publish failed; retrying next pass");
                    return Ok(RelayOutcome::Skipped("metadata publisher unavailable"));
                }
            },
        };

        let signer = match self.signer().await {
            Ok(signer) => signer,
            Err(e) => {
                warn!(credential = %id, error = %e, "relayer signer unavailable; retrying next pass");
                return Ok(RelayOutcome::Skipped("signer unavailable"));
            }
        };

        if let Some(submission) = &credential.submission {
            match self.submitter.find_receipt(&submission.all_hashes()).await {
                Ok(Some(receipt)) => {
                    self.credentials.mark_submitted(&id, receipt.tx_hash)?;
                    info!(
                        credential = %id,
                        tx_hash = %receipt.tx_hash,
                        "earlier submission already mined"
                    );
                    return Ok(RelayOutcome::Submitted(receipt.tx_hash));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(credential = %id, error = %e, "receipt lookup failed; retrying next pass");
                    return Ok(RelayOutcome::Skipped("chain unavailable"));
                }
            }
        }

        self.submit_with_retries(&mut claim, credential, &content, &signer, report)
            .await
    }

    async fn publish(&self, credential: &Credential) -> Result<ContentAddress, PublishError> {
        let limit = self.config.call_timeout;
        with_timeout(limit, self.publisher.publish(&credential.metadata_payload), || {
            PublishError::Unavailable(format!("publish timed out after {}ms", limit.as_millis()))
        })
        .await
    }

    async fn signer(&self) -> Result<Arc<RelayerKey>, SignerError> {
        let name = self.config.relayer_key_name.as_str();
        with_timeout(self.config.call_timeout, self.signers.get(name), || {
            SignerError::unavailable(name, "key service timed out")
        })
        .await
    }

    async fn submit_with_retries(
        &self,
        claim: &mut CredentialClaim,
        mut credential: Credential,
        content: &ContentAddress,
        signer: &RelayerKey,
        report: &mut PassReport,
    ) -> Result<RelayOutcome, PipelineError> {
        let id = credential.id;
        let mut attempts = credential.attempts;
        // A checkpoint left by an interrupted pass is rebroadcast unchanged
        // first; it may already sit in a mempool.
        let mut rebroadcast = credential.submission.is_some();
        let mut choice = NonceChoice::Replace;
        let mut last_error: Option<ChainError> = None;

        while attempts < self.config.max_attempts {
            let lane = self.submitter.lane().enter().await;
            let mut sign_error = None;
            if !rebroadcast || credential.submission.is_none() {
                match self
                    .submitter
                    .sign_version(&credential, content, signer, choice)
                    .await
                {
                    Ok(signed) => {
                        credential = self.credentials.record_signed(&id, &signed)?;
                        debug!(
                            credential = %id,
                            tx_hash = %signed.tx_hash,
                            nonce = signed.nonce,
                            gas_price_wei = %signed.gas_price_wei,
                            "mint transaction signed"
                        );
                    }
                    Err(PrepareError::Signer(e)) => {
                        warn!(credential = %id, error = %e, "signing failed; retrying next pass");
                        return Ok(RelayOutcome::Skipped("signing failed"));
                    }
                    Err(PrepareError::Chain(e)) if !e.is_transient() => {
                        // Nothing was broadcast, so there is no rejection to act on.
                        warn!(credential = %id, error = %e, "could not prepare transaction; retrying next pass");
                        return Ok(RelayOutcome::Skipped("chain unavailable"));
                    }
                    Err(PrepareError::Chain(e)) => sign_error = Some(e),
                }
            }
            rebroadcast = false;

            let broadcasted = sign_error.is_none();
            let result = match (sign_error, credential.submission.as_ref()) {
                (Some(e), _) => Err(e),
                (None, Some(submission)) => self
                    .submitter
                    .broadcast(submission)
                    .await
                    .map(|_| submission.tx_hash),
                (None, None) => Err(ChainError::permanent("no signed transaction to broadcast")),
            };

            let e = match result {
                Ok(tx_hash) => {
                    self.credentials.mark_submitted(&id, tx_hash)?;
                    info!(credential = %id, %tx_hash, attempts, "mint transaction submitted");
                    return Ok(RelayOutcome::Submitted(tx_hash));
                }
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    warn!(credential = %id, error = %e, "mint transaction rejected permanently");
                    last_error = Some(e);
                    break;
                }
            };

            attempts += 1;
            report.retries += 1;
            credential = self.credentials.record_attempt(
                &id,
                attempts,
                &e.to_string(),
                broadcasted && e.is_ambiguous(),
            )?;
            warn!(
                credential = %id,
                attempt = attempts,
                max_attempts = self.config.max_attempts,
                error = %e,
                "submission attempt failed"
            );

            choice = NonceChoice::Replace;
            if e.is_nonce_conflict() {
                if let Some(submission) = &credential.submission {
                    match self.submitter.find_receipt(&submission.all_hashes()).await {
                        Ok(Some(receipt)) => {
                            self.credentials.mark_submitted(&id, receipt.tx_hash)?;
                            info!(
                                credential = %id,
                                tx_hash = %receipt.tx_hash,
                                "nonce consumed by our own earlier version"
                            );
                            return Ok(RelayOutcome::Submitted(receipt.tx_hash));
                        }
                        Ok(None) => choice = NonceChoice::Fresh,
                        Err(lookup) => {
                            debug!(credential = %id, error = %lookup, "receipt lookup failed; keeping nonce")
                        }
                    }
                }
            }
            last_error = Some(e);
            drop(lane);

            if attempts >= self.config.max_attempts {
                break;
            }
            if let Err(e) = claim.renew(self.config.claim_lease) {
                warn!(credential = %id, error = %e, "lost claim during retries");
                return Ok(RelayOutcome::Skipped("claim lost"));
            }
            tokio::time::sleep(self.config.backoff_for(attempts - 1)).await;
        }

        self.give_up(credential, last_error)
    }

    fn give_up(
        &self,
        credential: Credential,
        last_error: Option<ChainError>,
    ) -> Result<RelayOutcome, PipelineError> {
        let id = credential.id;

        // Any broadcast without a definite answer may still be mined, so a
        // refund now could pay back a credential that gets minted anyway.
        if let Some(submission) = credential.submission.as_ref().filter(|s| s.ambiguous) {
            let tx_hash = submission.tx_hash;
            self.credentials.mark_submitted(&id, tx_hash)?;
            warn!(
                credential = %id,
                %tx_hash,
                attempts = credential.attempts,
                "giving up after an ambiguous broadcast; leaving finality to the watcher"
            );
            return Ok(RelayOutcome::Parked(tx_hash));
        }

        let reason = match (last_error, credential.last_error) {
            (Some(e), _) => e.to_string(),
            (None, Some(stored)) => stored,
            (None, None) => format!("{} submission attempts exhausted", credential.attempts),
        };
        fail_and_refund(&self.credentials, &self.ledger, &id, &reason)?;
        Ok(RelayOutcome::Failed)
    }
}

#[async_trait]
impl PeriodicTask for Relayer {
    fn name(&self) -> &'static str {
        "relayer"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> PassReport {
        let mut report = PassReport::default();
        let batch = match self.credentials.claim_batch(
            CredentialStatus::Queued,
            &self.owner,
            self.config.claim_lease,
            self.config.batch_size,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "failed to claim queued credentials");
                report.errors += 1;
                return report;
            }
        };
        report.claimed = batch.len();

        for claimed in batch {
            let id = claimed.credential.id;
            match self.process(claimed, &mut report).await {
                Ok(RelayOutcome::Submitted(_)) => report.submitted += 1,
                Ok(RelayOutcome::Parked(_)) => report.parked += 1,
                Ok(RelayOutcome::Failed) => {
                    report.failed += 1;
                    report.refunded += 1;
                }
                Ok(RelayOutcome::Skipped(reason)) => {
                    debug!(credential = %id, reason, "credential skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(credential = %id, error = %e, "relayer failed to process credential");
                    report.errors += 1;
                }
            }
        }
        report
    }
}
