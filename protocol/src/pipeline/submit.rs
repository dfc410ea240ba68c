//! Building, signing and locating mint transactions.
//!
//! Shared by the relayer (first submission and retries) and the watcher
//! (escalation replacements). Gas pricing rule for a signed version:
//!
//! ```text
//! price = max(configured floor, node suggestion)
//! same nonce as a previous version: price = max(price, previous * (1 + bump%))
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use credmint_contracts::Address;
use primitive_types::U256;
use tokio::sync::{Mutex, MutexGuard};

use super::{chain_timeout, with_timeout};
use crate::chain::{bump_gas_price, ChainClient, ChainError, Receipt, TxHash, UnsignedTx};
use crate::config::ChainConfig;
use crate::credential::{Credential, SignedSubmission};
use crate::metadata::ContentAddress;
use crate::signer::{RelayerKey, SignerError};

/// Why a new version could not be signed.
#[derive(Debug)]
pub enum PrepareError {
    Chain(ChainError),
    Signer(SignerError),
}

impl From<ChainError> for PrepareError {
    fn from(e: ChainError) -> Self {
        PrepareError::Chain(e)
    }
}

impl From<SignerError> for PrepareError {
    fn from(e: SignerError) -> Self {
        PrepareError::Signer(e)
    }
}

/// Which nonce the next signed version uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceChoice {
    /// Reuse the previous version's nonce, replacing it.
    Replace,
    /// Ask the node for the sender's pending nonce.
    Fresh,
}

/// Builds the unsigned mint call for `credential`.
pub fn mint_transaction(
    config: &ChainConfig,
    credential: &Credential,
    content: &ContentAddress,
    nonce: u64,
    gas_price: u128,
) -> UnsignedTx {
    UnsignedTx {
        nonce,
        gas_price,
        gas_limit: config.gas_limit,
        to: config.registry_address,
        value: U256::zero(),
        data: config
            .mint_abi
            .encode_mint(&credential.recipient_address, &content.uri()),
        chain_id: config.chain_id,
    }
}

/// Serializes nonce selection and broadcast for one relayer key within the
/// process. Two workers holding the same lane never pick the same pending
/// nonce for different credentials.
#[derive(Debug, Clone, Default)]
pub struct NonceLane(Arc<Mutex<()>>);

impl NonceLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enter(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Chain-facing half of the pipeline: signs versions, broadcasts them and
/// looks for their receipts, every call bounded by `call_timeout`.
#[derive(Clone)]
pub struct Submitter {
    chain: Arc<dyn ChainClient>,
    config: ChainConfig,
    call_timeout: Duration,
    gas_bump_percent: u64,
    lane: NonceLane,
}

impl Submitter {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        config: ChainConfig,
        call_timeout: Duration,
        gas_bump_percent: u64,
    ) -> Self {
        Self {
            chain,
            config,
            call_timeout,
            gas_bump_percent,
            lane: NonceLane::new(),
        }
    }

    /// Shares `lane` with other submitters signing for the same key.
    pub fn with_lane(mut self, lane: NonceLane) -> Self {
        self.lane = lane;
        self
    }

    pub fn lane(&self) -> &NonceLane {
        &self.lane
    }

    pub fn chain(&self) -> &dyn ChainClient {
        self.chain.as_ref()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Signs the next version of the credential's mint transaction.
    ///
    /// A previous version is only replaced when it was signed by the same
    /// key; after a key rotation the old nonce belongs to another account.
    pub async fn sign_version(
        &self,
        credential: &Credential,
        content: &ContentAddress,
        signer: &RelayerKey,
        choice: NonceChoice,
    ) -> Result<SignedSubmission, PrepareError> {
        let suggested = with_timeout(
            self.call_timeout,
            self.chain.gas_price(),
            chain_timeout("eth_gasPrice", self.call_timeout),
        )
        .await?;
        let mut gas_price = suggested.max(self.config.gas_price_floor_wei);

        let replaceable = credential
            .submission
            .as_ref()
            .filter(|previous| previous.sender == signer.address());

        let nonce = match (choice, replaceable) {
            (NonceChoice::Replace, Some(previous)) => {
                gas_price =
                    gas_price.max(bump_gas_price(previous.gas_price_wei, self.gas_bump_percent));
                previous.nonce
            }
            _ => self.pending_nonce(signer).await?,
        };

        let tx = mint_transaction(&self.config, credential, content, nonce, gas_price);
        let signed = signer.sign_transaction(tx)?;

        Ok(SignedSubmission {
            sender: signer.address(),
            nonce,
            gas_price_wei: gas_price,
            raw_tx: signed.raw,
            tx_hash: signed.hash,
            previous_hashes: credential
                .submission
                .as_ref()
                .map(SignedSubmission::lineage)
                .unwrap_or_default(),
            ambiguous: false,
            signed_at: Utc::now(),
        })
    }

    async fn pending_nonce(&self, signer: &RelayerKey) -> Result<u64, ChainError> {
        with_timeout(
            self.call_timeout,
            self.chain.pending_nonce(&signer.address()),
            chain_timeout("eth_getTransactionCount", self.call_timeout),
        )
        .await
    }

    /// Mined-only nonce of `sender`.
    pub async fn latest_nonce(&self, sender: &Address) -> Result<u64, ChainError> {
        with_timeout(
            self.call_timeout,
            self.chain.latest_nonce(sender),
            chain_timeout("eth_getTransactionCount", self.call_timeout),
        )
        .await
    }

    /// Broadcasts a checkpointed version.
    pub async fn broadcast(&self, submission: &SignedSubmission) -> Result<TxHash, ChainError> {
        with_timeout(
            self.call_timeout,
            self.chain.submit_signed(&submission.raw_tx),
            chain_timeout("eth_sendRawTransaction", self.call_timeout),
        )
        .await
    }

    /// The first receipt found among `hashes`, in order.
    pub async fn find_receipt(&self, hashes: &[TxHash]) -> Result<Option<Receipt>, ChainError> {
        for hash in hashes {
            let receipt = with_timeout(
                self.call_timeout,
                self.chain.get_receipt(hash),
                chain_timeout("eth_getTransactionReceipt", self.call_timeout),
            )
            .await?;
            if receipt.is_some() {
                return Ok(receipt);
            }
        }
        Ok(None)
    }

    pub async fn block_height(&self) -> Result<u64, ChainError> {
        with_timeout(
            self.call_timeout,
            self.chain.block_height(),
            chain_timeout("eth_blockNumber", self.call_timeout),
        )
        .await
    }
}
