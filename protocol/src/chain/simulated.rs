//! # Simulated Chain
//!
//! An in-memory EVM stand-in implementing [`ChainClient`] for local devnets
//! and tests. It is strict where the pipeline's correctness depends on node
//! behaviour:
//!
//! - signatures are verified and the sender recovered from the raw bytes;
//! - nonces are enforced per sender (`nonce too low`), and transactions are
//!   mined strictly in nonce order;
//! - a same-nonce replacement must raise the gas price by at least 10%;
//! - resubmitting identical bytes is accepted as "already known";
//! - mint calls to the registry produce the registry's real mint event.
//!
//! Faults are injected explicitly: rejected or ambiguous submissions,
//! reverted mints, dropped mempool entries and foreign nonce consumption.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use credmint_contracts::abi;
use credmint_contracts::{Address, MintAbi};
use parking_lot::Mutex;
use primitive_types::U256;
use tokio::sync::watch;
use tracing::{debug, info};

use super::transaction::{bump_gas_price, SignedTx};
use super::{ChainClient, ChainError, Receipt, ReceiptStatus, TransientKind, TxHash};

/// Minimum gas price increase nodes demand for a same-nonce replacement.
const REPLACEMENT_BUMP_PERCENT: u64 = 10;

/// Gas price suggested by a fresh simulated chain (2 gwei).
const DEFAULT_SIMULATED_GAS_PRICE: u128 = 2_000_000_000;

/// An injected outcome for the next `submit_signed` call.
#[derive(Debug, Clone)]
pub enum SubmitFault {
    /// Reject the transaction with this error; nothing reaches the mempool.
    Reject(ChainError),
    /// Accept the transaction into the mempool, then report this error as
    /// if the response was lost.
    AcceptThenFail(ChainError),
}

#[derive(Debug, Clone)]
struct PendingTx {
    signed: SignedTx,
}

#[derive(Debug)]
struct SimState {
    height: u64,
    gas_price: u128,
    confirmed_nonces: HashMap<Address, u64>,
    mempool: BTreeMap<(Address, u64), PendingTx>,
    receipts: HashMap<TxHash, Receipt>,
    next_token_id: U256,
    submit_faults: VecDeque<SubmitFault>,
    reverts_pending: usize,
    submitted: u64,
    minted: u64,
}

/// In-memory chain. Share it behind an `Arc` between the pipeline and the
/// test driving it.
#[derive(Debug)]
pub struct SimulatedChain {
    chain_id: u64,
    registry: Address,
    mint_abi: MintAbi,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(chain_id: u64, registry: Address, mint_abi: MintAbi) -> Self {
        Self {
            chain_id,
            registry,
            mint_abi,
            state: Mutex::new(SimState {
                height: 0,
                gas_price: DEFAULT_SIMULATED_GAS_PRICE,
                confirmed_nonces: HashMap::new(),
                mempool: BTreeMap::new(),
                receipts: HashMap::new(),
                next_token_id: U256::one(),
                submit_faults: VecDeque::new(),
                reverts_pending: 0,
                submitted: 0,
                minted: 0,
            }),
        }
    }

    pub fn registry(&self) -> Address {
        self.registry
    }

    // -- Fault injection ----------------------------------------------------

    /// Queues an outcome for a future `submit_signed` call, in FIFO order.
    pub fn inject_submit_fault(&self, fault: SubmitFault) {
        self.state.lock().submit_faults.push_back(fault);
    }

    /// Makes the next mined mint revert.
    pub fn revert_next_mint(&self) {
        self.state.lock().reverts_pending += 1;
    }

    /// Evicts a transaction from the mempool, as a node under pressure
    /// would. Returns whether it was there.
    pub fn drop_pending(&self, hash: &TxHash) -> bool {
        let mut state = self.state.lock();
        let key = state
            .mempool
            .iter()
            .find(|(_, tx)| tx.signed.hash == *hash)
            .map(|(key, _)| *key);
        match key {
            Some(key) => state.mempool.remove(&key).is_some(),
            None => false,
        }
    }

    /// Consumes the sender's next nonce with a transaction we never see, as
    /// if the key were used elsewhere. Our queued transaction at that nonce
    /// becomes unmineable.
    pub fn advance_nonce(&self, sender: &Address) {
        let mut state = self.state.lock();
        let confirmed = state.confirmed_nonces.entry(*sender).or_insert(0);
        *confirmed += 1;
        let floor = *confirmed;
        state
            .mempool
            .retain(|(addr, nonce), _| addr != sender || *nonce >= floor);
    }

    pub fn set_gas_price(&self, wei: u128) {
        self.state.lock().gas_price = wei;
    }

    // -- Mining ---------------------------------------------------------------

    /// Mines one block containing every transaction that is next in line
    /// for its sender.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state.lock();
        state.height += 1;
        let height = state.height;

        let senders: Vec<Address> = {
            let mut senders: Vec<Address> = state.mempool.keys().map(|(addr, _)| *addr).collect();
            senders.dedup();
            senders
        };

        for sender in senders {
            loop {
                let next = state.confirmed_nonces.get(&sender).copied().unwrap_or(0);
                let Some(tx) = state.mempool.remove(&(sender, next)) else {
                    break;
                };
                state.confirmed_nonces.insert(sender, next + 1);
                let receipt = self.execute(&mut state, &tx, height);
                debug!(hash = %receipt.tx_hash, height, status = ?receipt.status, "simulated tx mined");
                state.receipts.insert(receipt.tx_hash, receipt);
            }
        }
        height
    }

    /// Mines `n` blocks.
    pub fn mine_blocks(&self, n: u64) -> u64 {
        let mut height = 0;
        for _ in 0..n {
            height = self.mine_block();
        }
        height
    }

    fn execute(&self, state: &mut SimState, tx: &PendingTx, height: u64) -> Receipt {
        let data = &tx.signed.tx.data;
        let is_mint = tx.signed.tx.to == self.registry
            && data.len() >= 4
            && data[..4] == self.mint_abi.selector();

        let call = if is_mint {
            let args = &data[4..];
            abi::word_at(args, 0)
                .map(|w| Address::from_word(&w))
                .zip(abi::decode_string(args, 1))
        } else {
            None
        };

        let reverted = match call {
            Some(_) if state.reverts_pending > 0 => {
                state.reverts_pending -= 1;
                true
            }
            Some(_) => false,
            None => true,
        };

        let logs = match (reverted, call) {
            (false, Some((recipient, uri))) => {
                let token_id = state.next_token_id;
                state.next_token_id = token_id + U256::one();
                state.minted += 1;
                vec![self.mint_abi.minted_log(self.registry, token_id, recipient, &uri)]
            }
            _ => Vec::new(),
        };

        Receipt {
            tx_hash: tx.signed.hash,
            block_number: height,
            status: if reverted {
                ReceiptStatus::Reverted
            } else {
                ReceiptStatus::Success
            },
            logs,
        }
    }

    /// Mines a block every `interval` until shutdown. Used by the devnet.
    pub async fn run_miner(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "simulated miner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.mine_block();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("simulated miner stopped");
    }

    // -- Inspection -----------------------------------------------------------

    /// Successful `submit_signed` calls that put a transaction in the mempool.
    pub fn submitted_count(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Tokens minted so far.
    pub fn minted_count(&self) -> u64 {
        self.state.lock().minted
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().mempool.len()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Whether a transaction with this hash sits in the mempool.
    pub fn is_pending(&self, hash: &TxHash) -> bool {
        self.state
            .lock()
            .mempool
            .values()
            .any(|tx| tx.signed.hash == *hash)
    }

    fn accept(&self, raw: &[u8]) -> Result<TxHash, ChainError> {
        let signed = SignedTx::decode(raw, self.chain_id)
            .map_err(|e| ChainError::permanent(format!("invalid transaction: {e}")))?;
        let sender = signed
            .recover_sender()
            .map_err(|e| ChainError::permanent(format!("invalid sender: {e}")))?;
        let hash = signed.hash;
        let nonce = signed.tx.nonce;

        let mut state = self.state.lock();
        if state.receipts.contains_key(&hash) {
            return Ok(hash);
        }
        let confirmed = state.confirmed_nonces.get(&sender).copied().unwrap_or(0);
        if nonce < confirmed {
            return Err(ChainError::transient(
                TransientKind::NonceConflict,
                format!("nonce too low: next nonce {confirmed}, tx nonce {nonce}"),
            ));
        }
        if signed.tx.gas_price < state.gas_price {
            return Err(ChainError::transient(
                TransientKind::Underpriced,
                format!(
                    "transaction underpriced: {} < {}",
                    signed.tx.gas_price, state.gas_price
                ),
            ));
        }
        if let Some(existing) = state.mempool.get(&(sender, nonce)) {
            if existing.signed.hash == hash {
                return Ok(hash);
            }
            let required = bump_gas_price(existing.signed.tx.gas_price, REPLACEMENT_BUMP_PERCENT);
            if signed.tx.gas_price < required {
                return Err(ChainError::transient(
                    TransientKind::Underpriced,
                    "replacement transaction underpriced",
                ));
            }
        }

        state
            .mempool
            .insert((sender, nonce), PendingTx { signed });
        state.submitted += 1;
        Ok(hash)
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        let state = self.state.lock();
        let mut next = state.confirmed_nonces.get(address).copied().unwrap_or(0);
        while state.mempool.contains_key(&(*address, next)) {
            next += 1;
        }
        Ok(next)
    }

    async fn latest_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        Ok(self
            .state
            .lock()
            .confirmed_nonces
            .get(address)
            .copied()
            .unwrap_or(0))
    }

    async fn submit_signed(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError> {
        let fault = self.state.lock().submit_faults.pop_front();
        match fault {
            Some(SubmitFault::Reject(error)) => Err(error),
            Some(SubmitFault::AcceptThenFail(error)) => {
                self.accept(raw_tx)?;
                Err(error)
            }
            None => self.accept(raw_tx),
        }
    }

    async fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        Ok(self.state.lock().receipts.get(hash).cloned())
    }

    async fn block_height(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().height)
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.state.lock().gas_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::transaction::{address_of, UnsignedTx};
    use k256::ecdsa::SigningKey;

    const CHAIN_ID: u64 = 31_337;

    fn registry() -> Address {
        "0x00000000000000000000000000000000000000c0".parse().unwrap()
    }

    fn chain() -> SimulatedChain {
        SimulatedChain::new(CHAIN_ID, registry(), MintAbi::default())
    }

    fn key() -> SigningKey {
        SigningKey::from_slice(&[0x42; 32]).unwrap()
    }

    fn mint(nonce: u64, gas_price: u128) -> SignedTx {
        let recipient: Address = "0x00000000000000000000000000000000000000d0".parse().unwrap();
        let tx = UnsignedTx {
            nonce,
            gas_price,
            gas_limit: 300_000,
            to: registry(),
            value: U256::zero(),
            data: MintAbi::default().encode_mint(&recipient, "ipfs://QmX"),
            chain_id: CHAIN_ID,
        };
        let (sig, recid) = key().sign_prehash_recoverable(&tx.signing_hash()).unwrap();
        tx.into_signed(&sig, recid)
    }

    const GWEI2: u128 = DEFAULT_SIMULATED_GAS_PRICE;

    #[tokio::test]
    async fn mint_is_mined_with_event() {
        let chain = chain();
        let tx = mint(0, GWEI2);
        let hash = chain.submit_signed(&tx.raw).await.unwrap();
        assert_eq!(hash, tx.hash);
        assert!(chain.get_receipt(&hash).await.unwrap().is_none());

        chain.mine_block();
        let receipt = chain.get_receipt(&hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        let event = MintAbi::default().decode_minted(&registry(), &receipt.logs).unwrap();
        assert_eq!(event.token_id, U256::one());
    }

    #[tokio::test]
    async fn identical_resubmission_is_already_known() {
        let chain = chain();
        let tx = mint(0, GWEI2);
        chain.submit_signed(&tx.raw).await.unwrap();
        assert_eq!(chain.submit_signed(&tx.raw).await.unwrap(), tx.hash);
        assert_eq!(chain.submitted_count(), 1);

        chain.mine_block();
        assert_eq!(chain.submit_signed(&tx.raw).await.unwrap(), tx.hash);
    }

    #[tokio::test]
    async fn stale_nonce_rejected() {
        let chain = chain();
        chain.submit_signed(&mint(0, GWEI2).raw).await.unwrap();
        chain.mine_block();
        let err = chain.submit_signed(&mint(0, GWEI2 * 2).raw).await.unwrap_err();
        assert!(err.is_nonce_conflict());
    }

    #[tokio::test]
    async fn replacement_needs_price_bump() {
        let chain = chain();
        chain.submit_signed(&mint(0, GWEI2).raw).await.unwrap();

        let cheap = mint(0, GWEI2 + 1);
        let err = chain.submit_signed(&cheap.raw).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transient {
                kind: TransientKind::Underpriced,
                ..
            }
        ));

        let bumped = mint(0, bump_gas_price(GWEI2, 10));
        chain.submit_signed(&bumped.raw).await.unwrap();
        chain.mine_block();
        assert!(chain.get_receipt(&bumped.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nonces_track_mempool_and_chain() {
        let chain = chain();
        let sender = address_of(key().verifying_key());
        chain.submit_signed(&mint(0, GWEI2).raw).await.unwrap();
        chain.submit_signed(&mint(1, GWEI2).raw).await.unwrap();

        assert_eq!(chain.pending_nonce(&sender).await.unwrap(), 2);
        assert_eq!(chain.latest_nonce(&sender).await.unwrap(), 0);
        chain.mine_block();
        assert_eq!(chain.latest_nonce(&sender).await.unwrap(), 2);
        assert_eq!(chain.minted_count(), 2);
    }

    #[tokio::test]
    async fn reverted_mint_has_no_event() {
        let chain = chain();
        chain.revert_next_mint();
        let tx = mint(0, GWEI2);
        chain.submit_signed(&tx.raw).await.unwrap();
        chain.mine_block();
        let receipt = chain.get_receipt(&tx.hash).await.unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert!(receipt.logs.is_empty());
    }

    #[tokio::test]
    async fn accept_then_fail_still_lands() {
        let chain = chain();
        chain.inject_submit_fault(SubmitFault::AcceptThenFail(ChainError::transient(
            TransientKind::Timeout,
            "deadline exceeded",
        )));
        let tx = mint(0, GWEI2);
        let err = chain.submit_signed(&tx.raw).await.unwrap_err();
        assert!(err.is_ambiguous());
        assert!(chain.is_pending(&tx.hash));
    }

    #[tokio::test]
    async fn advance_nonce_strands_queued_tx() {
        let chain = chain();
        let sender = address_of(key().verifying_key());
        let tx = mint(0, GWEI2);
        chain.submit_signed(&tx.raw).await.unwrap();
        chain.advance_nonce(&sender);
        chain.mine_block();
        assert!(chain.get_receipt(&tx.hash).await.unwrap().is_none());
        assert_eq!(chain.latest_nonce(&sender).await.unwrap(), 1);
        assert_eq!(chain.mempool_len(), 0);
    }

    #[tokio::test]
    async fn garbage_is_permanent() {
        let chain = chain();
        let err = chain.submit_signed(&[0xde, 0xad]).await.unwrap_err();
        assert!(matches!(err, ChainError::Permanent(_)));
    }
}
