//! # Chain Client
//!
//! Everything the pipeline needs from an EVM chain, behind one capability
//! trait. The relayer and the watcher only ever see `dyn ChainClient`; the
//! backend is picked once at startup.
//!
//! ```text
//! rlp.rs         — recursive length prefix encoding
//! transaction.rs — legacy EIP-155 transactions: build, sign, hash
//! rpc.rs         — Ethereum JSON-RPC over HTTP (reqwest)
//! simulated.rs   — in-memory chain for devnets and tests
//! ```
//!
//! ## Error classification
//!
//! Every failure is either [`ChainError::Transient`] (retry later, maybe
//! with a higher gas price or a fresh nonce) or [`ChainError::Permanent`]
//! (the transaction will never be accepted as built). Transient failures
//! additionally carry a [`TransientKind`]; `Timeout` and `Network` are
//! *ambiguous*: the node may have accepted the transaction before the
//! connection went away.

pub mod rlp;
pub mod rpc;
pub mod simulated;
pub mod transaction;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use credmint_contracts::{keccak256, Address, Log};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rpc::JsonRpcChainClient;
pub use simulated::SimulatedChain;
pub use transaction::{bump_gas_price, SignedTx, UnsignedTx};

// ---------------------------------------------------------------------------
// TxHash
// ---------------------------------------------------------------------------

/// Keccak-256 hash of a signed transaction. Renders as 66-char `0x` hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash of raw signed transaction bytes.
    pub fn of_raw(raw: &[u8]) -> Self {
        Self(keccak256(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self)
    }
}

impl FromStr for TxHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("tx hash '{s}' must be 0x-prefixed"))?;
        let bytes = hex::decode(body).map_err(|e| format!("tx hash '{s}': {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("tx hash '{s}' must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// Execution outcome recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// A mined transaction's receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub status: ReceiptStatus,
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Blocks mined on top of the receipt's block at `height`.
    pub fn confirmations(&self, height: u64) -> u64 {
        height.saturating_sub(self.block_number)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Flavours of retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The call timed out. The node may have acted on it.
    Timeout,
    /// Connection failure mid-request. The node may have acted on it.
    Network,
    /// The nonce is already used (or too far ahead).
    NonceConflict,
    /// Gas price too low, including same-nonce replacement rules.
    Underpriced,
    /// The node is overloaded, syncing or rate limiting us.
    Unavailable,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransientKind::Timeout => "timeout",
            TransientKind::Network => "network",
            TransientKind::NonceConflict => "nonce conflict",
            TransientKind::Underpriced => "underpriced",
            TransientKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Errors from a chain backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("transient chain error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("permanent chain error: {0}")]
    Permanent(String),
}

impl ChainError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        ChainError::Transient {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ChainError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient { .. })
    }

    /// The node may have accepted the transaction despite the error.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ChainError::Transient {
                kind: TransientKind::Timeout | TransientKind::Network,
                ..
            }
        )
    }

    pub fn is_nonce_conflict(&self) -> bool {
        matches!(
            self,
            ChainError::Transient {
                kind: TransientKind::NonceConflict,
                ..
            }
        )
    }

    /// Classifies a node's error message for a rejected transaction.
    ///
    /// Node wording varies between geth, erigon, nethermind and hosted
    /// providers; these substrings cover the common ones. Anything unknown
    /// is treated as transient, so a surprise message costs a retry rather
    /// than a credential.
    pub fn classify_rpc_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let has = |needle: &str| lower.contains(needle);

        if has("nonce too low") || has("nonce too high") || has("invalid nonce") {
            return ChainError::transient(TransientKind::NonceConflict, message);
        }
        if has("underpriced") || has("fee too low") || has("max fee per gas less than") {
            return ChainError::transient(TransientKind::Underpriced, message);
        }
        if has("timeout") || has("timed out") {
            return ChainError::transient(TransientKind::Timeout, message);
        }
        if has("rate limit") || has("too many requests") || has("syncing") || has("busy") {
            return ChainError::transient(TransientKind::Unavailable, message);
        }
        if has("revert")
            || has("invalid")
            || has("malformed")
            || has("rlp")
            || has("insufficient funds")
            || has("gas limit")
            || has("intrinsic gas")
            || has("chain id")
        {
            return ChainError::permanent(message);
        }
        ChainError::transient(TransientKind::Unavailable, message)
    }
}

/// The node already holds this exact transaction.
pub fn is_already_known(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("already known") || lower.contains("known transaction")
}

// ---------------------------------------------------------------------------
// ChainClient
// ---------------------------------------------------------------------------

/// What the pipeline needs from a chain node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Next nonce for `address`, counting transactions still in the mempool.
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError>;

    /// Next nonce for `address` counting mined transactions only.
    async fn latest_nonce(&self, address: &Address) -> Result<u64, ChainError>;

    /// Broadcasts a signed raw transaction and returns its hash.
    async fn submit_signed(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError>;

    /// Receipt of a mined transaction, or `None` while it is not mined.
    async fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, ChainError>;

    /// Current block height.
    async fn block_height(&self) -> Result<u64, ChainError>;

    /// The node's gas price suggestion, in wei.
    async fn gas_price(&self) -> Result<u128, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_hash_renders_66_chars() {
        let hash = TxHash::of_raw(b"raw");
        let s = hash.to_string();
        assert_eq!(s.len(), 66);
        assert_eq!(s.parse::<TxHash>().unwrap(), hash);
    }

    #[test]
    fn tx_hash_parse_rejects_bad_input() {
        assert!("deadbeef".parse::<TxHash>().is_err());
        assert!("0x1234".parse::<TxHash>().is_err());
        assert!("0xzz".parse::<TxHash>().is_err());
    }

    #[test]
    fn classify_common_node_messages() {
        assert!(ChainError::classify_rpc_message("nonce too low").is_nonce_conflict());
        assert!(matches!(
            ChainError::classify_rpc_message("replacement transaction underpriced"),
            ChainError::Transient {
                kind: TransientKind::Underpriced,
                ..
            }
        ));
        assert!(matches!(
            ChainError::classify_rpc_message("execution reverted: not minter"),
            ChainError::Permanent(_)
        ));
        assert!(matches!(
            ChainError::classify_rpc_message("rlp: expected input list"),
            ChainError::Permanent(_)
        ));
        assert!(ChainError::classify_rpc_message("request timed out").is_ambiguous());
        assert!(ChainError::classify_rpc_message("something odd").is_transient());
    }

    #[test]
    fn only_timeouts_and_network_are_ambiguous() {
        assert!(ChainError::transient(TransientKind::Network, "reset").is_ambiguous());
        assert!(!ChainError::transient(TransientKind::Underpriced, "x").is_ambiguous());
        assert!(!ChainError::permanent("reverted").is_ambiguous());
    }

    #[test]
    fn already_known_detection() {
        assert!(is_already_known("already known"));
        assert!(is_already_known("Known transaction: 0xabc"));
        assert!(!is_already_known("nonce too low"));
    }

    #[test]
    fn confirmations_saturate() {
        let receipt = Receipt {
            tx_hash: TxHash::new([0; 32]),
            block_number: 10,
            status: ReceiptStatus::Success,
            logs: vec![],
        };
        assert_eq!(receipt.confirmations(22), 12);
        assert_eq!(receipt.confirmations(5), 0);
    }
}
