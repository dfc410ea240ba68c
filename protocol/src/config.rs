//! # Pipeline Configuration & Constants
//!
//! Every tunable of the issuance pipeline lives here, either as a default
//! constant or as a field of one of the config structs below. The node binary
//! fills these structs from CLI flags and `CREDMINT_*` environment variables;
//! tests build them with struct-update syntax over `Default`.
//!
//! Nothing in this module reads the environment by itself. Configuration is
//! resolved once at startup and passed down explicitly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use credmint_contracts::{Address, MintAbi};

use crate::ledger::Credits;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// How often the relayer scans for QUEUED credentials. Submission latency is
/// what the issuer feels, so this one runs hot.
pub const DEFAULT_RELAYER_INTERVAL: Duration = Duration::from_secs(5);

/// How often the watcher polls receipts. Finality takes minutes; polling
/// every block would only burn RPC quota.
pub const DEFAULT_WATCHER_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum credentials handled per pass, per task.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// How long a claimed credential row stays exclusively ours. Must exceed the
/// worst-case retry sequence of a single credential.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Chain policy
// ---------------------------------------------------------------------------

/// Blocks that must be mined on top of a receipt before we call it final.
pub const DEFAULT_MIN_CONFIRMATIONS: u64 = 12;

/// Gas price increase applied to each resubmission, in percent. Most nodes
/// refuse a same-nonce replacement below +10%.
pub const DEFAULT_GAS_BUMP_PERCENT: u64 = 10;

/// Submission attempts before a credential is failed and refunded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// First retry delay inside a relayer pass. Doubles per attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Ceiling for the doubling retry delay.
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(8);

/// Timeout for every call to the signer, the publisher, or the chain node.
pub const DEFAULT_EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// A PENDING credential with no receipt after this long is escalated.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Gas limit for a mint call. Generous for an ERC-721 mint with a URI.
pub const DEFAULT_GAS_LIMIT: u64 = 300_000;

/// Lowest gas price we will ever offer, in wei (1 gwei).
pub const DEFAULT_GAS_PRICE_FLOOR_WEI: u128 = 1_000_000_000;

/// Local development chain id (Hardhat / Anvil).
pub const DEFAULT_CHAIN_ID: u64 = 31_337;

// ---------------------------------------------------------------------------
// Credits & keys
// ---------------------------------------------------------------------------

/// Credits charged per mint, in minor units (1.00).
pub const DEFAULT_MINT_COST_MINOR: i64 = 100;

/// Name of the managed key the relayer signs with.
pub const DEFAULT_RELAYER_KEY_NAME: &str = "relayer";

/// How long a fetched signer stays in the in-process cache.
pub const DEFAULT_SIGNER_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// URI scheme prepended to content addresses in mint calldata.
pub const METADATA_URI_SCHEME: &str = "ipfs://";

// ---------------------------------------------------------------------------
// Escalation policy
// ---------------------------------------------------------------------------

/// What the watcher does with a credential stuck in PENDING past
/// [`WatcherConfig::pending_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscalationPolicy {
    /// Record the escalation and leave the row for an operator.
    #[default]
    Flag,
    /// Re-sign with the same nonce and a bumped gas price, broadcast as a
    /// replacement.
    Resubmit,
    /// Fail and refund, but only once the relayer's confirmed nonce has
    /// moved past ours, proving the transaction can no longer land.
    /// Otherwise behaves like [`EscalationPolicy::Flag`].
    FailIfDropped,
}

impl fmt::Display for EscalationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationPolicy::Flag => write!(f, "flag"),
            EscalationPolicy::Resubmit => write!(f, "resubmit"),
            EscalationPolicy::FailIfDropped => write!(f, "fail-if-dropped"),
        }
    }
}

impl FromStr for EscalationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flag" => Ok(EscalationPolicy::Flag),
            "resubmit" => Ok(EscalationPolicy::Resubmit),
            "fail-if-dropped" | "fail_if_dropped" => Ok(EscalationPolicy::FailIfDropped),
            other => Err(format!(
                "unknown escalation policy '{other}' (expected flag, resubmit, fail-if-dropped)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// Where and how mint transactions are built.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// EIP-155 chain id signed into every transaction.
    pub chain_id: u64,
    /// Address of the credential registry contract.
    pub registry_address: Address,
    /// Gas limit for the mint call.
    pub gas_limit: u64,
    /// Minimum gas price offered, in wei. The node's suggestion wins when
    /// it is higher.
    pub gas_price_floor_wei: u128,
    /// Mint function and event signatures of the deployed registry.
    pub mint_abi: MintAbi,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            registry_address: Address::ZERO,
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_price_floor_wei: DEFAULT_GAS_PRICE_FLOOR_WEI,
            mint_abi: MintAbi::default(),
        }
    }
}

/// Relayer worker tunables.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Credentials claimed per pass.
    pub batch_size: usize,
    /// Submission attempts per credential before failing it.
    pub max_attempts: u32,
    /// Gas price bump per retry, in percent.
    pub gas_bump_percent: u64,
    /// First retry delay; doubles per attempt up to `max_retry_backoff`.
    pub retry_backoff: Duration,
    /// Retry delay ceiling.
    pub max_retry_backoff: Duration,
    /// Timeout for each external call.
    pub call_timeout: Duration,
    /// Lease on a claimed credential row.
    pub claim_lease: Duration,
    /// Managed key used to sign mint transactions.
    pub relayer_key_name: String,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RELAYER_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            gas_bump_percent: DEFAULT_GAS_BUMP_PERCENT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            call_timeout: DEFAULT_EXTERNAL_CALL_TIMEOUT,
            claim_lease: DEFAULT_CLAIM_LEASE,
            relayer_key_name: DEFAULT_RELAYER_KEY_NAME.to_string(),
        }
    }
}

impl RelayerConfig {
    /// Delay before retry number `attempt` (0-based), with doubling and cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_retry_backoff)
            .min(self.max_retry_backoff)
    }
}

/// Confirmation watcher tunables.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Credentials claimed per pass.
    pub batch_size: usize,
    /// Confirmation depth required for finality.
    pub min_confirmations: u64,
    /// PENDING age without a receipt that triggers escalation.
    pub pending_timeout: Duration,
    /// What escalation does.
    pub escalation: EscalationPolicy,
    /// Gas bump for escalation resubmissions, in percent.
    pub gas_bump_percent: u64,
    /// Timeout for each external call.
    pub call_timeout: Duration,
    /// Lease on a claimed credential row.
    pub claim_lease: Duration,
    /// Managed key used when escalation resubmits.
    pub relayer_key_name: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_WATCHER_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            escalation: EscalationPolicy::default(),
            gas_bump_percent: DEFAULT_GAS_BUMP_PERCENT,
            call_timeout: DEFAULT_EXTERNAL_CALL_TIMEOUT,
            claim_lease: DEFAULT_CLAIM_LEASE,
            relayer_key_name: DEFAULT_RELAYER_KEY_NAME.to_string(),
        }
    }
}

/// Everything the pipeline needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Credits charged per mint.
    pub mint_cost: Credits,
    pub chain: ChainConfig,
    pub relayer: RelayerConfig,
    pub watcher: WatcherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mint_cost: Credits::from_minor(DEFAULT_MINT_COST_MINOR),
            chain: ChainConfig::default(),
            relayer: RelayerConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_polls_slower_than_relayer() {
        assert!(DEFAULT_RELAYER_INTERVAL < DEFAULT_WATCHER_INTERVAL);
    }

    #[test]
    fn claim_lease_covers_worst_case_retries() {
        let cfg = RelayerConfig::default();
        let worst: Duration = (0..cfg.max_attempts)
            .map(|a| cfg.backoff_for(a) + cfg.call_timeout * 3)
            .sum();
        assert!(cfg.claim_lease > worst, "lease {:?} < retries {:?}", cfg.claim_lease, worst);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RelayerConfig::default();
        assert_eq!(cfg.backoff_for(0), Duration::from_millis(500));
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(cfg.backoff_for(3), Duration::from_secs(4));
        assert_eq!(cfg.backoff_for(10), DEFAULT_MAX_RETRY_BACKOFF);
        assert_eq!(cfg.backoff_for(u32::MAX), DEFAULT_MAX_RETRY_BACKOFF);
    }

    #[test]
    fn escalation_policy_parses_both_spellings() {
        assert_eq!("flag".parse(), Ok(EscalationPolicy::Flag));
        assert_eq!("RESUBMIT".parse(), Ok(EscalationPolicy::Resubmit));
        assert_eq!("fail-if-dropped".parse(), Ok(EscalationPolicy::FailIfDropped));
        assert_eq!("fail_if_dropped".parse(), Ok(EscalationPolicy::FailIfDropped));
        assert!("refund".parse::<EscalationPolicy>().is_err());
    }

    #[test]
    fn escalation_policy_display_roundtrips() {
        for p in [
            EscalationPolicy::Flag,
            EscalationPolicy::Resubmit,
            EscalationPolicy::FailIfDropped,
        ] {
            assert_eq!(p.to_string().parse::<EscalationPolicy>(), Ok(p));
        }
    }

    #[test]
    fn default_mint_cost_is_one_credit() {
        assert_eq!(PipelineConfig::default().mint_cost.to_string(), "1.00");
    }
}
