//! # CLI Interface
//!
//! Command-line structure for `credmint-node`, built with `clap` derive.
//! Every tunable also reads a `CREDMINT_*` environment variable, so a
//! container can be configured without flags.
//!
//! | Command   | Needs the database | Talks to a running node |
//! |-----------|--------------------|-------------------------|
//! | `run`     | exclusive          | -                       |
//! | `init`    | no                 | no                      |
//! | `account` | exclusive          | no                      |
//! | `issue`   | exclusive          | no                      |
//! | `status`  | no                 | yes                     |
//!
//! sled holds a process-wide lock on the database, so `account` and
//! `issue` only work while the node is stopped.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use credmint_contracts::registry::{DEFAULT_MINT_EVENT, DEFAULT_MINT_FUNCTION};
use credmint_protocol::config::{
    self, ChainConfig, EscalationPolicy, PipelineConfig, RelayerConfig, WatcherConfig,
};
use credmint_protocol::ledger::Credits;

use crate::logging::{LogFormat, DEFAULT_FILTER};

/// CredMint issuance node.
///
/// Runs the relayer and the confirmation watcher against a credit ledger
/// stored in the data directory, and serves health, status and metrics
/// over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "credmint-node",
    about = "CredMint credential issuance node",
    version,
    propagate_version = true
)]
pub struct CredMintCli {
    /// Log output format.
    #[arg(long, global = true, env = "CREDMINT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Tracing filter directives; `RUST_LOG` overrides this when set.
    #[arg(long, global = true, env = "CREDMINT_LOG", default_value = DEFAULT_FILTER)]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relayer, the watcher and the HTTP endpoints.
    Run(Box<RunArgs>),
    /// Create the data directory and generate a relayer key.
    Init(InitArgs),
    /// Credit account administration (node must be stopped).
    #[command(subcommand)]
    Account(AccountCommand),
    /// Queue a credential for minting (node must be stopped).
    Issue(IssueArgs),
    /// Query the status endpoint of a running node.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

// ---------------------------------------------------------------------------
// Shared arguments
// ---------------------------------------------------------------------------

/// Location of the node's database and key files.
#[derive(Args, Debug, Clone)]
pub struct DataDirArgs {
    /// Node data directory. Holds `db/` and `keys/`.
    #[arg(long, short = 'd', env = "CREDMINT_DATA_DIR", default_value = "./credmint-data")]
    pub data_dir: PathBuf,
}

impl DataDirArgs {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }
}

/// Credits charged per mint, in display units.
#[derive(Args, Debug, Clone)]
pub struct MintCostArgs {
    /// Credits charged per mint, e.g. `1.00`.
    #[arg(long, env = "CREDMINT_MINT_COST", default_value = "1.00")]
    pub mint_cost: Credits,
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Chain client implementation.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBackend {
    /// Ethereum JSON-RPC over HTTP.
    Rpc,
    /// In-process chain that mines on a timer. For local runs and demos.
    Simulated,
}

/// Metadata publisher implementation.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherBackend {
    /// HTTP pinning service.
    Http,
    /// In-process store. Content is lost on restart.
    Memory,
}

/// Where relayer keys are read from.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// `<data-dir>/keys/<name>.key`, as written by `init`.
    File,
    /// `CREDMINT_KEY_<NAME>` hex secret.
    Env,
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    #[command(flatten)]
    pub cost: MintCostArgs,

    /// Port for `/health`, `/status` and `/metrics`.
    #[arg(long, env = "CREDMINT_API_PORT", default_value_t = 9750)]
    pub api_port: u16,

    // -- Chain ---------------------------------------------------------------
    #[arg(long, env = "CREDMINT_CHAIN_BACKEND", value_enum, default_value_t = ChainBackend::Rpc)]
    pub chain_backend: ChainBackend,

    /// JSON-RPC endpoint of the chain node.
    #[arg(long, env = "CREDMINT_RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Timeout for each chain or publisher call, in seconds.
    #[arg(long, env = "CREDMINT_CALL_TIMEOUT_SECS", default_value_t = config::DEFAULT_EXTERNAL_CALL_TIMEOUT.as_secs())]
    pub call_timeout_secs: u64,

    /// EIP-155 chain id.
    #[arg(long, env = "CREDMINT_CHAIN_ID", default_value_t = config::DEFAULT_CHAIN_ID)]
    pub chain_id: u64,

    /// Address of the credential registry contract.
    #[arg(long, env = "CREDMINT_CONTRACT_ADDRESS")]
    pub contract_address: Option<String>,

    /// Gas limit for the mint call.
    #[arg(long, env = "CREDMINT_GAS_LIMIT", default_value_t = config::DEFAULT_GAS_LIMIT)]
    pub gas_limit: u64,

    /// Minimum gas price offered, in wei.
    #[arg(long, env = "CREDMINT_GAS_PRICE_FLOOR_WEI", default_value_t = config::DEFAULT_GAS_PRICE_FLOOR_WEI)]
    pub gas_price_floor_wei: u128,

    /// Canonical signature of the registry's mint function.
    #[arg(long, env = "CREDMINT_MINT_FUNCTION", default_value = DEFAULT_MINT_FUNCTION)]
    pub mint_function: String,

    /// Canonical signature of the registry's mint event.
    #[arg(long, env = "CREDMINT_MINT_EVENT", default_value = DEFAULT_MINT_EVENT)]
    pub mint_event: String,

    /// Block interval of the simulated chain, in milliseconds.
    #[arg(long, env = "CREDMINT_SIMULATED_BLOCK_MS", default_value_t = 1_000)]
    pub simulated_block_ms: u64,

    // -- Metadata ------------------------------------------------------------
    #[arg(long, env = "CREDMINT_PUBLISHER_BACKEND", value_enum, default_value_t = PublisherBackend::Http)]
    pub publisher_backend: PublisherBackend,

    /// Pinning service endpoint.
    #[arg(long, env = "CREDMINT_PUBLISHER_URL", default_value = "http://127.0.0.1:5001/pin")]
    pub publisher_url: String,

    /// Bearer token for the pinning service.
    #[arg(long, env = "CREDMINT_PUBLISHER_TOKEN", hide_env_values = true)]
    pub publisher_token: Option<String>,

    // -- Keys ----------------------------------------------------------------
    #[arg(long, env = "CREDMINT_KEY_SOURCE", value_enum, default_value_t = KeySource::File)]
    pub key_source: KeySource,

    /// Name of the relayer key.
    #[arg(long, env = "CREDMINT_RELAYER_KEY", default_value = config::DEFAULT_RELAYER_KEY_NAME)]
    pub relayer_key: String,

    /// How long a fetched key is reused before it is fetched again, in seconds.
    #[arg(long, env = "CREDMINT_SIGNER_CACHE_TTL_SECS", default_value_t = config::DEFAULT_SIGNER_CACHE_TTL.as_secs())]
    pub signer_cache_ttl_secs: u64,

    // -- Relayer -------------------------------------------------------------
    /// Relayer poll interval, in seconds.
    #[arg(long, env = "CREDMINT_RELAYER_INTERVAL_SECS", default_value_t = config::DEFAULT_RELAYER_INTERVAL.as_secs())]
    pub relayer_interval_secs: u64,

    /// Submission attempts before a credential fails.
    #[arg(long, env = "CREDMINT_MAX_ATTEMPTS", default_value_t = config::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Gas price increase per retry, in percent.
    #[arg(long, env = "CREDMINT_GAS_BUMP_PERCENT", default_value_t = config::DEFAULT_GAS_BUMP_PERCENT)]
    pub gas_bump_percent: u64,

    /// Rows claimed per pass.
    #[arg(long, env = "CREDMINT_BATCH_SIZE", default_value_t = config::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// How long a worker owns a claimed row, in seconds.
    #[arg(long, env = "CREDMINT_CLAIM_LEASE_SECS", default_value_t = config::DEFAULT_CLAIM_LEASE.as_secs())]
    pub claim_lease_secs: u64,

    // -- Watcher -------------------------------------------------------------
    /// Watcher poll interval, in seconds.
    #[arg(long, env = "CREDMINT_WATCHER_INTERVAL_SECS", default_value_t = config::DEFAULT_WATCHER_INTERVAL.as_secs())]
    pub watcher_interval_secs: u64,

    /// Blocks on top of the receipt before a mint is final.
    #[arg(long, env = "CREDMINT_MIN_CONFIRMATIONS", default_value_t = config::DEFAULT_MIN_CONFIRMATIONS)]
    pub min_confirmations: u64,

    /// Age after which an unmined submission is escalated, in seconds.
    #[arg(long, env = "CREDMINT_PENDING_TIMEOUT_SECS", default_value_t = config::DEFAULT_PENDING_TIMEOUT.as_secs())]
    pub pending_timeout_secs: u64,

    /// What to do with a stuck submission: flag, resubmit, fail-if-dropped.
    #[arg(long, env = "CREDMINT_ESCALATION", default_value = "flag")]
    pub escalation: EscalationPolicy,
}

impl RunArgs {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Resolves flags into the protocol's configuration. Fails on values
    /// the pipeline cannot run with.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        use anyhow::{bail, Context};

        if !self.cost.mint_cost.is_positive() {
            bail!("--mint-cost must be positive, got {}", self.cost.mint_cost);
        }
        if self.max_attempts == 0 {
            bail!("--max-attempts must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        if self.relayer_interval_secs == 0 || self.watcher_interval_secs == 0 {
            bail!("poll intervals must be at least one second");
        }

        let mint_abi = credmint_contracts::MintAbi::new(&self.mint_function, &self.mint_event)
            .context("invalid registry ABI signatures")?;
        let registry_address = match &self.contract_address {
            Some(raw) => raw
                .parse::<credmint_contracts::Address>()
                .with_context(|| format!("invalid --contract-address {raw}"))?,
            None if self.chain_backend == ChainBackend::Simulated => {
                credmint_contracts::Address::ZERO
            }
            None => bail!("--contract-address is required with the rpc chain backend"),
        };

        let call_timeout = self.call_timeout();
        let claim_lease = Duration::from_secs(self.claim_lease_secs);
        let defaults = PipelineConfig::default();

        Ok(PipelineConfig {
            mint_cost: self.cost.mint_cost,
            chain: ChainConfig {
                chain_id: self.chain_id,
                registry_address,
                gas_limit: self.gas_limit,
                gas_price_floor_wei: self.gas_price_floor_wei,
                mint_abi,
            },
            relayer: RelayerConfig {
                interval: Duration::from_secs(self.relayer_interval_secs),
                batch_size: self.batch_size,
                max_attempts: self.max_attempts,
                gas_bump_percent: self.gas_bump_percent,
                call_timeout,
                claim_lease,
                relayer_key_name: self.relayer_key.clone(),
                ..defaults.relayer
            },
            watcher: WatcherConfig {
                interval: Duration::from_secs(self.watcher_interval_secs),
                batch_size: self.batch_size,
                min_confirmations: self.min_confirmations,
                pending_timeout: Duration::from_secs(self.pending_timeout_secs),
                escalation: self.escalation,
                gas_bump_percent: self.gas_bump_percent,
                call_timeout,
                claim_lease,
                relayer_key_name: self.relayer_key.clone(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// init / account / issue / status
// ---------------------------------------------------------------------------

/// Arguments for the `init` subcommand.
#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    /// Name of the relayer key to generate.
    #[arg(long, env = "CREDMINT_RELAYER_KEY", default_value = config::DEFAULT_RELAYER_KEY_NAME)]
    pub relayer_key: String,
}

/// `account` subcommands.
#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    /// Open a new credit account and print its id.
    Open(DataDirArgs),
    /// Record a payment against an account.
    Purchase {
        #[command(flatten)]
        data: DataDirArgs,
        /// Account id.
        account: String,
        /// Credits bought, e.g. `25.00`.
        amount: Credits,
        /// Payment reference. Each reference is accepted once.
        #[arg(long)]
        reference: String,
    },
    /// Print the balance and the ledger entries of an account.
    Show {
        #[command(flatten)]
        data: DataDirArgs,
        /// Account id.
        account: String,
    },
}

/// Arguments for the `issue` subcommand.
#[derive(Args, Debug)]
pub struct IssueArgs {
    #[command(flatten)]
    pub data: DataDirArgs,

    #[command(flatten)]
    pub cost: MintCostArgs,

    /// Issuer account id.
    #[arg(long)]
    pub issuer: String,

    /// Recipient wallet address.
    #[arg(long)]
    pub recipient: String,

    /// Metadata document, a JSON object.
    #[arg(long)]
    pub metadata: String,
}

/// Arguments for the `status` subcommand.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Base URL of the running node's API.
    #[arg(long, env = "CREDMINT_API_URL", default_value = "http://127.0.0.1:9750")]
    pub api_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        CredMintCli::command().debug_assert();
    }

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["credmint-node", "run"];
        argv.extend_from_slice(extra);
        match CredMintCli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => *args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn log_filter_is_global() {
        let cli = CredMintCli::try_parse_from([
            "credmint-node",
            "version",
            "--log-filter",
            "credmint_protocol::pipeline=debug",
        ])
        .unwrap();
        assert_eq!(cli.log_filter, "credmint_protocol::pipeline=debug");
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = run_args(&["--chain-backend", "simulated"])
            .pipeline_config()
            .unwrap();
        let defaults = PipelineConfig::default();

        assert_eq!(cfg.mint_cost, defaults.mint_cost);
        assert_eq!(cfg.relayer.interval, defaults.relayer.interval);
        assert_eq!(cfg.relayer.max_attempts, defaults.relayer.max_attempts);
        assert_eq!(cfg.watcher.min_confirmations, defaults.watcher.min_confirmations);
        assert_eq!(cfg.watcher.escalation, EscalationPolicy::Flag);
        assert_eq!(cfg.chain.registry_address, credmint_contracts::Address::ZERO);
    }

    #[test]
    fn flags_reach_the_pipeline_config() {
        let cfg = run_args(&[
            "--contract-address",
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "--mint-cost",
            "2.50",
            "--min-confirmations",
            "3",
            "--gas-bump-percent",
            "25",
            "--escalation",
            "fail-if-dropped",
            "--relayer-key",
            "hot",
        ])
        .pipeline_config()
        .unwrap();

        assert_eq!(cfg.mint_cost, Credits::from_minor(250));
        assert_eq!(cfg.watcher.min_confirmations, 3);
        assert_eq!(cfg.relayer.gas_bump_percent, 25);
        assert_eq!(cfg.watcher.gas_bump_percent, 25);
        assert_eq!(cfg.watcher.escalation, EscalationPolicy::FailIfDropped);
        assert_eq!(cfg.relayer.relayer_key_name, "hot");
        assert_eq!(cfg.watcher.relayer_key_name, "hot");
    }

    #[test]
    fn rpc_backend_requires_a_contract_address() {
        assert!(run_args(&[]).pipeline_config().is_err());
    }

    #[test]
    fn nonsensical_values_are_rejected() {
        let sim = ["--chain-backend", "simulated"];
        for bad in [
            ["--mint-cost", "0.00"],
            ["--max-attempts", "0"],
            ["--batch-size", "0"],
            ["--mint-function", "mint(uint256)"],
        ] {
            let mut argv = sim.to_vec();
            argv.extend_from_slice(&bad);
            assert!(run_args(&argv).pipeline_config().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn unknown_escalation_policy_fails_parsing() {
        let parsed =
            CredMintCli::try_parse_from(["credmint-node", "run", "--escalation", "refund"]);
        assert!(parsed.is_err());
    }
}
