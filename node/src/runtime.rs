//! Startup wiring: picks the capability implementations named on the
//! command line and assembles the pipeline around one database.
//!
//! ```text
//!   RunArgs ──► PipelineConfig
//!      │
//!      ├─► ChainClient        (JsonRpcChainClient | SimulatedChain)
//!      ├─► MetadataPublisher  (HttpPinningPublisher | InMemoryPublisher)
//!      └─► SignerCache        (FileKeySigner | EnvKeySigner)
//!                │
//!   CredMintDB ──┴─► IssuanceService, Relayer, Watcher ──► Scheduler
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use credmint_protocol::chain::{ChainClient, JsonRpcChainClient, SimulatedChain};
use credmint_protocol::config::PipelineConfig;
use credmint_protocol::credential::CredentialRepository;
use credmint_protocol::ledger::CreditLedger;
use credmint_protocol::metadata::{HttpPinningPublisher, InMemoryPublisher, MetadataPublisher};
use credmint_protocol::pipeline::{PassObserver, Relayer, Scheduler, Watcher};
use credmint_protocol::signer::{EnvKeySigner, FileKeySigner, KeySigner, SignerCache};
use credmint_protocol::storage::CredMintDB;
use credmint_protocol::IssuanceService;

use crate::cli::{ChainBackend, DataDirArgs, KeySource, PublisherBackend, RunArgs};

/// Opens (or creates) the node database under the data directory.
pub fn open_database(data: &DataDirArgs) -> Result<CredMintDB> {
    let path = data.db_path();
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create database directory {}", path.display()))?;
    let db = CredMintDB::open(&path).with_context(|| {
        format!(
            "failed to open database at {} (is another credmint-node using it?)",
            path.display()
        )
    })?;
    info!(path = %path.display(), "database opened");
    Ok(db)
}

/// The external collaborators selected at startup.
pub struct Backends {
    pub chain: Arc<dyn ChainClient>,
    /// Set when the chain is simulated; the caller runs its miner.
    pub simulated: Option<Arc<SimulatedChain>>,
    pub publisher: Arc<dyn MetadataPublisher>,
    pub signers: Arc<SignerCache>,
}

impl Backends {
    pub fn from_args(args: &RunArgs, config: &PipelineConfig) -> Result<Self> {
        let (chain, simulated): (Arc<dyn ChainClient>, _) = match args.chain_backend {
            ChainBackend::Rpc => {
                let client = JsonRpcChainClient::new(&args.rpc_url, args.call_timeout())
                    .with_context(|| format!("failed to build chain client for {}", args.rpc_url))?;
                info!(url = %args.rpc_url, chain_id = config.chain.chain_id, "using JSON-RPC chain");
                (Arc::new(client), None)
            }
            ChainBackend::Simulated => {
                let sim = Arc::new(SimulatedChain::new(
                    config.chain.chain_id,
                    config.chain.registry_address,
                    config.chain.mint_abi.clone(),
                ));
                warn!(chain_id = config.chain.chain_id, "using simulated chain; nothing is minted on a real network");
                (sim.clone() as Arc<dyn ChainClient>, Some(sim))
            }
        };

        let publisher: Arc<dyn MetadataPublisher> = match args.publisher_backend {
            PublisherBackend::Http => {
                let publisher = HttpPinningPublisher::new(
                    &args.publisher_url,
                    args.publisher_token.clone(),
                    args.call_timeout(),
                )
                .context("failed to build pinning publisher")?;
                info!(url = %args.publisher_url, "using HTTP pinning publisher");
                Arc::new(publisher)
            }
            PublisherBackend::Memory => {
                warn!("using in-memory metadata publisher; content is lost on restart");
                Arc::new(InMemoryPublisher::new())
            }
        };

        let source: Arc<dyn KeySigner> = match args.key_source {
            KeySource::File => Arc::new(FileKeySigner::new(args.data.keys_dir())),
            KeySource::Env => Arc::new(EnvKeySigner::new()),
        };
        let signers = Arc::new(SignerCache::new(
            source,
            Duration::from_secs(args.signer_cache_ttl_secs),
        ));

        Ok(Self {
            chain,
            simulated,
            publisher,
            signers,
        })
    }
}

/// Everything `run` needs after wiring.
pub struct Pipeline {
    pub service: IssuanceService,
    pub scheduler: Scheduler,
}

/// Builds the issuance service and a scheduler holding the relayer and the
/// watcher, all sharing `db`.
pub fn assemble(
    db: CredMintDB,
    backends: &Backends,
    config: &PipelineConfig,
    observer: Arc<dyn PassObserver>,
) -> Result<Pipeline> {
    let ledger = CreditLedger::new(db.clone());
    let credentials = CredentialRepository::new(db);
    let service = IssuanceService::new(ledger.clone(), credentials.clone(), config.mint_cost)
        .context("invalid mint cost")?;

    let relayer = Relayer::new(
        credentials.clone(),
        ledger.clone(),
        Arc::clone(&backends.publisher),
        Arc::clone(&backends.signers),
        Arc::clone(&backends.chain),
        config.chain.clone(),
        config.relayer.clone(),
    );
    let watcher = Watcher::new(
        credentials,
        ledger,
        Arc::clone(&backends.signers),
        Arc::clone(&backends.chain),
        config.chain.clone(),
        config.watcher.clone(),
    );
    info!(
        relayer = relayer.owner(),
        watcher = watcher.owner(),
        escalation = %config.watcher.escalation,
        min_confirmations = config.watcher.min_confirmations,
        "pipeline assembled"
    );

    let scheduler = Scheduler::new()
        .with_task(Arc::new(relayer))
        .with_task(Arc::new(watcher))
        .with_observer(observer);

    Ok(Pipeline { service, scheduler })
}
