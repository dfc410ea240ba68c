// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CredMint Node
//!
//! Entry point for the `credmint-node` binary. Parses CLI arguments,
//! initializes logging and metrics, runs the relayer and the confirmation
//! watcher, and serves the operator API.
//!
//! - `run`     — start the pipeline and the HTTP endpoints
//! - `init`    — create the data directory and a relayer key
//! - `account` — open, fund and inspect credit accounts
//! - `issue`   — queue a credential
//! - `status`  — query a running node's status endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod runtime;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use credmint_protocol::credential::CredentialRepository;
use credmint_protocol::ledger::{AccountId, CreditLedger};
use credmint_protocol::signer::FileKeySigner;
use credmint_protocol::IssuanceService;

use cli::{AccountCommand, ChainBackend, Commands, CredMintCli};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CredMintCli::parse();
    logging::init_logging(&cli.log_filter, cli.log_format)?;

    match cli.command {
        Commands::Run(args) => run_node(*args).await,
        Commands::Init(args) => init_node(args),
        Commands::Account(command) => account(command),
        Commands::Issue(args) => issue(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs the pipeline until SIGINT/SIGTERM, then lets every worker finish
/// its current pass before exiting.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let config = args.pipeline_config()?;
    tracing::info!(
        data_dir = %args.data.data_dir.display(),
        api_port = args.api_port,
        chain_id = config.chain.chain_id,
        registry = %config.chain.registry_address,
        mint_cost = %config.mint_cost,
        "starting credmint-node"
    );

    let db = runtime::open_database(&args.data)?;
    let backends = runtime::Backends::from_args(&args, &config)?;
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let pipeline = runtime::assemble(db.clone(), &backends, &config, node_metrics.clone())?;

    match backends
        .signers
        .get(&config.relayer.relayer_key_name)
        .await
    {
        Ok(key) => tracing::info!(key_name = key.name(), address = %key.address(), "relayer key loaded"),
        Err(e) => tracing::warn!(
            error = %e,
            "relayer key unavailable; credentials stay queued until it can be loaded"
        ),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = pipeline.scheduler.spawn(shutdown_rx.clone());
    if let Some(sim) = backends.simulated.clone() {
        workers.push(tokio::spawn(sim.run_miner(
            Duration::from_millis(args.simulated_block_ms),
            shutdown_rx.clone(),
        )));
    }

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        chain_id: config.chain.chain_id,
        registry: config.chain.registry_address.to_string(),
        chain_backend: match args.chain_backend {
            ChainBackend::Rpc => "rpc",
            ChainBackend::Simulated => "simulated",
        },
        service: pipeline.service,
        signers: Arc::clone(&backends.signers),
        metrics: node_metrics,
        started_at: chrono::Utc::now(),
    };
    let router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API listening on {}", api_addr);

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, finishing current passes");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("API server failed")?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    db.flush().context("failed to flush database")?;
    tracing::info!("credmint-node stopped");
    Ok(())
}

/// Creates the data directory and a fresh relayer key file.
fn init_node(args: cli::InitArgs) -> Result<()> {
    let data_dir = &args.data.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let signer = FileKeySigner::new(args.data.keys_dir());
    let key = signer
        .create_key(&args.relayer_key)
        .with_context(|| format!("failed to create relayer key '{}'", args.relayer_key))?;

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Key file       : {}", signer.path_for(&args.relayer_key).display());
    println!("  Relayer address: {}", key.address());
    println!("Fund the relayer address with gas before running against a real chain.");
    Ok(())
}

fn offline_service(data: &cli::DataDirArgs, cost: &cli::MintCostArgs) -> Result<IssuanceService> {
    let db = runtime::open_database(data)?;
    IssuanceService::new(
        CreditLedger::new(db.clone()),
        CredentialRepository::new(db),
        cost.mint_cost,
    )
    .context("invalid mint cost")
}

fn parse_account(raw: &str) -> Result<AccountId> {
    raw.parse::<AccountId>()
        .with_context(|| format!("invalid account id {raw}"))
}

fn account(command: AccountCommand) -> Result<()> {
    let default_cost = cli::MintCostArgs {
        mint_cost: credmint_protocol::config::PipelineConfig::default().mint_cost,
    };
    match command {
        AccountCommand::Open(data) => {
            let service = offline_service(&data, &default_cost)?;
            let account = service.open_account(AccountId::new())?;
            println!("{}", account.id);
        }
        AccountCommand::Purchase {
            data,
            account,
            amount,
            reference,
        } => {
            let service = offline_service(&data, &default_cost)?;
            let id = parse_account(&account)?;
            let entry = service.purchase(&id, amount, &reference)?;
            println!("purchased {} credits, balance {}", entry.amount, entry.balance_after);
        }
        AccountCommand::Show { data, account } => {
            let service = offline_service(&data, &default_cost)?;
            let id = parse_account(&account)?;
            let audit = service.ledger().verify_account(&id)?;
            println!("account  {id}");
            println!("balance  {}", service.balance(&id)?);
            if !audit.is_consistent() {
                println!("WARNING  balance does not match the sum of entries: {audit:?}");
            }
            for entry in service.history(&id)? {
                println!(
                    "{:>6}  {}  {:<8} {:>12} -> {:>12}  {}",
                    entry.sequence,
                    entry.created_at.to_rfc3339(),
                    entry.entry_type.as_str(),
                    entry.amount.to_string(),
                    entry.balance_after.to_string(),
                    entry
                        .credential_id
                        .map(|c| c.to_string())
                        .or(entry.payment_reference.clone())
                        .or(entry.memo.clone())
                        .unwrap_or_default(),
                );
            }
        }
    }
    Ok(())
}

fn issue(args: cli::IssueArgs) -> Result<()> {
    let service = offline_service(&args.data, &args.cost)?;
    let issuer = parse_account(&args.issuer)?;
    let recipient = args
        .recipient
        .parse::<credmint_contracts::Address>()
        .map_err(|e| anyhow!("invalid recipient {}: {e}", args.recipient))?;
    let credential = service.issue(&issuer, recipient, &args.metadata)?;
    println!("{}", credential.id);
    Ok(())
}

/// Fetches `/status` from a running node and prints it.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()
        .with_context(|| format!("{url} returned an error"))?
        .json()
        .await
        .context("status response is not JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_version() {
    println!("credmint-node {}", env!("CARGO_PKG_VERSION"));
    println!("schema        {}", credmint_protocol::storage::db::SCHEMA_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first. If a
/// handler cannot be installed, that signal is never delivered.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
