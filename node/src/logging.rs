//! Tracing setup for `credmint-node`.
//!
//! The filter is chosen in this order: `RUST_LOG`, then `--log-filter`
//! (`CREDMINT_LOG`), then [`DEFAULT_FILTER`]. A malformed filter is an
//! error at startup instead of silently logging everything at the default
//! level. Output goes to stderr; stdout carries command results (account
//! ids, status JSON).

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "credmint_node=info,credmint_protocol=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output for local runs.
    Pretty,
    /// One JSON object per line for log aggregation.
    Json,
}

/// Where the active filter came from; logged once the subscriber is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSource {
    Environment,
    Configured,
}

/// Picks and parses the filter directives. `rust_log` wins when set and
/// non-blank.
pub fn resolve_filter(
    rust_log: Option<&str>,
    configured: &str,
) -> Result<(EnvFilter, FilterSource)> {
    match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .map(|f| (f, FilterSource::Environment))
            .with_context(|| format!("invalid RUST_LOG filter '{directives}'")),
        None => EnvFilter::try_new(configured)
            .map(|f| (f, FilterSource::Configured))
            .with_context(|| format!("invalid --log-filter '{configured}'")),
    }
}

/// Installs the global subscriber. Fails if the filter does not parse or a
/// subscriber is already installed.
pub fn init_logging(configured_filter: &str, format: LogFormat) -> Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let (filter, source) = resolve_filter(rust_log.as_deref(), configured_filter)?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(false),
            )
            .try_init(),
    }
    .context("tracing subscriber already installed")?;

    tracing::debug!(?format, ?source, "logging initialized");
    Ok(())
}
