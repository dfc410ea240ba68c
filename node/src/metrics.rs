//! # Prometheus Metrics
//!
//! Pipeline metrics for the issuance node, scraped at `/metrics`.
//!
//! Pass counters are fed by the scheduler through [`PassObserver`]; the
//! per-status credential gauges and the signer cache counters are refreshed
//! from storage right before each scrape, so they never drift from the
//! rows themselves.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `credmint` prefix.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use credmint_protocol::credential::{CredentialStatus, StatusCounts};
use credmint_protocol::pipeline::{PassObserver, PassReport};
use credmint_protocol::signer::SignerCacheStats;

/// Metric handles for the node. Clone shares the underlying collectors.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Completed passes, by task.
    pub passes_total: IntCounterVec,
    /// Per-row pass outcomes, by task and outcome.
    pub outcomes_total: IntCounterVec,
    /// Wall time of each pass, by task.
    pub pass_duration_seconds: HistogramVec,
    /// Credentials currently in each status.
    pub credentials: IntGaugeVec,
    pub signer_cache_hits: IntGauge,
    pub signer_cache_misses: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all collectors.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("credmint".into()), None)?;

        let passes_total = IntCounterVec::new(
            Opts::new("passes_total", "Completed scheduler passes"),
            &["task"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let outcomes_total = IntCounterVec::new(
            Opts::new("outcomes_total", "Per-credential pass outcomes"),
            &["task", "outcome"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let pass_duration_seconds = HistogramVec::new(
            HistogramOpts::new("pass_duration_seconds", "Wall time of one scheduler pass")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["task"],
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        let credentials = IntGaugeVec::new(
            Opts::new("credentials", "Credentials currently in each status"),
            &["status"],
        )?;
        registry.register(Box::new(credentials.clone()))?;

        let signer_cache_hits =
            IntGauge::new("signer_cache_hits", "Signer lookups served from the cache")?;
        registry.register(Box::new(signer_cache_hits.clone()))?;

        let signer_cache_misses =
            IntGauge::new("signer_cache_misses", "Signer lookups that hit the key source")?;
        registry.register(Box::new(signer_cache_misses.clone()))?;

        Ok(Self {
            registry,
            passes_total,
            outcomes_total,
            pass_duration_seconds,
            credentials,
            signer_cache_hits,
            signer_cache_misses,
        })
    }

    pub fn record_status_counts(&self, counts: &StatusCounts) {
        for status in CredentialStatus::ALL {
            self.credentials
                .with_label_values(&[status.as_str()])
                .set(gauge_value(counts.get(status)));
        }
    }

    pub fn record_signer_cache(&self, stats: &SignerCacheStats) {
        self.signer_cache_hits.set(gauge_value(stats.hits));
        self.signer_cache_misses.set(gauge_value(stats.misses));
    }

    /// Renders every collector in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl PassObserver for NodeMetrics {
    fn observe(&self, task: &'static str, report: &PassReport, elapsed: Duration) {
        self.passes_total.with_label_values(&[task]).inc();
        self.pass_duration_seconds
            .with_label_values(&[task])
            .observe(elapsed.as_secs_f64());

        let outcomes = [
            ("claimed", report.claimed),
            ("submitted", report.submitted),
            ("parked", report.parked),
            ("confirmed", report.confirmed),
            ("failed", report.failed),
            ("refunded", report.refunded),
            ("skipped", report.skipped),
            ("escalated", report.escalated),
            ("retries", report.retries),
            ("errors", report.errors),
        ];
        for (outcome, count) in outcomes {
            if count > 0 {
                self.outcomes_total
                    .with_label_values(&[task, outcome])
                    .inc_by(count as u64);
            }
        }
    }
}

fn gauge_value(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
