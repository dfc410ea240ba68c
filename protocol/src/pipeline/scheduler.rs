//! Explicit periodic-task runner.
//!
//! The [`Scheduler`] owns its tasks and drives each on its own tokio task
//! and its own interval. Shutdown is a `watch` channel: on `true` (or when
//! the sender is dropped) each loop exits after finishing its current pass,
//! so no credential is abandoned mid-transition.
//!
//! A slow pass delays the next tick rather than bursting to catch up
//! (`MissedTickBehavior::Delay`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one pass did. Fields that do not apply to a task stay zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Rows claimed for this pass.
    pub claimed: usize,
    /// QUEUED rows moved to PENDING.
    pub submitted: usize,
    /// QUEUED rows moved to PENDING after exhausting retries on an
    /// ambiguous broadcast.
    pub parked: usize,
    pub confirmed: usize,
    pub failed: usize,
    /// Refunds written, including the reconciliation sweep.
    pub refunded: usize,
    /// Rows left for a later pass (collaborator unavailable, not final yet).
    pub skipped: usize,
    /// Rows newly handled by the pending-timeout policy.
    pub escalated: usize,
    /// Submission attempts that failed transiently.
    pub retries: usize,
    /// Rows whose processing hit an unexpected error.
    pub errors: usize,
}

impl PassReport {
    /// Whether the pass changed any row.
    pub fn made_progress(&self) -> bool {
        self.submitted + self.parked + self.confirmed + self.failed + self.refunded + self.escalated
            > 0
    }
}

/// A unit of periodic work.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Stable name used in logs and metric labels.
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Runs one pass. Never fails: per-row problems are counted in the
    /// report.
    async fn run_once(&self) -> PassReport;
}

/// Receives every pass report, e.g. to update metrics.
pub trait PassObserver: Send + Sync {
    fn observe(&self, task: &'static str, report: &PassReport, elapsed: Duration);
}

/// Owns periodic tasks and their shutdown.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    observers: Vec<Arc<dyn PassObserver>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: Arc<dyn PeriodicTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PassObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Starts one loop per task. Each handle completes after shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let observers: Arc<[Arc<dyn PassObserver>]> = self.observers.into();
        self.tasks
            .into_iter()
            .map(|task| {
                let observers = Arc::clone(&observers);
                let shutdown = shutdown.clone();
                tokio::spawn(drive(task, observers, shutdown))
            })
            .collect()
    }

    /// Runs all tasks until shutdown and waits for them to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        for result in join_all(self.spawn(shutdown)).await {
            if let Err(e) = result {
                warn!(error = %e, "periodic task panicked");
            }
        }
    }
}

async fn drive(
    task: Arc<dyn PeriodicTask>,
    observers: Arc<[Arc<dyn PassObserver>]>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = task.name();
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task = name, interval_ms = task.interval().as_millis() as u64, "periodic task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        let report = task.run_once().await;
        let elapsed = started.elapsed();

        if report.made_progress() || report.errors > 0 {
            info!(task = name, ?report, elapsed_ms = elapsed.as_millis() as u64, "pass finished");
        } else {
            debug!(task = name, claimed = report.claimed, "idle pass");
        }
        for observer in observers.iter() {
            observer.observe(name, &report, elapsed);
        }
    }

    info!(task = name, "periodic task stopped");
}
