//! # Issuance Pipeline
//!
//! Two periodic tasks move credentials from QUEUED to a terminal state:
//!
//! ```text
//!   QUEUED ──(Relayer: publish, sign, submit)──► PENDING
//!   PENDING ──(Watcher: receipt, depth, event)──► CONFIRMED | FAILED
//!   FAILED without refund ──(Watcher sweep)──► refunded
//! ```
//!
//! | Module       | Contents                                            |
//! |--------------|-----------------------------------------------------|
//! | `scheduler`  | `PeriodicTask`, `Scheduler`, `PassReport`           |
//! | `relayer`    | QUEUED -> PENDING, retries, gas bumps, give-up      |
//! | `watcher`    | finality, event decoding, escalation, refund sweep  |
//! | `submit`     | transaction building shared by relayer and watcher  |
//! | `settle`     | FAILED transition plus idempotent refund            |
//!
//! Every credential is processed under a row claim, and one credential's
//! failure never aborts a pass: errors are logged and counted in the
//! [`PassReport`].

pub mod relayer;
pub mod scheduler;
pub mod settle;
pub mod submit;
pub mod watcher;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::chain::ChainError;
use crate::credential::CredentialError;
use crate::ledger::LedgerError;

pub use relayer::{RelayOutcome, Relayer};
pub use scheduler::{PassObserver, PassReport, PeriodicTask, Scheduler};
pub use submit::{NonceLane, Submitter};
pub use watcher::{WatchOutcome, Watcher};

/// Errors that stop processing of a single credential.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Runs `call` with a deadline. On expiry the call is dropped and
/// `on_timeout` supplies the error.
pub(crate) async fn with_timeout<T, E, F>(
    limit: Duration,
    call: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

/// Timeout error for a chain call. Always ambiguous: a request that timed
/// out may still have been executed.
pub(crate) fn chain_timeout(what: &'static str, limit: Duration) -> impl FnOnce() -> ChainError {
    move || {
        ChainError::transient(
            crate::chain::TransientKind::Timeout,
            format!("{what} timed out after {}ms", limit.as_millis()),
        )
    }
}
