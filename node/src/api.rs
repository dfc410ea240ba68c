//! # Operator HTTP API
//!
//! Read-only endpoints for orchestrators and operators. Issuance itself is
//! driven by the application in front of CredMint, not over this API.
//!
//! ## Endpoints
//!
//! | Method | Path                | Description                          |
//! |--------|---------------------|--------------------------------------|
//! | GET    | `/health`           | Liveness probe                       |
//! | GET    | `/status`           | Credentials per status, node config  |
//! | GET    | `/metrics`          | Prometheus text exposition           |
//! | GET    | `/credentials/:id`  | One credential's lifecycle fields    |

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use credmint_protocol::credential::{
    Credential, CredentialError, CredentialId, CredentialStatus, StatusCounts,
};
use credmint_protocol::signer::SignerCache;
use credmint_protocol::{IssuanceError, IssuanceService};

use crate::metrics::NodeMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub chain_id: u64,
    /// Registry contract, checksummed.
    pub registry: String,
    /// `rpc` or `simulated`.
    pub chain_backend: &'static str,
    pub service: IssuanceService,
    pub signers: Arc<SignerCache>,
    pub metrics: Arc<NodeMetrics>,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/credentials/:id", get(credential_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub chain_id: u64,
    pub registry: String,
    pub chain_backend: String,
    /// Display units, e.g. `1.00`.
    pub mint_cost: String,
    pub credentials: StatusCountsBody,
    pub uptime_secs: i64,
    pub timestamp: String,
}

/// Mirror of [`StatusCounts`] that can also be read back in tests and by
/// the `status` subcommand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCountsBody {
    pub queued: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub revoked: u64,
}

impl From<StatusCounts> for StatusCountsBody {
    fn from(c: StatusCounts) -> Self {
        Self {
            queued: c.queued,
            pending: c.pending,
            confirmed: c.confirmed,
            failed: c.failed,
            revoked: c.revoked,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialResponse {
    pub id: String,
    pub issuer_id: String,
    pub recipient_address: String,
    pub status: CredentialStatus,
    pub metadata_uri: Option<String>,
    pub chain_tx_hash: Option<String>,
    pub token_id: Option<String>,
    pub cost: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub refunded: bool,
    pub created_at: String,
    pub updated_at: String,
    pub confirmed_at: Option<String>,
}

impl From<&Credential> for CredentialResponse {
    fn from(c: &Credential) -> Self {
        Self {
            id: c.id.to_string(),
            issuer_id: c.issuer_id.to_string(),
            recipient_address: c.recipient_address.to_string(),
            status: c.status,
            metadata_uri: c.content_address.as_ref().map(|a| a.uri()),
            chain_tx_hash: c.chain_tx_hash.map(|h| h.to_string()),
            token_id: c.token_id_decimal(),
            cost: c.cost.to_string(),
            attempts: c.attempts,
            last_error: c.last_error.clone(),
            refunded: c.refund_entry.is_some(),
            created_at: c.created_at.to_rfc3339(),
            updated_at: c.updated_at.to_rfc3339(),
            confirmed_at: c.confirmed_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — 200 while the process is serving. Pipeline health
/// belongs in `/status` and `/metrics`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        chain_id: state.chain_id,
        registry: state.registry.clone(),
        chain_backend: state.chain_backend.to_string(),
        mint_cost: state.service.mint_cost().to_string(),
        credentials: state.service.status_counts().into(),
        uptime_secs: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
    })
}

/// `GET /metrics` — refreshes the storage-backed gauges, then renders.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    state
        .metrics
        .record_status_counts(&state.service.status_counts());
    state.metrics.record_signer_cache(&state.signers.stats());

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
        }
    }
}

async fn credential_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id: CredentialId = match id.parse() {
        Ok(id) => id,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, format!("invalid credential id {id}")),
    };

    match state.service.get_credential(&id) {
        Ok(credential) => Json(CredentialResponse::from(&credential)).into_response(),
        Err(IssuanceError::Credential(CredentialError::NotFound(_))) => {
            error_response(StatusCode::NOT_FOUND, format!("credential {id} not found"))
        }
        Err(e) => {
            tracing::error!(credential = %id, error = %e, "credential lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "credential lookup failed")
        }
    }
}
