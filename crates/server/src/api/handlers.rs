use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use ticketsync_core::{
    CircuitState, CircuitStatus, OrchestratorError, RateLimitStatus, SanitizedConfig,
};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, `degraded` while the notification circuit is open, or
    /// `unhealthy` when storage is unreachable.
    pub status: String,
    pub storage: StorageHealth,
    pub circuit: CircuitStatus,
    pub rate_limit: RateLimitStatus,
}

#[derive(Serialize)]
pub struct StorageHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body shared by all API handlers.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let orchestrator = state.orchestrator();
    let storage = match orchestrator.check_storage() {
        Ok(()) => StorageHealth {
            status: "ok".to_string(),
            error: None,
        },
        Err(e) => {
            tracing::warn!("Health check: storage unavailable: {}", e);
            StorageHealth {
                status: "error".to_string(),
                error: Some(e.to_string()),
            }
        }
    };
    let circuit = orchestrator.circuit_status();
    let rate_limit = orchestrator.rate_limit_status().await;

    let (code, status) = if storage.error.is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if circuit.state == CircuitState::Open {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            storage,
            circuit,
            rate_limit,
        }),
    )
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SanitizedConfig> {
    Json(state.sanitized_config())
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state).await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}

/// Map an orchestrator error to its HTTP status and body.
pub fn error_response(err: OrchestratorError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        OrchestratorError::Conflict { .. } | OrchestratorError::AlreadyTerminal { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Extract a non-empty `tenant_id` query parameter.
pub fn require_tenant(
    tenant_id: Option<String>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    match tenant_id {
        Some(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => Err(bad_request("tenant_id is required")),
    }
}
