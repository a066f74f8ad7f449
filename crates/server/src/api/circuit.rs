//! Notification circuit breaker endpoints.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use ticketsync_core::{CircuitStatus, DispatchStatsSnapshot};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CircuitResponse {
    #[serde(flatten)]
    pub circuit: CircuitStatus,
    /// Delivery counters since startup
    pub notifications: DispatchStatsSnapshot,
}

/// Current breaker state. Reading it never counts as a call.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<CircuitResponse> {
    let orchestrator = state.orchestrator();
    Json(CircuitResponse {
        circuit: orchestrator.circuit_status(),
        notifications: orchestrator.notify_stats(),
    })
}

/// Force the breaker back to CLOSED with an empty window.
pub async fn reset(State(state): State<Arc<AppState>>) -> Json<CircuitResponse> {
    let orchestrator = state.orchestrator();
    tracing::info!("Circuit breaker reset via API");
    Json(CircuitResponse {
        circuit: orchestrator.reset_circuit(),
        notifications: orchestrator.notify_stats(),
    })
}
