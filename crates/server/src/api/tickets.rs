//! Ticket API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ticketsync_core::{Ticket, TicketFilter, TicketHistoryEntry, Urgency};

use super::handlers::{bad_request, error_response, require_tenant, ErrorResponse};
use crate::state::AppState;

/// Maximum allowed limit for ticket queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for ticket queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for listing tickets
#[derive(Debug, Deserialize)]
pub struct ListTicketsParams {
    pub tenant_id: Option<String>,
    /// Filter by source status
    pub status: Option<String>,
    /// Filter by urgency: low, medium or high
    pub urgency: Option<String>,
    /// Include soft-deleted tickets
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListTicketsResponse {
    pub tickets: Vec<Ticket>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct TenantParams {
    pub tenant_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub tenant_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub tenant_id: String,
    pub external_id: String,
    pub entries: Vec<TicketHistoryEntry>,
}

// ============================================================================
// Handlers
// ============================================================================

/// List a tenant's tickets; soft-deleted ones only on request
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTicketsParams>,
) -> Result<Json<ListTicketsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = require_tenant(params.tenant_id)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut base_filter = TicketFilter::new().with_tenant(tenant_id);
    if let Some(status) = params.status {
        base_filter = base_filter.with_status(status);
    }
    if let Some(ref urgency) = params.urgency {
        let urgency = Urgency::parse(urgency)
            .ok_or_else(|| bad_request(format!("unknown urgency: {urgency}")))?;
        base_filter = base_filter.with_urgency(urgency);
    }
    if params.include_deleted {
        base_filter = base_filter.including_deleted();
    }

    let query_filter = base_filter.clone().with_limit(limit).with_offset(offset);

    let orchestrator = state.orchestrator();
    let tickets = orchestrator
        .list_tickets(&query_filter)
        .map_err(error_response)?;
    let total = orchestrator
        .count_tickets(&base_filter)
        .map_err(error_response)?;

    Ok(Json(ListTicketsResponse {
        tickets,
        total,
        limit,
        offset,
    }))
}

/// Field-level change history of one ticket, newest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(external_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = require_tenant(params.tenant_id)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let entries = state
        .orchestrator()
        .ticket_history(&tenant_id, &external_id, limit)
        .map_err(error_response)?;

    Ok(Json(HistoryResponse {
        tenant_id,
        external_id,
        entries,
    }))
}

/// One ticket of a tenant, including soft-deleted ones
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(external_id): Path<String>,
    Query(params): Query<TenantParams>,
) -> Result<Json<Ticket>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = require_tenant(params.tenant_id)?;

    match state
        .orchestrator()
        .get_ticket(&tenant_id, &external_id)
        .map_err(error_response)?
    {
        Some(ticket) => Ok(Json(ticket)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("ticket not found: {tenant_id}/{external_id}"),
            }),
        )),
    }
}

/// Live high-urgency tickets of a tenant
pub async fn list_urgent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TenantParams>,
) -> Result<Json<ListTicketsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = require_tenant(params.tenant_id)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let base_filter = TicketFilter::new()
        .with_tenant(tenant_id)
        .with_urgency(Urgency::High);
    let query_filter = base_filter.clone().with_limit(limit).with_offset(offset);

    let orchestrator = state.orchestrator();
    let tickets = orchestrator
        .list_tickets(&query_filter)
        .map_err(error_response)?;
    let total = orchestrator
        .count_tickets(&base_filter)
        .map_err(error_response)?;

    Ok(Json(ListTicketsResponse {
        tickets,
        total,
        limit,
        offset,
    }))
}
