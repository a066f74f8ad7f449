//! Ingestion API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use ticketsync_core::{
    AuditFilter, IngestionLogEntry, IngestionStatus, Job, JobStatus, LockStatus,
};

use super::handlers::{bad_request, error_response, require_tenant, ErrorResponse};
use crate::state::AppState;

/// Maximum allowed limit for audit log queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for audit log queries
const DEFAULT_LIMIT: i64 = 100;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TenantParams {
    pub tenant_id: Option<String>,
}

/// Response for an accepted run
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub job_id: String,
    pub tenant_id: String,
    pub status: JobStatus,
}

/// Response for a cancellation request
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub tenant_id: String,
    pub locked: bool,
    pub lock: Option<LockStatus>,
}

/// Query parameters for the ingestion log
#[derive(Debug, Deserialize)]
pub struct LogsParams {
    pub tenant_id: Option<String>,
    pub job_id: Option<String>,
    /// Final status: running, completed, failed or cancelled
    pub status: Option<String>,
    /// Runs started at or after this timestamp (ISO 8601)
    pub from: Option<DateTime<Utc>>,
    /// Runs started at or before this timestamp (ISO 8601)
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub entries: Vec<IngestionLogEntry>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start an ingestion run. Answers 202 with the job id, or 409 when the
/// tenant is already being ingested.
pub async fn run_ingestion(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TenantParams>,
) -> ApiResult<(StatusCode, Json<RunResponse>)> {
    let tenant_id = require_tenant(params.tenant_id)?;
    let handle = state
        .orchestrator()
        .run(&tenant_id)
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            job_id: handle.job_id,
            tenant_id,
            status: JobStatus::Running,
        }),
    ))
}

/// Running job (if any) and lock of a tenant
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TenantParams>,
) -> ApiResult<Json<IngestionStatus>> {
    let tenant_id = require_tenant(params.tenant_id)?;
    state
        .orchestrator()
        .ingestion_status(&tenant_id)
        .map(Json)
        .map_err(error_response)
}

pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .orchestrator()
        .get_job_status(&job_id)
        .map(Json)
        .map_err(error_response)
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let status = state
        .orchestrator()
        .cancel(&job_id)
        .map_err(error_response)?;
    Ok(Json(CancelResponse { job_id, status }))
}

pub async fn get_lock(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<LockResponse>> {
    let lock = state
        .orchestrator()
        .lock_status(&tenant_id)
        .map_err(error_response)?;
    Ok(Json(LockResponse {
        tenant_id,
        locked: lock.as_ref().is_some_and(|l| !l.is_expired),
        lock,
    }))
}

/// Query the ingestion audit log, newest first
pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsParams>,
) -> ApiResult<Json<LogsResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = AuditFilter::new().with_limit(limit).with_offset(offset);
    if let Some(tenant_id) = params.tenant_id {
        filter = filter.with_tenant(tenant_id);
    }
    if let Some(job_id) = params.job_id {
        filter = filter.with_job_id(job_id);
    }
    if let Some(ref status) = params.status {
        let status = JobStatus::parse(status)
            .ok_or_else(|| bad_request(format!("unknown status: {status}")))?;
        filter = filter.with_status(status);
    }
    if params.from.is_some() || params.to.is_some() {
        filter = filter.with_time_range(params.from, params.to);
    }

    let orchestrator = state.orchestrator();
    let entries = orchestrator
        .audit_entries(&filter)
        .map_err(error_response)?;
    let total = orchestrator
        .audit_count(&filter)
        .map_err(error_response)?;

    Ok(Json(LogsResponse {
        entries,
        total,
        limit,
        offset,
    }))
}
