//! Types for the ingestion orchestrator.

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::audit::{AuditError, IngestionLogEntry};
use crate::job::{Job, JobError, JobStatus};
use crate::lock::{LockError, LockStatus};
use crate::source::FetchError;
use crate::ticket::TicketError;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another unexpired lock owns the tenant.
    #[error("ingestion already running for tenant {tenant_id}")]
    Conflict { tenant_id: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    /// The lock could not be refreshed and may now belong to another run.
    #[error("lost the ingestion lock for tenant {tenant_id}")]
    LockLost { tenant_id: String },

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("job tracker error: {0}")]
    Job(JobError),

    #[error("ticket store error: {0}")]
    Ticket(#[from] TicketError),

    #[error("audit store error: {0}")]
    Audit(#[from] AuditError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
}

impl From<JobError> for OrchestratorError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(job_id) => OrchestratorError::JobNotFound(job_id),
            JobError::AlreadyTerminal { job_id, status } => {
                OrchestratorError::AlreadyTerminal { job_id, status }
            }
            other => OrchestratorError::Job(other),
        }
    }
}

/// A started run. The run proceeds whether or not the handle is awaited.
#[derive(Debug)]
pub struct RunHandle {
    pub job_id: String,
    task: JoinHandle<IngestionLogEntry>,
}

impl RunHandle {
    pub(crate) fn new(job_id: String, task: JoinHandle<IngestionLogEntry>) -> Self {
        Self { job_id, task }
    }

    /// Wait for the run to finish and return its audit entry.
    pub async fn wait(self) -> Result<IngestionLogEntry, tokio::task::JoinError> {
        self.task.await
    }
}

/// What a tenant is doing right now.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    pub tenant_id: String,
    pub running: bool,
    pub job: Option<Job>,
    pub lock: Option<LockStatus>,
}
