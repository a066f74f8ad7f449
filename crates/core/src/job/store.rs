use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("Database error: {0}")]
    Database(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub status: JobStatus,
    pub processed_pages: u32,
    pub total_pages_estimate: Option<u32>,
    pub cancellation_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Owner of the job state machine: `running` to one of the terminal states,
/// with no way back.
pub trait JobTracker: Send + Sync {
    /// Record a new job in `running` state with no progress.
    fn create(&self, job_id: &str, tenant_id: &str) -> Result<Job, JobError>;

    fn get(&self, job_id: &str) -> Result<Option<Job>, JobError>;

    fn update_progress(
        &self,
        job_id: &str,
        processed_pages: u32,
        total_pages_estimate: Option<u32>,
    ) -> Result<(), JobError>;

    /// Flag a running job for cooperative cancellation.
    fn request_cancellation(&self, job_id: &str) -> Result<(), JobError>;

    fn is_cancellation_requested(&self, job_id: &str) -> Result<bool, JobError>;

    /// Move a running job to `status`. Returns `false` (and changes nothing)
    /// when the job is already terminal.
    fn finalize(&self, job_id: &str, status: JobStatus) -> Result<bool, JobError>;

    /// The running job for a tenant, if any.
    fn running_for_tenant(&self, tenant_id: &str) -> Result<Option<Job>, JobError>;

    /// Every job still in `running`, optionally for one tenant, oldest first.
    fn running_jobs(&self, tenant_id: Option<&str>) -> Result<Vec<Job>, JobError>;
}
