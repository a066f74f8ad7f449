use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),
}

/// Summary of one ingestion run. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionLogEntry {
    /// Assigned by the store; 0 before insertion.
    pub id: i64,
    pub job_id: String,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_status: JobStatus,
    pub pages_fetched: u64,
    pub tickets_upserted: u64,
    pub tickets_soft_deleted: u64,
    pub tickets_unchanged: u64,
    pub notifications_queued: u64,
    pub notifications_dropped: u64,
    pub error_summary: Option<String>,
}

/// Filter for querying audit entries
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tenant_id: Option<String>,
    pub job_id: Option<String>,
    pub final_status: Option<JobStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            offset: 0,
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.final_status = Some(status);
        self
    }

    pub fn with_time_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for audit entry storage
pub trait AuditStore: Send + Sync {
    /// Append an entry, returns the assigned ID
    fn insert(&self, entry: &IngestionLogEntry) -> Result<i64, AuditError>;

    /// Query entries with optional filters, newest first
    fn query(&self, filter: &AuditFilter) -> Result<Vec<IngestionLogEntry>, AuditError>;

    /// Count matching entries
    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError>;
}
