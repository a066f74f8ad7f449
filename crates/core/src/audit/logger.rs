use std::sync::Arc;

use tracing::{error, info};

use super::{AuditFilter, AuditStore, IngestionLogEntry};

/// Writes run summaries to the audit store.
///
/// Writes are synchronous: when `record` returns, the entry is durable (or
/// the failure has been logged). A failing audit store never fails the run.
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append `entry`. Returns the stored id, or `None` if the write failed.
    pub fn record(&self, entry: &IngestionLogEntry) -> Option<i64> {
        match self.store.insert(entry) {
            Ok(id) => {
                info!(
                    job_id = %entry.job_id,
                    tenant_id = %entry.tenant_id,
                    status = %entry.final_status,
                    pages = entry.pages_fetched,
                    upserted = entry.tickets_upserted,
                    "Ingestion run recorded"
                );
                Some(id)
            }
            Err(e) => {
                error!(job_id = %entry.job_id, "Failed to write audit entry: {}", e);
                None
            }
        }
    }

    pub fn entries(
        &self,
        filter: &AuditFilter,
    ) -> Result<Vec<IngestionLogEntry>, super::AuditError> {
        self.store.query(filter)
    }

    pub fn count(&self, filter: &AuditFilter) -> Result<i64, super::AuditError> {
        self.store.count(filter)
    }
}
