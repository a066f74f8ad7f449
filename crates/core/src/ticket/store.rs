use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{FieldChange, Ticket, TicketHistoryEntry, Urgency};

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Ticket not found: {tenant_id}/{external_id}")]
    NotFound {
        tenant_id: String,
        external_id: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

/// Filter for listing tickets.
///
/// Soft-deleted tickets are excluded unless `include_deleted` is set.
#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub tenant_id: Option<String>,
    pub status: Option<String>,
    pub urgency: Option<Urgency>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

impl TicketFilter {
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

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
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

/// Durable ticket storage.
///
/// Methods are synchronous and hold the connection only for their own
/// duration.
pub trait TicketStore: Send + Sync {
    /// Look up a ticket, soft-deleted or not.
    fn get(&self, tenant_id: &str, external_id: &str) -> Result<Option<Ticket>, TicketError>;

    /// Insert or replace `ticket` and append `changes` to its history, atomically.
    fn upsert_with_history(
        &self,
        ticket: &Ticket,
        changes: &[FieldChange],
    ) -> Result<(), TicketError>;

    /// Set `deleted_at` on a live ticket and record it in the history.
    ///
    /// Returns `false` when the ticket is unknown or already deleted.
    fn soft_delete(
        &self,
        tenant_id: &str,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, TicketError>;

    fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, TicketError>;

    fn count(&self, filter: &TicketFilter) -> Result<i64, TicketError>;

    /// History of one ticket, newest first.
    fn history(
        &self,
        tenant_id: &str,
        external_id: &str,
        limit: i64,
    ) -> Result<Vec<TicketHistoryEntry>, TicketError>;

    /// Number of history rows for a tenant.
    fn history_count(&self, tenant_id: &str) -> Result<i64, TicketError>;

    /// External ids of every ticket of the tenant that is not soft-deleted.
    fn active_external_ids(&self, tenant_id: &str) -> Result<Vec<String>, TicketError>;
}
