use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(String),
}

/// Snapshot of a tenant's lock row.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub tenant_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
}

/// Exclusive per-tenant lock backed by a store with an atomic conditional write.
pub trait LockManager: Send + Sync {
    /// Take the lock for `owner` if no row exists or the existing row has expired.
    ///
    /// Returns `false` when a live lock is held by anyone (including `owner`).
    fn acquire(&self, tenant_id: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Push the expiry forward. Succeeds only while `owner` still holds the row.
    fn refresh(&self, tenant_id: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete the row if `owner` still holds it. A stale release is a no-op.
    fn release(&self, tenant_id: &str, owner: &str) -> Result<(), LockError>;

    fn status(&self, tenant_id: &str) -> Result<Option<LockStatus>, LockError>;

    /// Remove every expired row, returning how many were deleted.
    fn cleanup_expired(&self) -> Result<usize, LockError>;
}
