//! Append-only audit log of ingestion runs.
//!
//! Exactly one entry is written per run, whatever its outcome.

mod logger;
mod sqlite;
mod store;

pub use logger::AuditLogger;
pub use sqlite::SqliteAuditStore;
pub use store::{AuditError, AuditFilter, AuditStore, IngestionLogEntry};
