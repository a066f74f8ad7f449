//! Per-tenant ingestion lock.
//!
//! The lock lives in durable storage so it is visible to every process that
//! shares the database and survives restarts. Acquisition is one conditional
//! write; there is never a separate "is it locked?" read.

mod sqlite;
mod store;

pub use sqlite::SqliteLockManager;
pub use store::{LockError, LockManager, LockStatus};
