//! Ingestion job lifecycle.

mod sqlite;
mod store;

pub use sqlite::SqliteJobTracker;
pub use store::{Job, JobError, JobStatus, JobTracker};
