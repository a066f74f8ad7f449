//! Per-tenant ingestion runs.
//!
//! A run holds the tenant lock for its whole lifetime and drives
//! fetch, sync and notify page by page until the source is exhausted,
//! the job is cancelled, or an error ends it. Whatever the outcome, the
//! job is finalized, the lock released and one audit entry written.

mod config;
mod runner;
mod types;

pub use config::IngestConfig;
pub use runner::IngestionOrchestrator;
pub use runner::OrchestratorParts;
pub use types::{IngestionStatus, OrchestratorError, RunHandle};
