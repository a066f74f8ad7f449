pub mod audit;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod db;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod rate_limiter;
pub mod source;
pub mod sync;
pub mod testing;
pub mod ticket;

pub use audit::{
    AuditError, AuditFilter, AuditLogger, AuditStore, IngestionLogEntry, SqliteAuditStore,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStatus,
};
pub use classify::{Classifier, KeywordClassifier};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DatabaseConfig,
    SanitizedConfig, ServerConfig,
};
pub use job::{Job, JobError, JobStatus, JobTracker, SqliteJobTracker};
pub use lock::{LockError, LockManager, LockStatus, SqliteLockManager};
pub use notify::{
    create_notify_system, DispatchStatsSnapshot, HttpNotifier, LogNotifier, Notification,
    Notifier, NotifyConfig, NotifyDispatcher, NotifyError, NotifyWorker,
};
pub use orchestrator::{
    IngestConfig, IngestionOrchestrator, IngestionStatus, OrchestratorError, OrchestratorParts,
    RunHandle,
};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, TokenBucketLimiter};
pub use source::{
    FetchError, FetchPolicy, HttpTicketSource, PageFetcher, SourceConfig, SourceError,
    TicketPage, TicketSource,
};
pub use sync::{ChangeSync, SyncOutcome};
pub use ticket::{
    Classification, ExternalTicket, FieldChange, Sentiment, SqliteTicketStore, Ticket,
    TicketError, TicketFilter, TicketHistoryEntry, TicketStore, Urgency,
};
