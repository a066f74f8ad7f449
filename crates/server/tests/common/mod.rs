//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that creates an in-process server
//! with a mock ticket source and a mock notification endpoint, so the full
//! HTTP surface can be exercised without external infrastructure.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use ticketsync_core::testing::{MockNotifier, MockTicketSource};
use ticketsync_core::{
    create_notify_system, load_config_from_str, AuditLogger, CircuitBreaker, IngestionOrchestrator,
    KeywordClassifier, OrchestratorParts, PageFetcher, SqliteAuditStore, SqliteJobTracker,
    SqliteLockManager, SqliteTicketStore, TokenBucketLimiter,
};
use ticketsync_server::bootstrap::NOTIFY_CIRCUIT;
use ticketsync_server::state::AppState;

/// Re-export fixtures for test convenience
pub use ticketsync_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
///
/// Provides an in-process server with fully controllable mocks for:
/// - The ticket provider (MockTicketSource)
/// - The notification endpoint (MockNotifier)
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_run() {
///     let fixture = TestFixture::new().await;
///     fixture.source.set_tickets("acme", fixtures::external_tickets(3));
///
///     let response = fixture.post("/api/v1/ingest/run?tenant_id=acme").await;
///     assert_eq!(response.status, 202);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Mock ticket source - configure datasets and failures
    pub source: Arc<MockTicketSource>,
    /// Mock notifier - inspect deliveries
    pub notifier: Arc<MockNotifier>,
    /// Temporary directory for the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

const PAGE_SIZE: u32 = 2;

impl TestFixture {
    /// Create a new test fixture with default mocks.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let config = load_config_from_str(&format!(
            r#"
[source]
base_url = "http://127.0.0.1:9"
page_size = {PAGE_SIZE}

[server]
host = "127.0.0.1"
port = 0

[database]
path = "{}"

[rate_limit]
requests_per_minute = 6000
burst = 100

[ingest]
backoff_base_ms = 1
backoff_max_ms = 5
"#,
            db_path.display()
        ))
        .expect("Failed to parse test config");

        let source = Arc::new(MockTicketSource::new());
        let notifier = Arc::new(MockNotifier::new());

        let limiter = Arc::new(TokenBucketLimiter::new(&config.rate_limit));
        let breaker = Arc::new(CircuitBreaker::new(
            NOTIFY_CIRCUIT,
            config.circuit_breaker.clone(),
        ));
        let (dispatcher, worker) =
            create_notify_system(notifier.clone(), Arc::clone(&breaker), &config.notify);
        tokio::spawn(worker.run());

        let fetcher = PageFetcher::new(
            source.clone(),
            Arc::clone(&limiter),
            config.ingest.fetch_policy(Duration::from_secs(5)),
            PAGE_SIZE,
        );

        let parts = OrchestratorParts {
            locks: Arc::new(SqliteLockManager::new(&db_path).expect("Failed to create locks")),
            jobs: Arc::new(SqliteJobTracker::new(&db_path).expect("Failed to create jobs")),
            tickets: Arc::new(
                SqliteTicketStore::new(&db_path).expect("Failed to create ticket store"),
            ),
            classifier: Arc::new(KeywordClassifier::new().expect("Failed to build classifier")),
            fetcher,
            limiter,
            breaker,
            notifier: dispatcher,
            audit: AuditLogger::new(Arc::new(
                SqliteAuditStore::new(&db_path).expect("Failed to create audit store"),
            )),
        };
        let orchestrator = IngestionOrchestrator::new(config.ingest.clone(), parts);

        let state = Arc::new(AppState::new(config, orchestrator));
        let router = ticketsync_server::api::create_router(state);

        Self {
            router,
            source,
            notifier,
            temp_dir,
        }
    }

    /// Path of the database file shared by every store.
    pub fn db_path(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("test.db")
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path).await
    }

    /// Send a POST request without a body.
    pub async fn post(&self, path: &str) -> TestResponse {
        self.request("POST", path).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path).await
    }

    /// Start a run for `tenant_id` and return its job id.
    pub async fn start_run(&self, tenant_id: &str) -> String {
        let response = self
            .post(&format!("/api/v1/ingest/run?tenant_id={tenant_id}"))
            .await;
        assert_eq!(response.status, StatusCode::ACCEPTED, "{:?}", response.body);
        response.body["job_id"]
            .as_str()
            .expect("job_id in run response")
            .to_string()
    }

    /// Poll the progress endpoint until the job leaves `running`.
    pub async fn wait_for_job(&self, job_id: &str) -> Value {
        for _ in 0..200 {
            let response = self
                .get(&format!("/api/v1/ingest/progress/{job_id}"))
                .await;
            if response.body["status"] != "running" {
                return response.body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish in time");
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).into_owned();
        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body, text }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status, $response.status, $response.text
        );
    };
}
