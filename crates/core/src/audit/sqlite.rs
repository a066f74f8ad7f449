use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use super::{AuditError, AuditFilter, AuditStore, IngestionLogEntry};
use crate::db::{dt_to_text, open_connection, open_in_memory, parse_rfc3339};
use crate::job::JobStatus;

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Create a new SQLite audit store, creating the database file and tables if needed
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        let conn = open_connection(path).map_err(|e| AuditError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite audit store (useful for testing)
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = open_in_memory().map_err(|e| AuditError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                final_status TEXT NOT NULL,
                pages_fetched INTEGER NOT NULL,
                tickets_upserted INTEGER NOT NULL,
                tickets_soft_deleted INTEGER NOT NULL,
                tickets_unchanged INTEGER NOT NULL,
                notifications_queued INTEGER NOT NULL,
                notifications_dropped INTEGER NOT NULL,
                error_summary TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_ingestion_logs_tenant_started ON ingestion_logs(tenant_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_ingestion_logs_job_id ON ingestion_logs(job_id);
            "#,
        )
        .map_err(|e| AuditError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Database("audit store mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &AuditFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push("tenant_id = ?");
            params.push(Box::new(tenant_id.clone()));
        }

        if let Some(ref job_id) = filter.job_id {
            conditions.push("job_id = ?");
            params.push(Box::new(job_id.clone()));
        }

        if let Some(status) = filter.final_status {
            conditions.push("final_status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref from) = filter.from {
            conditions.push("started_at >= ?");
            params.push(Box::new(dt_to_text(*from)));
        }

        if let Some(ref to) = filter.to {
            conditions.push("started_at <= ?");
            params.push(Box::new(dt_to_text(*to)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<IngestionLogEntry> {
        let started_at: String = row.get(3)?;
        let finished_at: String = row.get(4)?;
        let final_status: String = row.get(5)?;

        Ok(IngestionLogEntry {
            id: row.get(0)?,
            job_id: row.get(1)?,
            tenant_id: row.get(2)?,
            started_at: parse_rfc3339(&started_at),
            finished_at: parse_rfc3339(&finished_at),
            final_status: JobStatus::parse(&final_status).unwrap_or(JobStatus::Failed),
            pages_fetched: row.get(6)?,
            tickets_upserted: row.get(7)?,
            tickets_soft_deleted: row.get(8)?,
            tickets_unchanged: row.get(9)?,
            notifications_queued: row.get(10)?,
            notifications_dropped: row.get(11)?,
            error_summary: row.get(12)?,
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, entry: &IngestionLogEntry) -> Result<i64, AuditError> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO ingestion_logs (job_id, tenant_id, started_at, finished_at, final_status, pages_fetched, tickets_upserted, tickets_soft_deleted, tickets_unchanged, notifications_queued, notifications_dropped, error_summary) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.job_id,
                entry.tenant_id,
                dt_to_text(entry.started_at),
                dt_to_text(entry.finished_at),
                entry.final_status.as_str(),
                entry.pages_fetched,
                entry.tickets_upserted,
                entry.tickets_soft_deleted,
                entry.tickets_unchanged,
                entry.notifications_queued,
                entry.notifications_dropped,
                entry.error_summary,
            ],
        )
        .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<IngestionLogEntry>, AuditError> {
        let conn = self.conn()?;

        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT id, job_id, tenant_id, started_at, finished_at, final_status, pages_fetched, tickets_upserted, tickets_soft_deleted, tickets_unchanged, notifications_queued, notifications_dropped, error_summary FROM ingestion_logs {} ORDER BY started_at DESC, id DESC LIMIT ? OFFSET ?",
            where_clause
        );

        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let entries = stmt
            .query_map(param_refs.as_slice(), Self::row_to_entry)
            .map_err(|e| AuditError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(entries)
    }

    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!("SELECT COUNT(*) FROM ingestion_logs {}", where_clause);

        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let count: i64 = conn
            .query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))?;

        Ok(count)
    }
}
