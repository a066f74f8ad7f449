use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Job, JobError, JobStatus, JobTracker};
use crate::db::{dt_to_ms, ms_to_dt, open_connection, open_in_memory};

const JOB_COLUMNS: &str = "job_id, tenant_id, status, processed_pages, total_pages_estimate, cancellation_requested, created_at_ms, finished_at_ms";

/// SQLite-backed job tracker.
pub struct SqliteJobTracker {
    conn: Mutex<Connection>,
}

impl SqliteJobTracker {
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = open_connection(path).map_err(|e| JobError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, JobError> {
        let conn = open_in_memory().map_err(|e| JobError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_jobs (
                job_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                processed_pages INTEGER NOT NULL DEFAULT 0,
                total_pages_estimate INTEGER,
                cancellation_requested INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                finished_at_ms INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_tenant_status ON ingestion_jobs(tenant_id, status);
            "#,
        )
        .map_err(|e| JobError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JobError> {
        self.conn
            .lock()
            .map_err(|_| JobError::Database("job store mutex poisoned".to_string()))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status: String = row.get(2)?;
        let finished_at_ms: Option<i64> = row.get(7)?;
        Ok(Job {
            job_id: row.get(0)?,
            tenant_id: row.get(1)?,
            // Only this module writes the column.
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
            processed_pages: row.get(3)?,
            total_pages_estimate: row.get(4)?,
            cancellation_requested: row.get(5)?,
            created_at: ms_to_dt(row.get(6)?),
            finished_at: finished_at_ms.map(ms_to_dt),
        })
    }

    fn get_with(conn: &Connection, job_id: &str) -> Result<Option<Job>, JobError> {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE job_id = ?1"),
            params![job_id],
            Self::row_to_job,
        )
        .optional()
        .map_err(|e| JobError::Database(e.to_string()))
    }
}

impl JobTracker for SqliteJobTracker {
    fn create(&self, job_id: &str, tenant_id: &str) -> Result<Job, JobError> {
        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO ingestion_jobs (job_id, tenant_id, status, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, tenant_id, JobStatus::Running.as_str(), dt_to_ms(now)],
        )
        .map_err(|e| JobError::Database(e.to_string()))?;

        Ok(Job {
            job_id: job_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: JobStatus::Running,
            processed_pages: 0,
            total_pages_estimate: None,
            cancellation_requested: false,
            created_at: ms_to_dt(dt_to_ms(now)),
            finished_at: None,
        })
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.conn()?;
        Self::get_with(&conn, job_id)
    }

    fn update_progress(
        &self,
        job_id: &str,
        processed_pages: u32,
        total_pages_estimate: Option<u32>,
    ) -> Result<(), JobError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE ingestion_jobs SET processed_pages = ?1, total_pages_estimate = ?2 WHERE job_id = ?3",
                params![processed_pages, total_pages_estimate, job_id],
            )
            .map_err(|e| JobError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(JobError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn request_cancellation(&self, job_id: &str) -> Result<(), JobError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE ingestion_jobs SET cancellation_requested = 1 WHERE job_id = ?1 AND status = 'running'",
                params![job_id],
            )
            .map_err(|e| JobError::Database(e.to_string()))?;

        if changed == 1 {
            return Ok(());
        }
        match Self::get_with(&conn, job_id)? {
            Some(job) => Err(JobError::AlreadyTerminal {
                job_id: job.job_id,
                status: job.status,
            }),
            None => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    fn is_cancellation_requested(&self, job_id: &str) -> Result<bool, JobError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cancellation_requested FROM ingestion_jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get::<_, bool>(0),
        )
        .optional()
        .map_err(|e| JobError::Database(e.to_string()))?
        .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    fn finalize(&self, job_id: &str, status: JobStatus) -> Result<bool, JobError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE ingestion_jobs SET status = ?1, finished_at_ms = ?2 WHERE job_id = ?3 AND status = 'running'",
                params![status.as_str(), dt_to_ms(Utc::now()), job_id],
            )
            .map_err(|e| JobError::Database(e.to_string()))?;
        Ok(changed == 1)
    }

    fn running_for_tenant(&self, tenant_id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE tenant_id = ?1 AND status = 'running' ORDER BY created_at_ms DESC LIMIT 1"
            ),
            params![tenant_id],
            Self::row_to_job,
        )
        .optional()
        .map_err(|e| JobError::Database(e.to_string()))
    }

    fn running_jobs(&self, tenant_id: Option<&str>) -> Result<Vec<Job>, JobError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE status = 'running' AND (?1 IS NULL OR tenant_id = ?1) ORDER BY created_at_ms, job_id"
            ))
            .map_err(|e| JobError::Database(e.to_string()))?;
        let jobs = stmt
            .query_map(params![tenant_id], Self::row_to_job)
            .map_err(|e| JobError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| JobError::Database(e.to_string()))?;
        Ok(jobs)
    }
}
