use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{LockError, LockManager, LockStatus};
use crate::db::{dt_to_ms, ms_to_dt, open_connection, open_in_memory};

/// SQLite-backed lock manager.
pub struct SqliteLockManager {
    conn: Mutex<Connection>,
}

impl SqliteLockManager {
    pub fn new(path: &Path) -> Result<Self, LockError> {
        let conn = open_connection(path).map_err(|e| LockError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, LockError> {
        let conn = open_in_memory().map_err(|e| LockError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LockError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_locks (
                tenant_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| LockError::Database(e.to_string()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LockError> {
        self.conn
            .lock()
            .map_err(|_| LockError::Database("lock store mutex poisoned".to_string()))
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl LockManager for SqliteLockManager {
    fn acquire(&self, tenant_id: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let conn = self.conn()?;
        let now = dt_to_ms(Utc::now());
        let expires = now.saturating_add(ttl_ms(ttl));

        // Insert, or take over a row whose expiry is in the past. A live row
        // makes the upsert's WHERE false and nothing changes.
        let changed = conn
            .execute(
                r#"
                INSERT INTO ingest_locks (tenant_id, owner, acquired_at_ms, expires_at_ms)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(tenant_id) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms
                WHERE ingest_locks.expires_at_ms < ?3
                "#,
                params![tenant_id, owner, now, expires],
            )
            .map_err(|e| LockError::Database(e.to_string()))?;

        debug!(tenant_id, owner, acquired = changed == 1, "Lock acquire attempt");
        Ok(changed == 1)
    }

    fn refresh(&self, tenant_id: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let conn = self.conn()?;
        let expires = dt_to_ms(Utc::now()).saturating_add(ttl_ms(ttl));
        let changed = conn
            .execute(
                "UPDATE ingest_locks SET expires_at_ms = ?1 WHERE tenant_id = ?2 AND owner = ?3",
                params![expires, tenant_id, owner],
            )
            .map_err(|e| LockError::Database(e.to_string()))?;
        Ok(changed == 1)
    }

    fn release(&self, tenant_id: &str, owner: &str) -> Result<(), LockError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM ingest_locks WHERE tenant_id = ?1 AND owner = ?2",
            params![tenant_id, owner],
        )
        .map_err(|e| LockError::Database(e.to_string()))?;
        Ok(())
    }

    fn status(&self, tenant_id: &str) -> Result<Option<LockStatus>, LockError> {
        let conn = self.conn()?;
        let now = dt_to_ms(Utc::now());
        conn.query_row(
            "SELECT tenant_id, owner, acquired_at_ms, expires_at_ms FROM ingest_locks WHERE tenant_id = ?1",
            params![tenant_id],
            |row| {
                let expires_at_ms: i64 = row.get(3)?;
                Ok(LockStatus {
                    tenant_id: row.get(0)?,
                    owner: row.get(1)?,
                    acquired_at: ms_to_dt(row.get(2)?),
                    expires_at: ms_to_dt(expires_at_ms),
                    is_expired: expires_at_ms < now,
                })
            },
        )
        .optional()
        .map_err(|e| LockError::Database(e.to_string()))
    }

    fn cleanup_expired(&self) -> Result<usize, LockError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM ingest_locks WHERE expires_at_ms < ?1",
            params![dt_to_ms(Utc::now())],
        )
        .map_err(|e| LockError::Database(e.to_string()))
    }
}
