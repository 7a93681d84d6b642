//! SQLite-backed [`PersistenceGateway`].
//!
//! A single `kv_store` table in WAL mode. Expired rows are invisible to
//! reads immediately and physically removed by [`SqliteGateway::purge_expired`].

use crate::clock::SharedClock;
use crate::error::{CoreError, CoreResult};
use crate::persistence::PersistenceGateway;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub struct SqliteGateway {
    conn: Mutex<Connection>,
    clock: SharedClock,
}

impl SqliteGateway {
    /// Create or open a store at the specified path.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> CoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening persistence store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Private in-memory database (no WAL).
    pub fn open_in_memory(clock: SharedClock) -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn init_schema(conn: &Connection) -> CoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv_store(expires_at);
            "#,
        )?;
        Ok(())
    }

    /// Delete expired rows, returning how many were removed.
    pub fn purge_expired(&self) -> CoreResult<usize> {
        let now = self.clock.now_ms() as i64;
        let removed = self.conn.lock().execute(
            "DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            debug!(removed, "Purged expired entries");
        }
        Ok(removed)
    }
}

impl PersistenceGateway for SqliteGateway {
    fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CoreResult<()> {
        let now = self.clock.now_ms();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as u64) as i64);
        self.conn.lock().execute(
            r#"
            INSERT INTO kv_store (key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![key, value, expires_at, now as i64],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let now = self.clock.now_ms() as i64;
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                r#"
                SELECT value FROM kv_store
                WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                "#,
                params![key, now],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn scan(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let now = self.clock.now_ms() as i64;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT key, value FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
              AND (expires_at IS NULL OR expires_at > ?2)
            ORDER BY key ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![prefix, now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)?;
        Ok(rows)
    }

    fn delete(&self, key: &str) -> CoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}
