//! Identity store: the hub's sole persistence mechanism.
//!
//! A single SQLite file holds the allow-list, device registry, twin pairs,
//! API tokens and the device event log. Writes serialize on one connection
//! behind a mutex; every call runs on the blocking pool so the MQTT and HTTP
//! read loops stay responsive.

mod allowlist;
mod devices;
mod events;
mod tokens;
mod twins;

pub use events::EventQuery;
pub use tokens::TokenValidation;

use crate::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Handle to the identity store. Cheap to clone; all clones share the same
/// serialized connection.
#[derive(Clone)]
pub struct IdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("Cannot create store directory: {}", e)))?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(format!("Cannot open database: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store. Used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("Cannot open database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::from)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate_blocking()?;
        Ok(store)
    }

    /// Run a closure against the connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("Store worker failed: {}", e)))?
    }

    /// Apply the schema, migrating older shapes idempotently.
    fn migrate_blocking(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                uuid       TEXT PRIMARY KEY,
                name       TEXT NOT NULL UNIQUE,
                meta       TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS uuid_whitelist (
                uuid       TEXT PRIMARY KEY,
                note       TEXT,
                created_at TEXT NOT NULL,
                used_at    TEXT
            );
            CREATE TABLE IF NOT EXISTS twin_desired (
                device_id  TEXT PRIMARY KEY,
                version    INTEGER NOT NULL DEFAULT 0,
                doc        TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS twin_reported (
                device_id  TEXT PRIMARY KEY,
                version    INTEGER NOT NULL DEFAULT 0,
                doc        TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS device_events (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                topic     TEXT NOT NULL,
                payload   TEXT NOT NULL,
                ts        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_device_events_device_ts
                ON device_events (device_id, ts);
            CREATE TABLE IF NOT EXISTS api_tokens (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                token      TEXT NOT NULL UNIQUE,
                scopes     TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                last_used  TEXT,
                expires_at TEXT,
                active     INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        // Legacy allow-list shape carried a mandatory device_id column.
        // Detect it and rebuild the table with the relaxed schema.
        let has_device_id = {
            let mut stmt = tx
                .prepare("PRAGMA table_info(uuid_whitelist)")
                .map_err(StoreError::from)?;
            let mut found = false;
            let mut rows = stmt.query([]).map_err(StoreError::from)?;
            while let Some(row) = rows.next().map_err(StoreError::from)? {
                let column: String = row.get(1).map_err(StoreError::from)?;
                if column == "device_id" {
                    found = true;
                }
            }
            found
        };

        if has_device_id {
            info!("Migrating legacy uuid_whitelist schema");
            tx.execute_batch(
                r#"
                CREATE TABLE uuid_whitelist_new (
                    uuid       TEXT PRIMARY KEY,
                    note       TEXT,
                    created_at TEXT NOT NULL,
                    used_at    TEXT
                );
                INSERT INTO uuid_whitelist_new (uuid, note, created_at, used_at)
                    SELECT uuid, note, created_at, used_at FROM uuid_whitelist;
                DROP TABLE uuid_whitelist;
                ALTER TABLE uuid_whitelist_new RENAME TO uuid_whitelist;
                "#,
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        }

        tx.commit().map_err(|e| StoreError::Migration(e.to_string()))?;
        debug!("Store schema up to date");
        Ok(())
    }
}

/// Current timestamp in the store's text encoding
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored timestamp
pub(crate) fn parse_ts(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidValue(format!("Bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_and_migrate() {
        let store = IdentityStore::open_in_memory().unwrap();
        // Tables exist: a fresh query on each should succeed
        store
            .with_conn(|conn| {
                for table in [
                    "devices",
                    "uuid_whitelist",
                    "twin_desired",
                    "twin_reported",
                    "device_events",
                    "api_tokens",
                ] {
                    conn.query_row(
                        &format!("SELECT COUNT(*) FROM {}", table),
                        [],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(StoreError::from)?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_legacy_whitelist_migration() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE uuid_whitelist (
                uuid       TEXT PRIMARY KEY,
                device_id  TEXT NOT NULL,
                note       TEXT,
                created_at TEXT NOT NULL,
                used_at    TEXT
            );
            INSERT INTO uuid_whitelist (uuid, device_id, note, created_at, used_at)
                VALUES ('u-1', 'legacy-device', 'kept', '2024-01-01T00:00:00+00:00', NULL);
            "#,
        )
        .unwrap();

        let store = IdentityStore::from_connection(conn).unwrap();

        let entry = store.allowlist_check("u-1").await.unwrap().unwrap();
        assert_eq!(entry.uuid, "u-1");
        assert_eq!(entry.note.as_deref(), Some("kept"));
        assert!(entry.used_at.is_none());

        // The device_id column is gone
        let has_device_id = store
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("PRAGMA table_info(uuid_whitelist)")
                    .map_err(StoreError::from)?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(1))
                    .map_err(StoreError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StoreError::from)?;
                Ok(names.contains(&"device_id".to_string()))
            })
            .await
            .unwrap();
        assert!(!has_device_id);
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.migrate_blocking().unwrap();
        store.migrate_blocking().unwrap();
    }
}
