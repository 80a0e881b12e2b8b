//! SQLite reference backend for the dual-store seam. The shared slot models
//! the per-object store travelling with the table (created by the privileged
//! client, readable by everyone); the world slot models the host-scoped
//! fallback. Both hold one JSON payload row keyed by a fixed slot id.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use contracts::SCHEMA_VERSION_V1;
use rusqlite::{params, Connection, OptionalExtension};
use watch_core::store::{FallbackStore, SharedState, SharedStoreHandle, StoreLocator};
use watch_core::StoreError;

const SHARED_SLOT_ID: &str = "watch-shared";
const WORLD_SLOT_ID: &str = "watch-world";

/// One SQLite database holding both store slots. Handles clone the inner
/// connection handle, so a locator and its shared store stay consistent.
pub struct SqliteStores {
    conn: Arc<Mutex<Connection>>,
    can_create: bool,
}

impl SqliteStores {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sqlite_error)?;
        Self::from_connection(conn, true)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Self::from_connection(conn, true)
    }

    /// A handle that refuses slot creation, mirroring an unprivileged client
    /// looking at a table whose owner never attached a store.
    pub fn read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(sqlite_error)?;
        Self::from_connection(conn, false)
    }

    fn from_connection(conn: Connection, can_create: bool) -> Result<Self, StoreError> {
        let stores = Self {
            conn: Arc::new(Mutex::new(conn)),
            can_create,
        };
        stores.configure()?;
        stores.migrate()?;
        Ok(stores)
    }

    pub fn locator(&self) -> Arc<dyn StoreLocator> {
        Arc::new(SqliteStoreLocator {
            conn: Arc::clone(&self.conn),
            can_create: self.can_create,
        })
    }

    pub fn fallback(&self) -> Arc<dyn FallbackStore> {
        Arc::new(SqliteFallbackStore {
            conn: Arc::clone(&self.conn),
        })
    }

    fn configure(&self) -> Result<(), StoreError> {
        let conn = lock_conn(&self.conn)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sqlite_error)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sqlite_error)?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = lock_conn(&self.conn)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shared_state (
                slot_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS world_state (
                slot_id TEXT PRIMARY KEY,
                schema_version TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            ",
        )
        .map_err(sqlite_error)?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
             VALUES(1, 'initial_v1', 'ms-0')",
            [],
        )
        .map_err(sqlite_error)?;

        Ok(())
    }
}

struct SqliteStoreLocator {
    conn: Arc<Mutex<Connection>>,
    can_create: bool,
}

#[async_trait]
impl StoreLocator for SqliteStoreLocator {
    async fn find(&self) -> Option<Arc<dyn SharedStoreHandle>> {
        let conn = lock_conn(&self.conn).ok()?;
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM shared_state WHERE slot_id = ?1",
                params![SHARED_SLOT_ID],
                |row| row.get(0),
            )
            .optional()
            .ok()?;
        drop(conn);
        row?;

        Some(Arc::new(SqliteSharedStore {
            conn: Arc::clone(&self.conn),
        }))
    }

    async fn create(&self) -> Result<Arc<dyn SharedStoreHandle>, StoreError> {
        if !self.can_create {
            return Err(StoreError::PermissionDenied(
                "store handle is read-only".to_string(),
            ));
        }

        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO shared_state (
                slot_id, schema_version, version, payload_json, updated_at_ms
             ) VALUES (?1, ?2, 0, '{}', 0)",
            params![SHARED_SLOT_ID, SCHEMA_VERSION_V1],
        )
        .map_err(sqlite_error)?;
        drop(conn);

        Ok(Arc::new(SqliteSharedStore {
            conn: Arc::clone(&self.conn),
        }))
    }
}

struct SqliteSharedStore {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl SharedStoreHandle for SqliteSharedStore {
    async fn read(&self) -> Result<Option<SharedState>, StoreError> {
        let conn = lock_conn(&self.conn)?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM shared_state WHERE slot_id = ?1 AND version > 0",
                params![SHARED_SLOT_ID],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<SharedState>(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, state: &SharedState) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(state)?;
        let conn = lock_conn(&self.conn)?;
        let affected = conn
            .execute(
                "INSERT INTO shared_state (
                    slot_id, schema_version, version, payload_json, updated_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(slot_id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    version = excluded.version,
                    payload_json = excluded.payload_json,
                    updated_at_ms = excluded.updated_at_ms",
                params![
                    SHARED_SLOT_ID,
                    state.organization.schema_version.as_str(),
                    i64::try_from(state.organization.version).unwrap_or(i64::MAX),
                    payload_json,
                    i64::try_from(state.organization.updated_at_ms).unwrap_or(i64::MAX),
                ],
            )
            .map_err(sqlite_error)?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

struct SqliteFallbackStore {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl FallbackStore for SqliteFallbackStore {
    async fn read(&self) -> Result<Option<contracts::Organization>, StoreError> {
        let conn = lock_conn(&self.conn)?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM world_state WHERE slot_id = ?1",
                params![WORLD_SLOT_ID],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_error)?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str::<contracts::Organization>(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, organization: &contracts::Organization) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(organization)?;
        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT INTO world_state (
                slot_id, schema_version, version, payload_json, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(slot_id) DO UPDATE SET
                schema_version = excluded.schema_version,
                version = excluded.version,
                payload_json = excluded.payload_json,
                updated_at_ms = excluded.updated_at_ms",
            params![
                WORLD_SLOT_ID,
                organization.schema_version.as_str(),
                i64::try_from(organization.version).unwrap_or(i64::MAX),
                payload_json,
                i64::try_from(organization.updated_at_ms).unwrap_or(i64::MAX),
            ],
        )
        .map_err(sqlite_error)?;
        Ok(())
    }
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock()
        .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))
}

fn sqlite_error(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::Organization;

    #[tokio::test]
    async fn shared_slot_round_trips_through_json() {
        let stores = SqliteStores::open_in_memory().expect("open in-memory db");
        let locator = stores.locator();

        assert!(locator.find().await.is_none());

        let handle = locator.create().await.expect("privileged create");
        assert!(handle.read().await.expect("read works").is_none());

        let mut organization = Organization::new_default(42);
        organization.version = 3;
        organization.name = "Harbor Watch".to_string();
        let state = SharedState {
            organization,
            patrols: Vec::new(),
        };
        handle.write(&state).await.expect("write works");

        let reloaded = handle
            .read()
            .await
            .expect("read works")
            .expect("state present");
        assert_eq!(reloaded, state);

        // Once created, discovery succeeds.
        assert!(locator.find().await.is_some());
    }

    #[tokio::test]
    async fn read_only_handle_refuses_slot_creation() {
        let dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        let path = dir.join(format!("watch_store_ro_{nanos}.sqlite"));

        let stores = SqliteStores::read_only(&path).expect("open db");
        let locator = stores.locator();
        assert!(matches!(
            locator.create().await,
            Err(StoreError::PermissionDenied(_))
        ));

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
    }

    #[tokio::test]
    async fn world_slot_keeps_the_latest_copy() {
        let stores = SqliteStores::open_in_memory().expect("open in-memory db");
        let fallback = stores.fallback();

        assert!(fallback.read().await.expect("read works").is_none());

        let mut organization = Organization::new_default(1);
        fallback.write(&organization).await.expect("first write");
        organization.version = 2;
        organization.subtitle = "second".to_string();
        fallback.write(&organization).await.expect("second write");

        let reloaded = fallback
            .read()
            .await
            .expect("read works")
            .expect("present");
        assert_eq!(reloaded.version, 2);
        assert_eq!(reloaded.subtitle, "second");
    }
}
