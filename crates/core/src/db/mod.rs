//! The working-copy metadata store.
//!
//! [`Database`] owns the single SQLite connection of a working copy. The
//! layered node table, conflict storage, write locks and the work queue are
//! reached through the free functions in the sub-modules, which all take a
//! plain `&Connection` and so compose inside [`Database::transaction`].

pub mod actual;
pub mod locks;
pub mod nodes;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// Handle on a working copy's `wc.db`.
///
/// Temporary tables such as the notification spool live on this connection
/// only, so every caller shares it through the mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<(), DatabaseError> {
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))?;
    Ok(())
}

impl Database {
    /// Open `path`, creating the file if needed, in WAL journal mode.
    pub fn new<P: AsRef<Path>>(path: P, busy_timeout_ms: u64) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening working copy database");

        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        configure(&conn, busy_timeout_ms)?;
        debug!(journal_mode = %mode, busy_timeout_ms, "database ready");

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// A throwaway store, for unit tests.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, 0)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Install the schema on a fresh store, or check the format of an
    /// existing one.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::ensure_schema(&self.conn())
    }

    /// Lock the connection. A poisoned mutex is recovered.
    ///
    /// The guard must be dropped before calling anything that locks the
    /// connection again.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("working copy database mutex poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` as one transaction: commit on `Ok`, roll back on `Err`.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repos_count(db: &Database) -> i64 {
        db.conn()
            .query_row("SELECT COUNT(*) FROM repository", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_open_on_disk_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wc.db");
        let db = Database::new(&path, 250).unwrap();
        db.initialize().unwrap();

        let mode: String = db
            .conn()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[test]
    fn test_initialize_twice() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.initialize().unwrap();
        assert_eq!(repos_count(&db), 0);
    }

    #[test]
    fn test_committed_rows_are_visible() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let id = db
            .transaction(|conn| {
                conn.execute(
                    "INSERT INTO repository (root, uuid) VALUES ('file:///repo', 'u-1')",
                    [],
                )?;
                Ok::<_, DatabaseError>(conn.last_insert_rowid())
            })
            .unwrap();

        assert!(id > 0);
        assert_eq!(repos_count(&db), 1);
    }

    #[test]
    fn test_failed_transaction_discards_rows_and_temp_tables() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute_batch(
                "CREATE TEMP TABLE scratch (x INTEGER);
                 INSERT INTO repository (root, uuid) VALUES ('file:///gone', 'u-2');",
            )?;
            Err(DatabaseError::NotFound {
                entity: "node".into(),
                id: "A/missing".into(),
            })
        });
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
        assert_eq!(repos_count(&db), 0);

        let scratch: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'scratch'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scratch, 0);
    }
}
