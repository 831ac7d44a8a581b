//! Working-copy metadata schema.
//!
//! The schema is created in one step and its format number is kept in the
//! SQLite `user_version` pragma. Databases written by a newer format are
//! refused rather than reinterpreted.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// Format written by this library.
pub const FORMAT: u32 = 1;

static SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS repository (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        root    TEXT NOT NULL UNIQUE,
        uuid    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        local_relpath   TEXT    NOT NULL,
        op_depth        INTEGER NOT NULL,
        parent_relpath  TEXT,
        repos_id        INTEGER REFERENCES repository (id),
        repos_path      TEXT,
        revision        INTEGER,
        presence        TEXT    NOT NULL,
        moved_here      INTEGER,
        moved_to        TEXT,
        kind            TEXT    NOT NULL,
        properties      TEXT,
        depth           TEXT,
        checksum        TEXT,
        translated_size INTEGER,
        last_mod_time   INTEGER,
        PRIMARY KEY (local_relpath, op_depth)
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes (parent_relpath, op_depth);
    CREATE INDEX IF NOT EXISTS idx_nodes_moved_to ON nodes (moved_to, local_relpath);

    CREATE TABLE IF NOT EXISTS actual_node (
        local_relpath   TEXT PRIMARY KEY,
        parent_relpath  TEXT,
        properties      TEXT,
        conflict_data   TEXT
    );

    CREATE TABLE IF NOT EXISTS wc_lock (
        local_dir_relpath   TEXT PRIMARY KEY,
        locked_levels       INTEGER NOT NULL DEFAULT -1
    );

    CREATE TABLE IF NOT EXISTS work_queue (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        work    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pristine (
        checksum    TEXT PRIMARY KEY,
        size        INTEGER NOT NULL,
        refcount    INTEGER NOT NULL DEFAULT 0
    );
"#;

/// Create the schema if needed and check the stored format.
pub fn ensure_schema(conn: &Connection) -> Result<(), DatabaseError> {
    let current = get_format(conn)?;
    if current > FORMAT {
        return Err(DatabaseError::UnsupportedFormat {
            found: current,
            supported: FORMAT,
        });
    }
    if current == FORMAT {
        debug!(format = current, "working copy schema is current");
        return Ok(());
    }

    info!(format = FORMAT, "creating working copy schema");
    conn.execute_batch(SCHEMA)
        .map_err(|e| DatabaseError::SchemaFailed {
            version: FORMAT,
            detail: e.to_string(),
        })?;
    set_format(conn, FORMAT)?;
    Ok(())
}

/// Read the current format from the SQLite `user_version` pragma.
fn get_format(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_format(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
