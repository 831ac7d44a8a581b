//! Persistent write locks (`wc_lock`).
//!
//! A lock on directory `D` with `locked_levels = n` covers `D` and everything
//! up to `n` levels below it; `-1` means the whole subtree.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::relpath;

/// A write lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WcLock {
    pub local_dir_relpath: String,
    pub locked_levels: i64,
}

impl WcLock {
    /// True if this lock covers `local_relpath`.
    pub fn covers(&self, local_relpath: &str) -> bool {
        match relpath::skip_ancestor(&self.local_dir_relpath, local_relpath) {
            Some(below) => {
                self.locked_levels < 0 || relpath::depth(below) <= self.locked_levels
            }
            None => false,
        }
    }
}

/// All recorded locks.
pub fn list_locks(conn: &Connection) -> Result<Vec<WcLock>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT local_dir_relpath, locked_levels FROM wc_lock ORDER BY local_dir_relpath")?;
    let locks = stmt
        .query_map([], |row| {
            Ok(WcLock {
                local_dir_relpath: row.get(0)?,
                locked_levels: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(locks)
}

/// A recorded lock that overlaps `wanted`, if any.
pub fn find_overlapping(conn: &Connection, wanted: &WcLock) -> Result<Option<WcLock>, DatabaseError> {
    Ok(list_locks(conn)?.into_iter().find(|held| {
        held.covers(&wanted.local_dir_relpath) || wanted.covers(&held.local_dir_relpath)
    }))
}

pub fn insert_lock(conn: &Connection, lock: &WcLock) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO wc_lock (local_dir_relpath, locked_levels) VALUES (?1, ?2)",
        params![lock.local_dir_relpath, lock.locked_levels],
    )?;
    debug!(relpath = %lock.local_dir_relpath, levels = lock.locked_levels, "recorded write lock");
    Ok(())
}

pub fn delete_lock(conn: &Connection, local_dir_relpath: &str) -> Result<bool, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM wc_lock WHERE local_dir_relpath = ?1",
        params![local_dir_relpath],
    )?;
    Ok(deleted > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn lock(dir: &str, levels: i64) -> WcLock {
        WcLock {
            local_dir_relpath: dir.into(),
            locked_levels: levels,
        }
    }

    #[test]
    fn test_covers() {
        assert!(lock("", -1).covers("A/B/c"));
        assert!(lock("A", 0).covers("A"));
        assert!(!lock("A", 0).covers("A/B"));
        assert!(lock("A", 1).covers("A/B"));
        assert!(!lock("A", 1).covers("A/B/c"));
        assert!(!lock("A", -1).covers("X"));
    }

    #[test]
    fn test_overlap_detection() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let conn = db.conn();
        insert_lock(&conn, &lock("A", -1)).unwrap();

        assert!(find_overlapping(&conn, &lock("A/B", 0)).unwrap().is_some());
        assert!(find_overlapping(&conn, &lock("", -1)).unwrap().is_some());
        assert!(find_overlapping(&conn, &lock("X", -1)).unwrap().is_none());

        assert!(delete_lock(&conn, "A").unwrap());
        assert!(list_locks(&conn).unwrap().is_empty());
    }
}
