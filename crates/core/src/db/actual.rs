//! Working properties and conflict data (`actual_node`).

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::conflict::ConflictDescriptor;
use crate::db::nodes;
use crate::errors::DatabaseError;
use crate::models::Props;
use crate::relpath;

fn parent_of(local_relpath: &str) -> Option<&str> {
    (!local_relpath.is_empty()).then(|| relpath::dirname(local_relpath))
}

/// The conflict descriptor recorded on `local_relpath`, if any.
pub fn read_conflict(
    conn: &Connection,
    local_relpath: &str,
) -> Result<Option<ConflictDescriptor>, DatabaseError> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT conflict_data FROM actual_node WHERE local_relpath = ?1",
            params![local_relpath],
            |row| row.get(0),
        )
        .optional()?;
    match raw.flatten() {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// Record `conflict` on `local_relpath`, replacing whatever was there.
pub fn mark_conflict(
    conn: &Connection,
    local_relpath: &str,
    conflict: &ConflictDescriptor,
) -> Result<(), DatabaseError> {
    let data = serde_json::to_string(conflict)?;
    conn.execute(
        "INSERT INTO actual_node (local_relpath, parent_relpath, conflict_data) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (local_relpath) DO UPDATE SET conflict_data = excluded.conflict_data",
        params![local_relpath, parent_of(local_relpath), data],
    )?;
    debug!(relpath = %local_relpath, "recorded conflict");
    Ok(())
}

/// Working property overlay of `local_relpath`, if one is recorded.
pub fn read_actual_props(conn: &Connection, local_relpath: &str) -> Result<Option<Props>, DatabaseError> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT properties FROM actual_node WHERE local_relpath = ?1",
            params![local_relpath],
            |row| row.get(0),
        )
        .optional()?;
    match raw.flatten() {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// Pristine properties of the topmost present layer of `local_relpath`.
pub fn read_pristine_props(conn: &Connection, local_relpath: &str) -> Result<Option<Props>, DatabaseError> {
    Ok(nodes::top_layer(conn, local_relpath)?
        .filter(|row| row.presence.is_present())
        .map(|row| row.properties.unwrap_or_default()))
}

/// The properties a user sees on `local_relpath`: the working overlay if
/// present, otherwise the pristine properties, otherwise nothing.
pub fn read_props(conn: &Connection, local_relpath: &str) -> Result<Props, DatabaseError> {
    if let Some(actual) = read_actual_props(conn, local_relpath)? {
        return Ok(actual);
    }
    Ok(read_pristine_props(conn, local_relpath)?.unwrap_or_default())
}

/// Store (or with `None`, clear) the working property overlay.
pub fn set_actual_props(
    conn: &Connection,
    local_relpath: &str,
    props: Option<&Props>,
) -> Result<(), DatabaseError> {
    let encoded = nodes::encode_props(props)?;
    conn.execute(
        "INSERT INTO actual_node (local_relpath, parent_relpath, properties) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (local_relpath) DO UPDATE SET properties = excluded.properties",
        params![local_relpath, parent_of(local_relpath), encoded],
    )?;
    conn.execute(
        "DELETE FROM actual_node WHERE local_relpath = ?1 \
         AND properties IS NULL AND conflict_data IS NULL",
        params![local_relpath],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictAction, ConflictReason, Operation, TreeConflict};
    use crate::db::nodes::NodeRow;
    use crate::db::Database;
    use crate::models::{NodeKind, Presence};

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_read_props_falls_back_to_pristine() {
        let db = db();
        let conn = db.conn();
        let mut row = NodeRow::new("f", 0, Presence::Normal, NodeKind::File);
        row.properties = Some(Props::from([("a".to_string(), "1".to_string())]));
        nodes::insert_node(&conn, &row).unwrap();

        assert_eq!(read_props(&conn, "f").unwrap()["a"], "1");

        let mine = Props::from([("a".to_string(), "2".to_string())]);
        set_actual_props(&conn, "f", Some(&mine)).unwrap();
        assert_eq!(read_props(&conn, "f").unwrap()["a"], "2");

        set_actual_props(&conn, "f", None).unwrap();
        assert_eq!(read_props(&conn, "f").unwrap()["a"], "1");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM actual_node", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_conflict_survives_prop_clear() {
        let db = db();
        let conn = db.conn();
        let mut conflict = ConflictDescriptor::new(Operation::Update);
        conflict.tree = Some(TreeConflict {
            reason: ConflictReason::Edited,
            action: ConflictAction::Delete,
            move_src_op_root_relpath: None,
        });
        mark_conflict(&conn, "A/c.txt", &conflict).unwrap();
        set_actual_props(&conn, "A/c.txt", None).unwrap();

        let read = read_conflict(&conn, "A/c.txt").unwrap().unwrap();
        assert_eq!(read, conflict);
        assert!(read_conflict(&conn, "A/other").unwrap().is_none());
    }
}
