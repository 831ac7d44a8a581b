//! User-visible notifications and the spool that defers them.
//!
//! Events raised while a move-update transaction runs are appended to the
//! temporary `update_move_list` table on the same connection. Creating the
//! table is part of the transaction, so a rollback discards the spool along
//! with everything else. After commit, [`spool_flush`] hands the records to
//! the caller's callback in recording order and drops the table.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::debug;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{token_enum, NodeKind};

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    UpdateAdd,
    UpdateDelete,
    UpdateUpdate,
    TreeConflict,
    MoveBroken,
    /// Terminal event of an operation.
    OperationCompleted,
}

token_enum!(NotifyAction {
    UpdateAdd => "update-add",
    UpdateDelete => "update-delete",
    UpdateUpdate => "update-update",
    TreeConflict => "tree-conflict",
    MoveBroken => "move-broken",
    OperationCompleted => "operation-completed",
});

/// Outcome for the content or the properties of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    Inapplicable,
    Unknown,
    Unchanged,
    Missing,
    Obstructed,
    Changed,
    Merged,
    Conflicted,
}

token_enum!(NotifyState {
    Inapplicable => "inapplicable",
    Unknown => "unknown",
    Unchanged => "unchanged",
    Missing => "missing",
    Obstructed => "obstructed",
    Changed => "changed",
    Merged => "merged",
    Conflicted => "conflicted",
});

/// One event delivered to a notification callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Absolute path of the node.
    pub path: PathBuf,
    pub action: NotifyAction,
    pub kind: NodeKind,
    pub content_state: NotifyState,
    pub prop_state: NotifyState,
    pub old_revision: Option<i64>,
    pub revision: Option<i64>,
}

impl Notification {
    /// An event with both states inapplicable and no revisions.
    pub fn new(path: PathBuf, action: NotifyAction, kind: NodeKind) -> Self {
        Self {
            path,
            action,
            kind,
            content_state: NotifyState::Inapplicable,
            prop_state: NotifyState::Inapplicable,
            old_revision: None,
            revision: None,
        }
    }

    /// The terminal event for an operation on `path`.
    pub fn completed(path: PathBuf, revision: Option<i64>) -> Self {
        Self {
            revision,
            ..Self::new(path, NotifyAction::OperationCompleted, NodeKind::None)
        }
    }
}

/// Callback receiving notifications after commit.
pub type NotifyFn<'a> = &'a mut dyn FnMut(&Notification);

/// Borrow an optional callback for one more call site.
pub fn reborrow<'b>(notify: &'b mut Option<NotifyFn<'_>>) -> Option<NotifyFn<'b>> {
    match notify {
        Some(callback) => Some(&mut **callback),
        None => None,
    }
}

/// Deliver `notification` directly, bypassing the spool.
pub fn emit(notify: &mut Option<NotifyFn<'_>>, notification: &Notification) {
    if let Some(callback) = notify {
        callback(notification);
    }
}

// ---------------------------------------------------------------------------
// Spool
// ---------------------------------------------------------------------------

/// Start a fresh, empty spool inside the current transaction.
pub fn spool_create(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS temp.update_move_list;
         CREATE TEMP TABLE update_move_list (
             seq            INTEGER PRIMARY KEY AUTOINCREMENT,
             local_relpath  TEXT NOT NULL,
             action         TEXT NOT NULL,
             kind           TEXT NOT NULL,
             content_state  TEXT NOT NULL,
             prop_state     TEXT NOT NULL
         );",
    )?;
    Ok(())
}

/// Append one record to the spool.
pub fn spool_add(
    conn: &Connection,
    local_relpath: &str,
    action: NotifyAction,
    kind: NodeKind,
    content_state: NotifyState,
    prop_state: NotifyState,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO temp.update_move_list \
             (local_relpath, action, kind, content_state, prop_state) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![local_relpath, action, kind, content_state, prop_state],
    )?;
    debug!(relpath = %local_relpath, %action, %kind, "spooled notification");
    Ok(())
}

/// Deliver every spooled record to `notify`, then drop the spool.
///
/// Must run after the transaction that filled the spool has committed.
pub fn spool_flush(
    db: &Database,
    root: &Path,
    old_revision: Option<i64>,
    new_revision: Option<i64>,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), DatabaseError> {
    let records = {
        let conn = db.conn();
        let records = if notify.is_some() {
            read_spool(&conn, root, old_revision, new_revision)?
        } else {
            Vec::new()
        };
        conn.execute_batch("DROP TABLE IF EXISTS temp.update_move_list;")?;
        records
    };

    if let Some(notify) = notify {
        for record in &records {
            notify(record);
        }
    }
    Ok(())
}

fn read_spool(
    conn: &Connection,
    root: &Path,
    old_revision: Option<i64>,
    new_revision: Option<i64>,
) -> Result<Vec<Notification>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath, action, kind, content_state, prop_state \
         FROM temp.update_move_list ORDER BY seq",
    )?;
    let records = stmt
        .query_map([], |row| {
            let relpath: String = row.get(0)?;
            Ok(Notification {
                path: abspath(root, &relpath),
                action: row.get(1)?,
                kind: row.get(2)?,
                content_state: row.get(3)?,
                prop_state: row.get(4)?,
                old_revision,
                revision: new_revision,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

fn abspath(root: &Path, local_relpath: &str) -> PathBuf {
    if local_relpath.is_empty() {
        root.to_path_buf()
    } else {
        root.join(local_relpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_flush_in_recording_order() {
        let db = db();
        db.transaction(|conn| {
            spool_create(conn)?;
            spool_add(
                conn,
                "X/b",
                NotifyAction::UpdateAdd,
                NodeKind::File,
                NotifyState::Inapplicable,
                NotifyState::Inapplicable,
            )?;
            spool_add(
                conn,
                "X/a",
                NotifyAction::UpdateUpdate,
                NodeKind::File,
                NotifyState::Merged,
                NotifyState::Unchanged,
            )?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        let mut seen = Vec::new();
        let mut collect = |n: &Notification| seen.push(n.clone());
        spool_flush(&db, Path::new("/wc"), Some(1), Some(2), Some(&mut collect)).unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].path, PathBuf::from("/wc/X/b"));
        assert_eq!(seen[0].action, NotifyAction::UpdateAdd);
        assert_eq!(seen[1].content_state, NotifyState::Merged);
        assert_eq!(seen[1].old_revision, Some(1));
        assert_eq!(seen[1].revision, Some(2));

        // The spool is gone after the flush.
        let conn = db.conn();
        assert!(conn
            .prepare("SELECT 1 FROM temp.update_move_list")
            .is_err());
    }

    #[test]
    fn test_rollback_discards_spool() {
        let db = db();
        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            spool_create(conn)?;
            spool_add(
                conn,
                "X",
                NotifyAction::TreeConflict,
                NodeKind::Dir,
                NotifyState::Inapplicable,
                NotifyState::Inapplicable,
            )?;
            Err(DatabaseError::NotFound {
                entity: "node".into(),
                id: "X".into(),
            })
        });
        assert!(result.is_err());

        let mut count = 0;
        let mut counter = |_: &Notification| count += 1;
        spool_flush(&db, Path::new("/wc"), None, None, Some(&mut counter)).unwrap_err();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_completed_event() {
        let n = Notification::completed(PathBuf::from("/wc/A"), Some(7));
        assert_eq!(n.action, NotifyAction::OperationCompleted);
        assert_eq!(n.kind, NodeKind::None);
        assert_eq!(n.revision, Some(7));
        assert_eq!(NotifyState::Conflicted.to_string(), "conflicted");
    }
}
