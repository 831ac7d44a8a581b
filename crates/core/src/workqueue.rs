//! Deferred filesystem work.
//!
//! Items are queued inside the transaction that decides on them and only run
//! after it commits, so a rolled-back operation never touches working files.
//! Every item can be replayed: removals tolerate a missing target and
//! installs overwrite.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::nodes;
use crate::errors::{DatabaseError, WorkQueueError};
use crate::models::Checksum;
use crate::modcheck;
use crate::pristine;
use crate::wcroot::WcRoot;

/// One deferred filesystem action, addressed by working-copy relpath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkItem {
    /// Materialize the pristine text `checksum` at `relpath`.
    FileInstall {
        relpath: String,
        checksum: Checksum,
        #[serde(default)]
        record_file_info: bool,
    },
    FileRemove {
        relpath: String,
    },
    DirInstall {
        relpath: String,
    },
    /// Remove a directory. A non-recursive removal leaves a non-empty
    /// directory in place.
    DirRemove {
        relpath: String,
        #[serde(default)]
        recursive: bool,
    },
    /// Copy a working file, as it is when the item runs.
    FileCopy {
        src_relpath: String,
        dst_relpath: String,
    },
    FileWrite {
        relpath: String,
        text: String,
    },
    /// Write a property reject file.
    PrejInstall {
        relpath: String,
        text: String,
    },
}

impl WorkItem {
    /// The path the item changes.
    pub fn target(&self) -> &str {
        match self {
            Self::FileInstall { relpath, .. }
            | Self::FileRemove { relpath }
            | Self::DirInstall { relpath }
            | Self::DirRemove { relpath, .. }
            | Self::FileWrite { relpath, .. }
            | Self::PrejInstall { relpath, .. } => relpath,
            Self::FileCopy { dst_relpath, .. } => dst_relpath,
        }
    }
}

/// Queue `item` and return its id.
pub fn add(conn: &Connection, item: &WorkItem) -> Result<i64, DatabaseError> {
    let work = serde_json::to_string(item)?;
    conn.execute("INSERT INTO work_queue (work) VALUES (?1)", params![work])?;
    let id = conn.last_insert_rowid();
    debug!(id, target = %item.target(), "queued work item");
    Ok(id)
}

/// All queued items in execution order.
pub fn list(conn: &Connection) -> Result<Vec<(i64, WorkItem)>, WorkQueueError> {
    let mut stmt = conn
        .prepare("SELECT id, work FROM work_queue ORDER BY id")
        .map_err(DatabaseError::from)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(DatabaseError::from)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(DatabaseError::from)?;
    rows.into_iter().map(|(id, work)| decode(id, &work)).collect()
}

fn decode(id: i64, work: &str) -> Result<(i64, WorkItem), WorkQueueError> {
    serde_json::from_str(work)
        .map(|item| (id, item))
        .map_err(|e| WorkQueueError::InvalidItem {
            id,
            detail: e.to_string(),
        })
}

fn next_item(conn: &Connection) -> Result<Option<(i64, WorkItem)>, WorkQueueError> {
    let row: Option<(i64, String)> = conn
        .query_row("SELECT id, work FROM work_queue ORDER BY id LIMIT 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()
        .map_err(DatabaseError::from)?;
    row.map(|(id, work)| decode(id, &work)).transpose()
}

/// Run every queued item in order, removing each once it has been applied.
/// Returns the number of items run.
pub fn run(wc: &WcRoot) -> Result<usize, WorkQueueError> {
    let mut count = 0;
    loop {
        let next = next_item(&wc.db().conn())?;
        let Some((id, item)) = next else {
            break;
        };

        let file_info = apply(wc, &item)?;
        wc.db().transaction(|conn| {
            if let (Some((size, mtime)), WorkItem::FileInstall { relpath, .. }) = (file_info, &item) {
                nodes::set_recorded_info(conn, relpath, Some(size), Some(mtime))?;
            }
            conn.execute("DELETE FROM work_queue WHERE id = ?1", params![id])
                .map_err(DatabaseError::from)?;
            Ok::<_, WorkQueueError>(())
        })?;
        count += 1;
    }

    if count > 0 {
        info!(count, "work queue completed");
    }
    Ok(count)
}

/// Apply one item. For a file install that records file info, returns the
/// installed file's size and mtime.
fn apply(wc: &WcRoot, item: &WorkItem) -> Result<Option<(i64, i64)>, WorkQueueError> {
    debug!(?item, "running work item");
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source| WorkQueueError::Io { path, source }
    };

    match item {
        WorkItem::FileInstall {
            relpath,
            checksum,
            record_file_info,
        } => {
            let src = pristine::get_path(&wc.pristine_dir(), checksum)?;
            let dst = wc.abspath(relpath);
            create_parent(&dst).map_err(io_err(&dst))?;
            let tmp = dst.with_file_name(format!(".{}.tmp", crate::relpath::basename(relpath)));
            std::fs::copy(&src, &tmp).map_err(io_err(&tmp))?;
            std::fs::rename(&tmp, &dst).map_err(io_err(&dst))?;
            if *record_file_info {
                return modcheck::file_info(&dst).map(Some).map_err(io_err(&dst));
            }
        }
        WorkItem::FileRemove { relpath } => {
            let path = wc.abspath(relpath);
            ignore_missing(std::fs::remove_file(&path)).map_err(io_err(&path))?;
        }
        WorkItem::DirInstall { relpath } => {
            let path = wc.abspath(relpath);
            std::fs::create_dir_all(&path).map_err(io_err(&path))?;
        }
        WorkItem::DirRemove { relpath, recursive } => {
            let path = wc.abspath(relpath);
            if *recursive {
                ignore_missing(std::fs::remove_dir_all(&path)).map_err(io_err(&path))?;
            } else {
                remove_dir_if_empty(&path).map_err(io_err(&path))?;
            }
        }
        WorkItem::FileCopy {
            src_relpath,
            dst_relpath,
        } => {
            let src = wc.abspath(src_relpath);
            let dst = wc.abspath(dst_relpath);
            std::fs::copy(&src, &dst).map_err(io_err(&dst))?;
        }
        WorkItem::FileWrite { relpath, text } | WorkItem::PrejInstall { relpath, text } => {
            let path = wc.abspath(relpath);
            create_parent(&path).map_err(io_err(&path))?;
            std::fs::write(&path, text).map_err(io_err(&path))?;
        }
    }
    Ok(None)
}

fn create_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_dir_if_empty(path: &Path) -> std::io::Result<()> {
    let mut entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if entries.next().is_some() {
        warn!(path = %path.display(), "directory not empty, leaving it in place");
        return Ok(());
    }
    std::fs::remove_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WcConfig;
    use crate::db::nodes::NodeRow;
    use crate::models::{NodeKind, Presence};

    fn setup() -> (tempfile::TempDir, WcRoot) {
        let dir = tempfile::tempdir().unwrap();
        let wc = WcRoot::open(dir.path(), WcConfig::default()).unwrap();
        (dir, wc)
    }

    #[test]
    fn test_stored_form_is_tagged() {
        let item = WorkItem::DirRemove {
            relpath: "X".into(),
            recursive: false,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"type\":\"dir_remove\""));
        assert_eq!(serde_json::from_str::<WorkItem>(&json).unwrap(), item);
    }

    #[test]
    fn test_run_in_order_and_record_info() {
        let (_dir, wc) = setup();
        let checksum = {
            let conn = wc.db().conn();
            let checksum = pristine::install(&conn, &wc.pristine_dir(), b"text\n").unwrap();
            let mut row = NodeRow::new("X/f", 1, Presence::Normal, NodeKind::File);
            row.checksum = Some(checksum.clone());
            nodes::insert_node(&conn, &row).unwrap();

            add(&conn, &WorkItem::DirInstall { relpath: "X".into() }).unwrap();
            add(
                &conn,
                &WorkItem::FileInstall {
                    relpath: "X/f".into(),
                    checksum: checksum.clone(),
                    record_file_info: true,
                },
            )
            .unwrap();
            add(
                &conn,
                &WorkItem::PrejInstall {
                    relpath: "X/dir_conflicts.prej".into(),
                    text: "conflict\n".into(),
                },
            )
            .unwrap();
            assert_eq!(list(&conn).unwrap().len(), 3);
            checksum
        };

        assert_eq!(run(&wc).unwrap(), 3);
        assert_eq!(std::fs::read(wc.abspath("X/f")).unwrap(), b"text\n");
        assert!(wc.abspath("X/dir_conflicts.prej").is_file());

        let conn = wc.db().conn();
        assert!(list(&conn).unwrap().is_empty());
        let row = nodes::depth_get_info(&conn, "X/f", 1).unwrap().unwrap();
        assert_eq!(row.translated_size, Some(5));
        assert!(row.last_mod_time.is_some());
        assert_eq!(row.checksum, Some(checksum));
    }

    #[test]
    fn test_removals_are_idempotent() {
        let (_dir, wc) = setup();
        std::fs::create_dir_all(wc.abspath("D/keep")).unwrap();
        {
            let conn = wc.db().conn();
            add(&conn, &WorkItem::FileRemove { relpath: "missing".into() }).unwrap();
            add(
                &conn,
                &WorkItem::DirRemove {
                    relpath: "D".into(),
                    recursive: false,
                },
            )
            .unwrap();
            add(
                &conn,
                &WorkItem::DirRemove {
                    relpath: "gone".into(),
                    recursive: true,
                },
            )
            .unwrap();
        }
        assert_eq!(run(&wc).unwrap(), 3);
        assert!(wc.abspath("D/keep").is_dir());
    }

    #[test]
    fn test_missing_pristine_fails_and_keeps_item() {
        let (_dir, wc) = setup();
        {
            let conn = wc.db().conn();
            add(
                &conn,
                &WorkItem::FileInstall {
                    relpath: "f".into(),
                    checksum: Checksum("cd".repeat(32)),
                    record_file_info: false,
                },
            )
            .unwrap();
        }
        assert!(matches!(run(&wc), Err(WorkQueueError::Pristine(_))));
        assert_eq!(list(&wc.db().conn()).unwrap().len(), 1);
    }
}
