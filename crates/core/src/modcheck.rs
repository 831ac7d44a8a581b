//! Detection of local modifications below a move destination.

use std::path::Path;
use std::time::UNIX_EPOCH;

use rusqlite::Connection;
use tracing::debug;

use crate::db::nodes::{self, NodeRow};
use crate::db::actual;
use crate::errors::WcError;
use crate::models::{NodeKind, Presence};
use crate::pristine;
use crate::wcroot::WcRoot;

/// What [`node_has_local_mods`] found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalMods {
    pub modified: bool,
    /// Every modification found is a local deletion.
    pub all_deletes: bool,
}

#[derive(Default)]
struct Findings {
    deletes: bool,
    edits: bool,
}

impl Findings {
    fn finish(self) -> LocalMods {
        LocalMods {
            modified: self.deletes || self.edits,
            all_deletes: self.deletes && !self.edits,
        }
    }
}

/// Check `local_relpath` and everything below it for changes relative to
/// the layer at `baseline_op_depth`.
pub fn node_has_local_mods(
    wc: &WcRoot,
    conn: &Connection,
    local_relpath: &str,
    baseline_op_depth: i64,
) -> Result<LocalMods, WcError> {
    let mut found = Findings::default();

    for relpath in nodes::subtree_relpaths(conn, local_relpath)? {
        if actual::read_conflict(conn, &relpath)?.is_some() {
            debug!(relpath = %relpath, "conflicted");
            found.edits = true;
            break;
        }

        if let Some(layer) = nodes::lowest_working_node(conn, &relpath, baseline_op_depth)? {
            if layer.presence == Presence::BaseDeleted {
                found.deletes = true;
                continue;
            }
            debug!(relpath = %relpath, op_depth = layer.op_depth, "local layer above baseline");
            found.edits = true;
            break;
        }

        let Some(row) = nodes::depth_get_info(conn, &relpath, baseline_op_depth)? else {
            continue;
        };
        if !row.presence.is_present() {
            continue;
        }
        if row_is_modified(wc, conn, &row)? {
            found.edits = true;
            break;
        }
    }

    Ok(found.finish())
}

fn row_is_modified(wc: &WcRoot, conn: &Connection, row: &NodeRow) -> Result<bool, WcError> {
    let relpath = row.local_relpath.as_str();

    if let Some(props) = actual::read_actual_props(conn, relpath)? {
        if props != row.properties.clone().unwrap_or_default() {
            debug!(relpath = %relpath, "property modification");
            return Ok(true);
        }
    }

    let on_disk = NodeKind::on_disk(&wc.abspath(relpath))?;
    let expected = if row.kind.is_file_like() {
        NodeKind::File
    } else {
        row.kind
    };
    if on_disk != expected {
        debug!(relpath = %relpath, %on_disk, %expected, "missing or obstructed");
        return Ok(true);
    }

    if row.kind.is_file_like() {
        return is_file_modified(wc, row);
    }
    Ok(false)
}

/// True if the working file for `row` differs from its pristine text.
///
/// Matching recorded size and mtime are taken as proof that the file is
/// unchanged; otherwise the contents are hashed.
pub fn is_file_modified(wc: &WcRoot, row: &NodeRow) -> Result<bool, WcError> {
    let path = wc.abspath(&row.local_relpath);
    let Some(checksum) = &row.checksum else {
        return Ok(true);
    };

    let (size, mtime) = match file_info(&path) {
        Ok(info) => info,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };
    if row.translated_size == Some(size) && row.last_mod_time == Some(mtime) {
        return Ok(false);
    }

    let content = std::fs::read(&path)?;
    let modified = pristine::checksum_of(&content) != *checksum;
    debug!(relpath = %row.local_relpath, modified, "compared against pristine");
    Ok(modified)
}

/// Size in bytes and modification time in microseconds since the epoch.
pub fn file_info(path: &Path) -> std::io::Result<(i64, i64)> {
    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    Ok((meta.len() as i64, mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WcConfig;
    use crate::models::{Checksum, Props};

    fn setup() -> (tempfile::TempDir, WcRoot) {
        let dir = tempfile::tempdir().unwrap();
        let wc = WcRoot::open(dir.path(), WcConfig::default()).unwrap();
        (dir, wc)
    }

    fn copied_file(wc: &WcRoot, conn: &Connection, relpath: &str, content: &[u8]) -> NodeRow {
        let mut row = NodeRow::new(relpath, 1, Presence::Normal, NodeKind::File);
        row.checksum = Some(pristine::checksum_of(content));
        nodes::insert_node(conn, &row).unwrap();
        std::fs::write(wc.abspath(relpath), content).unwrap();
        row
    }

    #[test]
    fn test_unmodified_tree() {
        let (_dir, wc) = setup();
        let conn = wc.db().conn();
        nodes::insert_node(&conn, &NodeRow::new("X", 1, Presence::Normal, NodeKind::Dir)).unwrap();
        std::fs::create_dir(wc.abspath("X")).unwrap();
        copied_file(&wc, &conn, "X/f", b"one\n");

        let mods = node_has_local_mods(&wc, &conn, "X", 1).unwrap();
        assert_eq!(mods, LocalMods::default());
    }

    #[test]
    fn test_edited_file() {
        let (_dir, wc) = setup();
        let conn = wc.db().conn();
        copied_file(&wc, &conn, "f", b"one\n");
        std::fs::write(wc.abspath("f"), b"two\n").unwrap();

        let mods = node_has_local_mods(&wc, &conn, "f", 1).unwrap();
        assert!(mods.modified);
        assert!(!mods.all_deletes);
    }

    #[test]
    fn test_recorded_info_skips_hashing() {
        let (_dir, wc) = setup();
        let conn = wc.db().conn();
        let mut row = copied_file(&wc, &conn, "f", b"one\n");
        // A checksum that cannot match, hidden behind matching file info.
        row.checksum = Some(Checksum("0".repeat(64)));
        let (size, mtime) = file_info(&wc.abspath("f")).unwrap();
        row.translated_size = Some(size);
        row.last_mod_time = Some(mtime);
        assert!(!is_file_modified(&wc, &row).unwrap());

        row.last_mod_time = Some(mtime - 1);
        assert!(is_file_modified(&wc, &row).unwrap());
    }

    #[test]
    fn test_deletes_only() {
        let (_dir, wc) = setup();
        let conn = wc.db().conn();
        nodes::insert_node(&conn, &NodeRow::new("X", 1, Presence::Normal, NodeKind::Dir)).unwrap();
        std::fs::create_dir(wc.abspath("X")).unwrap();
        copied_file(&wc, &conn, "X/f", b"one\n");
        nodes::insert_node(&conn, &NodeRow::new("X/f", 2, Presence::BaseDeleted, NodeKind::File))
            .unwrap();
        std::fs::remove_file(wc.abspath("X/f")).unwrap();

        let mods = node_has_local_mods(&wc, &conn, "X", 1).unwrap();
        assert!(mods.modified);
        assert!(mods.all_deletes);
    }

    #[test]
    fn test_prop_change_and_missing_dir() {
        let (_dir, wc) = setup();
        let conn = wc.db().conn();
        copied_file(&wc, &conn, "f", b"x");
        let props = Props::from([("p".to_string(), "v".to_string())]);
        actual::set_actual_props(&conn, "f", Some(&props)).unwrap();
        assert!(node_has_local_mods(&wc, &conn, "f", 1).unwrap().modified);

        nodes::insert_node(&conn, &NodeRow::new("D", 1, Presence::Normal, NodeKind::Dir)).unwrap();
        let mods = node_has_local_mods(&wc, &conn, "D", 1).unwrap();
        assert!(mods.modified && !mods.all_deletes);
    }
}
