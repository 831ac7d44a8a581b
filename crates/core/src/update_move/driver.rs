//! The walk that compares the updated move source with the destination.
//!
//! Pass one walks both trees depth-first in lexical order and hands every
//! difference to the receiver. Pass two copies the whole source layer over
//! the destination layer, so the destination rows end up equal to the source
//! rows whatever the walk did to working files.

use std::cmp::Ordering;

use rusqlite::Connection;
use tracing::debug;

use super::tracker::check_node_shadowed;
use super::{receiver, UpdateMove};
use crate::db::nodes;
use crate::errors::WcError;
use crate::models::{Checksum, NodeKind, Props};
use crate::relpath;

/// What the walk needs to know about one side of a path pair.
#[derive(Debug, Default)]
struct NodeInfo {
    kind: Option<NodeKind>,
    props: Option<Props>,
    checksum: Option<Checksum>,
    /// Sorted child names.
    children: Vec<String>,
}

impl NodeInfo {
    fn kind(&self) -> NodeKind {
        self.kind.unwrap_or(NodeKind::None)
    }
}

/// A missing row, or one that only records the deletion of a lower layer,
/// reads as no node. Any other row without content still names a
/// repository location; it keeps its kind but has no props, text or
/// children.
fn get_info(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<NodeInfo, WcError> {
    let Some(row) = nodes::depth_get_info(conn, local_relpath, op_depth)? else {
        return Ok(NodeInfo::default());
    };
    if !row.presence.is_present() {
        return Ok(NodeInfo {
            kind: row.repos_path.is_some().then_some(row.kind),
            ..NodeInfo::default()
        });
    }
    let children = nodes::present_children(conn, local_relpath, op_depth)?;
    Ok(NodeInfo {
        kind: Some(row.kind),
        props: Some(row.properties.unwrap_or_default()),
        checksum: row.checksum,
        children,
    })
}

/// An unknown checksum on either side matches anything.
fn checksums_match(a: Option<&Checksum>, b: Option<&Checksum>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn props_match(a: Option<&Props>, b: Option<&Props>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        (Some(p), None) | (None, Some(p)) => p.is_empty(),
    }
}

fn update_moved_away_node(
    umb: &mut UpdateMove<'_>,
    src_relpath: &str,
    dst_relpath: &str,
    src_op_depth: i64,
    shadowed: bool,
) -> Result<(), WcError> {
    let dst_op_depth = umb.dst_op_depth();
    let src = get_info(umb.conn, src_relpath, src_op_depth)?;
    let dst = get_info(umb.conn, dst_relpath, dst_op_depth)?;
    let (src_kind, dst_kind) = (src.kind(), dst.kind());

    if src_kind == NodeKind::None || (dst_kind != NodeKind::None && src_kind != dst_kind) {
        if dst_kind != NodeKind::None {
            receiver::delete(umb, dst_relpath, shadowed)?;
        }
        delete_move_leaf(umb, dst_relpath)?;
    }

    if src_kind != NodeKind::None && src_kind != dst_kind {
        if shadowed {
            nodes::extend_parent_delete(umb.conn, dst_relpath, src_kind, dst_op_depth)?;
        }
        if src_kind.is_file_like() {
            receiver::add_file(umb, dst_relpath, src.checksum.as_ref(), shadowed)?;
        } else if src_kind == NodeKind::Dir {
            receiver::add_directory(umb, dst_relpath, shadowed)?;
        }
    } else if src_kind != NodeKind::None {
        let props = if props_match(src.props.as_ref(), dst.props.as_ref()) {
            None
        } else {
            src.props.as_ref()
        };
        if src_kind.is_file_like() {
            let checksum = if checksums_match(src.checksum.as_ref(), dst.checksum.as_ref()) {
                None
            } else {
                src.checksum.as_ref()
            };
            if props.is_some() || checksum.is_some() {
                receiver::alter_file(umb, dst_relpath, checksum, props, shadowed)?;
            }
        } else if src_kind == NodeKind::Dir && (props.is_some() || src.children != dst.children) {
            receiver::alter_directory(umb, dst_relpath, props, shadowed)?;
        }
    }

    if src_kind == NodeKind::Dir {
        let (mut i, mut j) = (0, 0);
        while i < src.children.len() || j < dst.children.len() {
            let name = match (src.children.get(i), dst.children.get(j)) {
                (Some(s), Some(d)) => match s.cmp(d) {
                    Ordering::Less => {
                        i += 1;
                        s
                    }
                    Ordering::Greater => {
                        j += 1;
                        d
                    }
                    Ordering::Equal => {
                        i += 1;
                        j += 1;
                        s
                    }
                },
                (Some(s), None) => {
                    i += 1;
                    s
                }
                (None, Some(d)) => {
                    j += 1;
                    d
                }
                (None, None) => break,
            };

            umb.check_cancelled()?;
            let src_child = relpath::join(src_relpath, name);
            let dst_child = relpath::join(dst_relpath, name);
            let child_shadowed = shadowed || check_node_shadowed(umb, &dst_child)?;
            update_moved_away_node(umb, &src_child, &dst_child, src_op_depth, child_shadowed)?;
        }
    }
    Ok(())
}

/// Drop the destination rows for `local_relpath`. Where a lower layer of the
/// parent still needs shadowing, the rows become base-deleted markers
/// instead.
fn delete_move_leaf(umb: &UpdateMove<'_>, local_relpath: &str) -> Result<(), WcError> {
    let op_depth = umb.dst_op_depth();
    let parent = relpath::dirname(local_relpath);
    match nodes::highest_layer_below(umb.conn, parent, op_depth)? {
        Some(below) => {
            nodes::delete_no_lower_layer(umb.conn, local_relpath, op_depth, below)?;
            nodes::replace_with_base_deleted(umb.conn, local_relpath, op_depth)?;
        }
        None => {
            nodes::delete_at(umb.conn, local_relpath, op_depth)?;
        }
    }
    nodes::retract_parent_delete(umb.conn, local_relpath, op_depth)?;
    Ok(())
}

/// Copy every row of `src_relpath`'s subtree at `src_op_depth` over the
/// destination layer rooted at `dst_relpath`.
pub(crate) fn replace_moved_layer(
    conn: &Connection,
    src_relpath: &str,
    dst_relpath: &str,
    src_op_depth: i64,
) -> Result<(), WcError> {
    let dst_op_depth = relpath::depth(dst_relpath);
    let rows = nodes::subtree_at_op_depth(conn, src_relpath, src_op_depth)?;
    debug!(src = %src_relpath, dst = %dst_relpath, rows = rows.len(), "replacing moved layer");

    for (src_path, kind) in rows {
        let below = relpath::skip_ancestor(src_relpath, &src_path).unwrap_or("");
        let dst_path = relpath::join(dst_relpath, below);
        nodes::copy_node_move(conn, &src_path, src_op_depth, &dst_path, dst_op_depth)?;
        if dst_path.len() > dst_relpath.len() {
            nodes::extend_parent_delete(conn, &dst_path, kind, dst_op_depth)?;
        }
    }
    Ok(())
}

/// Bring the destination of the current move up to date with `src_relpath`.
pub(crate) fn drive(umb: &mut UpdateMove<'_>, src_relpath: &str, src_op_depth: i64) -> Result<(), WcError> {
    if !umb.operation.is_update_or_switch() {
        return Err(WcError::CannotAutoResolve(src_relpath.to_string()));
    }

    let dst_relpath = umb.move_root_dst_relpath.clone();
    update_moved_away_node(umb, src_relpath, &dst_relpath, src_op_depth, false)?;
    replace_moved_layer(umb.conn, src_relpath, &dst_relpath, src_op_depth)
}

/// Refuse move sources that are mixed-revision or switched below the root.
pub(crate) fn suitable_for_move(conn: &Connection, local_relpath: &str) -> Result<(), WcError> {
    let Some(root) = nodes::base_get_info(conn, local_relpath)? else {
        return Ok(());
    };

    for (child, repos_path, revision) in nodes::base_repos_locations(conn, local_relpath)? {
        if revision != root.revision {
            debug!(relpath = %child, ?revision, expected = ?root.revision, "mixed revision");
            return Err(WcError::MixedRevision(local_relpath.to_string()));
        }
        if let Some(root_repos) = &root.repos_path {
            let below = relpath::skip_ancestor(local_relpath, &child).unwrap_or("");
            let expected = relpath::join(root_repos, below);
            if repos_path.as_deref() != Some(expected.as_str()) {
                debug!(relpath = %child, ?repos_path, %expected, "switched");
                return Err(WcError::SwitchedSubtree(local_relpath.to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::NodeRow;
    use crate::db::Database;
    use crate::models::Presence;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn base(conn: &Connection, relpath: &str, kind: NodeKind, repos_path: &str, revision: i64) {
        let mut row = NodeRow::new(relpath, 0, Presence::Normal, kind);
        row.repos_path = Some(repos_path.to_string());
        row.revision = Some(revision);
        nodes::insert_node(conn, &row).unwrap();
    }

    #[test]
    fn test_props_match_treats_missing_as_empty() {
        let props = Props::from([("p".to_string(), "v".to_string())]);
        assert!(props_match(None, None));
        assert!(props_match(Some(&Props::new()), None));
        assert!(!props_match(Some(&props), None));
        assert!(props_match(Some(&props), Some(&props.clone())));
    }

    #[test]
    fn test_get_info_hides_deletions() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir, "A", 1);
        base(&conn, "A/b", NodeKind::File, "A/b", 1);
        base(&conn, "A/a", NodeKind::File, "A/a", 1);
        nodes::insert_node(&conn, &NodeRow::new("A", 1, Presence::BaseDeleted, NodeKind::Dir)).unwrap();

        let info = get_info(&conn, "A", 0).unwrap();
        assert_eq!(info.kind(), NodeKind::Dir);
        assert_eq!(info.children, vec!["a".to_string(), "b".to_string()]);
        assert!(info.props.is_some());

        let deleted = get_info(&conn, "A", 1).unwrap();
        assert_eq!(deleted.kind(), NodeKind::None);
        assert!(deleted.children.is_empty());
        assert_eq!(get_info(&conn, "missing", 0).unwrap().kind(), NodeKind::None);
    }

    #[test]
    fn test_get_info_keeps_kind_of_not_present_node() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir, "A", 1);
        let mut gone = NodeRow::new("A", 1, Presence::NotPresent, NodeKind::Dir);
        gone.repos_path = Some("A".to_string());
        gone.revision = Some(1);
        nodes::insert_node(&conn, &gone).unwrap();
        let mut child = NodeRow::new("A/b", 1, Presence::Normal, NodeKind::File);
        child.repos_path = Some("A/b".to_string());
        nodes::insert_node(&conn, &child).unwrap();

        let info = get_info(&conn, "A", 1).unwrap();
        assert_eq!(info.kind(), NodeKind::Dir);
        assert!(info.props.is_none());
        assert!(info.checksum.is_none());
        assert!(info.children.is_empty());
    }

    #[test]
    fn test_unknown_checksum_matches() {
        let sum = Checksum("ab".repeat(32));
        let other = Checksum("cd".repeat(32));
        assert!(checksums_match(None, None));
        assert!(checksums_match(Some(&sum), None));
        assert!(checksums_match(None, Some(&sum)));
        assert!(checksums_match(Some(&sum), Some(&sum.clone())));
        assert!(!checksums_match(Some(&sum), Some(&other)));
    }

    #[test]
    fn test_suitable_for_move() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir, "trunk/A", 2);
        base(&conn, "A/f", NodeKind::File, "trunk/A/f", 2);
        suitable_for_move(&conn, "A").unwrap();
        suitable_for_move(&conn, "missing").unwrap();

        base(&conn, "A/g", NodeKind::File, "trunk/A/g", 1);
        assert!(matches!(suitable_for_move(&conn, "A"), Err(WcError::MixedRevision(_))));
    }

    #[test]
    fn test_switched_subtree_is_refused() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir, "trunk/A", 2);
        base(&conn, "A/f", NodeKind::File, "branches/f", 2);
        let err = suitable_for_move(&conn, "A").unwrap_err();
        assert!(matches!(err, WcError::SwitchedSubtree(_)));
        assert!(err.to_string().contains("switched subtree"));
    }

    #[test]
    fn test_replace_moved_layer_twice_is_stable() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir, "A", 2);
        base(&conn, "A/f", NodeKind::File, "A/f", 2);
        nodes::insert_node(&conn, &NodeRow::new("X", 1, Presence::Normal, NodeKind::Dir)).unwrap();

        replace_moved_layer(&conn, "A", "X", 0).unwrap();
        let once = nodes::subtree_at_op_depth(&conn, "X", 1).unwrap();
        let row_once = nodes::depth_get_info(&conn, "X/f", 1).unwrap().unwrap();
        replace_moved_layer(&conn, "A", "X", 0).unwrap();
        let twice = nodes::subtree_at_op_depth(&conn, "X", 1).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
        assert_eq!(nodes::depth_get_info(&conn, "X/f", 1).unwrap().unwrap(), row_once);
        assert!(row_once.moved_here);
        assert_eq!(row_once.repos_path.as_deref(), Some("A/f"));
    }
}
