//! Raising tree conflicts during a move update, and deciding which
//! destination paths the walk must leave alone.

use rusqlite::Connection;
use tracing::debug;

use super::UpdateMove;
use crate::conflict::{
    ConflictAction, ConflictDescriptor, ConflictReason, ConflictVersion, Operation, TreeConflict,
};
use crate::db::{actual, nodes};
use crate::errors::{ConflictError, WcError};
use crate::models::NodeKind;
use crate::notify::{self, NotifyAction, NotifyState};
use crate::relpath;

/// Everything needed to record one tree conflict.
pub(crate) struct NewTreeConflict<'a> {
    pub local_relpath: &'a str,
    pub old_version: &'a ConflictVersion,
    pub new_version: &'a ConflictVersion,
    /// Destination root of the move being updated; locates the node in the
    /// new tree when its old repository path is unknown.
    pub move_root_dst_relpath: &'a str,
    pub operation: Operation,
    pub old_kind: NodeKind,
    pub new_kind: NodeKind,
    pub old_repos_relpath: Option<&'a str>,
    pub reason: ConflictReason,
    pub action: ConflictAction,
    pub move_src_op_root_relpath: Option<&'a str>,
}

/// Record a tree conflict on `tc.local_relpath` and spool its notification.
///
/// Raising the same update/switch tree conflict twice is a no-op. Any other
/// existing tree conflict is an error, as is a conflict left by an operation
/// other than update or switch.
pub(crate) fn mark_tree_conflict(conn: &Connection, tc: &NewTreeConflict<'_>) -> Result<(), WcError> {
    let local_relpath = tc.local_relpath;

    let rebased = tc
        .old_repos_relpath
        .and_then(|old| relpath::skip_ancestor(&tc.old_version.path_in_repos, old));
    let new_repos_relpath = match rebased {
        Some(below) => relpath::join(&tc.new_version.path_in_repos, below),
        None => {
            let below = relpath::skip_ancestor(tc.move_root_dst_relpath, local_relpath).unwrap_or("");
            relpath::join(&tc.new_version.path_in_repos, below)
        }
    };

    let mut conflict = match actual::read_conflict(conn, local_relpath)? {
        Some(existing) => {
            if !existing.operation.is_update_or_switch() {
                return Err(ConflictError::ResolverFailure(local_relpath.to_string()).into());
            }
            if let Some(tree) = &existing.tree {
                let same_move = tc.reason != ConflictReason::MovedAway
                    || tree.move_src_op_root_relpath.as_deref() == tc.move_src_op_root_relpath;
                if tree.reason != tc.reason || tree.action != tc.action || !same_move {
                    return Err(ConflictError::Obstructed(local_relpath.to_string()).into());
                }
                debug!(relpath = %local_relpath, "already a suitable tree conflict");
                return Ok(());
            }
            existing
        }
        None => ConflictDescriptor::new(tc.operation),
    };

    conflict.tree = Some(TreeConflict {
        reason: tc.reason,
        action: tc.action,
        move_src_op_root_relpath: tc.move_src_op_root_relpath.map(str::to_string),
    });

    let old_version = match tc.old_repos_relpath {
        Some(old_repos_relpath) if tc.reason != ConflictReason::Unversioned => {
            Some(ConflictVersion {
                path_in_repos: old_repos_relpath.to_string(),
                node_kind: tc.old_kind,
                ..tc.old_version.clone()
            })
        }
        _ => None,
    };
    let new_version = ConflictVersion {
        path_in_repos: new_repos_relpath,
        node_kind: tc.new_kind,
        ..tc.new_version.clone()
    };
    conflict.set_operation(tc.operation, old_version, Some(new_version));

    actual::mark_conflict(conn, local_relpath, &conflict)?;
    debug!(
        relpath = %local_relpath,
        reason = %tc.reason,
        action = %tc.action,
        "raised tree conflict"
    );
    notify::spool_add(
        conn,
        local_relpath,
        NotifyAction::TreeConflict,
        tc.new_kind,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    Ok(())
}

impl UpdateMove<'_> {
    /// Raise a tree conflict using this walk's operation and locations.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn raise(
        &self,
        local_relpath: &str,
        old_kind: NodeKind,
        new_kind: NodeKind,
        old_repos_relpath: Option<&str>,
        reason: ConflictReason,
        action: ConflictAction,
        move_src_op_root_relpath: Option<&str>,
    ) -> Result<(), WcError> {
        mark_tree_conflict(
            self.conn,
            &NewTreeConflict {
                local_relpath,
                old_version: &self.old_version,
                new_version: &self.new_version,
                move_root_dst_relpath: &self.move_root_dst_relpath,
                operation: self.operation,
                old_kind,
                new_kind,
                old_repos_relpath,
                reason,
                action,
                move_src_op_root_relpath,
            },
        )
    }
}

/// True if a local layer above the destination layer hides `dst_relpath`.
pub(crate) fn check_node_shadowed(umb: &UpdateMove<'_>, dst_relpath: &str) -> Result<bool, WcError> {
    let top = nodes::working_op_depth(umb.conn, dst_relpath)?;
    Ok(top.is_some_and(|op_depth| op_depth > umb.dst_op_depth()))
}

/// Decide whether the edit at `local_relpath` collides with local changes
/// layered over the destination.
///
/// Paths inside the conflict most recently raised by this walk are reported
/// as conflicted outright. Otherwise, if a layer sits above the destination
/// layer, a tree conflict is raised on the root of that layer, which becomes
/// the new suppression scope.
pub(crate) fn check_tree_conflict(
    umb: &mut UpdateMove<'_>,
    local_relpath: &str,
    old_kind: NodeKind,
    new_kind: NodeKind,
    old_repos_relpath: Option<&str>,
    action: ConflictAction,
) -> Result<bool, WcError> {
    if let Some(root) = &umb.conflict_root {
        if relpath::is_ancestor(root, local_relpath) {
            return Ok(true);
        }
        umb.conflict_root = None;
    }

    let dst_op_depth = umb.dst_op_depth();
    let Some(layer) = nodes::lowest_working_node(umb.conn, local_relpath, dst_op_depth)? else {
        return Ok(false);
    };

    let mut conflict_root = local_relpath;
    let mut old_kind = old_kind;
    let mut new_kind = new_kind;
    let mut old_repos_relpath = old_repos_relpath;
    let mut action = action;
    while relpath::depth(conflict_root) > layer.op_depth {
        conflict_root = relpath::dirname(conflict_root);
        old_kind = NodeKind::Dir;
        new_kind = NodeKind::Dir;
        old_repos_relpath = old_repos_relpath.map(relpath::dirname);
        action = ConflictAction::Edit;
    }

    let link = nodes::op_depth_moved_to(umb.conn, dst_op_depth, conflict_root)?;
    let (reason, move_src_op_root) = match &link {
        Some(link) => (ConflictReason::MovedAway, Some(link.src_op_root_relpath.as_str())),
        None => (ConflictReason::Deleted, None),
    };
    debug!(
        relpath = %local_relpath,
        conflict_root = %conflict_root,
        op_depth = layer.op_depth,
        "edit collides with a local layer"
    );
    umb.raise(
        conflict_root,
        old_kind,
        new_kind,
        old_repos_relpath,
        reason,
        action,
        move_src_op_root,
    )?;
    umb.conflict_root = Some(conflict_root.to_string());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn version(path: &str, rev: i64) -> ConflictVersion {
        ConflictVersion {
            repos_url: "file:///repo".into(),
            repos_uuid: "uuid".into(),
            path_in_repos: path.into(),
            peg_rev: rev,
            node_kind: NodeKind::Dir,
        }
    }

    fn edited<'a>(
        relpath: &'a str,
        old: &'a ConflictVersion,
        new: &'a ConflictVersion,
        old_repos: Option<&'a str>,
    ) -> NewTreeConflict<'a> {
        NewTreeConflict {
            local_relpath: relpath,
            old_version: old,
            new_version: new,
            move_root_dst_relpath: "X",
            operation: Operation::Update,
            old_kind: NodeKind::File,
            new_kind: NodeKind::None,
            old_repos_relpath: old_repos,
            reason: ConflictReason::Edited,
            action: ConflictAction::Delete,
            move_src_op_root_relpath: None,
        }
    }

    fn spooled(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM temp.update_move_list", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_mark_records_rebased_locations() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));

        mark_tree_conflict(&conn, &edited("X/c.txt", &old, &new, Some("A/c.txt"))).unwrap();

        let conflict = actual::read_conflict(&conn, "X/c.txt").unwrap().unwrap();
        let tree = conflict.tree.unwrap();
        assert_eq!(tree.reason, ConflictReason::Edited);
        assert_eq!(tree.action, ConflictAction::Delete);
        let old_version = conflict.old_version.unwrap();
        assert_eq!(old_version.path_in_repos, "A/c.txt");
        assert_eq!(old_version.node_kind, NodeKind::File);
        assert_eq!(old_version.peg_rev, 1);
        let new_version = conflict.new_version.unwrap();
        assert_eq!(new_version.path_in_repos, "A/c.txt");
        assert_eq!(new_version.node_kind, NodeKind::None);
        assert_eq!(new_version.peg_rev, 2);
        assert_eq!(spooled(&conn), 1);
    }

    #[test]
    fn test_unknown_old_location_uses_destination_offset() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));
        let mut tc = edited("X/new/f", &old, &new, None);
        tc.reason = ConflictReason::Unversioned;
        tc.action = ConflictAction::Add;

        mark_tree_conflict(&conn, &tc).unwrap();

        let conflict = actual::read_conflict(&conn, "X/new/f").unwrap().unwrap();
        assert!(conflict.old_version.is_none());
        assert_eq!(conflict.new_version.unwrap().path_in_repos, "A/new/f");
    }

    #[test]
    fn test_same_conflict_twice_is_noop() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));
        let tc = edited("X/c.txt", &old, &new, Some("A/c.txt"));

        mark_tree_conflict(&conn, &tc).unwrap();
        mark_tree_conflict(&conn, &tc).unwrap();
        assert_eq!(spooled(&conn), 1);
    }

    #[test]
    fn test_incompatible_conflict_is_obstructed() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));
        mark_tree_conflict(&conn, &edited("X/c.txt", &old, &new, Some("A/c.txt"))).unwrap();

        let mut other = edited("X/c.txt", &old, &new, Some("A/c.txt"));
        other.reason = ConflictReason::Deleted;
        let err = mark_tree_conflict(&conn, &other).unwrap_err();
        assert!(matches!(err, WcError::Conflict(ConflictError::Obstructed(_))));
        assert_eq!(err.to_string(), "'X/c.txt' already in conflict");
    }

    #[test]
    fn test_moved_away_compares_move_source() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));
        let mut tc = edited("A/B", &old, &new, Some("A/B"));
        tc.reason = ConflictReason::MovedAway;
        tc.action = ConflictAction::Edit;
        tc.move_src_op_root_relpath = Some("A/B");
        mark_tree_conflict(&conn, &tc).unwrap();

        tc.move_src_op_root_relpath = Some("A");
        assert!(matches!(
            mark_tree_conflict(&conn, &tc),
            Err(WcError::Conflict(ConflictError::Obstructed(_)))
        ));
    }

    #[test]
    fn test_merge_conflict_is_resolver_failure() {
        let db = db();
        let conn = db.conn();
        notify::spool_create(&conn).unwrap();
        actual::mark_conflict(&conn, "X/c.txt", &ConflictDescriptor::new(Operation::Merge)).unwrap();
        let (old, new) = (version("A", 1), version("A", 2));

        let err = mark_tree_conflict(&conn, &edited("X/c.txt", &old, &new, None)).unwrap_err();
        assert!(matches!(err, WcError::Conflict(ConflictError::ResolverFailure(_))));
    }
}
