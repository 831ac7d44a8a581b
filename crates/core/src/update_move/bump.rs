//! Extending moves after an update.
//!
//! An update of BASE below a move source leaves the move destination behind.
//! Bumping copies the freshly updated source layer over the destination of
//! every move whose source the update fully covered, and raises a moved-away
//! conflict where it did not.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::{debug, info};

use super::driver::replace_moved_layer;
use super::tracker::{mark_tree_conflict, NewTreeConflict};
use crate::conflict::{ConflictAction, ConflictReason, ConflictVersion, Operation};
use crate::db::nodes::{self, MovedPair};
use crate::db::actual;
use crate::errors::WcError;
use crate::models::{Depth, NodeKind};
use crate::notify::{self, Notification, NotifyFn};
use crate::relpath;
use crate::wcroot::WcRoot;

/// True if an update to `depth` brought everything below `local_relpath`
/// at `op_depth` up to date.
fn depth_sufficient_to_bump(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
    depth: Depth,
) -> Result<bool, WcError> {
    let sufficient = match depth {
        Depth::Infinity => true,
        Depth::Empty => !nodes::has_children(conn, local_relpath, op_depth)?,
        Depth::Files => !nodes::has_non_file_children(conn, local_relpath, op_depth)?,
        Depth::Immediates => !nodes::has_grandchildren(conn, local_relpath, op_depth)?,
    };
    Ok(sufficient)
}

/// Whether a move of `src_relpath` lies inside an update of `root_relpath`
/// to `depth`. Returns whether to skip it, and the depth its source was
/// covered to.
fn check_bump_layer(root_relpath: &str, depth: Depth, src_relpath: &str, src_kind: NodeKind) -> (bool, Depth) {
    let Some(below) = relpath::skip_ancestor(root_relpath, src_relpath) else {
        return (true, depth);
    };
    if depth == Depth::Infinity || below.is_empty() {
        return (false, depth);
    }

    match depth {
        Depth::Empty => (true, depth),
        Depth::Files if src_kind != NodeKind::File => (true, depth),
        _ => (relpath::depth(below) > 1, Depth::Empty),
    }
}

/// Raise a moved-away/edit conflict on `src_root_relpath` for a move that
/// cannot be bumped. The old location comes from the destination, the new
/// one from the updated BASE of the source op root.
fn bump_mark_tree_conflict(
    wc: &WcRoot,
    conn: &Connection,
    src_root_relpath: &str,
    src_op_root_relpath: &str,
    dst_op_root_relpath: &str,
) -> Result<(), WcError> {
    wc.verify_write_lock(src_root_relpath)?;

    let new = nodes::base_get_info(conn, src_op_root_relpath)?
        .ok_or_else(|| WcError::PathNotFound(src_op_root_relpath.to_string()))?;
    let repos_id = new
        .repos_id
        .ok_or_else(|| WcError::PathNotFound(src_op_root_relpath.to_string()))?;
    let (repos_url, repos_uuid) = nodes::fetch_repos_info(conn, repos_id)?;

    let old = nodes::depth_get_info(conn, dst_op_root_relpath, relpath::depth(dst_op_root_relpath))?
        .ok_or_else(|| WcError::PathNotFound(dst_op_root_relpath.to_string()))?;

    let old_version = ConflictVersion {
        repos_url: repos_url.clone(),
        repos_uuid: repos_uuid.clone(),
        path_in_repos: old.repos_path.clone().unwrap_or_default(),
        peg_rev: old.revision.unwrap_or_default(),
        node_kind: old.kind,
    };
    let new_version = ConflictVersion {
        repos_url,
        repos_uuid,
        path_in_repos: new.repos_path.clone().unwrap_or_default(),
        peg_rev: new.revision.unwrap_or_default(),
        node_kind: new.kind,
    };

    debug!(src = %src_root_relpath, dst = %dst_op_root_relpath, "move cannot be bumped");
    mark_tree_conflict(
        conn,
        &NewTreeConflict {
            local_relpath: src_root_relpath,
            old_version: &old_version,
            new_version: &new_version,
            move_root_dst_relpath: dst_op_root_relpath,
            operation: Operation::Update,
            old_kind: old.kind,
            new_kind: new.kind,
            old_repos_relpath: old.repos_path.as_deref(),
            reason: ConflictReason::MovedAway,
            action: ConflictAction::Edit,
            move_src_op_root_relpath: Some(src_op_root_relpath),
        },
    )
}

/// Bump one move found below `local_relpath`. Returns true if the
/// destination was replaced and nested moves should be bumped too.
fn bump_moved_layer(
    wc: &WcRoot,
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
    pair: &MovedPair,
    src_depth: Depth,
) -> Result<bool, WcError> {
    wc.verify_write_lock(local_relpath)?;

    if nodes::has_layer_between(conn, local_relpath, op_depth, pair.src_op_depth)? {
        return Ok(false);
    }

    let mut can_bump = if op_depth == 0 {
        depth_sufficient_to_bump(conn, &pair.src_relpath, op_depth, src_depth)?
    } else {
        // Bumping a whole BASE move already covered its nested moves.
        true
    };
    if can_bump && !wc.owns_lock(&pair.dst_relpath) {
        debug!(dst = %pair.dst_relpath, "destination not locked");
        can_bump = false;
    }

    let src_op_root = relpath::ancestor_at_depth(&pair.src_relpath, pair.src_op_depth);
    if !can_bump {
        bump_mark_tree_conflict(wc, conn, &pair.src_relpath, src_op_root, &pair.dst_relpath)?;
        return Ok(false);
    }

    if actual::read_conflict(conn, src_op_root)?.is_some() {
        debug!(src_op_root = %src_op_root, "move source already in conflict");
        return Ok(false);
    }

    wc.verify_write_lock(&pair.src_relpath)?;
    replace_moved_layer(conn, &pair.src_relpath, &pair.dst_relpath, op_depth)?;
    Ok(true)
}

fn bump_moved_away_at(
    wc: &WcRoot,
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
    src_done: &mut HashSet<String>,
    depth: Depth,
) -> Result<(), WcError> {
    for pair in nodes::moved_pairs(conn, local_relpath, op_depth)? {
        let (skip, src_depth) = check_bump_layer(local_relpath, depth, &pair.src_relpath, pair.src_kind);
        if skip || !src_done.insert(pair.src_relpath.clone()) {
            continue;
        }

        if bump_moved_layer(wc, conn, local_relpath, op_depth, &pair, src_depth)? {
            debug!(src = %pair.src_relpath, dst = %pair.dst_relpath, "bumped move");
            bump_moved_away_at(
                wc,
                conn,
                &pair.dst_relpath,
                relpath::depth(&pair.dst_relpath),
                src_done,
                depth,
            )?;
        }
    }
    Ok(())
}

/// Carry an update of `local_relpath` to `depth` over to the destinations of
/// the moves it affected.
///
/// When `local_relpath` lies inside a moved-away subtree without being the
/// move source itself, nothing is bumped; the move source root gets a
/// moved-away/edit conflict instead.
pub fn bump_moved_away(
    wc: &WcRoot,
    local_relpath: &str,
    depth: Depth,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), WcError> {
    let mut notify = notify;
    info!(relpath = %local_relpath, ?depth, "bumping moves");

    let revision = wc.db().transaction(|conn| {
        notify::spool_create(conn)?;

        let inside_move = if local_relpath.is_empty() {
            None
        } else {
            nodes::op_depth_moved_to(conn, 0, local_relpath)?
                .filter(|link| link.src_root_relpath != local_relpath)
        };

        match inside_move {
            Some(link) => bump_mark_tree_conflict(
                wc,
                conn,
                &link.src_root_relpath,
                &link.src_op_root_relpath,
                &link.dst_op_root_relpath,
            )?,
            None => {
                let mut src_done = HashSet::new();
                bump_moved_away_at(wc, conn, local_relpath, 0, &mut src_done, depth)?;
            }
        }

        Ok::<_, WcError>(nodes::base_get_info(conn, local_relpath)?.and_then(|row| row.revision))
    })?;

    notify::spool_flush(wc.db(), wc.root(), None, revision, notify::reborrow(&mut notify))?;
    notify::emit(&mut notify, &Notification::completed(wc.abspath(local_relpath), revision));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_bump_layer_outside_root() {
        assert_eq!(check_bump_layer("A", Depth::Infinity, "B/c", NodeKind::Dir), (true, Depth::Infinity));
        assert_eq!(check_bump_layer("", Depth::Empty, "A", NodeKind::Dir), (true, Depth::Empty));
    }

    #[test]
    fn test_check_bump_layer_root_itself() {
        assert_eq!(check_bump_layer("A", Depth::Empty, "A", NodeKind::Dir), (false, Depth::Empty));
        assert_eq!(
            check_bump_layer("A", Depth::Immediates, "A", NodeKind::Dir),
            (false, Depth::Immediates)
        );
    }

    #[test]
    fn test_check_bump_layer_limited_depths() {
        assert_eq!(check_bump_layer("A", Depth::Empty, "A/B", NodeKind::Dir), (true, Depth::Empty));
        assert_eq!(check_bump_layer("A", Depth::Files, "A/B", NodeKind::Dir), (true, Depth::Files));
        assert_eq!(check_bump_layer("A", Depth::Files, "A/f", NodeKind::File), (false, Depth::Empty));
        assert_eq!(
            check_bump_layer("A", Depth::Immediates, "A/B", NodeKind::Dir),
            (false, Depth::Empty)
        );
        assert_eq!(
            check_bump_layer("A", Depth::Immediates, "A/B/C", NodeKind::Dir),
            (true, Depth::Empty)
        );
        assert_eq!(
            check_bump_layer("A", Depth::Infinity, "A/B/C", NodeKind::Dir),
            (false, Depth::Infinity)
        );
    }
}
