//! Conflict-resolution actions on moves: raising moved-away conflicts on
//! the sources of nested moves, and breaking moves into plain copies.

use std::path::PathBuf;

use rusqlite::Connection;
use tracing::{debug, info};

use super::tracker::{mark_tree_conflict, NewTreeConflict};
use crate::conflict::{get_tc_info, ConflictReason};
use crate::db::nodes;
use crate::errors::{ConflictError, WcError};
use crate::models::NodeKind;
use crate::notify::{self, Notification, NotifyAction, NotifyFn, NotifyState};
use crate::relpath;
use crate::wcroot::WcRoot;

/// Forget the move from `src_relpath` to `dst_relpath`. The destination stays
/// as an ordinary copy.
fn break_move(conn: &Connection, src_relpath: &str, src_op_depth: i64, dst_relpath: &str) -> Result<(), WcError> {
    nodes::clear_moved_to(conn, src_relpath, src_op_depth)?;
    nodes::clear_moved_here_recursive(conn, dst_relpath, relpath::depth(dst_relpath))?;
    debug!(src = %src_relpath, dst = %dst_relpath, "broke move");
    Ok(())
}

/// The victim's deletion removed the sources of moves below it. Raise a
/// moved-away conflict on each of those sources, carrying over the victim's
/// operation, action and locations.
pub fn resolve_delete_raise_moved_away(
    wc: &WcRoot,
    local_relpath: &str,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), WcError> {
    let mut notify = notify;
    let info = get_tc_info(&wc.db().conn(), local_relpath)?;
    let (Some(old_version), Some(new_version)) = (info.old_version, info.new_version) else {
        return Err(ConflictError::MissingLocations(local_relpath.to_string()).into());
    };
    wc.verify_write_lock(local_relpath)?;

    wc.db().transaction(|conn| {
        notify::spool_create(conn)?;
        let op_depth = relpath::depth(local_relpath);
        for (moved_relpath, kind, dst_relpath, repos_path) in
            nodes::op_depth_moved_pairs(conn, local_relpath, op_depth)?
        {
            let repos_path = repos_path.ok_or_else(|| WcError::PathNotFound(moved_relpath.clone()))?;
            mark_tree_conflict(
                conn,
                &NewTreeConflict {
                    local_relpath: &moved_relpath,
                    old_version: &old_version,
                    new_version: &new_version,
                    move_root_dst_relpath: &dst_relpath,
                    operation: info.operation,
                    old_kind: kind,
                    new_kind: kind,
                    old_repos_relpath: Some(&repos_path),
                    reason: ConflictReason::MovedAway,
                    action: info.action,
                    move_src_op_root_relpath: Some(local_relpath),
                },
            )?;
        }
        Ok::<_, WcError>(())
    })?;

    notify::spool_flush(
        wc.db(),
        wc.root(),
        Some(old_version.peg_rev),
        Some(new_version.peg_rev),
        notify::reborrow(&mut notify),
    )?;
    notify::emit(
        &mut notify,
        &Notification::completed(wc.abspath(local_relpath), Some(new_version.peg_rev)),
    );
    Ok(())
}

/// Break the move that carried `local_relpath` away.
pub fn resolve_break_moved_away(
    wc: &WcRoot,
    local_relpath: &str,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), WcError> {
    let mut notify = notify;
    wc.verify_write_lock(local_relpath)?;

    wc.db().transaction(|conn| {
        let op_depth = relpath::depth(local_relpath);
        let link = nodes::op_depth_moved_to(conn, op_depth - 1, local_relpath)?
            .ok_or_else(|| WcError::NotMovedAway(local_relpath.to_string()))?;
        break_move(
            conn,
            &link.src_root_relpath,
            relpath::depth(&link.src_op_root_relpath),
            &link.dst_op_root_relpath,
        )
    })?;
    info!(relpath = %local_relpath, "move broken");

    let path = wc.abspath(local_relpath);
    let broken = Notification::new(path.clone(), NotifyAction::MoveBroken, NodeKind::Unknown);
    notify::emit(&mut notify, &broken);
    notify::emit(&mut notify, &Notification::completed(path, None));
    Ok(())
}

/// Break every move out of the children of `local_relpath`.
pub fn resolve_break_moved_away_children(
    wc: &WcRoot,
    local_relpath: &str,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), WcError> {
    let mut notify = notify;
    wc.verify_write_lock(local_relpath)?;

    let broken = wc.db().transaction(|conn| {
        notify::spool_create(conn)?;
        let moves = nodes::moved_descendants(conn, local_relpath, relpath::depth(local_relpath))?;
        for (src_relpath, dst_relpath, src_op_depth) in &moves {
            break_move(conn, src_relpath, *src_op_depth, dst_relpath)?;
            notify::spool_add(
                conn,
                src_relpath,
                NotifyAction::MoveBroken,
                NodeKind::Unknown,
                NotifyState::Inapplicable,
                NotifyState::Inapplicable,
            )?;
        }
        Ok::<_, WcError>(moves.len())
    })?;
    info!(relpath = %local_relpath, broken, "moves below broken");

    notify::spool_flush(wc.db(), wc.root(), None, None, notify::reborrow(&mut notify))?;
    notify::emit(&mut notify, &Notification::completed(wc.abspath(local_relpath), None));
    Ok(())
}

/// The directory a resolver must lock to resolve conflicts in
/// `local_relpath`: the common ancestor of the path and the destinations of
/// every move out of it.
pub fn required_lock_for_resolve(wc: &WcRoot, local_relpath: &str) -> Result<PathBuf, WcError> {
    let conn = wc.db().conn();
    let required = nodes::moved_outside(&conn, local_relpath, 0)?
        .iter()
        .fold(local_relpath.to_string(), |required, (_, dst_relpath, _)| {
            relpath::longest_ancestor(&required, dst_relpath)
        });
    Ok(wc.abspath(&required))
}
