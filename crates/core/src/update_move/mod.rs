//! Applying an update to the destination of a local move.
//!
//! When an update reaches the source of a local move, the source's BASE
//! layer moves to the new revision while the destination still holds the
//! pre-update tree. The update leaves a moved-away tree conflict on the
//! source. Resolving it walks the source (post-update) against the
//! destination (pre-update) and applies the difference to the destination:
//!
//! - [`driver`] walks both trees in lexical order and replaces the
//!   destination layer once the walk is done.
//! - [`receiver`] applies each add, alter and delete to the working copy,
//!   merging local changes and raising conflicts.
//! - [`tracker`] decides when a destination path is shadowed by a local
//!   layer or already inside a conflict raised by this walk.
//! - [`bump`] extends moves to parts of a tree revealed by a deeper update.
//! - [`breaker`] turns tracked moves into plain copies and implements the
//!   other conflict-resolution actions.
//!
//! Every entry point runs its changes in one transaction. Notifications are
//! spooled and handed to the callback once that transaction has committed,
//! followed by an operation-completed event.

mod breaker;
mod bump;
mod driver;
mod receiver;
mod tracker;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::conflict::{get_tc_info, ConflictVersion, Merger, Operation};
use crate::db::nodes;
use crate::errors::{ConflictError, WcError};
use crate::notify::{self, Notification, NotifyFn};
use crate::relpath;
use crate::wcroot::WcRoot;

pub use breaker::{
    required_lock_for_resolve, resolve_break_moved_away, resolve_break_moved_away_children,
    resolve_delete_raise_moved_away,
};
pub use bump::bump_moved_away;

/// Cancellation check; returning `true` aborts the walk.
pub type CancelFn<'a> = &'a dyn Fn() -> bool;

/// State of one move-update walk.
pub(crate) struct UpdateMove<'a> {
    pub(crate) wc: &'a WcRoot,
    pub(crate) conn: &'a Connection,
    /// Root of the move destination; its depth is the destination op-depth.
    pub(crate) move_root_dst_relpath: String,
    pub(crate) operation: Operation,
    pub(crate) old_version: ConflictVersion,
    pub(crate) new_version: ConflictVersion,
    /// Root of the most recent conflict raised by this walk. Edits inside it
    /// are suppressed.
    pub(crate) conflict_root: Option<String>,
    pub(crate) merger: Merger,
    cancel: Option<CancelFn<'a>>,
}

impl<'a> UpdateMove<'a> {
    pub(crate) fn new(
        wc: &'a WcRoot,
        conn: &'a Connection,
        move_root_dst_relpath: String,
        operation: Operation,
        old_version: ConflictVersion,
        new_version: ConflictVersion,
        cancel: Option<CancelFn<'a>>,
    ) -> Self {
        Self {
            wc,
            conn,
            move_root_dst_relpath,
            operation,
            old_version,
            new_version,
            conflict_root: None,
            merger: Merger::new(&wc.config().merge),
            cancel,
        }
    }

    /// Op-depth of the destination layer.
    pub(crate) fn dst_op_depth(&self) -> i64 {
        relpath::depth(&self.move_root_dst_relpath)
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), WcError> {
        match self.cancel {
            Some(cancelled) if cancelled() => Err(WcError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Bring the destination of the move that left `victim_relpath` in conflict
/// up to date with the updated source.
///
/// The victim must carry a moved-away tree conflict from an update or
/// switch, and the caller must hold write locks on the move source op root
/// and the move destination.
pub fn update_moved_away_conflict_victim(
    wc: &WcRoot,
    victim_relpath: &str,
    cancel: Option<CancelFn<'_>>,
    notify: Option<NotifyFn<'_>>,
) -> Result<(), WcError> {
    let mut notify = notify;
    let info = get_tc_info(&wc.db().conn(), victim_relpath)?;

    let move_src_op_root = info
        .move_src_op_root_relpath
        .clone()
        .ok_or_else(|| WcError::NotMovedAway(victim_relpath.to_string()))?;
    wc.verify_write_lock(&move_src_op_root)?;

    let (Some(old_version), Some(new_version)) = (info.old_version, info.new_version) else {
        return Err(ConflictError::MissingLocations(victim_relpath.to_string()).into());
    };
    let (old_revision, new_revision) = (old_version.peg_rev, new_version.peg_rev);

    wc.db().transaction(|conn| {
        let src_op_depth = relpath::depth(&move_src_op_root);
        let link = nodes::op_depth_moved_to(conn, src_op_depth - 1, victim_relpath)?
            .ok_or_else(|| WcError::NotMovedAway(victim_relpath.to_string()))?;
        wc.verify_write_lock(&link.dst_op_root_relpath)?;

        let source_layer = nodes::highest_layer_below(conn, &move_src_op_root, src_op_depth)?
            .ok_or_else(|| WcError::NotDeleted(victim_relpath.to_string()))?;
        if source_layer == 0 {
            driver::suitable_for_move(conn, victim_relpath)?;
        }

        debug!(
            victim = %victim_relpath,
            dst = %link.dst_op_root_relpath,
            source_layer,
            "updating move destination"
        );
        notify::spool_create(conn)?;
        let mut umb = UpdateMove::new(
            wc,
            conn,
            link.dst_op_root_relpath,
            info.operation,
            old_version,
            new_version,
            cancel,
        );
        driver::drive(&mut umb, victim_relpath, source_layer)
    })?;

    notify::spool_flush(
        wc.db(),
        wc.root(),
        Some(old_revision),
        Some(new_revision),
        notify::reborrow(&mut notify),
    )?;
    notify::emit(
        &mut notify,
        &Notification::completed(wc.abspath(victim_relpath), Some(new_revision)),
    );
    info!(victim = %victim_relpath, revision = new_revision, "move destination updated");
    Ok(())
}
