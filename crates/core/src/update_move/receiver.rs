//! Edits applied to the move destination.
//!
//! Every edit first asks the tracker whether the path is already conflicted
//! or collides with a local layer over the destination; the tracker raises
//! the tree conflict in the second case. Conflicted and shadowed paths stop
//! there. Working files are never touched directly: every filesystem effect
//! is queued as a work item, and every outcome is spooled as a notification.

use std::collections::BTreeMap;

use rusqlite::Connection;
use tracing::{debug, warn};

use super::tracker::check_tree_conflict;
use super::UpdateMove;
use crate::conflict::props::{diff_props, has_magic_property, merge_props, reject_text};
use crate::conflict::{
    ConflictAction, ConflictDescriptor, ConflictReason, ConflictVersion, PropConflict,
    PropConflictValues, TextConflict,
};
use crate::db::nodes::{self, NodeRow};
use crate::db::actual;
use crate::errors::WcError;
use crate::models::{Checksum, NodeKind, Props};
use crate::notify::{self, NotifyAction, NotifyState};
use crate::workqueue::{self, WorkItem};
use crate::{modcheck, pristine, relpath};

/// Reject file for conflicted properties of a directory.
const DIR_REJECT_FILE: &str = "dir_conflicts.prej";

fn existing_row(umb: &UpdateMove<'_>, relpath: &str) -> Result<Option<NodeRow>, WcError> {
    Ok(nodes::depth_get_info(umb.conn, relpath, umb.dst_op_depth())?)
}

fn kind_and_repos(row: Option<NodeRow>) -> (NodeKind, Option<String>) {
    match row {
        Some(row) => (row.kind, row.repos_path),
        None => (NodeKind::None, None),
    }
}

// ---------------------------------------------------------------------------
// Add
// ---------------------------------------------------------------------------

pub(crate) fn add_directory(umb: &mut UpdateMove<'_>, relpath: &str, shadowed: bool) -> Result<(), WcError> {
    let (old_kind, old_repos) = kind_and_repos(existing_row(umb, relpath)?);
    let conflicted =
        check_tree_conflict(umb, relpath, old_kind, NodeKind::Dir, old_repos.as_deref(), ConflictAction::Add)?;
    if conflicted || shadowed {
        return Ok(());
    }

    match NodeKind::on_disk(&umb.wc.abspath(relpath))? {
        NodeKind::None => {
            workqueue::add(umb.conn, &WorkItem::DirInstall { relpath: relpath.to_string() })?;
        }
        NodeKind::Dir => {}
        _ => {
            debug!(relpath = %relpath, "unversioned obstruction");
            umb.raise(
                relpath,
                old_kind,
                NodeKind::Dir,
                old_repos.as_deref(),
                ConflictReason::Unversioned,
                ConflictAction::Add,
                None,
            )?;
            umb.conflict_root = Some(relpath.to_string());
            return Ok(());
        }
    }

    notify::spool_add(
        umb.conn,
        relpath,
        NotifyAction::UpdateAdd,
        NodeKind::Dir,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    Ok(())
}

pub(crate) fn add_file(
    umb: &mut UpdateMove<'_>,
    relpath: &str,
    checksum: Option<&Checksum>,
    shadowed: bool,
) -> Result<(), WcError> {
    let (old_kind, old_repos) = kind_and_repos(existing_row(umb, relpath)?);
    let conflicted =
        check_tree_conflict(umb, relpath, old_kind, NodeKind::File, old_repos.as_deref(), ConflictAction::Add)?;
    if conflicted || shadowed {
        return Ok(());
    }

    if NodeKind::on_disk(&umb.wc.abspath(relpath))? != NodeKind::None {
        debug!(relpath = %relpath, "unversioned obstruction");
        umb.raise(
            relpath,
            old_kind,
            NodeKind::File,
            old_repos.as_deref(),
            ConflictReason::Unversioned,
            ConflictAction::Add,
            None,
        )?;
        umb.conflict_root = Some(relpath.to_string());
        return Ok(());
    }

    match checksum {
        Some(checksum) => {
            workqueue::add(
                umb.conn,
                &WorkItem::FileInstall {
                    relpath: relpath.to_string(),
                    checksum: checksum.clone(),
                    record_file_info: umb.wc.config().update_move.record_file_info,
                },
            )?;
        }
        None => warn!(relpath = %relpath, "added file has no pristine text, nothing to install"),
    }

    notify::spool_add(
        umb.conn,
        relpath,
        NotifyAction::UpdateAdd,
        NodeKind::File,
        NotifyState::Inapplicable,
        NotifyState::Inapplicable,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Alter
// ---------------------------------------------------------------------------

struct PropUpdate {
    state: NotifyState,
    conflicts: BTreeMap<String, PropConflictValues>,
}

/// Merge the incoming change from `old_props` to `new_props` into the
/// working properties of `relpath`.
fn update_working_props(
    conn: &Connection,
    relpath: &str,
    old_props: &Props,
    new_props: &Props,
) -> Result<PropUpdate, WcError> {
    let actual_props = actual::read_props(conn, relpath)?;
    let changes = diff_props(old_props, new_props);
    let outcome = merge_props(old_props, &actual_props, &changes);

    let overlay = (outcome.actual != *new_props).then_some(&outcome.actual);
    actual::set_actual_props(conn, relpath, overlay)?;
    if has_magic_property(&changes) {
        nodes::set_recorded_info(conn, relpath, None, None)?;
    }

    Ok(PropUpdate {
        state: outcome.state,
        conflicts: outcome.conflicts,
    })
}

/// Attach the locations to `conflict` and queue its reject file, if any.
fn create_conflict_markers(
    umb: &UpdateMove<'_>,
    relpath: &str,
    repos_relpath: Option<&str>,
    conflict: &mut ConflictDescriptor,
    kind: NodeKind,
) -> Result<(), WcError> {
    let old_path = repos_relpath
        .unwrap_or(&umb.old_version.path_in_repos)
        .to_string();
    let part = relpath::skip_ancestor(&umb.old_version.path_in_repos, &old_path)
        .or_else(|| relpath::skip_ancestor(&umb.new_version.path_in_repos, &old_path))
        .unwrap_or("");
    let new_version = ConflictVersion {
        path_in_repos: relpath::join(&umb.new_version.path_in_repos, part),
        node_kind: kind,
        ..umb.new_version.clone()
    };
    let old_version = ConflictVersion {
        path_in_repos: old_path,
        node_kind: kind,
        ..umb.old_version.clone()
    };
    conflict.set_operation(umb.operation, Some(old_version), Some(new_version));

    if let Some(prop_conflict) = &conflict.props {
        workqueue::add(
            umb.conn,
            &WorkItem::PrejInstall {
                relpath: prop_conflict.reject_file.clone(),
                text: reject_text(&prop_conflict.conflicted),
            },
        )?;
    }
    debug!(relpath = %relpath, "recording conflict markers");
    Ok(())
}

pub(crate) fn alter_directory(
    umb: &mut UpdateMove<'_>,
    relpath: &str,
    new_props: Option<&Props>,
    shadowed: bool,
) -> Result<(), WcError> {
    let row = existing_row(umb, relpath)?.ok_or_else(|| WcError::PathNotFound(relpath.to_string()))?;
    if row.kind != NodeKind::Dir {
        return Err(WcError::UnexpectedKind {
            path: relpath.to_string(),
            expected: NodeKind::Dir.to_string(),
            found: row.kind.to_string(),
        });
    }
    if check_tree_conflict(
        umb,
        relpath,
        NodeKind::Dir,
        NodeKind::Dir,
        row.repos_path.as_deref(),
        ConflictAction::Edit,
    )? || shadowed
    {
        return Ok(());
    }

    // Child changes are applied by the walk itself.
    let Some(new_props) = new_props else {
        return Ok(());
    };

    let old_props = row.properties.clone().unwrap_or_default();
    let update = update_working_props(umb.conn, relpath, &old_props, new_props)?;
    if !update.conflicts.is_empty() {
        let mut conflict = ConflictDescriptor::new(umb.operation);
        conflict.props = Some(PropConflict {
            reject_file: relpath::join(relpath, DIR_REJECT_FILE),
            conflicted: update.conflicts,
        });
        create_conflict_markers(umb, relpath, row.repos_path.as_deref(), &mut conflict, NodeKind::Dir)?;
        actual::mark_conflict(umb.conn, relpath, &conflict)?;
    }

    notify::spool_add(
        umb.conn,
        relpath,
        NotifyAction::UpdateUpdate,
        NodeKind::Dir,
        NotifyState::Inapplicable,
        update.state,
    )?;
    Ok(())
}

pub(crate) fn alter_file(
    umb: &mut UpdateMove<'_>,
    relpath: &str,
    new_checksum: Option<&Checksum>,
    new_props: Option<&Props>,
    shadowed: bool,
) -> Result<(), WcError> {
    let row = existing_row(umb, relpath)?.ok_or_else(|| WcError::PathNotFound(relpath.to_string()))?;
    if !row.kind.is_file_like() {
        return Err(WcError::UnexpectedKind {
            path: relpath.to_string(),
            expected: NodeKind::File.to_string(),
            found: row.kind.to_string(),
        });
    }
    if check_tree_conflict(
        umb,
        relpath,
        row.kind,
        NodeKind::File,
        row.repos_path.as_deref(),
        ConflictAction::Edit,
    )? || shadowed
    {
        return Ok(());
    }

    update_working_file(umb, &row, new_checksum, new_props)
}

fn update_working_file(
    umb: &UpdateMove<'_>,
    row: &NodeRow,
    new_checksum: Option<&Checksum>,
    new_props: Option<&Props>,
) -> Result<(), WcError> {
    let relpath = row.local_relpath.as_str();
    let old_props = row.properties.clone().unwrap_or_default();
    let new_props = new_props.unwrap_or(&old_props);
    let prop_update = update_working_props(umb.conn, relpath, &old_props, new_props)?;

    let mut conflict = ConflictDescriptor::new(umb.operation);
    let content_state = match new_checksum.filter(|c| row.checksum.as_ref() != Some(*c)) {
        Some(checksum) => update_working_text(umb, row, checksum, &mut conflict)?,
        None => NotifyState::Unchanged,
    };

    if !prop_update.conflicts.is_empty() {
        conflict.props = Some(PropConflict {
            reject_file: format!("{relpath}.prej"),
            conflicted: prop_update.conflicts,
        });
    }
    if !conflict.is_empty() {
        create_conflict_markers(umb, relpath, row.repos_path.as_deref(), &mut conflict, NodeKind::File)?;
        actual::mark_conflict(umb.conn, relpath, &conflict)?;
    }

    notify::spool_add(
        umb.conn,
        relpath,
        NotifyAction::UpdateUpdate,
        NodeKind::File,
        content_state,
        prop_update.state,
    )?;
    Ok(())
}

/// Bring the working text of `row` to `new_checksum`. An unmodified file is
/// replaced outright; a locally modified one gets a three-way merge.
fn update_working_text(
    umb: &UpdateMove<'_>,
    row: &NodeRow,
    new_checksum: &Checksum,
    conflict: &mut ConflictDescriptor,
) -> Result<NotifyState, WcError> {
    let relpath = row.local_relpath.as_str();
    let path = umb.wc.abspath(relpath);

    let missing = NodeKind::on_disk(&path)? == NodeKind::None;
    if missing || !modcheck::is_file_modified(umb.wc, row)? {
        workqueue::add(
            umb.conn,
            &WorkItem::FileInstall {
                relpath: relpath.to_string(),
                checksum: new_checksum.clone(),
                record_file_info: umb.wc.config().update_move.record_file_info,
            },
        )?;
        return Ok(NotifyState::Changed);
    }

    let pristine_dir = umb.wc.pristine_dir();
    let base = match &row.checksum {
        Some(old_checksum) => pristine::read(&pristine_dir, old_checksum)?,
        None => Vec::new(),
    };
    let theirs = pristine::read(&pristine_dir, new_checksum)?;
    let mine = std::fs::read(&path)?;

    let merged = umb.merger.merge_bytes(&base, &mine, &theirs)?;
    if let Some(merged) = &merged {
        if merged.is_clean() {
            debug!(relpath = %relpath, "merged cleanly");
            workqueue::add(
                umb.conn,
                &WorkItem::FileWrite {
                    relpath: relpath.to_string(),
                    text: merged.text.clone(),
                },
            )?;
            return Ok(NotifyState::Merged);
        }
    }

    // Conflicted, or binary. Binary working files stay as they are.
    let mine_file = match merged {
        Some(merged) => {
            let mine_file = format!("{relpath}.mine");
            workqueue::add(
                umb.conn,
                &WorkItem::FileCopy {
                    src_relpath: relpath.to_string(),
                    dst_relpath: mine_file.clone(),
                },
            )?;
            workqueue::add(
                umb.conn,
                &WorkItem::FileWrite {
                    relpath: relpath.to_string(),
                    text: merged.text,
                },
            )?;
            mine_file
        }
        None => {
            debug!(relpath = %relpath, "binary file, keeping working text");
            relpath.to_string()
        }
    };

    let old_file = format!("{relpath}.r{}", umb.old_version.peg_rev);
    let new_file = format!("{relpath}.r{}", umb.new_version.peg_rev);
    if let Some(old_checksum) = &row.checksum {
        workqueue::add(
            umb.conn,
            &WorkItem::FileInstall {
                relpath: old_file.clone(),
                checksum: old_checksum.clone(),
                record_file_info: false,
            },
        )?;
    }
    workqueue::add(
        umb.conn,
        &WorkItem::FileInstall {
            relpath: new_file.clone(),
            checksum: new_checksum.clone(),
            record_file_info: false,
        },
    )?;

    conflict.text = Some(TextConflict {
        mine_file,
        old_file,
        new_file,
    });
    Ok(NotifyState::Conflicted)
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

fn queue_removal(conn: &Connection, relpath: &str, kind: NodeKind) -> Result<(), WcError> {
    let item = if kind == NodeKind::Dir {
        WorkItem::DirRemove {
            relpath: relpath.to_string(),
            recursive: false,
        }
    } else {
        WorkItem::FileRemove {
            relpath: relpath.to_string(),
        }
    };
    workqueue::add(conn, &item)?;
    Ok(())
}

/// Remove `relpath` from the destination.
///
/// Local edits below it turn the destination subtree into an ordinary copy,
/// one op-depth up, and raise an edited/delete conflict. When the only local
/// changes are deletions, the working layers are dropped, the removal still
/// goes ahead and a deleted/delete conflict is raised.
pub(crate) fn delete(umb: &mut UpdateMove<'_>, relpath: &str, shadowed: bool) -> Result<(), WcError> {
    let op_depth = umb.dst_op_depth();
    let (kind, repos) = kind_and_repos(existing_row(umb, relpath)?);

    // Checked before the destination rows go, so that a local delete of the
    // node itself meets the incoming delete. Deleted children show up as
    // local modifications instead.
    if check_tree_conflict(
        umb,
        relpath,
        kind,
        NodeKind::Unknown,
        repos.as_deref(),
        ConflictAction::Delete,
    )? || shadowed
    {
        return Ok(());
    }

    let mods = modcheck::node_has_local_mods(umb.wc, umb.conn, relpath, op_depth)?;
    let conflicted = mods.modified;
    let must_delete = mods.modified && mods.all_deletes;
    if mods.modified {
        let reason = if must_delete {
            nodes::delete_above(umb.conn, relpath, op_depth)?;
            ConflictReason::Deleted
        } else {
            nodes::shift_op_depth(umb.conn, relpath, op_depth, relpath::depth(relpath))?;
            ConflictReason::Edited
        };
        debug!(relpath = %relpath, %reason, "incoming delete meets local changes");
        umb.raise(
            relpath,
            kind,
            NodeKind::None,
            repos.as_deref(),
            reason,
            ConflictAction::Delete,
            None,
        )?;
        umb.conflict_root = Some(relpath.to_string());
    }

    let mut del_kind = kind;
    if !conflicted || must_delete {
        for (child, child_kind) in nodes::descendants_at_op_depth_rev(umb.conn, relpath, op_depth)? {
            queue_removal(umb.conn, &child, child_kind)?;
        }
        if let Some(row) = existing_row(umb, relpath)? {
            del_kind = row.kind;
        }
        queue_removal(umb.conn, relpath, del_kind)?;
    }

    if !conflicted {
        notify::spool_add(
            umb.conn,
            relpath,
            NotifyAction::UpdateDelete,
            del_kind,
            NotifyState::Inapplicable,
            NotifyState::Inapplicable,
        )?;
    }
    Ok(())
}
