//! Conflict descriptors and their stored form.
//!
//! A descriptor is attached to one node (in `actual_node.conflict_data`) and
//! may carry a tree, text and property part at the same time. All parts share
//! the operation and the old/new repository locations that produced them.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::actual;
use crate::errors::ConflictError;
use crate::models::NodeKind;

/// Operation that left the node in conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    None,
    Update,
    Switch,
    Merge,
}

impl Operation {
    pub fn is_update_or_switch(self) -> bool {
        matches!(self, Self::Update | Self::Switch)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Update => write!(f, "update"),
            Self::Switch => write!(f, "switch"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Local state that collided with the incoming change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    Edited,
    Obstructed,
    Deleted,
    Missing,
    Unversioned,
    Added,
    Replaced,
    MovedAway,
    MovedHere,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Edited => "edited",
            Self::Obstructed => "obstructed",
            Self::Deleted => "deleted",
            Self::Missing => "missing",
            Self::Unversioned => "unversioned",
            Self::Added => "added",
            Self::Replaced => "replaced",
            Self::MovedAway => "moved_away",
            Self::MovedHere => "moved_here",
        };
        f.write_str(s)
    }
}

/// Incoming change that could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Edit,
    Add,
    Delete,
    Replace,
}

impl std::fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Edit => write!(f, "edit"),
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
            Self::Replace => write!(f, "replace"),
        }
    }
}

/// A repository location snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictVersion {
    pub repos_url: String,
    pub repos_uuid: String,
    pub path_in_repos: String,
    pub peg_rev: i64,
    pub node_kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConflict {
    pub reason: ConflictReason,
    pub action: ConflictAction,
    /// For `MovedAway`, root of the deletion layer whose move this is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_src_op_root_relpath: Option<String>,
}

/// Side files written next to a text-conflicted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextConflict {
    pub mine_file: String,
    pub old_file: String,
    pub new_file: String,
}

/// The three values of one conflicted property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropConflictValues {
    pub base: Option<String>,
    pub mine: Option<String>,
    pub theirs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropConflict {
    /// Relpath of the reject file describing the conflicts.
    pub reject_file: String,
    pub conflicted: BTreeMap<String, PropConflictValues>,
}

/// Everything recorded about the conflicts on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub operation: Operation,
    #[serde(default)]
    pub old_version: Option<ConflictVersion>,
    #[serde(default)]
    pub new_version: Option<ConflictVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<TreeConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextConflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<PropConflict>,
}

impl ConflictDescriptor {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            old_version: None,
            new_version: None,
            tree: None,
            text: None,
            props: None,
        }
    }

    /// Set the operation and the locations it moved between.
    pub fn set_operation(
        &mut self,
        operation: Operation,
        old_version: Option<ConflictVersion>,
        new_version: Option<ConflictVersion>,
    ) {
        self.operation = operation;
        self.old_version = old_version;
        self.new_version = new_version;
    }

    /// True if no part of the descriptor records a conflict.
    pub fn is_empty(&self) -> bool {
        self.tree.is_none() && self.text.is_none() && self.props.is_none()
    }
}

/// The tree-conflict view of a victim's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeConflictInfo {
    pub operation: Operation,
    pub reason: ConflictReason,
    pub action: ConflictAction,
    pub move_src_op_root_relpath: Option<String>,
    pub old_version: Option<ConflictVersion>,
    pub new_version: Option<ConflictVersion>,
}

/// Read the tree conflict on `local_relpath`, which must have been raised by
/// an update or a switch.
pub fn get_tc_info(conn: &Connection, local_relpath: &str) -> Result<TreeConflictInfo, ConflictError> {
    let conflict = actual::read_conflict(conn, local_relpath)?
        .ok_or_else(|| ConflictError::NotInConflict(local_relpath.to_string()))?;

    if !conflict.operation.is_update_or_switch() {
        return Err(ConflictError::NotTreeConflictVictim(local_relpath.to_string()));
    }
    let Some(tree) = conflict.tree else {
        return Err(ConflictError::NotTreeConflictVictim(local_relpath.to_string()));
    };

    Ok(TreeConflictInfo {
        operation: conflict.operation,
        reason: tree.reason,
        action: tree.action,
        move_src_op_root_relpath: tree.move_src_op_root_relpath,
        old_version: conflict.old_version,
        new_version: conflict.new_version,
    })
}
