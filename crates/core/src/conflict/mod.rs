//! Conflict recording and the merges that can produce conflicts.
//!
//! - [`descriptor`]: the per-node conflict descriptor and its stored form.
//! - [`props`]: three-way property merge.
//! - [`merger`]: three-way text merge.

pub mod descriptor;
pub mod merger;
pub mod props;

pub use descriptor::{
    get_tc_info, ConflictAction, ConflictDescriptor, ConflictReason, ConflictVersion, Operation,
    PropConflict, PropConflictValues, TextConflict, TreeConflict, TreeConflictInfo,
};
pub use merger::{Merger, TextMerge};
