//! wcmove core library.
//!
//! Replays an update of a locally moved subtree onto the move's destination.
//! The working-copy metadata lives in a layered node store, where each path
//! can carry a BASE layer and any number of local layers. The engine in
//! [`update_move`] compares the updated source with the destination inside
//! one transaction. It merges local changes and records tree conflicts where
//! they collide with the update. Filesystem effects are queued in
//! [`workqueue`] and notifications are spooled in [`notify`] until the
//! transaction commits.

pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod modcheck;
pub mod models;
pub mod notify;
pub mod pristine;
pub mod relpath;
pub mod update_move;
pub mod wcroot;
pub mod workqueue;

// Re-exports for convenience.
pub use config::WcConfig;
pub use db::Database;
pub use errors::WcError;
pub use notify::Notification;
pub use update_move::{
    bump_moved_away, required_lock_for_resolve, resolve_break_moved_away,
    resolve_break_moved_away_children, resolve_delete_raise_moved_away,
    update_moved_away_conflict_victim, CancelFn,
};
pub use wcroot::WcRoot;
