//! Handle on one working copy: its root directory, metadata store,
//! configuration and the write locks this process holds.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::config::WcConfig;
use crate::db::locks::{self, WcLock};
use crate::db::Database;
use crate::errors::WcError;

/// An open working copy.
pub struct WcRoot {
    abspath: PathBuf,
    admin_path: PathBuf,
    db: Database,
    config: WcConfig,
    /// Locks taken through this handle.
    owned_locks: Mutex<Vec<WcLock>>,
}

impl WcRoot {
    /// Open the working copy rooted at `root`, creating its administrative
    /// area on first use.
    pub fn open<P: AsRef<Path>>(root: P, config: WcConfig) -> Result<Self, WcError> {
        config.validate()?;
        let abspath = root.as_ref().to_path_buf();
        let admin_path = abspath.join(&config.working_copy.admin_dir);
        std::fs::create_dir_all(admin_path.join("pristine"))?;

        let db = Database::new(
            admin_path.join(&config.working_copy.db_file),
            config.working_copy.busy_timeout_ms,
        )?;
        db.initialize()?;
        info!(root = %abspath.display(), "opened working copy");

        Ok(Self {
            abspath,
            admin_path,
            db,
            config,
            owned_locks: Mutex::new(Vec::new()),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &WcConfig {
        &self.config
    }

    /// The working-copy root directory.
    pub fn root(&self) -> &Path {
        &self.abspath
    }

    pub fn admin_path(&self) -> &Path {
        &self.admin_path
    }

    pub fn pristine_dir(&self) -> PathBuf {
        self.admin_path.join("pristine")
    }

    /// Absolute path of `local_relpath`.
    pub fn abspath(&self, local_relpath: &str) -> PathBuf {
        if local_relpath.is_empty() {
            self.abspath.clone()
        } else {
            self.abspath.join(local_relpath)
        }
    }

    // -----------------------------------------------------------------------
    // Write locks
    // -----------------------------------------------------------------------

    /// Take a write lock on `local_dir_relpath` covering `levels` levels
    /// below it (`-1` for the whole subtree).
    pub fn lock(&self, local_dir_relpath: &str, levels: i64) -> Result<(), WcError> {
        let wanted = WcLock {
            local_dir_relpath: local_dir_relpath.to_string(),
            locked_levels: levels,
        };
        self.db.transaction(|conn| {
            if let Some(held) = locks::find_overlapping(conn, &wanted)? {
                debug!(relpath = %local_dir_relpath, held = %held.local_dir_relpath, "lock overlaps");
                return Err(WcError::AlreadyLocked(local_dir_relpath.to_string()));
            }
            locks::insert_lock(conn, &wanted)?;
            Ok(())
        })?;
        self.owned().push(wanted);
        Ok(())
    }

    /// Release a lock taken with [`WcRoot::lock`].
    pub fn unlock(&self, local_dir_relpath: &str) -> Result<(), WcError> {
        let mut owned = self.owned();
        let Some(idx) = owned
            .iter()
            .position(|lock| lock.local_dir_relpath == local_dir_relpath)
        else {
            return Err(WcError::NotLocked(local_dir_relpath.to_string()));
        };
        locks::delete_lock(&self.db.conn(), local_dir_relpath)?;
        owned.remove(idx);
        Ok(())
    }

    /// True if a lock held by this handle covers `local_relpath`.
    pub fn owns_lock(&self, local_relpath: &str) -> bool {
        self.owned().iter().any(|lock| lock.covers(local_relpath))
    }

    pub fn verify_write_lock(&self, local_relpath: &str) -> Result<(), WcError> {
        if self.owns_lock(local_relpath) {
            Ok(())
        } else {
            Err(WcError::NotLocked(local_relpath.to_string()))
        }
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, Vec<WcLock>> {
        self.owned_locks.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("lock ownership mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
