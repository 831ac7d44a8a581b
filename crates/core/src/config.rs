//! TOML-based configuration for working-copy access.
//!
//! Every field has a default, so an empty file (or [`WcConfig::default`])
//! describes a standard `.svn/wc.db` layout.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WcConfig {
    /// Location of the administrative area.
    #[serde(default)]
    pub working_copy: WorkingCopyConfig,

    /// Move-update behaviour.
    #[serde(default)]
    pub update_move: UpdateMoveConfig,

    /// Text merge settings.
    #[serde(default)]
    pub merge: MergeConfig,
}

// ---------------------------------------------------------------------------
// Working copy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingCopyConfig {
    /// Name of the administrative directory below the working-copy root.
    #[serde(default = "default_admin_dir")]
    pub admin_dir: String,

    /// File name of the metadata database inside the admin directory.
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_admin_dir() -> String {
    ".svn".into()
}
fn default_db_file() -> String {
    "wc.db".into()
}
fn default_busy_timeout() -> u64 {
    10_000
}

impl Default for WorkingCopyConfig {
    fn default() -> Self {
        Self {
            admin_dir: default_admin_dir(),
            db_file: default_db_file(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Update move
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMoveConfig {
    /// Record size and mtime of installed files so later modification
    /// checks can skip hashing.
    #[serde(default = "default_true")]
    pub record_file_info: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UpdateMoveConfig {
    fn default() -> Self {
        Self {
            record_file_info: default_true(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// How conflicting regions are written into a merged file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStyle {
    /// `<<<<<<<` ours `=======` theirs `>>>>>>>`.
    #[default]
    Merge,
    /// Like `Merge`, with the ancestor region between `|||||||` and `=======`.
    Diff3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub conflict_style: ConflictStyle,

    /// Length of the conflict marker lines.
    #[serde(default = "default_marker_length")]
    pub marker_length: usize,
}

fn default_marker_length() -> usize {
    7
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            conflict_style: ConflictStyle::default(),
            marker_length: default_marker_length(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl WcConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: WcConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate the configuration for obvious errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let admin_dir = &self.working_copy.admin_dir;
        if admin_dir.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "working_copy.admin_dir".into(),
                detail: "admin directory name must not be empty".into(),
            });
        }
        if admin_dir.contains('/') || admin_dir.contains('\\') || admin_dir == ".." {
            return Err(ConfigError::InvalidValue {
                field: "working_copy.admin_dir".into(),
                detail: "admin directory must be a single path component".into(),
            });
        }
        if self.working_copy.db_file.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "working_copy.db_file".into(),
                detail: "database file name must not be empty".into(),
            });
        }
        if self.merge.marker_length < 3 {
            return Err(ConfigError::InvalidValue {
                field: "merge.marker_length".into(),
                detail: "conflict markers must be at least 3 characters".into(),
            });
        }

        Ok(())
    }

    /// Load from `path` and validate.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
