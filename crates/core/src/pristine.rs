//! Checksum-addressed store of pristine file texts.
//!
//! Each text lives at `<pristine dir>/<first two hex digits>/<checksum>` and
//! is indexed in the `pristine` table.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{DatabaseError, PristineError};
use crate::models::Checksum;

/// SHA-256 of `content`.
pub fn checksum_of(content: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(content);
    Checksum(hex::encode(hasher.finalize()))
}

fn location(dir: &Path, checksum: &Checksum) -> PathBuf {
    let hex = checksum.as_str();
    let prefix = hex.get(..2).unwrap_or(hex);
    dir.join(prefix).join(hex)
}

/// Store `content` and return its checksum. Installing a text that is
/// already present only bumps its reference count.
pub fn install(conn: &Connection, dir: &Path, content: &[u8]) -> Result<Checksum, PristineError> {
    let checksum = checksum_of(content);
    let path = location(dir, &checksum);
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write under a temporary name so a crash never leaves a truncated text.
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
    }

    conn.execute(
        "INSERT INTO pristine (checksum, size, refcount) VALUES (?1, ?2, 1) \
         ON CONFLICT (checksum) DO UPDATE SET refcount = refcount + 1",
        params![checksum, content.len() as i64],
    )
    .map_err(DatabaseError::from)?;
    debug!(checksum = %checksum, size = content.len(), "installed pristine");
    Ok(checksum)
}

/// Path of the pristine text with `checksum`; fails if it is not stored.
pub fn get_path(dir: &Path, checksum: &Checksum) -> Result<PathBuf, PristineError> {
    let path = location(dir, checksum);
    if path.is_file() {
        Ok(path)
    } else {
        Err(PristineError::NotFound(checksum.to_string()))
    }
}

/// Contents of the pristine text with `checksum`.
pub fn read(dir: &Path, checksum: &Checksum) -> Result<Vec<u8>, PristineError> {
    let path = get_path(dir, checksum)?;
    Ok(std::fs::read(path)?)
}
