//! Domain model types shared by the store, the conflict codec and the engine.

use std::collections::BTreeMap;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Versioned properties of a node, ordered by name.
pub type Props = BTreeMap<String, String>;

/// Implements `Display`, `ToSql` and `FromSql` for an enum stored as a text token.
macro_rules! token_enum {
    ($ty:ident { $($variant:ident => $token:literal),+ $(,)? }) => {
        impl $ty {
            /// Token used for this value in the store.
            pub fn as_token(&self) -> &'static str {
                match self {
                    $(Self::$variant => $token),+
                }
            }

            /// Parse a stored token.
            pub fn from_token(s: &str) -> Option<Self> {
                match s {
                    $($token => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_token())
            }
        }

        impl ::rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> ::rusqlite::Result<::rusqlite::types::ToSqlOutput<'_>> {
                Ok(::rusqlite::types::ToSqlOutput::from(self.as_token()))
            }
        }

        impl ::rusqlite::types::FromSql for $ty {
            fn column_result(
                value: ::rusqlite::types::ValueRef<'_>,
            ) -> ::rusqlite::types::FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::from_token(s).ok_or(::rusqlite::types::FromSqlError::InvalidType)
            }
        }
    };
}
pub(crate) use token_enum;

// ---------------------------------------------------------------------------
// Node kind
// ---------------------------------------------------------------------------

/// Kind of a versioned node, or of whatever occupies a path on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    Unknown,
    /// Nothing is there.
    None,
}

token_enum!(NodeKind {
    File => "file",
    Dir => "dir",
    Symlink => "symlink",
    Unknown => "unknown",
    None => "none",
});

impl NodeKind {
    /// Kind of the node currently occupying `path` on disk. Symlinks are not
    /// followed and are reported as files.
    pub fn on_disk(path: &std::path::Path) -> std::io::Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(Self::Dir),
            Ok(meta) if meta.is_file() || meta.file_type().is_symlink() => Ok(Self::File),
            Ok(_) => Ok(Self::Unknown),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::None),
            Err(e) => Err(e),
        }
    }

    /// True for files and symlinks, the kinds that carry text.
    pub fn is_file_like(self) -> bool {
        matches!(self, Self::File | Self::Symlink)
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Presence of a node in one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    Normal,
    /// Known to the repository but absent in this layer.
    NotPresent,
    /// A delete shadowing a lower layer.
    BaseDeleted,
    Excluded,
    ServerExcluded,
    Incomplete,
}

token_enum!(Presence {
    Normal => "normal",
    NotPresent => "not-present",
    BaseDeleted => "base-deleted",
    Excluded => "excluded",
    ServerExcluded => "server-excluded",
    Incomplete => "incomplete",
});

impl Presence {
    /// True for rows that describe an existing node.
    pub fn is_present(self) -> bool {
        matches!(self, Self::Normal | Self::Incomplete)
    }
}

// ---------------------------------------------------------------------------
// Depth
// ---------------------------------------------------------------------------

/// How much of a directory's subtree an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// The directory itself only.
    Empty,
    /// The directory and its file children.
    Files,
    /// The directory and all its immediate children.
    Immediates,
    Infinity,
}

token_enum!(Depth {
    Empty => "empty",
    Files => "files",
    Immediates => "immediates",
    Infinity => "infinity",
});

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// SHA-256 of a pristine text, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl Checksum {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for Checksum {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for Checksum {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Checksum(value.as_str()?.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        assert_eq!(Presence::from_token("base-deleted"), Some(Presence::BaseDeleted));
        assert_eq!(Presence::BaseDeleted.to_string(), "base-deleted");
        assert_eq!(NodeKind::from_token("dir"), Some(NodeKind::Dir));
        assert_eq!(Depth::from_token("immediates"), Some(Depth::Immediates));
        assert_eq!(NodeKind::from_token("bogus"), None);
    }

    #[test]
    fn test_on_disk_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert_eq!(NodeKind::on_disk(dir.path()).unwrap(), NodeKind::Dir);
        assert_eq!(NodeKind::on_disk(&file).unwrap(), NodeKind::File);
        assert_eq!(
            NodeKind::on_disk(&dir.path().join("missing")).unwrap(),
            NodeKind::None
        );
    }

    #[test]
    fn test_presence_is_present() {
        assert!(Presence::Normal.is_present());
        assert!(Presence::Incomplete.is_present());
        assert!(!Presence::BaseDeleted.is_present());
        assert!(!Presence::NotPresent.is_present());
    }
}
