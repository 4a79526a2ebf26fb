//! Persistent row types.
//!
//! One struct per entity in the metadata index, plus the sqlite
//! conversions for the column types that are not plain integers.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::store::Digest;

// ============================================================================
// File Kind
// ============================================================================

/// Kind of a filesystem entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Directory
    Directory,
    /// Regular file
    RegularFile,
}

impl FileKind {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directory => "dir",
            Self::RegularFile => "file",
        }
    }

    /// Is this a directory
    #[inline]
    pub fn is_dir(&self) -> bool {
        *self == Self::Directory
    }
}

impl FromSql for FileKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "dir" => Ok(Self::Directory),
            "file" => Ok(Self::RegularFile),
            other => Err(FromSqlError::Other(
                format!("unknown inode kind '{other}'").into(),
            )),
        }
    }
}

impl ToSql for FileKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Digest {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Digest::from_hex(value.as_str()?)
            .map_err(|e| FromSqlError::Other(e.to_string().into()))
    }
}

impl ToSql for Digest {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One filesystem entry.
///
/// `path` is denormalized for tooling; the handler itself navigates by
/// `(parent, name)`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InodeRow {
    /// Stable id; doubles as the kernel-visible inode number
    pub id: i64,
    /// Parent inode id (0 for the root)
    pub parent: i64,
    /// Name component
    pub name: String,
    /// Full path from the root
    pub path: String,
    /// Directory or regular file
    pub kind: FileKind,
    /// Current version id; null iff directory
    pub current_version: Option<i64>,
    /// Soft-deleted flag
    pub deleted: bool,
    /// Permission bits
    pub mode: u32,
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Creation timestamp (unix nanoseconds)
    pub created_at: i64,
    /// Last-modification timestamp (unix nanoseconds)
    pub updated_at: i64,
}

impl InodeRow {
    /// Is this a directory
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// One saved state of one file.
#[derive(Clone, Debug, serde::Serialize)]
pub struct VersionRow {
    /// Version id; chain order is ascending id
    pub id: i64,
    /// Owning file inode id
    pub file_id: i64,
    /// Content digest
    pub digest: Digest,
    /// Byte size
    pub size: u64,
    /// Creation timestamp (unix nanoseconds)
    pub created_at: i64,
    /// Soft-deleted flag (set only by GC policy)
    pub deleted: bool,
}

/// One distinct byte sequence ever stored.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ObjectRow {
    /// Content digest (primary key)
    pub digest: Digest,
    /// Byte size
    pub size: u64,
    /// Live references from versions and snapshot entries
    pub refcount: i64,
    /// Creation timestamp (unix nanoseconds)
    pub created_at: i64,
}

/// A named point-in-time capture.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SnapshotRow {
    /// Snapshot id
    pub id: i64,
    /// Unique name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Creation timestamp (unix nanoseconds)
    pub created_at: i64,
}

/// One (snapshot, inode, version) record.
///
/// Directories participate with a null version id so that snapshot
/// restore can tell "existed at snapshot time" from "created later".
#[derive(Clone, Debug, serde::Serialize)]
pub struct SnapshotEntryRow {
    /// Owning snapshot
    pub snapshot_id: i64,
    /// Captured inode
    pub file_id: i64,
    /// The inode's then-current version; null for directories
    pub version_id: Option<i64>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_column_values() {
        assert_eq!(FileKind::Directory.as_str(), "dir");
        assert_eq!(FileKind::RegularFile.as_str(), "file");
        assert!(FileKind::Directory.is_dir());
        assert!(!FileKind::RegularFile.is_dir());
    }
}
