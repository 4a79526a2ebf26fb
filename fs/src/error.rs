//! Error types for COWFS.
//!
//! One error enum covers the whole crate. The operation handler maps
//! variants onto POSIX errno values at the FUSE boundary; everything the
//! index or store cannot express as a logical condition surfaces as I/O.

use std::path::PathBuf;

/// Result type used throughout the crate.
pub type CowResult<T> = Result<T, CowError>;

// ============================================================================
// Error Kinds
// ============================================================================

/// Filesystem error.
#[derive(thiserror::Error, Debug)]
pub enum CowError {
    /// No such file or directory
    #[error("no such file or directory")]
    NotFound,
    /// Entry already exists
    #[error("file exists")]
    Exists,
    /// Directory not empty
    #[error("directory not empty")]
    NotEmpty,
    /// Target is a directory
    #[error("is a directory")]
    IsDirectory,
    /// Target is not a directory
    #[error("not a directory")]
    NotDirectory,
    /// Inode id is not known to the index
    #[error("stale file handle")]
    StaleHandle,
    /// Operation not supported (hardlinks, device nodes)
    #[error("operation not supported")]
    NotSupported,
    /// Malformed name or argument
    #[error("invalid argument")]
    InvalidArgument,
    /// No such version in the file's chain
    #[error("{path} has no version {version}")]
    VersionNotFound {
        /// Path the lookup ran against
        path: String,
        /// Requested version ordinal
        version: u64,
    },
    /// No snapshot with the given name
    #[error("no snapshot named '{0}'")]
    SnapshotNotFound(String),
    /// Snapshot name already taken
    #[error("snapshot '{0}' already exists")]
    SnapshotExists(String),
    /// Directory is not an initialized backend
    #[error("{} is not a COWFS backend (missing marker)", .0.display())]
    NotABackend(PathBuf),
    /// Backend declares a format this build does not understand
    #[error("unsupported backend format version {0}")]
    UnsupportedFormat(u32),
    /// Runtime invariant violation (digest mismatch, dangling reference)
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata index failure
    #[error("metadata index error: {0}")]
    Index(rusqlite::Error),
    /// Malformed format marker
    #[error("invalid backend marker: {0}")]
    Marker(#[from] serde_json::Error),
}

impl CowError {
    /// Map onto the POSIX errno reported to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Exists | Self::SnapshotExists(_) => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::StaleHandle => libc::ESTALE,
            Self::NotSupported => libc::ENOTSUP,
            Self::InvalidArgument => libc::EINVAL,
            Self::VersionNotFound { .. } | Self::SnapshotNotFound(_) => libc::ENOENT,
            _ => libc::EIO,
        }
    }

    /// True for conditions a caller may race against and retry.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<rusqlite::Error> for CowError {
    fn from(err: rusqlite::Error) -> Self {
        // A unique-constraint violation on (parent, name) or a snapshot
        // name is a logical "exists", not an I/O failure.
        if let rusqlite::Error::SqliteFailure(ffi, _) = &err {
            if ffi.code == rusqlite::ErrorCode::ConstraintViolation {
                return Self::Exists;
            }
        }
        Self::Index(err)
    }
}

// ============================================================================
// Tests
// ============================================================================
