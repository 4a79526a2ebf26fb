//! Backend
//!
//! The on-disk home of one filesystem instance: a format marker, the
//! metadata index, and the object store, all rooted at a user-chosen
//! directory. A directory without the marker is never used as a backend,
//! and the digest algorithm is immutable after initialization.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{CowError, CowResult};
use crate::meta::MetaIndex;
use crate::store::{DigestAlgo, ObjectStore};

// ============================================================================
// Constants
// ============================================================================

/// Format marker file name at the backend root.
pub const MARKER_FILE: &str = ".cowfs";

/// Metadata index file name.
pub const DB_FILE: &str = "metadata.db";

/// Object store directory name.
pub const OBJECTS_DIR: &str = "objects";

/// Current backend format version.
pub const FORMAT_VERSION: u32 = 1;

// ============================================================================
// Format Marker
// ============================================================================

/// The `.cowfs` document identifying a directory as a backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormatMarker {
    /// Backend format version
    pub format_version: u32,
    /// Digest algorithm, fixed for the backend's lifetime
    pub digest_algo: String,
    /// Initialization timestamp (unix nanoseconds)
    pub created_at: i64,
}

impl FormatMarker {
    /// Reject markers this build cannot serve.
    pub fn validate(&self) -> CowResult<DigestAlgo> {
        if self.format_version != FORMAT_VERSION {
            return Err(CowError::UnsupportedFormat(self.format_version));
        }
        DigestAlgo::from_str(&self.digest_algo)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// An opened filesystem backend.
#[derive(Debug)]
pub struct Backend {
    root: PathBuf,
    algo: DigestAlgo,
    /// Content-addressed blob repository
    pub store: ObjectStore,
    /// Transactional metadata index
    pub index: MetaIndex,
}

impl Backend {
    /// Initialize a new backend at `root`.
    ///
    /// Creates the directory tree, writes the format marker, the schema,
    /// the root inode, and the well-known empty object's blob. Refuses a
    /// directory that is already a backend.
    pub fn init(root: impl AsRef<Path>, algo: DigestAlgo) -> CowResult<Self> {
        let root = root.as_ref().to_path_buf();
        let marker_path = root.join(MARKER_FILE);
        if marker_path.exists() {
            return Err(CowError::Exists);
        }
        fs::create_dir_all(&root)?;

        let marker = FormatMarker {
            format_version: FORMAT_VERSION,
            digest_algo: algo.as_str().to_owned(),
            created_at: crate::meta::now_nanos(),
        };
        fs::write(&marker_path, serde_json::to_vec_pretty(&marker)?)?;

        let store = ObjectStore::open(root.join(OBJECTS_DIR), algo)?;
        store.put(&[])?;
        let index = MetaIndex::open(root.join(DB_FILE))?;

        info!("initialized backend at {} ({algo})", root.display());
        Ok(Self {
            root,
            algo,
            store,
            index,
        })
    }

    /// Open an existing backend, refusing unmarked directories and
    /// unsupported format versions.
    pub fn open(root: impl AsRef<Path>) -> CowResult<Self> {
        let root = root.as_ref().to_path_buf();
        let marker_path = root.join(MARKER_FILE);
        if !marker_path.exists() {
            return Err(CowError::NotABackend(root));
        }
        let marker: FormatMarker = serde_json::from_slice(&fs::read(&marker_path)?)?;
        let algo = marker.validate()?;

        let store = ObjectStore::open(root.join(OBJECTS_DIR), algo)?;
        let index = MetaIndex::open(root.join(DB_FILE))?;

        Ok(Self {
            root,
            algo,
            store,
            index,
        })
    }

    /// Backend root directory.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The backend's digest algorithm.
    #[inline]
    pub fn algo(&self) -> DigestAlgo {
        self.algo
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        assert_eq!(backend.algo(), DigestAlgo::Sha256);
        drop(backend);

        let reopened = Backend::open(dir.path()).unwrap();
        assert_eq!(reopened.algo(), DigestAlgo::Sha256);
        // The empty object blob exists from init.
        assert!(reopened.store.exists(&DigestAlgo::Sha256.empty()));
    }

    #[test]
    fn test_open_refuses_unmarked_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = Backend::open(dir.path()).unwrap_err();
        assert!(matches!(err, CowError::NotABackend(_)));
    }

    #[test]
    fn test_init_refuses_existing_backend() {
        let dir = tempfile::tempdir().unwrap();
        Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        let err = Backend::init(dir.path(), DigestAlgo::Blake3).unwrap_err();
        assert!(matches!(err, CowError::Exists));
    }

    #[test]
    fn test_open_refuses_future_format() {
        let dir = tempfile::tempdir().unwrap();
        let marker = FormatMarker {
            format_version: 99,
            digest_algo: "sha256".into(),
            created_at: 0,
        };
        fs::write(
            dir.path().join(MARKER_FILE),
            serde_json::to_vec(&marker).unwrap(),
        )
        .unwrap();
        let err = Backend::open(dir.path()).unwrap_err();
        assert!(matches!(err, CowError::UnsupportedFormat(99)));
    }

    #[test]
    fn test_blake3_backend_keeps_algo() {
        let dir = tempfile::tempdir().unwrap();
        Backend::init(dir.path(), DigestAlgo::Blake3).unwrap();
        let reopened = Backend::open(dir.path()).unwrap();
        assert_eq!(reopened.algo(), DigestAlgo::Blake3);
    }
}
