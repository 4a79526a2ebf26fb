//! Object Store
//!
//! A flat repository of immutable blobs addressed by the digest of their
//! content. Blobs live under `objects/<xx>/<rest>` where `<xx>` is the
//! first two hex characters of the digest, bounding any one directory's
//! fan-out to 256 entries.
//!
//! Blobs are written to a temporary sibling, flushed to stable storage,
//! then renamed into place, so a blob that exists is always complete.
//! Two concurrent puts of the same content write the same bytes to the
//! same path and are therefore safe.

pub mod digest;

pub use digest::{Digest, DigestAlgo, DIGEST_HEX_LEN};

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::trace;

use crate::error::{CowError, CowResult};

// ============================================================================
// Object Store
// ============================================================================

/// Content-addressed blob repository.
#[derive(Debug)]
pub struct ObjectStore {
    /// Root directory (`<backend>/objects`)
    root: PathBuf,
    /// Digest algorithm fixed at backend initialization
    algo: DigestAlgo,
}

impl ObjectStore {
    /// Open the store rooted at `root`, creating the directory if absent.
    pub fn open(root: impl Into<PathBuf>, algo: DigestAlgo) -> CowResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, algo })
    }

    /// The digest algorithm this store hashes with.
    #[inline]
    pub fn algo(&self) -> DigestAlgo {
        self.algo
    }

    /// Absolute path of the blob for `digest`.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.shard()).join(digest.rest())
    }

    /// Store a byte sequence, returning its digest.
    ///
    /// If the blob already exists nothing is written; identical content
    /// always hashes to the same path. A new blob reaches stable storage
    /// before this returns.
    pub fn put(&self, bytes: &[u8]) -> CowResult<Digest> {
        let digest = self.algo.hash(bytes);
        let path = self.blob_path(&digest);

        if path.exists() {
            trace!("put {}: already present", digest.short());
            return Ok(digest);
        }

        let shard_dir = self.root.join(digest.shard());
        fs::create_dir_all(&shard_dir)?;

        let tmp = shard_dir.join(format!("{}.tmp", digest.rest()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;

        trace!("put {}: {} bytes", digest.short(), bytes.len());
        Ok(digest)
    }

    /// Read an entire blob.
    pub fn get(&self, digest: &Digest) -> CowResult<Vec<u8>> {
        match fs::read(self.blob_path(digest)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CowError::Corruption(
                format!("missing blob for object {}", digest.short()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only when the read crosses end of file.
    pub fn get_slice(&self, digest: &Digest, offset: u64, len: usize) -> CowResult<Vec<u8>> {
        let mut file = match fs::File::open(self.blob_path(digest)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CowError::Corruption(format!(
                    "missing blob for object {}",
                    digest.short()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let avail = (size - offset) as usize;
        let want = len.min(avail);
        let mut buf = vec![0u8; want];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Whether a blob for `digest` exists.
    pub fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Unlink the blob for `digest`. Idempotent.
    pub fn delete(&self, digest: &Digest) -> CowResult<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every digest with a blob on disk.
    ///
    /// Used by garbage collection to cross-check the objects table.
    pub fn iter_digests(&self) -> CowResult<Vec<Digest>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name();
            let Some(prefix) = prefix.to_str() else {
                continue;
            };
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.ends_with(".tmp") {
                    continue;
                }
                if let Ok(digest) = Digest::from_hex(&format!("{prefix}{name}")) {
                    out.push(digest);
                }
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("objects"), DigestAlgo::Sha256).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        let digest = store.put(b"hello cowfs").unwrap();
        assert!(store.exists(&digest));
        assert_eq!(store.get(&digest).unwrap(), b"hello cowfs");
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same bytes").unwrap();
        let b = store.put(b"same bytes").unwrap();
        assert_eq!(a, b);
        // Exactly one blob file on disk.
        assert_eq!(store.iter_digests().unwrap().len(), 1);
    }

    #[test]
    fn test_sharded_layout() {
        let (_dir, store) = store();
        let digest = store.put(b"layout").unwrap();
        let path = store.blob_path(&digest);
        let shard = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(shard, digest.shard());
    }

    #[test]
    fn test_get_slice() {
        let (_dir, store) = store();
        let digest = store.put(b"0123456789").unwrap();
        assert_eq!(store.get_slice(&digest, 2, 4).unwrap(), b"2345");
        // Short read at EOF.
        assert_eq!(store.get_slice(&digest, 8, 100).unwrap(), b"89");
        // Read past EOF is empty.
        assert!(store.get_slice(&digest, 100, 4).unwrap().is_empty());
    }

    #[test]
    fn test_delete_idempotent() {
        let (_dir, store) = store();
        let digest = store.put(b"ephemeral").unwrap();
        store.delete(&digest).unwrap();
        assert!(!store.exists(&digest));
        store.delete(&digest).unwrap();
    }

    #[test]
    fn test_empty_blob() {
        let (_dir, store) = store();
        let digest = store.put(b"").unwrap();
        assert_eq!(digest, DigestAlgo::Sha256.empty());
        assert!(store.get(&digest).unwrap().is_empty());
    }

    #[test]
    fn test_missing_blob_is_corruption() {
        let (_dir, store) = store();
        let digest = DigestAlgo::Sha256.hash(b"never stored");
        assert!(matches!(store.get(&digest), Err(CowError::Corruption(_))));
    }
}
