//! Version history and restore.
//!
//! Works against the backend directly, mounted or not. Restore never
//! rewrites history: it appends a new version citing the old content's
//! object, so the pre-restore state remains one more `restore` away.

use log::info;

use crate::backend::Backend;
use crate::error::{CowError, CowResult};
use crate::meta::{InodeRow, VersionRow};

// ============================================================================
// History
// ============================================================================

/// One entry of a file's version chain.
#[derive(Clone, Debug, serde::Serialize)]
pub struct VersionInfo {
    /// 1-based ordinal in the chain (version 1 is the initial empty
    /// version written by create)
    pub n: u64,
    /// The version row
    pub version: VersionRow,
    /// Whether this is the version a read returns
    pub current: bool,
}

/// The chronological version chain for the file at `path`, marking the
/// current version.
pub fn history(backend: &Backend, path: &str) -> CowResult<Vec<VersionInfo>> {
    let inode = file_at(backend, path)?;
    let chain = backend.index.version_chain(inode.id)?;
    Ok(chain
        .into_iter()
        .enumerate()
        .map(|(i, version)| VersionInfo {
            n: i as u64 + 1,
            current: inode.current_version == Some(version.id),
            version,
        })
        .collect())
}

// ============================================================================
// Restore
// ============================================================================

/// Restore `path` to version ordinal `n` (as printed by history).
///
/// Appends a new version pointing at the same object, bumps its
/// reference count, and moves the current pointer. A soft-deleted file
/// comes back to life.
pub fn restore(backend: &mut Backend, path: &str, n: u64) -> CowResult<VersionRow> {
    let inode = file_at(backend, path)?;
    let chain = backend.index.version_chain(inode.id)?;
    let target = chain
        .get(n.checked_sub(1).ok_or(CowError::InvalidArgument)? as usize)
        .ok_or_else(|| CowError::VersionNotFound {
            path: path.to_owned(),
            version: n,
        })?
        .clone();
    restore_row(backend, &inode, &target)
}

/// Restore `path` to the newest version created strictly before
/// `cutoff` (unix nanoseconds).
pub fn restore_before(backend: &mut Backend, path: &str, cutoff: i64) -> CowResult<VersionRow> {
    let inode = file_at(backend, path)?;
    let chain = backend.index.version_chain(inode.id)?;
    let target = chain
        .iter()
        .rev()
        .find(|v| v.created_at < cutoff)
        .ok_or(CowError::NotFound)?
        .clone();
    restore_row(backend, &inode, &target)
}

fn restore_row(
    backend: &mut Backend,
    inode: &InodeRow,
    target: &VersionRow,
) -> CowResult<VersionRow> {
    // The object must still be whole before the chain grows onto it.
    if backend.index.object(&target.digest)?.is_none() || !backend.store.exists(&target.digest) {
        return Err(CowError::Corruption(format!(
            "version {} cites missing object {}",
            target.id,
            target.digest.short()
        )));
    }
    let restored = backend
        .index
        .restore_version(inode.id, &target.digest, target.size)?;
    info!(
        "restored {} to version {} (new version {})",
        inode.path, target.id, restored.id
    );
    Ok(restored)
}

fn file_at(backend: &Backend, path: &str) -> CowResult<InodeRow> {
    let inode = backend
        .index
        .inode_by_path(path)?
        .ok_or(CowError::NotFound)?;
    if inode.is_dir() {
        return Err(CowError::IsDirectory);
    }
    Ok(inode)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ROOT_INO;
    use crate::ops::{CowHandler, SetAttr};
    use crate::store::DigestAlgo;

    fn handler() -> (tempfile::TempDir, CowHandler) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        (dir, CowHandler::new(backend))
    }

    fn save(h: &mut CowHandler, name: &str, data: &[u8]) -> i64 {
        let (ino, fh) = match h.lookup(ROOT_INO, name) {
            Ok(stat) => (stat.ino, h.open(stat.ino, 0).unwrap()),
            Err(_) => {
                let (stat, fh) = h.create(ROOT_INO, name, 0o644, 0, 0, 0).unwrap();
                (stat.ino, fh)
            }
        };
        h.write(fh, 0, data).unwrap();
        let len = h.getattr(ino).unwrap().size;
        if len > data.len() as u64 {
            h.setattr(
                ino,
                SetAttr {
                    size: Some(data.len() as u64),
                    ..SetAttr::default()
                },
            )
            .unwrap();
        }
        h.release(fh).unwrap();
        ino
    }

    fn read_all(h: &mut CowHandler, ino: i64) -> Vec<u8> {
        let fh = h.open(ino, 0).unwrap();
        let data = h.read(fh, 0, 1 << 22).unwrap();
        h.release(fh).unwrap();
        data
    }

    #[test]
    fn test_history_marks_current() {
        let (_dir, mut h) = handler();
        save(&mut h, "f", b"one");
        save(&mut h, "f", b"two");

        let chain = history(h.backend(), "/f").unwrap();
        assert_eq!(chain.len(), 3); // empty + two saves
        assert_eq!(chain[0].n, 1);
        assert!(chain[2].current);
        assert!(!chain[0].current && !chain[1].current);
    }

    #[test]
    fn test_restore_round_trip() {
        let (dir, mut h) = handler();
        let first: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();
        let second: Vec<u8> = (0u32..4096).map(|i| (i % 13) as u8).collect();
        let ino = save(&mut h, "data.bin", &first);
        save(&mut h, "data.bin", &second);
        drop(h);

        // Version 2 holds the first blob (version 1 is the empty one).
        let mut backend = Backend::open(dir.path()).unwrap();
        let restored = restore(&mut backend, "/data.bin", 2).unwrap();
        assert_eq!(restored.size, 4096);

        let mut h = CowHandler::new(backend);
        assert_eq!(read_all(&mut h, ino), first);

        // Restore appended, never rewrote: the chain kept growing.
        let chain = history(h.backend(), "/data.bin").unwrap();
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn test_restore_bumps_refcount() {
        let (dir, mut h) = handler();
        save(&mut h, "f", b"content");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        restore(&mut backend, "/f", 2).unwrap();
        let d = DigestAlgo::Sha256.hash(b"content");
        assert_eq!(backend.index.object(&d).unwrap().unwrap().refcount, 2);
    }

    #[test]
    fn test_restore_missing_version() {
        let (dir, mut h) = handler();
        save(&mut h, "f", b"x");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        assert!(matches!(
            restore(&mut backend, "/f", 99),
            Err(CowError::VersionNotFound { version: 99, .. })
        ));
        assert!(matches!(
            restore(&mut backend, "/missing", 1),
            Err(CowError::NotFound)
        ));
    }

    #[test]
    fn test_restore_deleted_file_resurrects() {
        let (dir, mut h) = handler();
        let d = h.mkdir(ROOT_INO, "tmp", 0o755, 0, 0).unwrap();
        let (stat, fh) = h.create(d.ino, "kept", 0o644, 0, 0, 0).unwrap();
        h.write(fh, 0, b"precious").unwrap();
        h.release(fh).unwrap();
        h.unlink(d.ino, "kept").unwrap();
        assert!(matches!(h.lookup(d.ino, "kept"), Err(CowError::NotFound)));
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        restore(&mut backend, "/tmp/kept", 2).unwrap();

        let mut h = CowHandler::new(backend);
        let found = h.lookup(d.ino, "kept").unwrap();
        assert_eq!(found.ino, stat.ino);
        assert_eq!(read_all(&mut h, stat.ino), b"precious");
    }

    #[test]
    fn test_restore_before_cutoff() {
        let (dir, mut h) = handler();
        save(&mut h, "f", b"early");
        let mid = crate::meta::now_nanos();
        save(&mut h, "f", b"late");
        let ino = h.lookup(ROOT_INO, "f").unwrap().ino;
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        restore_before(&mut backend, "/f", mid).unwrap();

        let mut h = CowHandler::new(backend);
        assert_eq!(read_all(&mut h, ino), b"early");
    }
}
