//! Snapshots.
//!
//! Named point-in-time captures of the whole tree. A snapshot is pure
//! metadata: one entry per live inode citing its then-current version,
//! with an object reference held per file entry so GC cannot reclaim
//! captured content while the snapshot is alive. Snapshots bind to
//! inode ids, not paths, so renames do not confuse restore.

pub mod diff;

use log::info;

use crate::backend::Backend;
use crate::error::{CowError, CowResult};
use crate::meta::{SnapshotRestoreReport, SnapshotRow};
use crate::store::Digest;

// ============================================================================
// Snapshot Detail
// ============================================================================

/// One captured file in a snapshot listing.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SnapshotFile {
    /// Captured file's inode id
    pub file_id: i64,
    /// The file's path (current path of the inode)
    pub path: String,
    /// Captured version id
    pub version_id: i64,
    /// Captured size in bytes
    pub size: u64,
    /// Captured content digest
    pub digest: Digest,
}

/// Full description of one snapshot.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SnapshotDetail {
    /// The snapshot row
    pub snapshot: SnapshotRow,
    /// Captured files (directories are captured but not listed)
    pub files: Vec<SnapshotFile>,
    /// Sum of captured file sizes
    pub total_bytes: u64,
}

// ============================================================================
// Operations
// ============================================================================

/// Capture the current tree under `name`.
pub fn create(backend: &mut Backend, name: &str, description: Option<&str>) -> CowResult<SnapshotRow> {
    let snapshot = backend.index.snapshot_create(name, description)?;
    info!("snapshot '{name}' created");
    Ok(snapshot)
}

/// All snapshots, oldest first.
pub fn list(backend: &Backend) -> CowResult<Vec<SnapshotRow>> {
    backend.index.snapshot_list()
}

/// Describe one snapshot, including every captured file.
pub fn show(backend: &Backend, name: &str) -> CowResult<SnapshotDetail> {
    let snapshot = backend
        .index
        .snapshot_by_name(name)?
        .ok_or_else(|| CowError::SnapshotNotFound(name.to_owned()))?;

    let mut files = Vec::new();
    let mut total_bytes = 0;
    for entry in backend.index.snapshot_entries(snapshot.id)? {
        let Some(version_id) = entry.version_id else {
            continue; // directory entry
        };
        let version = backend.index.version(version_id)?.ok_or_else(|| {
            CowError::Corruption(format!("snapshot entry cites unknown version {version_id}"))
        })?;
        let inode = backend.index.inode(entry.file_id)?.ok_or_else(|| {
            CowError::Corruption(format!("snapshot entry cites unknown inode {}", entry.file_id))
        })?;
        total_bytes += version.size;
        files.push(SnapshotFile {
            file_id: entry.file_id,
            path: inode.path,
            version_id,
            size: version.size,
            digest: version.digest,
        });
    }

    Ok(SnapshotDetail {
        snapshot,
        files,
        total_bytes,
    })
}

/// Restore the tree to the snapshot's state; see
/// [`crate::meta::MetaIndex::snapshot_restore`] for the exact contract.
pub fn restore(backend: &mut Backend, name: &str, keep_new: bool) -> CowResult<SnapshotRestoreReport> {
    let report = backend.index.snapshot_restore(name, keep_new)?;
    info!(
        "snapshot '{name}' restored ({} files, {} removed)",
        report.files_restored, report.removed
    );
    Ok(report)
}

/// Delete a snapshot; captured objects remain until GC finds them
/// unreferenced.
pub fn delete(backend: &mut Backend, name: &str) -> CowResult<()> {
    backend.index.snapshot_delete(name)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ROOT_INO;
    use crate::ops::CowHandler;
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
        h.release(fh).unwrap();
        ino
    }

    fn read_all(h: &mut CowHandler, ino: i64) -> Vec<u8> {
        let fh = h.open(ino, 0).unwrap();
        let data = h.read(fh, 0, 1 << 20).unwrap();
        h.release(fh).unwrap();
        data
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (dir, mut h) = handler();
        let c = save(&mut h, "c", b"original");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        create(&mut backend, "baseline", Some("before edits")).unwrap();

        let mut h = CowHandler::new(backend);
        save(&mut h, "c", b"modified");
        let newcomer = save(&mut h, "new", b"x");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        restore(&mut backend, "baseline", false).unwrap();

        let mut h = CowHandler::new(backend);
        assert_eq!(read_all(&mut h, c), b"original");
        assert!(h.lookup(ROOT_INO, "new").is_err());
        assert!(h.backend().index.inode(newcomer).unwrap().unwrap().deleted);
    }

    #[test]
    fn test_snapshot_restore_keep_new() {
        let (dir, mut h) = handler();
        save(&mut h, "c", b"original");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        create(&mut backend, "baseline", None).unwrap();

        let mut h = CowHandler::new(backend);
        let newcomer = save(&mut h, "new", b"x");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        let report = restore(&mut backend, "baseline", true).unwrap();
        assert_eq!(report.kept_new, 1);

        let mut h = CowHandler::new(backend);
        assert!(h.lookup(ROOT_INO, "new").is_ok());
        assert_eq!(read_all(&mut h, newcomer), b"x");
    }

    #[test]
    fn test_snapshot_restores_deleted_file() {
        let (dir, mut h) = handler();
        let f = save(&mut h, "doomed", b"still here");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        create(&mut backend, "s", None).unwrap();

        let mut h = CowHandler::new(backend);
        h.unlink(ROOT_INO, "doomed").unwrap();
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        let report = restore(&mut backend, "s", false).unwrap();
        assert!(report.resurrected >= 1);

        let mut h = CowHandler::new(backend);
        assert_eq!(h.lookup(ROOT_INO, "doomed").unwrap().ino, f);
        assert_eq!(read_all(&mut h, f), b"still here");
    }

    #[test]
    fn test_show_lists_files_only() {
        let (dir, mut h) = handler();
        save(&mut h, "a", b"aaaa");
        h.mkdir(ROOT_INO, "d", 0o755, 0, 0).unwrap();
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        create(&mut backend, "s", None).unwrap();

        let detail = show(&backend, "s").unwrap();
        assert_eq!(detail.files.len(), 1);
        assert_eq!(detail.files[0].path, "/a");
        assert_eq!(detail.total_bytes, 4);
    }

    #[test]
    fn test_list_and_delete() {
        let (dir, _h) = handler();
        let mut backend = Backend::open(dir.path()).unwrap();
        create(&mut backend, "one", None).unwrap();
        create(&mut backend, "two", None).unwrap();
        assert_eq!(list(&backend).unwrap().len(), 2);

        delete(&mut backend, "one").unwrap();
        let names: Vec<String> = list(&backend).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["two"]);

        assert!(matches!(
            delete(&mut backend, "one"),
            Err(CowError::SnapshotNotFound(_))
        ));
    }
}
