//! Snapshot diff.
//!
//! Digest-level comparison: which paths were added, removed, or changed
//! between a snapshot and the current tree, or between two snapshots.
//! Content is never read; two files differ iff their digests differ.

use std::collections::HashMap;

use crate::backend::Backend;
use crate::error::{CowError, CowResult};
use crate::store::Digest;

// ============================================================================
// Changes
// ============================================================================

/// What happened to a path between the two sides of a diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only on the newer side
    Added,
    /// Present only on the older side
    Removed,
    /// Present on both sides with different digests
    Modified,
}

/// One changed path.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Change {
    /// The file's path
    pub path: String,
    /// Kind of change
    pub kind: ChangeKind,
}

// ============================================================================
// Diffs
// ============================================================================

/// Changes from snapshot `name` to the current tree.
pub fn against_current(backend: &Backend, name: &str) -> CowResult<Vec<Change>> {
    let old = snapshot_map(backend, name)?;
    let new: HashMap<String, Digest> =
        backend.index.current_file_digests()?.into_iter().collect();
    Ok(diff_maps(&old, &new))
}

/// Changes from snapshot `old_name` to snapshot `new_name`.
pub fn between(backend: &Backend, old_name: &str, new_name: &str) -> CowResult<Vec<Change>> {
    let old = snapshot_map(backend, old_name)?;
    let new = snapshot_map(backend, new_name)?;
    Ok(diff_maps(&old, &new))
}

fn snapshot_map(backend: &Backend, name: &str) -> CowResult<HashMap<String, Digest>> {
    let snapshot = backend
        .index
        .snapshot_by_name(name)?
        .ok_or_else(|| CowError::SnapshotNotFound(name.to_owned()))?;
    Ok(backend
        .index
        .snapshot_file_digests(snapshot.id)?
        .into_iter()
        .collect())
}

fn diff_maps(old: &HashMap<String, Digest>, new: &HashMap<String, Digest>) -> Vec<Change> {
    let mut changes = Vec::new();
    for (path, digest) in new {
        match old.get(path) {
            None => changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Added,
            }),
            Some(old_digest) if old_digest != digest => changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            changes.push(Change {
                path: path.clone(),
                kind: ChangeKind::Removed,
            });
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
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

    fn save(h: &mut CowHandler, name: &str, data: &[u8]) {
        let (_ino, fh) = match h.lookup(ROOT_INO, name) {
            Ok(stat) => (stat.ino, h.open(stat.ino, 0).unwrap()),
            Err(_) => {
                let (stat, fh) = h.create(ROOT_INO, name, 0o644, 0, 0, 0).unwrap();
                (stat.ino, fh)
            }
        };
        h.write(fh, 0, data).unwrap();
        h.release(fh).unwrap();
    }

    #[test]
    fn test_diff_against_current() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        let mut h = CowHandler::new(backend);
        save(&mut h, "stay", b"same");
        save(&mut h, "edit", b"aaaa");
        save(&mut h, "drop", b"bye!");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        crate::snapshot::create(&mut backend, "s", None).unwrap();

        let mut h = CowHandler::new(backend);
        save(&mut h, "edit", b"bbbb");
        save(&mut h, "born", b"new!");
        h.unlink(ROOT_INO, "drop").unwrap();
        drop(h);

        let backend = Backend::open(dir.path()).unwrap();
        let changes = against_current(&backend, "s").unwrap();
        let summary: Vec<(&str, ChangeKind)> = changes
            .iter()
            .map(|c| (c.path.as_str(), c.kind))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("/born", ChangeKind::Added),
                ("/drop", ChangeKind::Removed),
                ("/edit", ChangeKind::Modified),
            ]
        );
    }

    #[test]
    fn test_diff_between_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        let mut h = CowHandler::new(backend);
        save(&mut h, "f", b"one");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        crate::snapshot::create(&mut backend, "a", None).unwrap();

        let mut h = CowHandler::new(backend);
        save(&mut h, "f", b"two");
        drop(h);

        let mut backend = Backend::open(dir.path()).unwrap();
        crate::snapshot::create(&mut backend, "b", None).unwrap();

        let changes = between(&backend, "a", "b").unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);

        assert!(matches!(
            between(&backend, "a", "missing"),
            Err(CowError::SnapshotNotFound(_))
        ));
    }
}
