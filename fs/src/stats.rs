//! Backend statistics.
//!
//! The `stats` reporting contract: logical bytes are what the version
//! chains claim to hold; actual bytes are what the deduplicated object
//! store really holds. The gap is the dedup saving.

use crate::backend::Backend;
use crate::error::CowResult;

// ============================================================================
// Stats
// ============================================================================

/// Everything the stats surface reports.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FsStats {
    /// Backend format version
    pub format_version: u32,
    /// Digest algorithm
    pub digest_algo: String,
    /// Sum of live version sizes
    pub logical_bytes: u64,
    /// Sum of object sizes
    pub actual_bytes: u64,
    /// Bytes saved by deduplication
    pub dedup_saved_bytes: u64,
    /// actual / logical; 1.0 when nothing is stored
    pub dedup_ratio: f64,
    /// Non-deleted regular files
    pub total_files: u64,
    /// Live versions
    pub total_versions: u64,
    /// Object rows
    pub total_objects: u64,
    /// Objects with reference count zero
    pub orphan_objects: u64,
}

/// Collect statistics from a backend.
pub fn collect(backend: &Backend) -> CowResult<FsStats> {
    let index = backend.index.stats()?;
    let logical = index.logical_bytes;
    let actual = index.actual_bytes;
    Ok(FsStats {
        format_version: crate::backend::FORMAT_VERSION,
        digest_algo: backend.algo().as_str().to_owned(),
        logical_bytes: logical,
        actual_bytes: actual,
        dedup_saved_bytes: logical.saturating_sub(actual),
        dedup_ratio: if logical == 0 {
            1.0
        } else {
            actual as f64 / logical as f64
        },
        total_files: index.total_files,
        total_versions: index.total_versions,
        total_objects: index.total_objects,
        orphan_objects: index.orphan_objects,
    })
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

    #[test]
    fn test_dedup_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Sha256).unwrap();
        let mut h = CowHandler::new(backend);
        for name in ["a", "b", "c"] {
            let (_stat, fh) = h.create(ROOT_INO, name, 0o644, 0, 0, 0).unwrap();
            h.write(fh, 0, b"0123456789").unwrap();
            h.release(fh).unwrap();
        }
        drop(h);

        let backend = Backend::open(dir.path()).unwrap();
        let stats = collect(&backend).unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.logical_bytes, 30);
        assert_eq!(stats.actual_bytes, 10);
        assert_eq!(stats.dedup_saved_bytes, 20);
        assert!((stats.dedup_ratio - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.digest_algo, "sha256");
        assert_eq!(stats.orphan_objects, 0);
    }

    #[test]
    fn test_empty_backend_ratio_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::init(dir.path(), DigestAlgo::Blake3).unwrap();
        let stats = collect(&backend).unwrap();
        assert_eq!(stats.logical_bytes, 0);
        assert_eq!(stats.dedup_ratio, 1.0);
        assert_eq!(stats.digest_algo, "blake3");
    }
}
