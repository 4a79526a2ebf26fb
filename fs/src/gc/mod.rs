//! Garbage collection.
//!
//! Reclaims objects no live version or snapshot entry can reach.
//! Optional policies pre-prune version chains; reclamation then removes
//! each unreferenced object row and its blob in its own bounded pass, so
//! one failure never aborts the rest. The safety window keeps GC away
//! from blobs whose metadata commit may still be in flight.
//!
//! Safe to run while the filesystem is mounted: the index's write-ahead
//! journaling serializes writers, and the referenced-set query protects
//! everything history can still reach.

use std::time::Duration;

use log::{info, warn};

use crate::backend::Backend;
use crate::error::CowResult;
use crate::meta::now_nanos;
use crate::store::Digest;

// ============================================================================
// Options
// ============================================================================

/// Default minimum age before an unreferenced object may be deleted.
pub const DEFAULT_SAFETY_WINDOW: Duration = Duration::from_secs(60);

/// Garbage collection policy and mode.
#[derive(Clone, Copy, Debug)]
pub struct GcOptions {
    /// Keep only each file's most recent N versions
    pub keep_last: Option<u32>,
    /// Soft-delete versions created before this time (unix nanoseconds)
    pub before: Option<i64>,
    /// Report what would be reclaimed without deleting
    pub dry_run: bool,
    /// Minimum object age before deletion
    pub safety_window: Duration,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            keep_last: None,
            before: None,
            dry_run: false,
            safety_window: DEFAULT_SAFETY_WINDOW,
        }
    }
}

/// Outcome of one GC run.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct GcReport {
    /// Versions soft-deleted by policy
    pub versions_pruned: u64,
    /// Object rows (and blobs) removed
    pub objects_deleted: u64,
    /// Blob bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Digests reclaimed (or reclaimable, for a dry run)
    pub digests: Vec<Digest>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

// ============================================================================
// GC Run
// ============================================================================

/// Run garbage collection with the given options.
pub fn run(backend: &mut Backend, opts: &GcOptions) -> CowResult<GcReport> {
    let mut report = GcReport {
        dry_run: opts.dry_run,
        ..GcReport::default()
    };

    // Policy phase: prune version chains first so their objects become
    // candidates in the same run.
    if let Some(n) = opts.keep_last {
        report.versions_pruned += backend.index.prune_keep_last(n)?;
    }
    if let Some(cutoff) = opts.before {
        report.versions_pruned += backend.index.prune_before(cutoff)?;
    }

    // Reclamation phase: unreferenced objects older than the window.
    let window = opts.safety_window.as_nanos().min(i64::MAX as u128) as i64;
    let cutoff = now_nanos() - window;
    let candidates = backend.index.reclaimable_objects(cutoff)?;

    for object in candidates {
        if opts.dry_run {
            report.bytes_reclaimed += object.size;
            report.digests.push(object.digest);
            continue;
        }
        // One bounded pass per digest; a failure skips just this one.
        match backend.index.remove_object(&object.digest) {
            Ok(true) => {
                if let Err(e) = backend.store.delete(&object.digest) {
                    warn!("blob {} left behind: {e}", object.digest.short());
                }
                report.objects_deleted += 1;
                report.bytes_reclaimed += object.size;
                report.digests.push(object.digest);
            }
            Ok(false) => {} // re-referenced since the scan
            Err(e) => warn!("skipping {}: {e}", object.digest.short()),
        }
    }

    info!(
        "gc: {} versions pruned, {} objects ({} bytes){}",
        report.versions_pruned,
        if opts.dry_run {
            report.digests.len() as u64
        } else {
            report.objects_deleted
        },
        report.bytes_reclaimed,
        if opts.dry_run { " [dry run]" } else { "" },
    );
    Ok(report)
}

// ============================================================================
// Tests
// ============================================================================
