//! # COWFS - Userspace Copy-on-Write Versioning Filesystem
//!
//! COWFS exposes an ordinary mountable directory tree in which every
//! externally visible modification produces a new immutable version of
//! the affected file. Past content is preserved, identical byte
//! sequences are stored once, and the whole tree can be snapshotted and
//! restored atomically.
//!
//! ## Key Properties
//!
//! - **Version per save**: writes coalesce in a per-inode buffer; one
//!   flush appends one version, never one per syscall
//! - **Content addressing**: blobs are keyed by cryptographic digest,
//!   so identical content exists once on disk
//! - **Append-only history**: restore and snapshot restore always add
//!   versions, never rewrite them
//! - **Crash ordering**: blob bytes reach stable storage before the
//!   metadata transaction commits; a crash leaves at most an orphan
//!   blob, reclaimable by GC
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  FUSE Adapter (ops::fuse)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Operation Handler (ops::CowHandler)             │
//! │  ┌──────────────┐ ┌──────────────┐ ┌───────────────────┐   │
//! │  │ Handle Table │ │ Per-Inode    │ │  Write-Buffer     │   │
//! │  │              │ │ Locks        │ │  Cache (cache)    │   │
//! │  └──────────────┘ └──────────────┘ └───────────────────┘   │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Version / Snapshot / GC Engine (version, snapshot, gc)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐  ┌─────────────────────────────┐ │
//! │  │ Metadata Index (meta)│  │   Object Store (store)      │ │
//! │  │ inodes · versions ·  │  │   objects/<xx>/<rest>       │ │
//! │  │ objects · snapshots  │  │   digest-addressed blobs    │ │
//! │  └──────────────────────┘  └─────────────────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Backend Directory (backend)                  │
//! │        .cowfs marker · metadata.db · objects/               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine layer works against the backend whether or not the
//! filesystem is mounted; the index's write-ahead journaling mediates
//! between the two.

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod cache;
pub mod error;
pub mod gc;
pub mod meta;
pub mod ops;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod version;

// Re-exports for convenience
pub use crate::backend::{Backend, FormatMarker, FORMAT_VERSION};
pub use crate::error::{CowError, CowResult};
pub use crate::meta::{MetaIndex, ROOT_INO};
pub use crate::ops::fuse::{mount, CowMountOptions};
pub use crate::ops::CowHandler;
pub use crate::store::{Digest, DigestAlgo, ObjectStore};

/// Crate version string.
pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
