//! Filesystem Operation Handler
//!
//! The kernel-facing dispatcher. Every POSIX operation is translated
//! into COW-preserving actions over the object store, the metadata
//! index, and the write-buffer cache: reads consult the buffer first,
//! writes touch only the buffer, and a flush drains the buffer into one
//! new immutable version.
//!
//! Mutations of one inode's buffer and its flush are serialized by a
//! per-inode lock; operations on distinct inodes are independent.

pub mod fuse;
pub mod handle;

pub use handle::{HandleTable, OpenHandle};

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::cache::BufferTable;
use crate::error::{CowError, CowResult};
use crate::meta::{FileKind, IndexStats, InodeRow};

// ============================================================================
// Attribute View
// ============================================================================

/// The attribute set reported for one inode.
///
/// Size and mtime come from the current version (or the dirty buffer if
/// one exists); everything else from the inode row.
#[derive(Clone, Debug)]
pub struct FileStat {
    /// Inode id
    pub ino: i64,
    /// Entry kind
    pub kind: FileKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    /// Owning user
    pub uid: u32,
    /// Owning group
    pub gid: u32,
    /// Link count (2 for directories, 1 for files)
    pub nlink: u32,
    /// Creation timestamp (unix nanoseconds)
    pub created_at: i64,
    /// Last-modification timestamp (unix nanoseconds)
    pub updated_at: i64,
}

/// Attribute changes requested by `setattr`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    /// New permission bits
    pub mode: Option<u32>,
    /// New owning user
    pub uid: Option<u32>,
    /// New owning group
    pub gid: Option<u32>,
    /// New modification time (unix nanoseconds)
    pub mtime: Option<i64>,
    /// New size; routed through truncate
    pub size: Option<u64>,
}

/// One readdir entry.
#[derive(Clone, Debug)]
pub struct DirEntry {
    /// Child inode id
    pub ino: i64,
    /// Entry kind
    pub kind: FileKind,
    /// Name component
    pub name: String,
}

// ============================================================================
// Per-Inode Locks
// ============================================================================

/// Lock table handing out one mutex per buffered-write inode.
///
/// Entries are pruned once the lock is unheld and the inode has no open
/// handles, bounding memory.
#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<i64, Arc<Mutex<()>>>,
}

impl LockTable {
    fn acquire(&mut self, ino: i64) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(ino).or_default())
    }

    fn prune(&mut self, ino: i64) {
        if let Some(lock) = self.locks.get(&ino) {
            if Arc::strong_count(lock) == 1 {
                self.locks.remove(&ino);
            }
        }
    }
}

// ============================================================================
// Operation Handler
// ============================================================================

/// The POSIX-facing operation handler over one backend.
#[derive(Debug)]
pub struct CowHandler {
    backend: Backend,
    buffers: BufferTable,
    handles: HandleTable,
    locks: LockTable,
}

impl CowHandler {
    /// Wrap an opened backend.
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            buffers: BufferTable::new(),
            handles: HandleTable::new(),
            locks: LockTable::default(),
        }
    }

    /// The underlying backend.
    #[inline]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    // ------------------------------------------------------------------------
    // Lookups and attributes
    // ------------------------------------------------------------------------

    /// Resolve `name` under `parent`.
    pub fn lookup(&self, parent: i64, name: &str) -> CowResult<FileStat> {
        let parent_row = self.inode_row(parent)?;
        if !parent_row.is_dir() {
            return Err(CowError::NotDirectory);
        }
        let child = self
            .backend
            .index
            .resolve(parent, name)?
            .ok_or(CowError::NotFound)?;
        self.stat(&child)
    }

    /// Attributes of `ino`.
    pub fn getattr(&self, ino: i64) -> CowResult<FileStat> {
        let row = self.inode_row(ino)?;
        self.stat(&row)
    }

    /// Apply attribute changes; a size change goes through truncate and
    /// produces a new version on flush.
    pub fn setattr(&mut self, ino: i64, changes: SetAttr) -> CowResult<FileStat> {
        let row = self.inode_row(ino)?;

        if let Some(size) = changes.size {
            if row.is_dir() {
                return Err(CowError::IsDirectory);
            }
            self.truncate(ino, size)?;
        }

        if changes.mode.is_some() || changes.uid.is_some() || changes.gid.is_some()
            || changes.mtime.is_some()
        {
            self.backend
                .index
                .set_attr(ino, changes.mode, changes.uid, changes.gid, changes.mtime)?;
        }

        self.getattr(ino)
    }

    /// Non-deleted children of a directory.
    pub fn readdir(&self, ino: i64) -> CowResult<Vec<DirEntry>> {
        let row = self.inode_row(ino)?;
        if !row.is_dir() {
            return Err(CowError::NotDirectory);
        }
        let children = self.backend.index.list_children(ino)?;
        Ok(children
            .into_iter()
            .map(|c| DirEntry {
                ino: c.id,
                kind: c.kind,
                name: c.name,
            })
            .collect())
    }

    // ------------------------------------------------------------------------
    // Open / read / write
    // ------------------------------------------------------------------------

    /// Open a file, returning a handle id. Initializes no buffer.
    pub fn open(&mut self, ino: i64, flags: i32) -> CowResult<u64> {
        let row = self.inode_row(ino)?;
        if row.is_dir() {
            return Err(CowError::IsDirectory);
        }
        if row.deleted {
            return Err(CowError::NotFound);
        }
        Ok(self.handles.open(ino, flags))
    }

    /// Read through the buffer when dirty, else from the object store.
    pub fn read(&self, fh: u64, offset: u64, len: usize) -> CowResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(CowError::StaleHandle)?;

        if let Some(buf) = self.buffers.get(handle.ino) {
            return Ok(buf.read_at(offset, len).to_vec());
        }

        let version = self
            .backend
            .index
            .current_version(handle.ino)?
            .ok_or(CowError::StaleHandle)?;
        self.backend.store.get_slice(&version.digest, offset, len)
    }

    /// Merge data into the inode's buffer. No disk I/O, no version.
    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> CowResult<u32> {
        let handle = self.handles.get(fh).ok_or(CowError::StaleHandle)?;
        let lock = self.locks.acquire(handle.ino);
        let _guard = lock.lock();

        self.ensure_seeded(handle.ino)?;
        let buf = self
            .buffers
            .get_mut(handle.ino)
            .ok_or(CowError::StaleHandle)?;
        Ok(buf.write_at(offset, data) as u32)
    }

    // ------------------------------------------------------------------------
    // Namespace mutations
    // ------------------------------------------------------------------------

    /// Create a regular file with its empty initial version and open it.
    pub fn create(
        &mut self,
        parent: i64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        flags: i32,
    ) -> CowResult<(FileStat, u64)> {
        check_name(name)?;
        let parent_row = self.dir_row(parent)?;
        let path = join_path(&parent_row.path, name);

        let empty = self.backend.store.put(&[])?;
        let row = self
            .backend
            .index
            .create_file(parent, name, &path, mode, uid, gid, &empty)?;
        let fh = self.handles.open(row.id, flags);
        Ok((self.stat(&row)?, fh))
    }

    /// Soft-delete a regular file; its object loses the current
    /// reference but history stays queryable by file id.
    pub fn unlink(&mut self, parent: i64, name: &str) -> CowResult<()> {
        let row = self
            .backend
            .index
            .resolve(parent, name)?
            .ok_or(CowError::NotFound)?;
        if row.is_dir() {
            return Err(CowError::IsDirectory);
        }
        self.backend.index.soft_delete(row.id)?;
        debug!("unlink {} (ino={})", row.path, row.id);
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(
        &mut self,
        parent: i64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> CowResult<FileStat> {
        check_name(name)?;
        let parent_row = self.dir_row(parent)?;
        let path = join_path(&parent_row.path, name);
        let row = self
            .backend
            .index
            .create_dir(parent, name, &path, mode, uid, gid)?;
        self.stat(&row)
    }

    /// Soft-delete an empty directory.
    pub fn rmdir(&mut self, parent: i64, name: &str) -> CowResult<()> {
        let row = self
            .backend
            .index
            .resolve(parent, name)?
            .ok_or(CowError::NotFound)?;
        if !row.is_dir() {
            return Err(CowError::NotDirectory);
        }
        if !self.backend.index.list_children(row.id)?.is_empty() {
            return Err(CowError::NotEmpty);
        }
        self.backend.index.soft_delete(row.id)?;
        Ok(())
    }

    /// Move an entry, atomically replacing an existing destination.
    /// Parent, name, and the denormalized paths of the whole moved
    /// subtree are rewritten in one transaction.
    pub fn rename(
        &mut self,
        parent: i64,
        name: &str,
        new_parent: i64,
        new_name: &str,
    ) -> CowResult<()> {
        check_name(new_name)?;
        let src = self
            .backend
            .index
            .resolve(parent, name)?
            .ok_or(CowError::NotFound)?;
        let new_parent_row = self.dir_row(new_parent)?;
        let new_path = join_path(&new_parent_row.path, new_name);

        // A directory cannot move under itself.
        if src.is_dir() && new_path.starts_with(&format!("{}/", src.path)) {
            return Err(CowError::InvalidArgument);
        }

        let replace = match self.backend.index.resolve(new_parent, new_name)? {
            Some(dst) if dst.id == src.id => return Ok(()),
            Some(dst) => {
                if src.is_dir() && !dst.is_dir() {
                    return Err(CowError::NotDirectory);
                }
                if !src.is_dir() && dst.is_dir() {
                    return Err(CowError::IsDirectory);
                }
                if dst.is_dir() && !self.backend.index.list_children(dst.id)?.is_empty() {
                    return Err(CowError::NotEmpty);
                }
                Some(dst.id)
            }
            None => None,
        };

        self.backend
            .index
            .rename(src.id, new_parent, new_name, &new_path, replace)
    }

    // ------------------------------------------------------------------------
    // Flush / release
    // ------------------------------------------------------------------------

    /// Drain the handle's buffer into a new version. Safe to call
    /// repeatedly; a clean buffer is a no-op.
    pub fn flush(&mut self, fh: u64) -> CowResult<()> {
        let handle = self.handles.get(fh).ok_or(CowError::StaleHandle)?;
        self.flush_ino(handle.ino)
    }

    /// Flush, then free the handle; the buffer is dropped with the last
    /// handle on the inode.
    pub fn release(&mut self, fh: u64) -> CowResult<()> {
        let result = self.flush(fh);
        if let Some(handle) = self.handles.close(fh) {
            if self.handles.open_count(handle.ino) == 0 {
                self.buffers.remove(handle.ino);
                self.locks.prune(handle.ino);
            }
        }
        result
    }

    /// Aggregate counters for statfs.
    pub fn statfs(&self) -> CowResult<IndexStats> {
        self.backend.index.stats()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Drain one inode's dirty buffer: hash, put the blob, then commit
    /// version + current pointer + refcount in one transaction. A crash
    /// or error after the blob write leaves at most an orphan blob; the
    /// previous version stays authoritative.
    fn flush_ino(&mut self, ino: i64) -> CowResult<()> {
        let lock = self.locks.acquire(ino);
        let _guard = lock.lock();

        let Some(buf) = self.buffers.get_mut(ino) else {
            return Ok(());
        };
        if !buf.is_dirty() {
            return Ok(());
        }

        let bytes = buf.bytes().to_vec();
        let digest = self.backend.store.put(&bytes)?;
        let version = self
            .backend
            .index
            .append_version(ino, &digest, bytes.len() as u64)
            .map_err(|e| {
                warn!(
                    "flush ino={ino}: metadata commit failed, blob {} left as orphan: {e}",
                    digest.short()
                );
                e
            })?;

        if let Some(buf) = self.buffers.get_mut(ino) {
            buf.mark_clean();
        }
        self.buffers.record_flush();
        debug!(
            "flush ino={ino}: version {} ({} bytes, {})",
            version.id,
            version.size,
            digest.short()
        );
        Ok(())
    }

    /// Seed the inode's buffer from its current object if absent.
    fn ensure_seeded(&mut self, ino: i64) -> CowResult<()> {
        if self.buffers.get(ino).is_some() {
            return Ok(());
        }
        let bytes = match self.backend.index.current_version(ino)? {
            Some(version) => self.backend.store.get(&version.digest)?,
            None => Vec::new(),
        };
        self.buffers.get_or_seed(ino, || Ok(bytes))?;
        Ok(())
    }

    /// Truncate through the buffer; flushed immediately when no handle
    /// is open to drain it later.
    fn truncate(&mut self, ino: i64, size: u64) -> CowResult<()> {
        {
            let lock = self.locks.acquire(ino);
            let _guard = lock.lock();
            self.ensure_seeded(ino)?;
            let buf = self.buffers.get_mut(ino).ok_or(CowError::StaleHandle)?;
            buf.truncate(size);
        }
        if self.handles.open_count(ino) == 0 {
            self.flush_ino(ino)?;
            self.buffers.remove(ino);
            self.locks.prune(ino);
        }
        Ok(())
    }

    fn inode_row(&self, ino: i64) -> CowResult<InodeRow> {
        self.backend.index.inode(ino)?.ok_or(CowError::StaleHandle)
    }

    fn dir_row(&self, ino: i64) -> CowResult<InodeRow> {
        let row = self.inode_row(ino)?;
        if !row.is_dir() {
            return Err(CowError::NotDirectory);
        }
        if row.deleted {
            return Err(CowError::NotFound);
        }
        Ok(row)
    }

    fn stat(&self, row: &InodeRow) -> CowResult<FileStat> {
        let size = if row.is_dir() {
            0
        } else if let Some(buf) = self.buffers.get(row.id) {
            buf.len()
        } else {
            self.backend
                .index
                .current_version(row.id)?
                .map_or(0, |v| v.size)
        };
        Ok(FileStat {
            ino: row.id,
            kind: row.kind,
            size,
            mode: row.mode,
            uid: row.uid,
            gid: row.gid,
            nlink: if row.is_dir() { 2 } else { 1 },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn check_name(name: &str) -> CowResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(CowError::InvalidArgument);
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

// ============================================================================
// Tests
// ============================================================================
