//! Write-Buffer Cache
//!
//! Per-inode dirty buffers that coalesce many kernel writes into one
//! version per flush. A buffer is created lazily on the first write (or
//! truncate) to an inode and seeded from the inode's current object, so
//! the read-modify-write of partial writes is correct. Reads prefer the
//! buffer when one exists; a reader on the same handle always observes
//! its own in-flight writes.
//!
//! Buffers are ephemeral: they belong to open handles and are discarded
//! on the last release. A clean buffer never produces a version.

use std::collections::HashMap;

use log::trace;

use crate::error::CowResult;

// ============================================================================
// Write Buffer
// ============================================================================

/// Mutable byte image of one open file.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    dirty: bool,
}

impl WriteBuffer {
    /// Create a buffer seeded with the file's current content.
    pub fn seeded(data: Vec<u8>) -> Self {
        Self { data, dirty: false }
    }

    /// Current length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the buffer differs from the committed version.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Full byte image.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Merge `data` at `offset`, zero-filling any gap past the current
    /// end of the buffer.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> usize {
        let offset = offset as usize;
        let end = offset + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(data);
        self.dirty = true;
        data.len()
    }

    /// Shorten or zero-extend to `size` bytes.
    pub fn truncate(&mut self, size: u64) {
        let size = size as usize;
        if size == self.data.len() {
            return;
        }
        self.data.resize(size, 0);
        self.dirty = true;
    }

    /// Read up to `len` bytes at `offset`; short only at end of buffer.
    pub fn read_at(&self, offset: u64, len: usize) -> &[u8] {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return &[];
        }
        let end = (offset + len).min(self.data.len());
        &self.data[offset..end]
    }

    /// Mark the buffer clean after a flush drained it.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

// ============================================================================
// Buffer Table
// ============================================================================

/// Buffer cache statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferStats {
    /// Buffers seeded
    pub seeded: u64,
    /// Buffers dropped on release
    pub dropped: u64,
    /// Flushes that drained a dirty buffer
    pub flushes: u64,
}

/// All live write buffers, keyed by inode id.
#[derive(Debug, Default)]
pub struct BufferTable {
    buffers: HashMap<i64, WriteBuffer>,
    stats: BufferStats,
}

impl BufferTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer for `ino`, if one exists.
    #[inline]
    pub fn get(&self, ino: i64) -> Option<&WriteBuffer> {
        self.buffers.get(&ino)
    }

    /// Mutable buffer for `ino`, if one exists.
    #[inline]
    pub fn get_mut(&mut self, ino: i64) -> Option<&mut WriteBuffer> {
        self.buffers.get_mut(&ino)
    }

    /// Buffer for `ino`, seeding it from `seed` on first use.
    pub fn get_or_seed(
        &mut self,
        ino: i64,
        seed: impl FnOnce() -> CowResult<Vec<u8>>,
    ) -> CowResult<&mut WriteBuffer> {
        if !self.buffers.contains_key(&ino) {
            let data = seed()?;
            trace!("seed buffer ino={ino} ({} bytes)", data.len());
            self.buffers.insert(ino, WriteBuffer::seeded(data));
            self.stats.seeded += 1;
        }
        Ok(self.buffers.get_mut(&ino).expect("just inserted"))
    }

    /// Drop the buffer for `ino`.
    pub fn remove(&mut self, ino: i64) {
        if self.buffers.remove(&ino).is_some() {
            self.stats.dropped += 1;
            trace!("drop buffer ino={ino}");
        }
    }

    /// Record a drained flush.
    pub fn record_flush(&mut self) {
        self.stats.flushes += 1;
    }

    /// Number of live buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Statistics.
    #[inline]
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}

// ============================================================================
// Tests
// ============================================================================
