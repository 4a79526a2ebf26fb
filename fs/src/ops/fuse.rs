//! FUSE adapter.
//!
//! Registers the operation handler with the kernel's userspace
//! filesystem facility. This layer only translates: kernel types in,
//! handler calls out, errno back. Inode numbers reported to the kernel
//! are the metadata index's inode ids; the root inode is 1.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use log::{error, info};

use crate::backend::Backend;
use crate::error::CowResult;
use crate::meta::{now_nanos, FileKind};
use crate::ops::{CowHandler, FileStat, SetAttr};

// ============================================================================
// Constants
// ============================================================================

/// Kernel attribute cache lifetime.
const TTL: Duration = Duration::from_secs(1);

/// Block size reported to statfs.
const BLOCK_SIZE: u32 = 4096;

/// Free-space figure reported to statfs; the backend grows with its
/// host filesystem, so report a generous constant.
const FREE_BLOCKS: u64 = 1 << 30;

// rename(2) flag bits as passed through by the kernel.
const RENAME_NOREPLACE: u32 = 1;
const RENAME_EXCHANGE: u32 = 2;

// ============================================================================
// Mount Entry Point
// ============================================================================

/// Mount options beyond the defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct CowMountOptions {
    /// Permit other users to access the mount
    pub allow_other: bool,
    /// Unmount automatically when the process exits
    pub auto_unmount: bool,
}

/// Mount `backend` at `mountpoint` and run the event loop until the
/// kernel tears the mount down.
pub fn mount(
    backend: Backend,
    mountpoint: impl AsRef<Path>,
    opts: CowMountOptions,
) -> CowResult<()> {
    let mut options = vec![
        MountOption::FSName("cowfs".to_owned()),
        MountOption::Subtype("cowfs".to_owned()),
    ];
    if opts.allow_other {
        options.push(MountOption::AllowOther);
    }
    if opts.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    info!(
        "mounting backend {} at {}",
        backend.root().display(),
        mountpoint.as_ref().display()
    );
    let fs = CowFuse::new(CowHandler::new(backend));
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}

// ============================================================================
// Conversions
// ============================================================================

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::RegularFile => FileType::RegularFile,
    }
}

fn system_time(nanos: i64) -> SystemTime {
    if nanos <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    }
}

fn to_attr(stat: &FileStat) -> FileAttr {
    FileAttr {
        ino: stat.ino as u64,
        size: stat.size,
        blocks: stat.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: system_time(stat.updated_at),
        mtime: system_time(stat.updated_at),
        ctime: system_time(stat.updated_at),
        crtime: system_time(stat.created_at),
        kind: file_type(stat.kind),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn name_str(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

fn time_to_nanos(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(st) => st
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => now_nanos(),
    }
}

// ============================================================================
// Filesystem Implementation
// ============================================================================

/// The `fuser::Filesystem` face of the handler.
pub struct CowFuse {
    handler: CowHandler,
}

impl CowFuse {
    /// Wrap a handler.
    pub fn new(handler: CowHandler) -> Self {
        Self { handler }
    }
}

impl std::fmt::Debug for CowFuse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowFuse").finish_non_exhaustive()
    }
}

impl Filesystem for CowFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("filesystem ready");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("filesystem stopped");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.handler.lookup(parent as i64, name) {
            Ok(stat) => reply.entry(&TTL, &to_attr(&stat), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.handler.getattr(ino as i64) {
            Ok(stat) => reply.attr(&TTL, &to_attr(&stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            mtime: mtime.map(time_to_nanos),
            size,
        };
        match self.handler.setattr(ino as i64, changes) {
            Ok(stat) => reply.attr(&TTL, &to_attr(&stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self
            .handler
            .mkdir(parent as i64, name, mode & 0o7777, req.uid(), req.gid())
        {
            Ok(stat) => reply.entry(&TTL, &to_attr(&stat), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.handler.unlink(parent as i64, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.handler.rmdir(parent as i64, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (name_str(name), name_str(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return reply.error(libc::EINVAL),
        };
        if flags & RENAME_EXCHANGE != 0 {
            return reply.error(libc::ENOTSUP);
        }
        if flags & RENAME_NOREPLACE != 0
            && self
                .handler
                .lookup(newparent as i64, newname)
                .is_ok()
        {
            return reply.error(libc::EEXIST);
        }
        match self
            .handler
            .rename(parent as i64, name, newparent as i64, newname)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hardlinks cannot share a version chain.
        reply.error(libc::ENOTSUP);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(errno) => return reply.error(errno),
        };
        match self.handler.create(
            parent as i64,
            name,
            mode & 0o7777,
            req.uid(),
            req.gid(),
            flags,
        ) {
            Ok((stat, fh)) => reply.created(&TTL, &to_attr(&stat), 0, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        // Only regular files exist here, and those arrive via create.
        reply.error(libc::ENOTSUP);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.handler.open(ino as i64, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.handler.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.handler.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handler.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.handler.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handler.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("release failed: {e}");
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ino = ino as i64;
        let parent = match self.handler.backend().index.inode(ino) {
            Ok(Some(row)) => row.parent.max(crate::meta::ROOT_INO),
            Ok(None) => return reply.error(libc::ESTALE),
            Err(e) => return reply.error(e.errno()),
        };

        let children = match self.handler.readdir(ino) {
            Ok(children) => children,
            Err(e) => return reply.error(e.errno()),
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino as u64, FileType::Directory, ".".to_owned()),
            (parent as u64, FileType::Directory, "..".to_owned()),
        ];
        entries.extend(
            children
                .into_iter()
                .map(|c| (c.ino as u64, file_type(c.kind), c.name)),
        );

        for (i, (child_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            // Offsets are 1-based positions in the stable name order.
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.handler.statfs() {
            Ok(stats) => reply.statfs(
                stats.actual_bytes.div_ceil(u64::from(BLOCK_SIZE)) + FREE_BLOCKS,
                FREE_BLOCKS,
                FREE_BLOCKS,
                stats.total_files + stats.total_dirs,
                u64::MAX / 2,
                BLOCK_SIZE,
                255,
                BLOCK_SIZE,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permission checks are left to the kernel's default handling.
        reply.ok();
    }
}
