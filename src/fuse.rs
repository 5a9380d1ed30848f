//! FUSE adapter: binds the catalog and build coordinator to the
//! kernel.
//!
//! The adapter is read-only. `open` on a derived entry runs the
//! get-or-build path and holds the resulting pinned handle in a file
//! handle table until `release`; `read` is a plain positional read on
//! the ready cache file (or the source file for pass-through entries).
//! Every write-family operation replies `EROFS`.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::TimeOrNow;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::cache::{BuildCoordinator, ReadHandle};
use crate::catalog::projection::ProjectedNode;
use crate::catalog::{Catalog, FileAttr, FileKind};
use crate::error::EngineError;

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Symlink => fuser::FileType::Symlink,
        }
    }
}

impl From<FileAttr> for fuser::FileAttr {
    fn from(attr: FileAttr) -> Self {
        fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            kind: attr.kind.into(),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: attr.flags,
        }
    }
}

enum OpenFile {
    /// Pinned, fully-built cache entry.
    Cached(ReadHandle),
    /// Pass-through read of the source file.
    Direct { file: File, len: u64 },
}

impl OpenFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OpenFile::Cached(handle) => handle.read_at(offset, buf),
            OpenFile::Direct { file, len } => {
                if offset >= *len {
                    return Ok(0);
                }
                let want = buf.len().min((*len - offset) as usize);
                let mut done = 0;
                while done < want {
                    match file.read_at(&mut buf[done..want], offset + done as u64) {
                        Ok(0) => break,
                        Ok(n) => done += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(done)
            }
        }
    }
}

/// The mounted filesystem.
pub struct AudioFs {
    catalog: Arc<Catalog>,
    coordinator: Arc<BuildCoordinator>,
    handles: FxHashMap<u64, OpenFile>,
    next_fh: u64,
}

impl AudioFs {
    pub fn new(catalog: Arc<Catalog>, coordinator: Arc<BuildCoordinator>) -> Self {
        AudioFs {
            catalog,
            coordinator,
            handles: FxHashMap::default(),
            next_fh: 1,
        }
    }

    fn do_open(&mut self, ino: u64) -> Result<u64, libc::c_int> {
        let node = self.catalog.node(ino).map_err(|e| e.errno())?;
        let open_file = match &node {
            ProjectedNode::Dir { .. } => return Err(libc::EISDIR),
            ProjectedNode::PassThrough { source } => {
                let file = File::open(source).map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        libc::ENOENT
                    } else {
                        libc::EIO
                    }
                })?;
                let len = file.metadata().map_err(|_| libc::EIO)?.len();
                OpenFile::Direct { file, len }
            }
            ProjectedNode::Derived { .. } => {
                let req = self.catalog.build_request(&node).map_err(|e| e.errno())?;
                let handle = self.coordinator.get_or_build(&req).map_err(|e| {
                    let errno = e.errno();
                    if !matches!(e, EngineError::Cancelled) {
                        warn!(ino, error = %e, "open failed");
                    }
                    errno
                })?;
                // First successful build: the true size supersedes the
                // estimate from here on.
                self.catalog.record_realized(ino, handle.len());
                OpenFile::Cached(handle)
            }
        };

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, open_file);
        Ok(fh)
    }
}

impl fuser::Filesystem for AudioFs {
    fn init(
        &mut self,
        _req: &fuser::Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!("audiofs mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("audiofs unmounted");
    }

    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.catalog.lookup(parent, name) {
            Ok((attr, ttl)) => {
                let attr: fuser::FileAttr = attr.into();
                reply.entry(&ttl, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        match self.catalog.getattr(ino) {
            Ok((attr, ttl)) => {
                let attr: fuser::FileAttr = attr.into();
                reply.attr(&ttl, &attr);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyData) {
        // The derived tree contains no symlinks.
        match self.catalog.getattr(ino) {
            Ok(_) => reply.error(libc::EINVAL),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let write_flags = libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND | libc::O_TRUNC;
        if flags & write_flags != 0 {
            reply.error(libc::EROFS);
            return;
        }
        match self.do_open(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(open_file) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match open_file.read_at(offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                warn!(ino, fh, error = %e, "read failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        // Dropping a cached handle releases its pin.
        self.handles.remove(&fh);
        reply.ok();
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        match self.catalog.node(ino) {
            Ok(node) if node.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let children = match self.catalog.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries: Vec<(u64, fuser::FileType, String)> = Vec::with_capacity(
            children.len() + 2,
        );
        entries.push((ino, fuser::FileType::Directory, ".".to_string()));
        let parent = self.catalog.parent_of(ino).unwrap_or(ino);
        entries.push((parent, fuser::FileType::Directory, "..".to_string()));
        for child in children {
            entries.push((child.ino, child.kind.into(), child.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // add() returns true when the reply buffer is full.
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let store = self.coordinator.store();
        let block_size = 4096u64;
        let total = store.ready_total();
        reply.statfs(
            total.div_ceil(block_size),
            0,
            0,
            store.ready_count() as u64,
            0,
            block_size as u32,
            255,
            block_size as u32,
        );
    }

    fn access(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mask: i32,
        reply: fuser::ReplyEmpty,
    ) {
        match self.catalog.getattr(ino) {
            Ok(_) => {
                if mask & libc::W_OK != 0 {
                    reply.error(libc::EROFS);
                } else {
                    reply.ok();
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    // ------------------------------------------------------------------
    // Write family: the view is read-only.
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }
}

/// Mount options for an AudioFS filesystem.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Allow other users to access the mount.
    pub allow_other: bool,
    /// Allow root to access the mount.
    pub allow_root: bool,
    /// Filesystem name shown in mount output.
    pub fsname: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            allow_root: true,
            fsname: "audiofs".to_string(),
        }
    }
}

fn fuse_options(options: MountOptions) -> Vec<fuser::MountOption> {
    use fuser::MountOption;

    let mut out = vec![
        MountOption::FSName(options.fsname),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
        MountOption::RO,
    ];
    if options.allow_other {
        out.push(MountOption::AllowOther);
    } else if options.allow_root {
        out.push(MountOption::AllowRoot);
    }
    out
}

/// Mounts `fs` at `mountpoint`, blocking until unmount.
pub fn mount<P: AsRef<Path>>(
    fs: AudioFs,
    mountpoint: P,
    options: MountOptions,
) -> io::Result<()> {
    debug!(mountpoint = %mountpoint.as_ref().display(), "mounting (foreground)");
    fuser::mount2(fs, mountpoint.as_ref(), &fuse_options(options))
}

/// Mounts `fs` in a background session; unmounts when the session is
/// dropped.
pub fn spawn_mount<P: AsRef<Path>>(
    fs: AudioFs,
    mountpoint: P,
    options: MountOptions,
) -> io::Result<fuser::BackgroundSession> {
    debug!(mountpoint = %mountpoint.as_ref().display(), "mounting (background)");
    fuser::spawn_mount2(fs, mountpoint.as_ref(), &fuse_options(options))
}
