//! FUSE adapter.
//!
//! Kernel requests arrive through `fuser`, are translated into [`Volume`]
//! calls and the result is mapped back with [`LfsError::to_errno`]. The
//! session loop is single-threaded, which is what the volume requires: one
//! request runs to completion before the next one is read.
//!
//! FUSE reserves inode 1 for the root, so kernel inode numbers are the
//! volume's identities shifted up by one.

use std::ffi::OsStr;
use std::io;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use log::{debug, error, info, warn};

use crate::{
    device::BlockDevice,
    error::{LfsError, LfsResult},
    record::{FileKind, FileMode, Ino, Owner, DENTRY_SIZE, RECORD_HEADER_SIZE},
    volume::{Attr, RemoveKind, SetAttr, Volume},
};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub fsname: String,
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fsname: "logfs".to_string(),
            allow_other: false,
            auto_unmount: false,
            read_only: false,
        }
    }
}

impl MountOptions {
    fn to_fuser(&self) -> Vec<MountOption> {
        let mut opts = vec![
            MountOption::FSName(self.fsname.clone()),
            MountOption::Subtype("logfs".to_string()),
            MountOption::DefaultPermissions,
        ];
        opts.push(if self.read_only {
            MountOption::RO
        } else {
            MountOption::RW
        });
        if self.allow_other {
            opts.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            opts.push(MountOption::AutoUnmount);
        }
        opts
    }
}

fn to_fuse_ino(ino: Ino) -> u64 {
    ino + FUSE_ROOT_ID
}

fn from_fuse_ino(ino: u64) -> Ino {
    ino.saturating_sub(FUSE_ROOT_ID)
}

fn to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn to_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn to_time_or_now(time: TimeOrNow) -> i64 {
    match time {
        TimeOrNow::SpecificTime(t) => to_secs(t),
        TimeOrNow::Now => to_secs(SystemTime::now()),
    }
}

fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
    }
}

fn to_file_attr(attr: &Attr) -> FileAttr {
    FileAttr {
        ino: to_fuse_ino(attr.ino),
        size: attr.size,
        blocks: (attr.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64,
        atime: to_system_time(attr.atime),
        mtime: to_system_time(attr.mtime),
        ctime: to_system_time(attr.ctime),
        crtime: to_system_time(attr.ctime),
        kind: to_file_type(attr.kind),
        perm: attr.perm as u16,
        nlink: attr.links,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Log the failure and pick the errno to reply with. ENOENT is routine for
/// lookups and only logged at debug.
fn errno(op: &str, ino: u64, err: &LfsError) -> c_int {
    let code = err.to_errno();
    if code == libc::ENOENT {
        debug!("{} ino={}: {}", op, ino, err);
    } else {
        warn!("{} ino={} failed: {} (errno {})", op, ino, err, code);
    }
    code
}

fn name_str<'a>(op: &str, name: &'a OsStr) -> Result<&'a str, c_int> {
    name.to_str().ok_or_else(|| {
        warn!("{}: name {:?} is not UTF-8", op, name);
        libc::EINVAL
    })
}

pub struct LogFuse<D: BlockDevice> {
    volume: Volume<D>,
    read_only: bool,
}

impl<D: BlockDevice> LogFuse<D> {
    pub fn new(volume: Volume<D>, options: &MountOptions) -> Self {
        Self {
            volume,
            read_only: options.read_only,
        }
    }

    pub fn into_volume(self) -> Volume<D> {
        self.volume
    }

    fn create_entry(
        &mut self,
        op: &str,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        kind: FileKind,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let name = match name_str(op, name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let owner = Owner {
            uid: req.uid(),
            gid: req.gid(),
        };
        let result = self
            .volume
            .create_at(from_fuse_ino(parent), name, mode, kind, owner)
            .and_then(|ino| self.volume.stat_ino(ino));
        match result {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno(op, parent, &e)),
        }
    }

    fn remove_entry(&mut self, op: &str, parent: u64, name: &OsStr, kind: RemoveKind, reply: ReplyEmpty) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let name = match name_str(op, name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.volume.remove_at(from_fuse_ino(parent), name, kind) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(op, parent, &e)),
        }
    }
}

impl<D: BlockDevice> Filesystem for LogFuse<D> {
    fn destroy(&mut self) {
        match self.volume.sync() {
            Ok(()) => info!("volume flushed on unmount"),
            Err(e) => error!("final flush failed: {}", e),
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str("lookup", name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.volume.lookup_at(from_fuse_ino(parent), name) {
            Ok(attr) => reply.entry(&TTL, &to_file_attr(&attr), 0),
            Err(e) => reply.error(errno("lookup", parent, &e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.volume.stat_ino(from_fuse_ino(ino)) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(errno("getattr", ino, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let changes = SetAttr {
            perm: mode,
            uid,
            gid,
            size,
            atime: atime.map(to_time_or_now),
            mtime: mtime.map(to_time_or_now),
        };
        match self.volume.setattr(from_fuse_ino(ino), &changes) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(&attr)),
            Err(e) => reply.error(errno("setattr", ino, &e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let kind = FileMode::from_bits_truncate(mode) & FileMode::S_IFMT;
        if !kind.is_empty() && kind != FileMode::S_IFREG {
            warn!("mknod {:?}: only regular files are supported (mode {:o})", name, mode);
            reply.error(libc::EPERM);
            return;
        }
        self.create_entry("mknod", req, parent, name, mode, FileKind::File, reply);
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
        self.create_entry("mkdir", req, parent, name, mode, FileKind::Directory, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry("unlink", parent, name, RemoveKind::File, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry("rmdir", parent, name, RemoveKind::Directory, reply);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.volume.read_at(from_fuse_ino(ino), offset, size as usize) {
            Ok(data) => reply.data(&data),
            // reading past end of file is an empty read for the kernel
            Err(LfsError::InvalidOffset(o)) if o >= 0 => reply.data(&[]),
            Err(e) => reply.error(errno("read", ino, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        match self.volume.write_at(from_fuse_ino(ino), offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", ino, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = from_fuse_ino(ino);
        let children = match self.volume.list_at(dir) {
            Ok(children) => children,
            Err(e) => return reply.error(errno("readdir", ino, &e)),
        };
        let parent = match self.volume.parent_of(dir) {
            Ok(parent) => to_fuse_ino(parent),
            Err(e) => return reply.error(errno("readdir", ino, &e)),
        };
        let dots = [
            (ino, FileType::Directory, ".".to_string()),
            (parent, FileType::Directory, "..".to_string()),
        ];
        let entries = dots.into_iter().chain(
            children
                .into_iter()
                .map(|c| (to_fuse_ino(c.ino), to_file_type(c.kind), c.name)),
        );
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in entries.enumerate().skip(skip) {
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.volume.statfs() {
            Ok(stats) => {
                let bsize = BLOCK_SIZE as u64;
                let per_file = (RECORD_HEADER_SIZE + DENTRY_SIZE) as u64;
                let free_files = stats.free / per_file;
                reply.statfs(
                    stats.capacity / bsize,
                    stats.free / bsize,
                    stats.free / bsize,
                    stats.live_files + free_files,
                    free_files,
                    BLOCK_SIZE,
                    stats.max_name_len as u32,
                    BLOCK_SIZE,
                );
            }
            Err(e) => reply.error(errno("statfs", ino, &e)),
        }
    }
}

/// Serve `volume` at `mountpoint` until it is unmounted.
pub fn mount<D: BlockDevice + 'static>(
    volume: Volume<D>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> LfsResult<()> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(LfsError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mountpoint cannot be empty",
        )));
    }
    info!("mounting at {}", mountpoint.display());
    let fs = LogFuse::new(volume, options);
    fuser::mount2(fs, mountpoint, &options.to_fuser())?;
    Ok(())
}
