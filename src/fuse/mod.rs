//! FUSE front end: serves a `Mount` to the kernel
//!
//! `FuseHook` is the `OsHook` that spawns one `fuser` background session per
//! mount. Each session owns a `FuseAdapter` translating kernel requests into
//! `Mount` operations on a dedicated runtime.

pub mod inode;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
    TimeOrNow,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::error::{MergeFsError, Result};
use crate::handle::MountId;
use crate::mount::{Mount, OsHook};
use crate::path::VPath;
use crate::source::{FileType, Metadata};

use self::inode::{InodeTable, ROOT_INODE};

/// Default TTL for attribute caching (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

fn to_fuse_file_type(ft: FileType) -> FuseFileType {
    match ft {
        FileType::File => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
    }
}

fn metadata_to_attr(ino: u64, meta: &Metadata, uid: u32, gid: u32) -> FileAttr {
    let kind = to_fuse_file_type(meta.file_type);
    let perm = meta.mode_or_default() as u16;
    let nlink = if meta.is_dir() { 2 } else { 1 };
    let blocks = meta.size.div_ceil(BLOCK_SIZE as u64);

    FileAttr {
        ino,
        size: meta.size,
        blocks,
        atime: meta.mtime,
        mtime: meta.mtime,
        ctime: meta.mtime,
        crtime: meta.mtime,
        kind,
        perm,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Kernel-facing filesystem for one mount
pub struct FuseAdapter {
    mount: Arc<Mount>,
    inodes: InodeTable,
    /// Dedicated runtime for FUSE async operations
    runtime: tokio::runtime::Runtime,
    uid: u32,
    gid: u32,
}

impl FuseAdapter {
    /// `uid`/`gid` default to the process owner
    pub fn new(mount: Arc<Mount>, uid: Option<u32>, gid: Option<u32>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .thread_name("mergefs-fuse")
            .enable_all()
            .build()?;

        let uid = uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = gid.unwrap_or_else(|| unsafe { libc::getgid() });

        Ok(Self {
            mount,
            inodes: InodeTable::new(),
            runtime,
            uid,
            gid,
        })
    }

    fn inode_to_path(&self, ino: u64) -> std::result::Result<VPath, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> std::result::Result<VPath, i32> {
        let parent = self.inode_to_path(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        parent.join(name).map_err(|e| e.to_errno())
    }

    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    fn reply_attr_for(&self, ino: u64, path: &VPath, reply: ReplyAttr) {
        match self.run_async(self.mount.stat(path)) {
            Ok(meta) => reply.attr(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid)),
            Err(e) => {
                debug!("getattr error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("lookup: {}", path);

        match self.run_async(self.mount.stat(&path)) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid), GENERATION);
            }
            Err(MergeFsError::NotFound(_)) => reply.error(libc::ENOENT),
            Err(e) => {
                error!("lookup error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.inode_to_path(ino) {
            Ok(path) => {
                trace!("getattr: {} (ino={})", path, ino);
                self.reply_attr_for(ino, &path, reply);
            }
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mount = self.mount.clone();
        let mtime = mtime.map(time_or_now);
        let perm_bits = mode.map(|m| m & 0o7777);
        let result = self.run_async(async {
            if let Some(new_size) = size {
                trace!("setattr truncate: {} to {} bytes", path, new_size);
                mount.truncate(&path, new_size).await?;
            }
            if perm_bits.is_some() || mtime.is_some() {
                trace!("setattr: {} mode={:?} mtime={:?}", path, perm_bits, mtime);
                mount.set_attributes(&path, perm_bits, mtime).await?;
            }
            mount.stat(&path).await
        });

        match result {
            Ok(meta) => reply.attr(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid)),
            Err(e) => {
                error!("setattr error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
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
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("read: {} offset={} size={}", path, offset, size);

        match self.run_async(self.mount.read(&path, offset.max(0) as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
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
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("write: {} offset={} size={}", path, offset, data.len());

        match self.run_async(self.mount.write(&path, offset.max(0) as u64, data)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("create: {} mode={:o}", path, effective_mode);

        let mount = self.mount.clone();
        match self.run_async(async {
            mount.create_file(&path, effective_mode).await?;
            mount.stat(&path).await
        }) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                let attr = metadata_to_attr(ino, &meta, self.uid, self.gid);
                reply.created(&ATTR_TTL, &attr, GENERATION, 0, 0);
            }
            Err(e) => {
                error!("create error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("mkdir: {} mode={:o}", path, effective_mode);

        let mount = self.mount.clone();
        match self.run_async(async {
            mount.create_dir(&path, effective_mode).await?;
            mount.stat(&path).await
        }) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&ATTR_TTL, &metadata_to_attr(ino, &meta, self.uid, self.gid), GENERATION);
            }
            Err(e) => {
                error!("mkdir error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("unlink: {}", path);

        match self.run_async(self.mount.remove_file(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => {
                error!("unlink error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        debug!("rmdir: {}", path);

        match self.run_async(self.mount.remove_dir(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => {
                debug!("rmdir error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };
        debug!("rename: {} -> {}", old_path, new_path);

        match self.run_async(self.mount.rename(&old_path, &new_path)) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => {
                error!("rename error {} -> {}: {}", old_path, new_path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            reply.opened(0, 0);
            return;
        }
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("open for write: {}", path);

        match self.run_async(self.mount.prepare_write(&path)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                debug!("open error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("readdir: {} offset={}", path, offset);

        let entries = match self.run_async(self.mount.list_dir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("readdir error for {}: {}", path, e);
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.get_inode(&p))
            .unwrap_or(ROOT_INODE);

        let mut listing: Vec<(u64, FuseFileType, String)> = Vec::with_capacity(entries.len() + 2);
        listing.push((ino, FuseFileType::Directory, ".".to_string()));
        listing.push((parent_ino, FuseFileType::Directory, "..".to_string()));
        for entry in entries {
            match path.join(&entry.name) {
                Ok(child) => {
                    let child_ino = self.inodes.get_or_create_inode(&child);
                    listing.push((child_ino, to_fuse_file_type(entry.file_type()), entry.name));
                }
                Err(e) => warn!("skipping entry {:?} in {}: {}", entry.name, path, e),
            }
        }

        for (idx, (entry_ino, kind, name)) in listing.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*entry_ino, (idx + 1) as i64, *kind, name) {
                // Buffer full
                break;
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.flush_inode(ino, reply);
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.flush_inode(ino, reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.run_async(self.mount.stat(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(
            u64::MAX,   // blocks
            u64::MAX,   // bfree
            u64::MAX,   // bavail
            u64::MAX,   // files
            u64::MAX,   // ffree
            BLOCK_SIZE, // bsize
            255,        // namelen
            BLOCK_SIZE, // frsize
        );
    }
}

impl FuseAdapter {
    fn flush_inode(&self, ino: u64, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        trace!("flush: {}", path);
        match self.run_async(self.mount.flush(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }
}

/// `OsHook` that exposes each mount through the kernel
pub struct FuseHook {
    sessions: Mutex<HashMap<MountId, fuser::BackgroundSession>>,
    uid: Option<u32>,
    gid: Option<u32>,
    allow_other: bool,
}

impl FuseHook {
    pub fn new(uid: Option<u32>, gid: Option<u32>, allow_other: bool) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            uid,
            gid,
            allow_other,
        }
    }

    /// Number of live kernel sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn mount_options(&self, writable: bool) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("mergefs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if !writable {
            options.push(MountOption::RO);
        }
        options
    }
}

impl Default for FuseHook {
    fn default() -> Self {
        Self::new(None, None, true)
    }
}

impl OsHook for FuseHook {
    fn mount_ready(&self, id: MountId, mount: Arc<Mount>) -> Result<()> {
        let mount_point = mount.mount_point().to_path_buf();
        if !mount_point.is_dir() {
            return Err(MergeFsError::NotADirectory(format!(
                "mount point {:?} is not a directory",
                mount_point
            )));
        }

        let options = self.mount_options(mount.is_writable());
        if !mount.is_writable() {
            info!("Mounting {:?} as read-only", mount_point);
        }
        let adapter = FuseAdapter::new(mount, self.uid, self.gid)?;
        let session = fuser::spawn_mount2(adapter, &mount_point, &options)?;
        self.sessions.lock().insert(id, session);
        info!("{} serving at {:?}", id, mount_point);
        Ok(())
    }

    fn mount_unmounting(&self, id: MountId, mount_point: &Path) {
        if let Some(session) = self.sessions.lock().remove(&id) {
            info!("Unmounting {:?}", mount_point);
            drop(session);
        }
    }
}
