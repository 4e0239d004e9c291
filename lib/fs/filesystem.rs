use super::handle::HandleTable;
use super::inode::{Ino, InodeTable};
use super::{cstr, io_errno, last_errno, to_attr, TTL};
use crate::backend::File as CachedFile;
use crate::context::Context;
use crate::error::Error;
use crate::lock::Operation;
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{EBADF, EBUSY, EINVAL, ENOENT};
use std::ffi::{OsStr, OsString};
use std::fs::{OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, DirEntryExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

type Res<T> = std::result::Result<T, i32>;

struct OpenFile {
    file: std::fs::File,
    /// source path, the key of the backend registry
    path: PathBuf,
    append: bool,
}

struct OpenDir {
    path: PathBuf,
    entries: Vec<(u64, FileType, OsString)>,
}

pub enum Xattr {
    Size(u32),
    Data(Vec<u8>),
}

pub struct Fs {
    ctx: Arc<Context>,
    inodes: InodeTable,
    files: HandleTable<OpenFile>,
    dirs: HandleTable<OpenDir>,
}

fn open_options(flags: i32) -> OpenOptions {
    let mut o = OpenOptions::new();
    let write = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            o.write(true);
            true
        }
        libc::O_RDWR => {
            o.read(true).write(true);
            true
        }
        _ => {
            o.read(true);
            false
        }
    };
    if flags & libc::O_APPEND != 0 {
        o.append(true);
    }
    if write && flags & libc::O_TRUNC != 0 {
        o.truncate(true);
    }
    o.custom_flags(flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL));
    o
}

fn read_file(file: &std::fs::File, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut done = 0;
    while done < size {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(done);
    Ok(buf)
}

fn to_timespec(t: Option<TimeOrNow>) -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    match t {
        None => ts.tv_nsec = libc::UTIME_OMIT,
        Some(TimeOrNow::Now) => ts.tv_nsec = libc::UTIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            ts.tv_sec = d.as_secs() as libc::time_t;
            ts.tv_nsec = d.subsec_nanos() as _;
        }
    }
    ts
}

impl Fs {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            inodes: InodeTable::new(),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
        }
    }

    /// mount in a background session, the session unmounts when dropped
    pub fn mount(self, mountpoint: &Path, allow_other: bool) -> std::io::Result<fuser::BackgroundSession> {
        let mut options = vec![
            fuser::MountOption::FSName("tierfs".to_string()),
            fuser::MountOption::Subtype("tierfs".to_string()),
            fuser::MountOption::DefaultPermissions,
        ];
        if allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        fuser::spawn_mount2(self, mountpoint, &options)
    }

    fn rel(&self, ino: Ino) -> Res<PathBuf> {
        self.inodes.path(ino).map(|p| p.to_path_buf()).ok_or(ENOENT)
    }

    fn real(&self, ino: Ino) -> Res<PathBuf> {
        Ok(self.ctx.root().join(self.rel(ino)?))
    }

    /// relative and real path of `name` under `parent`
    fn child(&self, parent: Ino, name: &OsStr) -> Res<(PathBuf, PathBuf)> {
        if name.as_bytes().contains(&b'/') {
            return Err(EINVAL);
        }
        let rel = self.rel(parent)?.join(name);
        let real = self.ctx.root().join(&rel);
        Ok((rel, real))
    }

    fn cached(&self, real: &Path) -> Option<Arc<dyn CachedFile>> {
        self.ctx.backend().find(real)
    }

    /// a cached file, or a directory holding one, can't change its name or length
    fn pinned(&self, real: &Path) -> bool {
        self.ctx.backend().exists_under(real)
    }

    fn attr(&self, ino: Ino, real: &Path) -> Res<FileAttr> {
        let m = std::fs::symlink_metadata(real).map_err(|e| io_errno(&e))?;
        let size = self.cached(real).map(|f| f.stat().size);
        Ok(to_attr(ino, &m, size))
    }

    /// count a kernel lookup of `rel`, only once it's known to exist
    fn entry(&mut self, rel: &Path) -> Res<FileAttr> {
        let real = self.ctx.root().join(rel);
        std::fs::symlink_metadata(&real).map_err(|e| io_errno(&e))?;
        let ino = self.inodes.lookup(rel);
        self.attr(ino, &real)
    }

    pub fn do_lookup(&mut self, parent: Ino, name: &OsStr) -> Res<FileAttr> {
        let (rel, _) = self.child(parent, name)?;
        self.entry(&rel)
    }

    pub fn do_getattr(&self, ino: Ino) -> Res<FileAttr> {
        let real = self.real(ino)?;
        self.attr(ino, &real)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_setattr(
        &mut self,
        ino: Ino,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Res<FileAttr> {
        let real = self.real(ino)?;
        if let Some(mode) = mode {
            std::fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777)).map_err(|e| io_errno(&e))?;
        }
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&real, uid, gid).map_err(|e| io_errno(&e))?;
        }
        if let Some(size) = size {
            if self.pinned(&real) {
                log::warn!("truncate cached {:?} rejected", real);
                return Err(EBUSY);
            }
            let r = match fh.and_then(|fh| self.files.get(fh)) {
                Some(h) => h.file.set_len(size),
                None => OpenOptions::new().write(true).open(&real).and_then(|f| f.set_len(size)),
            };
            r.map_err(|e| io_errno(&e))?;
        }
        if atime.is_some() || mtime.is_some() {
            let c = cstr(real.as_os_str())?;
            let times = [to_timespec(atime), to_timespec(mtime)];
            let r = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
            if r != 0 {
                return Err(last_errno());
            }
        }
        self.attr(ino, &real)
    }

    pub fn do_readlink(&self, ino: Ino) -> Res<Vec<u8>> {
        let target = std::fs::read_link(self.real(ino)?).map_err(|e| io_errno(&e))?;
        Ok(target.as_os_str().as_bytes().to_vec())
    }

    pub fn do_mknod(&mut self, parent: Ino, name: &OsStr, mode: u32, umask: u32, rdev: u32) -> Res<FileAttr> {
        let (rel, real) = self.child(parent, name)?;
        let c = cstr(real.as_os_str())?;
        let r = unsafe { libc::mknod(c.as_ptr(), (mode & !umask) as libc::mode_t, rdev as libc::dev_t) };
        if r != 0 {
            return Err(last_errno());
        }
        self.entry(&rel)
    }

    pub fn do_mkdir(&mut self, parent: Ino, name: &OsStr, mode: u32, umask: u32) -> Res<FileAttr> {
        let (rel, real) = self.child(parent, name)?;
        std::fs::DirBuilder::new()
            .mode(mode & !umask)
            .create(&real)
            .map_err(|e| io_errno(&e))?;
        self.entry(&rel)
    }

    pub fn do_unlink(&mut self, parent: Ino, name: &OsStr) -> Res<()> {
        let (rel, real) = self.child(parent, name)?;
        if self.pinned(&real) {
            log::warn!("unlink cached {:?} rejected", real);
            return Err(EBUSY);
        }
        std::fs::remove_file(&real).map_err(|e| io_errno(&e))?;
        self.inodes.unlink(&rel);
        Ok(())
    }

    pub fn do_rmdir(&mut self, parent: Ino, name: &OsStr) -> Res<()> {
        let (rel, real) = self.child(parent, name)?;
        std::fs::remove_dir(&real).map_err(|e| io_errno(&e))?;
        self.inodes.unlink(&rel);
        Ok(())
    }

    pub fn do_symlink(&mut self, parent: Ino, name: &OsStr, target: &Path) -> Res<FileAttr> {
        let (rel, real) = self.child(parent, name)?;
        std::os::unix::fs::symlink(target, &real).map_err(|e| io_errno(&e))?;
        self.entry(&rel)
    }

    pub fn do_rename(&mut self, parent: Ino, name: &OsStr, newparent: Ino, newname: &OsStr, flags: u32) -> Res<()> {
        if flags != 0 {
            return Err(EINVAL);
        }
        let (from_rel, from) = self.child(parent, name)?;
        let (to_rel, to) = self.child(newparent, newname)?;
        if self.pinned(&from) || self.pinned(&to) {
            log::warn!("rename {:?} -> {:?} touches a cached file, rejected", from, to);
            return Err(EBUSY);
        }
        std::fs::rename(&from, &to).map_err(|e| io_errno(&e))?;
        self.inodes.rename(&from_rel, &to_rel);
        Ok(())
    }

    pub fn do_link(&mut self, ino: Ino, newparent: Ino, newname: &OsStr) -> Res<FileAttr> {
        let src = self.real(ino)?;
        let (rel, real) = self.child(newparent, newname)?;
        std::fs::hard_link(&src, &real).map_err(|e| io_errno(&e))?;
        self.entry(&rel)
    }

    pub fn do_open(&mut self, ino: Ino, flags: i32) -> Res<u64> {
        let real = self.real(ino)?;
        if flags & libc::O_TRUNC != 0 && self.pinned(&real) {
            return Err(EBUSY);
        }
        let file = open_options(flags).open(&real).map_err(|e| io_errno(&e))?;
        Ok(self.files.insert(OpenFile {
            file,
            path: real,
            append: flags & libc::O_APPEND != 0,
        }))
    }

    pub fn do_create(&mut self, parent: Ino, name: &OsStr, mode: u32, umask: u32, flags: i32) -> Res<(FileAttr, u64)> {
        let (rel, real) = self.child(parent, name)?;
        if flags & libc::O_TRUNC != 0 && self.pinned(&real) {
            return Err(EBUSY);
        }
        let mut o = open_options(flags);
        o.create(true).mode(mode & !umask);
        if flags & libc::O_EXCL != 0 {
            o.create_new(true);
        }
        // creating implies write access for std, a read only create still gets its file
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            o.write(true);
        }
        let file = o.open(&real).map_err(|e| io_errno(&e))?;
        let attr = self.entry(&rel)?;
        let fh = self.files.insert(OpenFile {
            file,
            path: real,
            append: flags & libc::O_APPEND != 0,
        });
        Ok((attr, fh))
    }

    fn read_cached(&self, f: &dyn CachedFile, offset: u64, size: u32) -> crate::Result<Vec<u8>> {
        let end = offset.saturating_add(size as u64);
        let lock = f.lock_range_timeout(offset, end, Operation::Read, self.ctx.lock_timeout())?;
        let bmap = f.get_data(&lock, offset, size as u64)?;
        let mut buf = vec![0u8; bmap.window() as usize];
        bmap.copy_to(&mut buf);
        Ok(buf)
    }

    fn write_cached(&self, f: &dyn CachedFile, offset: u64, data: &[u8], append: bool) -> crate::Result<usize> {
        if append {
            return f.append_data(data);
        }
        let end = offset.saturating_add(data.len() as u64);
        let lock = f.lock_range_timeout(offset, end, Operation::Write, self.ctx.lock_timeout())?;
        f.put_data(&lock, offset, data)
    }

    pub fn do_read(&self, fh: u64, offset: i64, size: u32) -> Res<Vec<u8>> {
        let h = self.files.get(fh).ok_or(EBADF)?;
        let offset = u64::try_from(offset).map_err(|_| EINVAL)?;
        self.read_handle(h, self.cached(&h.path), offset, size)
    }

    /// a file unloaded while the request waited for its range lock is read from the source
    fn read_handle(&self, h: &OpenFile, cached: Option<Arc<dyn CachedFile>>, offset: u64, size: u32) -> Res<Vec<u8>> {
        if let Some(f) = cached {
            match self.read_cached(f.as_ref(), offset, size) {
                Err(Error::Stale(_)) => {}
                r => {
                    return r.map_err(|e| {
                        log::warn!("read {:?} at {} fail, error {}", h.path, offset, e);
                        e.errno()
                    })
                }
            }
        }
        read_file(&h.file, offset, size as usize).map_err(|e| io_errno(&e))
    }

    pub fn do_write(&self, fh: u64, offset: i64, data: &[u8]) -> Res<u32> {
        let h = self.files.get(fh).ok_or(EBADF)?;
        let offset = u64::try_from(offset).map_err(|_| EINVAL)?;
        self.write_handle(h, self.cached(&h.path), offset, data).map(|n| n as u32)
    }

    fn write_handle(&self, h: &OpenFile, cached: Option<Arc<dyn CachedFile>>, offset: u64, data: &[u8]) -> Res<usize> {
        if let Some(f) = cached {
            match self.write_cached(f.as_ref(), offset, data, h.append) {
                Err(Error::Stale(_)) => {}
                r => {
                    return r.map_err(|e| {
                        log::warn!("write {:?} at {} fail, error {}", h.path, offset, e);
                        e.errno()
                    })
                }
            }
        }
        // append handles were opened with O_APPEND, the offset is ignored by the host
        h.file.write_all_at(data, offset).map_err(|e| io_errno(&e))?;
        Ok(data.len())
    }

    pub fn do_fsync(&self, fh: u64, datasync: bool) -> Res<()> {
        let h = self.files.get(fh).ok_or(EBADF)?;
        // a cached file reaches its source on unload
        if self.ctx.backend().exists(&h.path) {
            return Ok(());
        }
        let r = if datasync { h.file.sync_data() } else { h.file.sync_all() };
        r.map_err(|e| io_errno(&e))
    }

    pub fn do_fsyncdir(&self, fh: u64, datasync: bool) -> Res<()> {
        let d = self.dirs.get(fh).ok_or(EBADF)?;
        let dir = std::fs::File::open(&d.path).map_err(|e| io_errno(&e))?;
        let r = if datasync { dir.sync_data() } else { dir.sync_all() };
        r.map_err(|e| io_errno(&e))
    }

    pub fn do_release(&mut self, fh: u64) -> Res<()> {
        self.files.remove(fh).map(|_| ()).ok_or(EBADF)
    }

    pub fn do_opendir(&mut self, ino: Ino) -> Res<u64> {
        let real = self.real(ino)?;
        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (ino, FileType::Directory, OsString::from("..")),
        ];
        for e in std::fs::read_dir(&real).map_err(|e| io_errno(&e))? {
            let e = e.map_err(|e| io_errno(&e))?;
            let kind = match e.file_type() {
                Ok(t) => super::to_filetype(t),
                Err(_) => FileType::RegularFile,
            };
            entries.push((e.ino(), kind, e.file_name()));
        }
        Ok(self.dirs.insert(OpenDir { path: real, entries }))
    }

    /// entries after `offset`, each paired with the offset of the next one
    pub fn dir_entries(&self, fh: u64, offset: i64) -> Res<Vec<(u64, i64, FileType, OsString)>> {
        let d = self.dirs.get(fh).ok_or(EBADF)?;
        let skip = usize::try_from(offset).map_err(|_| EINVAL)?;
        Ok(d.entries
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, (ino, kind, name))| (*ino, (i + 1) as i64, *kind, name.clone()))
            .collect())
    }

    pub fn do_releasedir(&mut self, fh: u64) -> Res<()> {
        self.dirs.remove(fh).map(|_| ()).ok_or(EBADF)
    }

    pub fn do_statfs(&self, ino: Ino) -> Res<libc::statvfs> {
        let real = self.real(ino).unwrap_or_else(|_| self.ctx.root().to_path_buf());
        let c = cstr(real.as_os_str())?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c.as_ptr(), &mut st) } != 0 {
            return Err(last_errno());
        }
        Ok(st)
    }

    pub fn do_access(&self, ino: Ino, mask: i32) -> Res<()> {
        let c = cstr(self.real(ino)?.as_os_str())?;
        if unsafe { libc::access(c.as_ptr(), mask) } != 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn do_setxattr(&self, ino: Ino, name: &OsStr, value: &[u8], flags: i32) -> Res<()> {
        let p = cstr(self.real(ino)?.as_os_str())?;
        let n = cstr(name)?;
        let r = unsafe { libc::lsetxattr(p.as_ptr(), n.as_ptr(), value.as_ptr() as *const libc::c_void, value.len(), flags) };
        if r != 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    pub fn do_getxattr(&self, ino: Ino, name: &OsStr, size: u32) -> Res<Xattr> {
        let p = cstr(self.real(ino)?.as_os_str())?;
        let n = cstr(name)?;
        let mut buf = vec![0u8; size as usize];
        let ptr = if size == 0 { std::ptr::null_mut() } else { buf.as_mut_ptr() as *mut libc::c_void };
        let r = unsafe { libc::lgetxattr(p.as_ptr(), n.as_ptr(), ptr, buf.len()) };
        if r < 0 {
            return Err(last_errno());
        }
        if size == 0 {
            return Ok(Xattr::Size(r as u32));
        }
        buf.truncate(r as usize);
        Ok(Xattr::Data(buf))
    }

    pub fn do_listxattr(&self, ino: Ino, size: u32) -> Res<Xattr> {
        let p = cstr(self.real(ino)?.as_os_str())?;
        let mut buf = vec![0u8; size as usize];
        let ptr = if size == 0 { std::ptr::null_mut() } else { buf.as_mut_ptr() as *mut libc::c_char };
        let r = unsafe { libc::llistxattr(p.as_ptr(), ptr, buf.len()) };
        if r < 0 {
            return Err(last_errno());
        }
        if size == 0 {
            return Ok(Xattr::Size(r as u32));
        }
        buf.truncate(r as usize);
        Ok(Xattr::Data(buf))
    }

    pub fn do_removexattr(&self, ino: Ino, name: &OsStr) -> Res<()> {
        let p = cstr(self.real(ino)?.as_os_str())?;
        let n = cstr(name)?;
        if unsafe { libc::lremovexattr(p.as_ptr(), n.as_ptr()) } != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

fn reply_xattr(r: Res<Xattr>, reply: ReplyXattr) {
    match r {
        Ok(Xattr::Size(n)) => reply.size(n),
        Ok(Xattr::Data(v)) => reply.data(&v),
        Err(e) => reply.error(e),
    }
}

fn reply_empty(r: Res<()>, reply: ReplyEmpty) {
    match r {
        Ok(()) => reply.ok(),
        Err(e) => reply.error(e),
    }
}

fn reply_entry(r: Res<FileAttr>, reply: ReplyEntry) {
    match r {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(e) => reply.error(e),
    }
}

impl Filesystem for Fs {
    fn init(&mut self, _req: &Request<'_>, _cfg: &mut fuser::KernelConfig) -> Result<(), i32> {
        match std::fs::metadata(self.ctx.root()) {
            Ok(m) if m.is_dir() => {
                log::info!("relay {:?} ready", self.ctx.root());
                Ok(())
            }
            _ => {
                log::error!("root {:?} is not a directory", self.ctx.root());
                Err(ENOENT)
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        reply_entry(self.do_lookup(parent, name), reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
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
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        match self.do_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(v) => reply.data(&v),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, rdev: u32, reply: ReplyEntry) {
        reply_entry(self.do_mknod(parent, name, mode, umask, rdev), reply);
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        reply_entry(self.do_mkdir(parent, name, mode, umask), reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_empty(self.do_unlink(parent, name), reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_empty(self.do_rmdir(parent, name), reply);
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        reply_entry(self.do_symlink(parent, link_name, target), reply);
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
        reply_empty(self.do_rename(parent, name, newparent, newname, flags), reply);
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        reply_entry(self.do_link(ino, newparent, newname), reply);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

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
        match self.do_read(fh, offset, size) {
            Ok(v) => reply.data(&v),
            Err(e) => reply.error(e),
        }
    }

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
        match self.do_write(fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.files.get(fh).is_some() {
            reply.ok();
        } else {
            reply.error(EBADF);
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
        reply_empty(self.do_release(fh), reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        reply_empty(self.do_fsync(fh, datasync), reply);
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        reply_empty(self.do_fsyncdir(fh, datasync), reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        match self.dir_entries(fh, offset) {
            Ok(entries) => {
                for (ino, next, kind, name) in entries {
                    if reply.add(ino, next, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply_empty(self.do_releasedir(fh), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.do_statfs(ino) {
            Ok(st) => reply.statfs(
                st.f_blocks as u64,
                st.f_bfree as u64,
                st.f_bavail as u64,
                st.f_files as u64,
                st.f_ffree as u64,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply_empty(self.do_setxattr(ino, name, value, flags), reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        reply_xattr(self.do_getxattr(ino, name, size), reply);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        reply_xattr(self.do_listxattr(ino, size), reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_empty(self.do_removexattr(ino, name), reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        reply_empty(self.do_access(ino, mask), reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.do_create(parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e),
        }
    }
}

impl Drop for Fs {
    fn drop(&mut self) {
        log::info!("relay closed with {} open files", self.files.len());
    }
}
