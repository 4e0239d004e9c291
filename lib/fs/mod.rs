//! The relay: a fuse filesystem mirroring a root directory, with cached files served from the
//! backend.

mod filesystem;
pub mod handle;
pub mod inode;

pub use filesystem::Fs;
pub use inode::{Ino, InodeTable};

use fuser::{FileAttr, FileType};
use std::ffi::{CString, OsStr};
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const TTL: Duration = Duration::from_secs(1);

pub fn to_systime(sec: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs()) + Duration::from_nanos(nsec as u64)
    }
}

pub fn to_filetype(t: std::fs::FileType) -> FileType {
    if t.is_dir() {
        FileType::Directory
    } else if t.is_symlink() {
        FileType::Symlink
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

/// `size` replaces the on disk length for files served from the backend
pub fn to_attr(ino: Ino, m: &Metadata, size: Option<u64>) -> FileAttr {
    let (size, blocks) = match size {
        Some(s) => (s, s.div_ceil(512)),
        None => (m.size(), m.blocks()),
    };
    FileAttr {
        ino,
        size,
        blocks,
        atime: to_systime(m.atime(), m.atime_nsec()),
        mtime: to_systime(m.mtime(), m.mtime_nsec()),
        ctime: to_systime(m.ctime(), m.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: to_filetype(m.file_type()),
        perm: (m.mode() & 0o7777) as u16,
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0,
    }
}

pub(crate) fn io_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

pub(crate) fn last_errno() -> i32 {
    io_errno(&std::io::Error::last_os_error())
}

pub(crate) fn cstr(s: &OsStr) -> Result<CString, i32> {
    CString::new(s.as_bytes()).map_err(|_| libc::EINVAL)
}

#[cfg(test)]
mod test {
    use super::{to_attr, to_filetype, to_systime};
    use fuser::FileType;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_systime() {
        assert_eq!(to_systime(10, 5), UNIX_EPOCH + Duration::new(10, 5));
        assert_eq!(to_systime(-10, 0), UNIX_EPOCH - Duration::from_secs(10));
    }

    #[test]
    fn test_attr() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"12345").unwrap();
        let m = std::fs::symlink_metadata(&p).unwrap();
        let a = to_attr(7, &m, None);
        assert_eq!(a.ino, 7);
        assert_eq!(a.size, 5);
        assert_eq!(a.kind, FileType::RegularFile);
        let a = to_attr(7, &m, Some(1025));
        assert_eq!(a.size, 1025);
        assert_eq!(a.blocks, 3);
        let m = std::fs::symlink_metadata(dir.path()).unwrap();
        assert_eq!(to_filetype(m.file_type()), FileType::Directory);
    }
}
