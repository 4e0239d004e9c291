use super::engine::{self, MappingList};
use super::RegionAlloc;
use crate::backend::buffer::BufferMap;
use crate::backend::registry::Usage;
use crate::backend::{File, FileStat};
use crate::error::{Error, Result};
use crate::lock::{Operation, RangeLock, RangeLockManager};
use std::cmp::min;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WRITE_BACK_CHUNK: usize = 1 << 20;

/// A file cached in a byte addressable tier
pub struct MemFile {
    source: PathBuf,
    maps: MappingList,
    size: AtomicU64,
    dirty: AtomicBool,
    // set under a whole file write lock once the file left its registry
    retired: AtomicBool,
    locks: RangeLockManager,
    append: Mutex<()>,
    alloc: Arc<dyn RegionAlloc>,
    usage: Arc<Usage>,
}

impl MemFile {
    /// read `source` into mappings of at most `chunk` bytes, the whole length is reserved
    /// before the first byte is read
    pub fn load(source: &Path, chunk: u64, alloc: Arc<dyn RegionAlloc>, usage: Arc<Usage>) -> Result<Self> {
        let mut src = std::fs::File::open(source)?;
        let meta = src.metadata()?;
        if !meta.is_file() {
            return Err(Error::Unsupported(format!("{} is not a regular file", source.display())));
        }
        let len = meta.len();
        usage.reserve(len)?;

        let maps = match engine::populate(&mut src, len, chunk, alloc.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                usage.release(len);
                log::error!("load {:?} fail, error {}", source, e);
                return Err(e);
            }
        };
        log::info!("loaded {:?} {} bytes in {} mappings", source, len, maps.len());

        Ok(Self {
            source: source.to_path_buf(),
            size: AtomicU64::new(len),
            maps,
            dirty: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            locks: RangeLockManager::new(),
            append: Mutex::new(()),
            alloc,
            usage,
        })
    }

    #[cfg(test)]
    pub(crate) fn empty(source: &Path, alloc: Arc<dyn RegionAlloc>, usage: Arc<Usage>) -> Self {
        Self {
            source: source.to_path_buf(),
            maps: MappingList::default(),
            size: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            locks: RangeLockManager::new(),
            append: Mutex::new(()),
            alloc,
            usage,
        }
    }

    /// `(offset, size, bytes)` of every mapping
    pub fn layout(&self) -> Vec<(u64, u64, u64)> {
        self.maps.layout()
    }

    fn check(&self, lock: &RangeLock<'_>, start: u64, end: u64, op: Operation) {
        assert!(lock.granted_by(&self.locks), "range lock belongs to another file");
        assert!(
            lock.covers(start, end, op),
            "range lock [{}, {}) {:?} doesn't cover [{start}, {end}) {op:?}",
            lock.start(),
            lock.end(),
            lock.op()
        );
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let len = data.len() as u64;
        let end = offset + len;
        let plan = engine::write_prepare(&self.maps, self.alloc.as_ref(), &self.usage, offset, len)?;
        plan.copy_in(data);
        engine::write_finalize(&plan);
        // published after the mappings, a reader never sees a size beyond populated bytes
        self.size.fetch_max(end, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(data.len())
    }

    fn live(&self) -> Result<()> {
        if self.retired.load(Ordering::Acquire) {
            return Err(Error::Stale(self.source.clone()));
        }
        Ok(())
    }

    /// copy contents and length to the source path, `lock` must cover the whole file
    fn flush(&self, lock: &RangeLock<'_>) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        let bmap = self.get_data(lock, 0, size)?;
        let out = OpenOptions::new().write(true).create(true).truncate(false).open(&self.source)?;

        let mut buf = vec![0u8; min(WRITE_BACK_CHUNK as u64, size) as usize];
        let zeros = |from: u64, to: u64, buf: &mut [u8]| -> std::io::Result<()> {
            buf.fill(0);
            let mut cur = from;
            while cur < to {
                let n = min(buf.len() as u64, to - cur) as usize;
                out.write_all_at(&buf[..n], cur)?;
                cur += n as u64;
            }
            Ok(())
        };

        let mut cur = 0u64;
        for b in bmap.iter() {
            zeros(cur, b.pos(), buf.as_mut_slice())?;
            let mut done = 0usize;
            while done < b.size() {
                let n = min(buf.len(), b.size() - done);
                b.read(done, &mut buf[..n]);
                out.write_all_at(&buf[..n], b.pos() + done as u64)?;
                done += n;
            }
            cur = b.end();
        }
        zeros(cur, size, buf.as_mut_slice())?;
        out.set_len(size)?;
        out.sync_all()?;

        self.dirty.store(false, Ordering::Release);
        log::info!("wrote back {:?} {} bytes", self.source, size);
        Ok(())
    }

    fn end_of(offset: u64, len: usize) -> Result<u64> {
        offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)))
    }
}

impl File for MemFile {
    fn stat(&self) -> FileStat {
        FileStat {
            size: self.size.load(Ordering::Acquire),
            allocated: self.maps.allocated(),
            mappings: self.maps.len(),
            dirty: self.dirty.load(Ordering::Acquire),
        }
    }

    fn lock_range(&self, start: u64, end: u64, op: Operation) -> RangeLock<'_> {
        self.locks.lock(start, end, op)
    }

    fn lock_range_timeout(&self, start: u64, end: u64, op: Operation, timeout: Duration) -> Result<RangeLock<'_>> {
        self.locks.lock_timeout(start, end, op, timeout)
    }

    fn get_data<'l>(&self, lock: &'l RangeLock<'_>, offset: u64, size: u64) -> Result<BufferMap<'l>> {
        let end = offset.saturating_add(size);
        self.check(lock, offset, end, Operation::Read);
        self.live()?;
        let eof = self.size.load(Ordering::Acquire);
        let window = min(end, eof).saturating_sub(offset);
        Ok(engine::read_prepare(&self.maps, offset, window))
    }

    fn put_data(&self, lock: &RangeLock<'_>, offset: u64, data: &[u8]) -> Result<usize> {
        let end = Self::end_of(offset, data.len())?;
        self.check(lock, offset, end, Operation::Write);
        self.live()?;
        if data.is_empty() {
            return Ok(0);
        }
        self.write_at(offset, data)
    }

    fn append_data(&self, data: &[u8]) -> Result<usize> {
        let _serial = self.append.lock().unwrap();
        // any write extending past `from` conflicts with this lock, so the size is stable
        // once it is granted
        let from = self.size.load(Ordering::Acquire);
        let _lock = self.locks.lock(from, u64::MAX, Operation::Write);
        self.live()?;
        let offset = self.size.load(Ordering::Acquire);
        Self::end_of(offset, data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        self.write_at(offset, data)
    }

    fn write_back(&self) -> Result<()> {
        let lock = self.locks.lock(0, u64::MAX, Operation::Read);
        self.flush(&lock)
    }

    fn retire(&self, lock: &RangeLock<'_>) -> Result<()> {
        self.check(lock, 0, u64::MAX, Operation::Write);
        self.live()?;
        if self.dirty.load(Ordering::Acquire) {
            self.flush(lock)?;
        }
        self.retired.store(true, Ordering::Release);
        Ok(())
    }

    fn retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let n = self.maps.allocated();
        self.usage.release(n);
        log::debug!("drop cached file {:?}, released {} bytes", self.source, n);
    }
}
