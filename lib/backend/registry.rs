use super::mem::{MemFile, RegionAlloc};
use super::File;
use crate::lock::Operation;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Capacity accounting of a tier, shared by every file loaded into it
#[derive(Debug)]
pub struct Usage {
    capacity: u64,
    used: AtomicU64,
}

impl Usage {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
        }
    }

    /// take `n` bytes or fail without taking anything
    pub fn reserve(&self, n: u64) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|x| *x <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| Error::CapacityExceeded {
                requested: n,
                available: self.capacity - used,
            })
    }

    pub fn release(&self, n: u64) {
        let old = self.used.fetch_sub(n, Ordering::AcqRel);
        assert!(old >= n, "release {n} bytes with only {old} in use");
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }
}

/// `path -> File` map, the lock is only held for a single map operation
#[derive(Default)]
pub struct Registry {
    files: Mutex<HashMap<PathBuf, Arc<dyn File>>>,
}

impl Registry {
    pub fn insert(&self, path: &Path, file: Arc<dyn File>) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Err(Error::Exists(path.to_path_buf()));
        }
        files.insert(path.to_path_buf(), file);
        Ok(())
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<dyn File>> {
        self.files.lock().unwrap().remove(path)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<dyn File>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn entries(&self) -> Vec<(PathBuf, Arc<dyn File>)> {
        let files = self.files.lock().unwrap();
        files.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// whether `path` or anything below it is registered, no entry is cloned
    pub fn any_under(&self, path: &Path) -> bool {
        let files = self.files.lock().unwrap();
        files.contains_key(path) || files.keys().any(|p| p.starts_with(path))
    }
}

/// What the byte addressable tiers have in common, they only differ in the region allocator
pub(crate) struct Tier {
    registry: Registry,
    usage: Arc<Usage>,
    alloc: Arc<dyn RegionAlloc>,
    chunk: u64,
}

impl Tier {
    pub(crate) fn new(capacity: u64, chunk: u64, alloc: Arc<dyn RegionAlloc>) -> Self {
        Self {
            registry: Registry::default(),
            usage: Arc::new(Usage::new(capacity)),
            alloc,
            chunk,
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.usage.capacity()
    }

    pub(crate) fn used(&self) -> u64 {
        self.usage.used()
    }

    pub(crate) fn load(&self, path: &Path) -> Result<()> {
        // cheap check before reading anything, the insert below decides races
        if self.registry.contains(path) {
            return Err(Error::Exists(path.to_path_buf()));
        }
        let file = MemFile::load(path, self.chunk, self.alloc.clone(), self.usage.clone())?;
        // a losing racer drops its copy here, which gives the capacity back
        self.registry.insert(path, Arc::new(file))?;
        log::info!("load {:?} ok, used {} of {}", path, self.used(), self.capacity());
        Ok(())
    }

    /// The entry stays registered until the write back is done, so the relay keeps finding it
    /// and its I/O waits on the whole file lock instead of bypassing the tier.
    pub(crate) fn unload(&self, path: &Path) -> Result<()> {
        let file = self.registry.get(path).ok_or_else(|| Error::NotFound(path.to_path_buf()))?;
        let lock = file.lock_range(0, u64::MAX, Operation::Write);
        match file.retire(&lock) {
            Ok(()) => {}
            // a concurrent unload got here first
            Err(Error::Stale(_)) => return Err(Error::NotFound(path.to_path_buf())),
            Err(e) => {
                log::error!("write back {:?} fail, error {}, keep it cached", path, e);
                return Err(e);
            }
        }
        self.registry.remove(path);
        drop(lock);
        log::info!("unload {:?} ok", path);
        // in flight operations still hold their Arc, memory goes with the last one
        Ok(())
    }

    pub(crate) fn exists(&self, path: &Path) -> bool {
        self.registry.contains(path)
    }

    pub(crate) fn exists_under(&self, path: &Path) -> bool {
        self.registry.any_under(path)
    }

    pub(crate) fn find(&self, path: &Path) -> Option<Arc<dyn File>> {
        self.registry.get(path)
    }

    pub(crate) fn entries(&self) -> Vec<(PathBuf, Arc<dyn File>)> {
        self.registry.entries()
    }
}

#[cfg(test)]
mod test {
    use super::{Tier, Usage};
    use crate::backend::dram::HeapAlloc;
    use crate::error::Error;
    use crate::lock::Operation;
    use std::io::Write;
    use std::os::unix::fs::FileExt;
    use std::sync::Arc;

    #[test]
    fn test_usage() {
        let u = Usage::new(100);
        u.reserve(60).unwrap();
        assert!(matches!(
            u.reserve(50),
            Err(Error::CapacityExceeded {
                requested: 50,
                available: 40
            })
        ));
        assert_eq!(u.used(), 60);
        u.reserve(40).unwrap();
        u.release(100);
        assert_eq!(u.used(), 0);
        assert!(u.reserve(u64::MAX).is_err());
    }

    fn source(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0x5a; len]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_load_10mib() {
        let src = source(10 << 20);
        let tier = Tier::new(1 << 30, 4 << 20, Arc::new(HeapAlloc));
        tier.load(src.path()).unwrap();
        assert!(tier.exists(src.path()));
        assert_eq!(tier.capacity(), 1 << 30);
        assert_eq!(tier.used(), 10 << 20);
        assert_eq!(tier.find(src.path()).unwrap().stat().mappings, 3);

        assert!(matches!(tier.load(src.path()), Err(Error::Exists(_))));
        tier.unload(src.path()).unwrap();
        assert!(!tier.exists(src.path()));
        assert_eq!(tier.used(), 0);
        assert!(matches!(tier.unload(src.path()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_load_over_capacity() {
        let small = source(4096);
        let big = source(8192);
        let tier = Tier::new(10000, 1 << 20, Arc::new(HeapAlloc));
        tier.load(small.path()).unwrap();
        assert!(matches!(tier.load(big.path()), Err(Error::CapacityExceeded { .. })));
        // registry unchanged
        assert!(!tier.exists(big.path()));
        assert_eq!(tier.entries().len(), 1);
        assert_eq!(tier.used(), 4096);
    }

    #[test]
    fn test_unload_writes_back() {
        let src = source(100);
        let tier = Tier::new(1 << 20, 1 << 20, Arc::new(HeapAlloc));
        tier.load(src.path()).unwrap();
        let f = tier.find(src.path()).unwrap();
        f.append_data(b"more").unwrap();
        drop(f);
        tier.unload(src.path()).unwrap();

        let disk = std::fs::read(src.path()).unwrap();
        assert_eq!(disk.len(), 104);
        assert_eq!(&disk[100..], b"more");
    }

    #[test]
    fn test_unload_while_in_use() {
        let src = source(5000);
        let tier = Tier::new(1 << 20, 1 << 20, Arc::new(HeapAlloc));
        tier.load(src.path()).unwrap();
        let f = tier.find(src.path()).unwrap();
        let lock = f.lock_range(0, 5000, Operation::Read);
        std::thread::scope(|s| {
            let h = s.spawn(|| tier.unload(src.path()));
            std::thread::sleep(std::time::Duration::from_millis(50));
            // unload waits for the reader, the file is still served from the tier
            assert!(tier.exists(src.path()));
            let m = f.get_data(&lock, 0, 5000).unwrap();
            assert_eq!(m.size(), 5000);
            drop(m);
            drop(lock);
            h.join().unwrap().unwrap();
        });
        assert!(!tier.exists(src.path()));
        // the handle outlives the registry entry
        assert_eq!(tier.used(), 5000);
        drop(f);
        assert_eq!(tier.used(), 0);
    }

    #[test]
    fn test_unload_keeps_writes() {
        let src = source(100);
        let tier = Tier::new(1 << 20, 1 << 20, Arc::new(HeapAlloc));
        tier.load(src.path()).unwrap();
        let f = tier.find(src.path()).unwrap();
        let w = f.lock_range(0, 1, Operation::Write);
        f.put_data(&w, 0, b"Z").unwrap();
        std::thread::scope(|s| {
            let h = s.spawn(|| tier.unload(src.path()));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(tier.exists(src.path()));
            drop(w);
            h.join().unwrap().unwrap();
        });
        assert!(!tier.exists(src.path()));

        // once unloaded the source is the only copy, a stale handle can't write over it
        std::fs::OpenOptions::new()
            .write(true)
            .open(src.path())
            .unwrap()
            .write_all_at(b"RELAY", 50)
            .unwrap();
        let w = f.lock_range(50, 55, Operation::Write);
        assert!(matches!(f.put_data(&w, 50, b"stale"), Err(Error::Stale(_))));
        drop(w);
        let disk = std::fs::read(src.path()).unwrap();
        assert_eq!(disk[0], b'Z');
        assert_eq!(&disk[50..55], b"RELAY");
        assert!(matches!(tier.unload(src.path()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_exists_under() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let p = dir.path().join("d/f");
        std::fs::write(&p, b"x").unwrap();
        let tier = Tier::new(1 << 20, 1 << 20, Arc::new(HeapAlloc));
        tier.load(&p).unwrap();
        assert!(tier.exists_under(&p));
        assert!(tier.exists_under(&dir.path().join("d")));
        assert!(tier.exists_under(dir.path()));
        // whole components only, `d/f` is not under `d/f.bak`
        assert!(!tier.exists_under(&dir.path().join("d/f.bak")));
    }
}
