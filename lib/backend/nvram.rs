use super::dram::tier_sizes;
use super::mem::{Region, RegionAlloc};
use super::registry::Tier;
use super::{Backend, File, Kind};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Regions backed by files under a directory of a pmem (DAX) mount
pub struct PmemAlloc {
    dir: PathBuf,
    seq: AtomicU64,
}

impl PmemAlloc {
    pub fn new(dir: &Path) -> Result<Self> {
        let meta = std::fs::metadata(dir)?;
        if !meta.is_dir() {
            return Err(Error::Config(format!("{} is not a directory", dir.display())));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            seq: AtomicU64::new(0),
        })
    }

    fn next_path(&self) -> PathBuf {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{}-{:016x}.pmem", std::process::id(), id))
    }
}

impl RegionAlloc for PmemAlloc {
    fn alloc(&self, len: u64) -> Result<Region> {
        let path = self.next_path();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let map = f.set_len(len).and_then(|_| unsafe { MmapMut::map_mut(&f) });
        match map {
            Ok(map) => Ok(Region::mapped(map, path)),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                log::error!("map region {:?} of {} bytes fail, error {}", path, len, e);
                Err(e.into())
            }
        }
    }
}

pub struct NvramBackend {
    tier: Tier,
}

impl NvramBackend {
    /// needs `path`, the directory regions are created in
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let (capacity, chunk) = tier_sizes(cfg)?;
        let dir = cfg.require("path")?;
        let alloc = PmemAlloc::new(Path::new(dir))?;
        Ok(Self {
            tier: Tier::new(capacity, chunk, Arc::new(alloc)),
        })
    }
}

impl Backend for NvramBackend {
    fn kind(&self) -> Kind {
        Kind::Nvram
    }

    fn capacity(&self) -> u64 {
        self.tier.capacity()
    }

    fn used(&self) -> u64 {
        self.tier.used()
    }

    fn load(&self, path: &Path) -> Result<()> {
        self.tier.load(path)
    }

    fn unload(&self, path: &Path) -> Result<()> {
        self.tier.unload(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.tier.exists(path)
    }

    fn exists_under(&self, path: &Path) -> bool {
        self.tier.exists_under(path)
    }

    fn find(&self, path: &Path) -> Option<Arc<dyn File>> {
        self.tier.find(path)
    }

    fn iter(&self) -> std::vec::IntoIter<(PathBuf, Arc<dyn File>)> {
        self.tier.entries().into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::{NvramBackend, PmemAlloc};
    use crate::backend::mem::RegionAlloc;
    use crate::backend::Backend;
    use crate::config::BackendConfig;
    use crate::lock::Operation;

    fn regions(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_region_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = PmemAlloc::new(dir.path()).unwrap();
        let mut r = a.alloc(8192).unwrap();
        let r2 = a.alloc(100).unwrap();
        assert_eq!(r.len(), 8192);
        assert!(r.as_mut_slice().iter().all(|x| *x == 0));
        assert_eq!(regions(dir.path()), 2);
        drop(r);
        drop(r2);
        assert_eq!(regions(dir.path()), 0);
    }

    #[test]
    fn test_not_a_directory() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(PmemAlloc::new(f.path()).is_err());
    }

    #[test]
    fn test_backend() {
        let pmem = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let src = data.path().join("hot.bin");
        std::fs::write(&src, vec![3u8; 3000]).unwrap();

        let cfg = BackendConfig::parse(
            "nvram",
            &[
                "capacity=1MiB".to_string(),
                "chunk=2048".to_string(),
                format!("path={}", pmem.path().display()),
            ],
        )
        .unwrap();
        let b = NvramBackend::new(&cfg).unwrap();
        b.load(&src).unwrap();
        assert_eq!(regions(pmem.path()), 2);
        assert_eq!(b.used(), 3000);

        let f = b.find(&src).unwrap();
        let w = f.lock_range(3000, 3005, Operation::Write);
        f.put_data(&w, 3000, b"nvram").unwrap();
        drop(w);
        drop(f);

        b.unload(&src).unwrap();
        assert_eq!(regions(pmem.path()), 0);
        let disk = std::fs::read(&src).unwrap();
        assert_eq!(disk.len(), 3005);
        assert_eq!(&disk[3000..], b"nvram");
    }
}
