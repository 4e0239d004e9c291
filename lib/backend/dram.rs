use super::mem::{Region, RegionAlloc};
use super::registry::Tier;
use super::{Backend, File, Kind};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::utils::DEFAULT_CHUNK_SIZE;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Heap regions
pub struct HeapAlloc;

impl RegionAlloc for HeapAlloc {
    fn alloc(&self, len: u64) -> Result<Region> {
        let len = usize::try_from(len).map_err(|_| Error::Unsupported(format!("region of {len} bytes")))?;
        Ok(Region::zeroed(len)?)
    }
}

/// Parse the options shared by the byte addressable tiers: `capacity` (required) and `chunk`
pub(crate) fn tier_sizes(cfg: &BackendConfig) -> Result<(u64, u64)> {
    let capacity = cfg
        .size("capacity")?
        .ok_or_else(|| Error::Config(format!("{} backend requires option 'capacity'", cfg.kind)))?;
    let chunk = cfg.size("chunk")?.unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk == 0 {
        return Err(Error::Config("chunk must not be zero".to_string()));
    }
    Ok((capacity, chunk))
}

pub struct DramBackend {
    tier: Tier,
}

impl DramBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self> {
        let (capacity, chunk) = tier_sizes(cfg)?;
        Ok(Self::with_capacity(capacity, chunk))
    }

    pub fn with_capacity(capacity: u64, chunk: u64) -> Self {
        Self {
            tier: Tier::new(capacity, chunk, Arc::new(HeapAlloc)),
        }
    }
}

impl Backend for DramBackend {
    fn kind(&self) -> Kind {
        Kind::Dram
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
    use super::DramBackend;
    use crate::backend::Backend;
    use crate::config::BackendConfig;
    use crate::error::Error;
    use crate::lock::Operation;
    use std::io::Write;

    #[test]
    fn test_options() {
        let cfg = BackendConfig::parse("dram", &["capacity=64MiB".to_string(), "chunk=1MiB".to_string()]).unwrap();
        let b = DramBackend::new(&cfg).unwrap();
        assert_eq!(b.capacity(), 64 << 20);
        assert_eq!(b.name(), "dram");

        let cfg = BackendConfig::parse("dram", &["capacity=1G".to_string(), "chunk=0".to_string()]).unwrap();
        assert!(matches!(DramBackend::new(&cfg), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_read_unload_all() {
        let dir = tempfile::tempdir().unwrap();
        let b = DramBackend::with_capacity(1 << 20, 1000);
        let mut paths = Vec::new();
        for i in 0..3u8 {
            let p = dir.path().join(format!("f{i}"));
            let mut f = std::fs::File::create(&p).unwrap();
            f.write_all(&vec![i; 2500]).unwrap();
            b.load(&p).unwrap();
            paths.push(p);
        }
        assert_eq!(b.used(), 7500);
        assert_eq!(b.iter().count(), 3);

        let f = b.find(&paths[1]).unwrap();
        assert_eq!(f.stat().mappings, 3);
        let lock = f.lock_range(900, 1100, Operation::Read);
        let m = f.get_data(&lock, 900, 200).unwrap();
        // crosses the chunk boundary at 1000
        assert_eq!(m.len(), 2);
        assert_eq!(m.to_vec(), vec![1; 200]);
        drop(m);
        drop(lock);
        drop(f);

        assert_eq!(b.unload_all(), 0);
        assert_eq!(b.iter().count(), 0);
        assert_eq!(b.used(), 0);
        assert!(b.find(&paths[0]).is_none());
    }
}
