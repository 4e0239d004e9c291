//! Storage tiers a cached file lives in.
//!
//! A `Backend` owns the `path -> File` registry of one tier, a `File` is the handle the relay
//! reads and writes through. Both are trait objects so the relay doesn't care which tier it
//! talks to.

pub mod buffer;
pub mod dram;
pub mod mem;
pub mod nvram;
pub mod registry;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::lock::{Operation, RangeLock};
use buffer::BufferMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStat {
    /// logical size
    pub size: u64,
    /// sum of mapping capacities
    pub allocated: u64,
    pub mappings: usize,
    /// modified since load or the last write back
    pub dirty: bool,
}

pub trait File: Send + Sync {
    fn stat(&self) -> FileStat;

    /// block until `[start, end)` can be granted for `op`
    fn lock_range(&self, start: u64, end: u64, op: Operation) -> RangeLock<'_>;

    fn lock_range_timeout(&self, start: u64, end: u64, op: Operation, timeout: Duration) -> Result<RangeLock<'_>>;

    fn unlock_range(&self, lock: RangeLock<'_>) {
        drop(lock);
    }

    /// fragments of `[offset, offset + size)` clipped to the logical size, `lock` must be a
    /// read or write lock of this file covering the range
    fn get_data<'l>(&self, lock: &'l RangeLock<'_>, offset: u64, size: u64) -> Result<BufferMap<'l>>;

    /// write `data` at `offset` under a write lock covering it, returns the bytes written
    fn put_data(&self, lock: &RangeLock<'_>, offset: u64, data: &[u8]) -> Result<usize>;

    /// write `data` at the current end of file
    fn append_data(&self, data: &[u8]) -> Result<usize>;

    /// mirror contents and length back to the source path
    fn write_back(&self) -> Result<()>;

    /// write back when dirty and stop serving I/O, later `get_data`, `put_data` and
    /// `append_data` fail with `Error::Stale`. `lock` must be a write lock over `[0, u64::MAX)`
    fn retire(&self, lock: &RangeLock<'_>) -> Result<()>;

    fn retired(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Dram,
    Nvram,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Dram => "dram",
            Kind::Nvram => "nvram",
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dram" => Ok(Kind::Dram),
            "nvram" => Ok(Kind::Nvram),
            _ => Err(Error::Config(format!("unknown backend type {s:?}"))),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub trait Backend: Send + Sync {
    fn kind(&self) -> Kind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn capacity(&self) -> u64;

    /// bytes currently allocated to cached files
    fn used(&self) -> u64;

    fn load(&self, path: &Path) -> Result<()>;

    /// drop `path` from the tier, writing it back first when it was modified
    fn unload(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// `path` itself or some file below it is cached
    fn exists_under(&self, path: &Path) -> bool;

    fn find(&self, path: &Path) -> Option<Arc<dyn File>>;

    /// snapshot of the registry
    fn iter(&self) -> std::vec::IntoIter<(PathBuf, Arc<dyn File>)>;

    /// unload every file, returns how many failed
    fn unload_all(&self) -> usize {
        let mut failed = 0;
        for (path, _) in self.iter() {
            if let Err(e) = self.unload(&path) {
                log::error!("unload {:?} fail, error {}", path, e);
                failed += 1;
            }
        }
        failed
    }
}

pub fn create_from_options(cfg: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let b: Arc<dyn Backend> = match cfg.kind {
        Kind::Dram => Arc::new(dram::DramBackend::new(cfg)?),
        Kind::Nvram => Arc::new(nvram::NvramBackend::new(cfg)?),
    };
    log::info!("created {} backend, capacity {}", b.name(), b.capacity());
    Ok(b)
}
