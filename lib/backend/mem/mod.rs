//! The in-memory engine shared by the byte addressable tiers: regions, mappings and the
//! mapping list algorithms. DRAM and NVRAM only differ in where regions come from.

pub mod engine;
mod file;
pub mod mapping;
pub mod region;

use crate::error::Result;
pub use file::MemFile;
pub use region::Region;

/// Source of zero filled regions for a tier
pub trait RegionAlloc: Send + Sync {
    fn alloc(&self, len: u64) -> Result<Region>;
}
