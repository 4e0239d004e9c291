use super::region::Region;
use std::sync::{Arc, Mutex, MutexGuard};

/// One region caching `[offset, offset + size)` of a file, of which the first `bytes` are
/// populated. `offset` and `size` never change after creation, `bytes` only grows and only
/// under the mapping lock.
pub struct Mapping {
    offset: u64,
    size: u64,
    region: Arc<Region>,
    bytes: Mutex<u64>,
}

impl Mapping {
    pub fn new(offset: u64, region: Region, bytes: u64) -> Self {
        let size = region.len() as u64;
        assert!(bytes <= size, "mapping bytes {bytes} exceed size {size}");
        assert!(offset.checked_add(size).is_some(), "mapping end overflows");
        Self {
            offset,
            size,
            region: Arc::new(region),
            bytes: Mutex::new(bytes),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// end of the capacity, not of the populated part
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn lock(&self) -> MappingGuard<'_> {
        MappingGuard {
            m: self,
            bytes: self.bytes.lock().unwrap(),
        }
    }
}

/// Held mapping lock, `overlaps` and `snapshot` are only reachable through it
pub struct MappingGuard<'a> {
    m: &'a Mapping,
    bytes: MutexGuard<'a, u64>,
}

impl MappingGuard<'_> {
    pub fn bytes(&self) -> u64 {
        *self.bytes
    }

    /// test `[offset, offset + size)` against the populated part of the mapping
    pub fn overlaps(&self, offset: u64, size: u64) -> bool {
        let end = offset.saturating_add(size);
        size > 0 && *self.bytes > 0 && self.m.offset < end && offset < self.m.offset + *self.bytes
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            region: self.m.region.clone(),
            offset: self.m.offset,
            size: self.m.size,
            bytes: *self.bytes,
        }
    }

    /// mark everything below mapping relative `upto` as populated, never shrinks
    pub fn advance(&mut self, upto: u64) {
        assert!(upto <= self.m.size, "advance to {upto} beyond size {}", self.m.size);
        if upto > *self.bytes {
            *self.bytes = upto;
        }
    }
}

/// Copy of a mapping's descriptor taken under its lock, used without the lock afterwards
#[derive(Clone)]
pub struct Snapshot {
    pub region: Arc<Region>,
    pub offset: u64,
    pub size: u64,
    pub bytes: u64,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::Mapping;
    use crate::backend::mem::region::Region;

    #[test]
    fn test_overlaps() {
        let m = Mapping::new(4096, Region::zeroed(8192).unwrap(), 4096);
        let g = m.lock();
        assert!(g.overlaps(4096, 1));
        assert!(g.overlaps(0, 4097));
        assert!(g.overlaps(8191, 100));
        // beyond populated bytes even though inside the capacity
        assert!(!g.overlaps(8192, 100));
        assert!(!g.overlaps(0, 4096));
        assert!(!g.overlaps(5000, 0));
    }

    #[test]
    fn test_advance_and_snapshot() {
        let m = Mapping::new(0, Region::zeroed(100).unwrap(), 10);
        let snap = m.lock().snapshot();
        {
            let mut g = m.lock();
            g.advance(50);
            g.advance(20);
            assert_eq!(g.bytes(), 50);
        }
        // the snapshot keeps the state it was taken with
        assert_eq!(snap.bytes, 10);
        assert_eq!(m.lock().snapshot().bytes, 50);
    }

    #[test]
    #[should_panic]
    fn test_advance_beyond_size() {
        let m = Mapping::new(0, Region::zeroed(100).unwrap(), 0);
        m.lock().advance(101);
    }

    #[test]
    #[should_panic]
    fn test_bytes_beyond_size() {
        let _ = Mapping::new(0, Region::zeroed(10).unwrap(), 11);
    }
}
