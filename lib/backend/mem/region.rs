use memmap2::MmapMut;
use std::io;
use std::path::PathBuf;

enum Backing {
    Heap,
    Pmem { _map: MmapMut, path: PathBuf },
}

/// Fixed size block of memory owned by one mapping. Heap regions back the DRAM tier, file
/// mapped regions the NVRAM tier. Every access is bounds checked against `len`.
pub struct Region {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// zero filled heap region, allocation failure is reported instead of aborting
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let mut v: Vec<u8> = Vec::new();
        v.try_reserve_exact(len)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()))?;
        v.resize(len, 0);
        let ptr = Box::into_raw(v.into_boxed_slice()) as *mut u8;
        Ok(Self {
            ptr,
            len,
            backing: Backing::Heap,
        })
    }

    /// take ownership of a mapped file, the file is removed when the region is dropped
    pub fn mapped(mut map: MmapMut, path: PathBuf) -> Self {
        let ptr = map.as_mut_ptr();
        let len = map.len();
        Self {
            ptr,
            len,
            backing: Backing::Pmem { _map: map, path },
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// exclusive access, only possible before the region is shared
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn check(&self, off: usize, n: usize) {
        let end = off.checked_add(n);
        assert!(
            end.is_some_and(|e| e <= self.len),
            "region access [{off}, +{n}) out of bounds {}",
            self.len
        );
    }

    /// # Safety
    /// no one may write `[off, off + dst.len())` concurrently, callers hold a range lock
    /// covering it
    pub(crate) unsafe fn read_at(&self, off: usize, dst: &mut [u8]) {
        self.check(off, dst.len());
        std::ptr::copy_nonoverlapping(self.ptr.add(off), dst.as_mut_ptr(), dst.len());
    }

    /// # Safety
    /// no one may access `[off, off + src.len())` concurrently, callers hold a write range
    /// lock covering it
    pub(crate) unsafe fn write_at(&self, off: usize, src: &[u8]) {
        self.check(off, src.len());
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(off), src.len());
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Heap => unsafe {
                let _ = Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr, self.len));
            },
            Backing::Pmem { path, .. } => {
                if let Err(e) = std::fs::remove_file(path) {
                    log::warn!("can't remove region file {:?}, error {}", path, e);
                }
            }
        }
    }
}
