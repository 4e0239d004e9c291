use super::mem::region::Region;
use std::cmp::min;
use std::marker::PhantomData;
use std::sync::Arc;

/// A contiguous fragment of cached data: `size` bytes of `region` starting at `start`, holding
/// the file bytes at `pos`
pub struct Buffer {
    region: Arc<Region>,
    start: usize,
    size: usize,
    pos: u64,
}

impl Buffer {
    pub(crate) fn new(region: Arc<Region>, start: usize, size: usize, pos: u64) -> Self {
        assert!(
            start.checked_add(size).is_some_and(|e| e <= region.len()),
            "buffer [{start}, +{size}) exceeds region of {} bytes",
            region.len()
        );
        Self {
            region,
            start,
            size,
            pos,
        }
    }

    /// offset inside the region
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// file offset of the first byte
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn end(&self) -> u64 {
        self.pos + self.size as u64
    }

    /// copy `dst.len()` bytes starting `at` bytes into the fragment
    pub fn read(&self, at: usize, dst: &mut [u8]) {
        assert!(at + dst.len() <= self.size);
        // a buffer is only reachable through a BufferMap bound to the range lock
        unsafe { self.region.read_at(self.start + at, dst) }
    }

    pub(crate) fn write(&self, at: usize, src: &[u8]) {
        assert!(at + src.len() <= self.size);
        unsafe { self.region.write_at(self.start + at, src) }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer {{ pos: {}, start: {}, size: {} }}", self.pos, self.start, self.size)
    }
}

/// Ordered, non overlapping fragments answering a read of `[base, base + window)`. Parts of
/// the window without a fragment are holes and read as zero. The map borrows the range lock
/// that was held to build it, so it can't outlive it.
#[derive(Debug)]
pub struct BufferMap<'l> {
    base: u64,
    window: u64,
    buffers: Vec<Buffer>,
    size: u64,
    _lock: PhantomData<&'l ()>,
}

impl<'l> BufferMap<'l> {
    pub(crate) fn new(base: u64, window: u64) -> Self {
        Self {
            base,
            window,
            buffers: Vec::new(),
            size: 0,
            _lock: PhantomData,
        }
    }

    pub(crate) fn push(&mut self, buf: Buffer) {
        assert!(buf.pos >= self.base && buf.end() <= self.base + self.window);
        if let Some(last) = self.buffers.last() {
            assert!(last.end() <= buf.pos, "fragments out of order {:?} {:?}", last, buf);
        }
        self.size += buf.size as u64;
        self.buffers.push(buf);
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// length of the answer, holes included
    pub fn window(&self) -> u64 {
        self.window
    }

    /// sum of fragment sizes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.buffers.iter()
    }

    /// gather the window into `dst`, zero filling holes, returns the number of bytes written
    /// which is `min(dst.len(), window)`
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let n = min(dst.len() as u64, self.window) as usize;
        let mut cur = 0usize;
        for b in &self.buffers {
            let from = (b.pos - self.base) as usize;
            if from >= n {
                break;
            }
            dst[cur..from].fill(0);
            let len = min(b.size, n - from);
            b.read(0, &mut dst[from..from + len]);
            cur = from + len;
        }
        dst[cur..n].fill(0);
        n
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = vec![0u8; self.window as usize];
        self.copy_to(&mut v);
        v
    }
}
