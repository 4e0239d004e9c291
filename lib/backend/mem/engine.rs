//! Read and write preparation over a file's mapping list.
//!
//! Lock order inside a file is: range lock, then the list lock, then a mapping lock. A mapping
//! lock is only held to take a snapshot or to advance `bytes`, all byte copying happens on
//! snapshots with no mapping lock held.

use super::mapping::{Mapping, Snapshot};
use super::region::Region;
use super::RegionAlloc;
use crate::backend::buffer::{Buffer, BufferMap};
use crate::backend::registry::Usage;
use crate::error::{Error, Result};
use crate::utils::{align_up, FS_PAGE_SIZE};
use std::cmp::min;
use std::sync::{Arc, RwLock};

/// Mappings of one file, sorted by offset and never overlapping
#[derive(Default)]
pub struct MappingList {
    maps: RwLock<Vec<Arc<Mapping>>>,
}

impl MappingList {
    pub fn new(maps: Vec<Mapping>) -> Self {
        let maps: Vec<Arc<Mapping>> = maps.into_iter().map(Arc::new).collect();
        for w in maps.windows(2) {
            assert!(w[0].end() <= w[1].offset(), "mappings overlap or are out of order");
        }
        Self {
            maps: RwLock::new(maps),
        }
    }

    pub fn len(&self) -> usize {
        self.maps.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// sum of mapping capacities
    pub fn allocated(&self) -> u64 {
        self.maps.read().unwrap().iter().map(|m| m.size()).sum()
    }

    /// `(offset, size, bytes)` of every mapping, in list order
    pub fn layout(&self) -> Vec<(u64, u64, u64)> {
        let maps = self.maps.read().unwrap();
        maps.iter().map(|m| (m.offset(), m.size(), m.lock().bytes())).collect()
    }
}

/// Ranges of `[offset, end)` not covered by any mapping's capacity
fn gaps(maps: &[Arc<Mapping>], offset: u64, end: u64) -> Vec<(u64, u64)> {
    let mut r = Vec::new();
    let mut cur = offset;
    for m in maps {
        if cur >= end {
            break;
        }
        if m.end() <= cur {
            continue;
        }
        if m.offset() > cur {
            r.push((cur, min(m.offset(), end)));
        }
        cur = cur.max(m.end());
    }
    if cur < end {
        r.push((cur, end));
    }
    r
}

/// Build the fragment list answering `[offset, offset + size)`. Only ranges populated in some
/// mapping produce fragments, the rest of the window is left as holes.
pub fn read_prepare<'l>(list: &MappingList, offset: u64, size: u64) -> BufferMap<'l> {
    let end = offset.saturating_add(size);
    let mut snaps: Vec<Snapshot> = Vec::new();
    {
        let maps = list.maps.read().unwrap();
        for m in maps.iter() {
            // sorted by offset, nothing further can overlap
            if m.offset() >= end {
                break;
            }
            let g = m.lock();
            if g.overlaps(offset, size) {
                snaps.push(g.snapshot());
            }
        }
    }

    let mut bmap = BufferMap::new(offset, end - offset);
    for sn in snaps {
        assert!(sn.bytes <= sn.size);
        let delta = offset.saturating_sub(sn.offset);
        let stop = min(end, sn.offset + sn.bytes);
        let len = stop - (sn.offset + delta);
        bmap.push(Buffer::new(sn.region, delta as usize, len as usize, sn.offset + delta));
    }
    bmap
}

/// Fragments a write of `[offset, offset + len)` lands in, together with their mappings
pub struct WritePlan {
    offset: u64,
    len: u64,
    targets: Vec<(Arc<Mapping>, Buffer)>,
}

impl WritePlan {
    /// copy caller data into the planned fragments, no mapping lock is taken here
    pub fn copy_in(&self, src: &[u8]) {
        assert_eq!(src.len() as u64, self.len);
        for (_, b) in &self.targets {
            let from = (b.pos() - self.offset) as usize;
            b.write(0, &src[from..from + b.size()]);
        }
    }
}

/// Make sure `[offset, end)` is backed by mappings, allocating zeroed ones for every gap.
/// Capacity for all gaps is reserved before anything changes, so a failure leaves the list as
/// it was. A gap past the last mapping is rounded up to a whole page when the tier has room
/// for it, otherwise it is allocated exactly.
fn ensure_backed(list: &MappingList, alloc: &dyn RegionAlloc, usage: &Usage, offset: u64, end: u64) -> Result<()> {
    if gaps(&list.maps.read().unwrap(), offset, end).is_empty() {
        return Ok(());
    }

    let mut maps = list.maps.write().unwrap();
    let tail = maps.last().map(|m| m.end()).unwrap_or(0);
    let exact = gaps(&maps, offset, end);
    if exact.is_empty() {
        return Ok(());
    }
    let mut padded = Vec::with_capacity(exact.len());
    for &(s, e) in &exact {
        if s >= tail {
            let stop = s.checked_add(align_up(e - s, FS_PAGE_SIZE)).ok_or_else(too_big)?;
            padded.push((s, stop));
        } else {
            padded.push((s, e));
        }
    }

    let (plan, total) = match usage.reserve(span(&padded)) {
        Ok(()) => {
            let total = span(&padded);
            (padded, total)
        }
        Err(e) if padded == exact => return Err(e),
        Err(_) => {
            let total = span(&exact);
            usage.reserve(total)?;
            (exact, total)
        }
    };

    let mut fresh = Vec::with_capacity(plan.len());
    for (s, e) in &plan {
        match alloc.alloc(e - s) {
            Ok(r) => fresh.push(Mapping::new(*s, r, 0)),
            Err(e) => {
                usage.release(total);
                return Err(e);
            }
        }
    }

    for m in fresh {
        log::debug!("new mapping offset {} size {}", m.offset(), m.size());
        let pos = maps.partition_point(|x| x.offset() < m.offset());
        maps.insert(pos, Arc::new(m));
    }
    Ok(())
}

fn span(ranges: &[(u64, u64)]) -> u64 {
    ranges.iter().map(|(s, e)| e - s).sum()
}

fn too_big() -> Error {
    Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG))
}

/// Plan a write of `len` bytes at `offset`, extending the list where the range isn't backed
pub fn write_prepare(
    list: &MappingList,
    alloc: &dyn RegionAlloc,
    usage: &Usage,
    offset: u64,
    len: u64,
) -> Result<WritePlan> {
    let end = offset.checked_add(len).ok_or_else(too_big)?;
    ensure_backed(list, alloc, usage, offset, end)?;

    let mut found = Vec::new();
    {
        let maps = list.maps.read().unwrap();
        for m in maps.iter() {
            if m.offset() >= end {
                break;
            }
            if m.end() <= offset {
                continue;
            }
            let sn = m.lock().snapshot();
            found.push((m.clone(), sn));
        }
    }

    let mut targets = Vec::with_capacity(found.len());
    let mut covered = 0u64;
    for (m, sn) in found {
        let from = offset.max(sn.offset);
        let to = end.min(sn.offset + sn.size);
        let b = Buffer::new(sn.region, (from - sn.offset) as usize, (to - from) as usize, from);
        covered += to - from;
        targets.push((m, b));
    }
    assert_eq!(covered, len, "write [{offset}, {end}) not fully backed");

    Ok(WritePlan { offset, len, targets })
}

/// Publish a copied plan: every touched mapping's `bytes` moves up to the written end
pub fn write_finalize(plan: &WritePlan) {
    for (m, b) in &plan.targets {
        let upto = b.end() - m.offset();
        m.lock().advance(upto);
    }
}

/// Build a mapping list from `len` bytes of `src`, one mapping per `chunk` bytes
pub fn populate<R: std::io::Read>(src: &mut R, len: u64, chunk: u64, alloc: &dyn RegionAlloc) -> Result<MappingList> {
    assert!(chunk > 0);
    let mut maps = Vec::new();
    let mut off = 0u64;
    while off < len {
        let n = min(chunk, len - off);
        let mut region: Region = alloc.alloc(n)?;
        src.read_exact(region.as_mut_slice())?;
        maps.push(Mapping::new(off, region, n));
        off += n;
    }
    Ok(MappingList::new(maps))
}

#[cfg(test)]
mod test {
    use super::{gaps, populate, read_prepare, write_finalize, write_prepare, MappingList};
    use crate::backend::dram::HeapAlloc;
    use crate::backend::mem::mapping::Mapping;
    use crate::backend::mem::region::Region;
    use crate::backend::registry::Usage;
    use crate::error::Error;
    use std::sync::Arc;

    fn filled(offset: u64, size: usize, bytes: u64, seed: u8) -> Mapping {
        let mut r = Region::zeroed(size).unwrap();
        for (i, b) in r.as_mut_slice().iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        Mapping::new(offset, r, bytes)
    }

    fn frags(list: &MappingList, offset: u64, size: u64) -> Vec<(usize, usize)> {
        let m = read_prepare(list, offset, size);
        let v: Vec<(usize, usize)> = m.iter().map(|b| (b.start(), b.size())).collect();
        assert_eq!(m.size(), v.iter().map(|(_, s)| *s as u64).sum::<u64>());
        v
    }

    #[test]
    fn test_single_mapping() {
        let list = MappingList::new(vec![filled(0, 65536, 65536, 0)]);
        assert_eq!(frags(&list, 0, 4096), vec![(0, 4096)]);
        assert_eq!(frags(&list, 65000, 4096), vec![(65000, 536)]);
    }

    #[test]
    fn test_two_mappings() {
        let list = MappingList::new(vec![filled(0, 4096, 4096, 0), filled(4096, 4096, 4096, 0)]);
        let m = read_prepare(&list, 2048, 4096);
        let v: Vec<(u64, usize, usize)> = m.iter().map(|b| (b.pos(), b.start(), b.size())).collect();
        assert_eq!(v, vec![(2048, 2048, 2048), (4096, 0, 2048)]);
        assert_eq!(m.size(), 4096);
    }

    #[test]
    fn test_past_end() {
        let list = MappingList::new(vec![filled(0, 65536, 65536, 0)]);
        let m = read_prepare(&list, 100000, 10);
        assert!(m.is_empty());
        assert_eq!(m.size(), 0);
    }

    #[test]
    fn test_partially_populated() {
        // only the first 100 bytes of a 4096 byte mapping hold data
        let list = MappingList::new(vec![filled(0, 4096, 100, 0), filled(8192, 4096, 4096, 0)]);
        assert_eq!(frags(&list, 50, 100), vec![(50, 50)]);
        assert_eq!(frags(&list, 200, 100), vec![]);
        // hole between the mappings yields no fragment
        let m = read_prepare(&list, 0, 12288);
        let v: Vec<(u64, usize)> = m.iter().map(|b| (b.pos(), b.size())).collect();
        assert_eq!(v, vec![(0, 100), (8192, 4096)]);
        assert_eq!(m.window(), 12288);
    }

    #[test]
    fn test_fragment_coverage() {
        let list = MappingList::new(vec![
            filled(0, 1000, 700, 1),
            filled(1000, 1000, 1000, 2),
            filled(3000, 500, 500, 3),
            filled(5000, 2000, 1500, 4),
        ]);
        let layout = list.layout();
        for offset in (0..7500u64).step_by(97) {
            for size in [0u64, 1, 300, 999, 2500, 8000] {
                let m = read_prepare(&list, offset, size);
                let mut expected = Vec::new();
                for (mo, _, mb) in &layout {
                    let s = offset.max(*mo);
                    let e = (offset + size).min(mo + mb);
                    if s < e {
                        expected.push((s, e));
                    }
                }
                let got: Vec<(u64, u64)> = m.iter().map(|b| (b.pos(), b.end())).collect();
                assert_eq!(got, expected, "offset {offset} size {size}");
                for w in got.windows(2) {
                    assert!(w[0].1 <= w[1].0);
                }
            }
        }
    }

    #[test]
    fn test_gaps() {
        let maps: Vec<Arc<Mapping>> = vec![Arc::new(filled(100, 100, 0, 0)), Arc::new(filled(300, 100, 0, 0))];
        assert_eq!(gaps(&maps, 0, 500), vec![(0, 100), (200, 300), (400, 500)]);
        assert_eq!(gaps(&maps, 120, 180), vec![]);
        assert_eq!(gaps(&maps, 150, 350), vec![(200, 300)]);
        assert_eq!(gaps(&[], 10, 20), vec![(10, 20)]);
    }

    fn write(list: &MappingList, usage: &Usage, offset: u64, data: &[u8]) -> crate::Result<()> {
        let plan = write_prepare(list, &HeapAlloc, usage, offset, data.len() as u64)?;
        plan.copy_in(data);
        write_finalize(&plan);
        Ok(())
    }

    #[test]
    fn test_write_extends() {
        let usage = Usage::new(1 << 20);
        let list = MappingList::default();
        write(&list, &usage, 0, b"hello").unwrap();
        assert_eq!(list.layout(), vec![(0, 4096, 5)]);
        assert_eq!(usage.used(), 4096);

        // fills spare capacity of the tail, then spills into a new mapping
        write(&list, &usage, 4090, b"0123456789").unwrap();
        assert_eq!(list.layout(), vec![(0, 4096, 4096), (4096, 4096, 4)]);

        let m = read_prepare(&list, 0, 4100);
        let v = m.to_vec();
        assert_eq!(&v[..5], b"hello");
        assert!(v[5..4090].iter().all(|x| *x == 0));
        assert_eq!(&v[4090..], b"0123456789");
    }

    #[test]
    fn test_write_fills_gap() {
        let usage = Usage::new(1 << 20);
        let list = MappingList::new(vec![filled(0, 100, 100, 0), filled(300, 100, 100, 0)]);
        write(&list, &usage, 50, &[0xaa; 300]).unwrap();
        // exactly the gap is allocated, the list stays sorted
        assert_eq!(list.layout(), vec![(0, 100, 100), (100, 200, 200), (300, 100, 100)]);
        assert_eq!(usage.used(), 200);
        let v = read_prepare(&list, 0, 400).to_vec();
        assert_eq!(v[49], 49);
        assert!(v[50..350].iter().all(|x| *x == 0xaa));
        assert_eq!(v[350], 50);
    }

    #[test]
    fn test_overwrite_keeps_bytes() {
        let usage = Usage::new(1 << 20);
        let list = MappingList::new(vec![filled(0, 4096, 4096, 0)]);
        write(&list, &usage, 10, b"xyz").unwrap();
        assert_eq!(list.layout(), vec![(0, 4096, 4096)]);
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn test_write_capacity() {
        let usage = Usage::new(4096);
        let list = MappingList::default();
        write(&list, &usage, 0, &[1; 4096]).unwrap();
        let r = write(&list, &usage, 8192, &[1; 10]);
        assert!(matches!(r, Err(Error::CapacityExceeded { .. })));
        // nothing changed
        assert_eq!(list.layout(), vec![(0, 4096, 4096)]);
        assert_eq!(usage.used(), 4096);
    }

    #[test]
    fn test_tail_padding_shrinks_to_fit() {
        let usage = Usage::new(4096 + 100);
        let list = MappingList::default();
        write(&list, &usage, 0, &[1; 4096]).unwrap();
        // no room for a whole page, the 10 bytes still fit
        write(&list, &usage, 4096, b"0123456789").unwrap();
        assert_eq!(list.layout(), vec![(0, 4096, 4096), (4096, 10, 10)]);
        assert_eq!(usage.used(), 4106);
        assert!(matches!(write(&list, &usage, 4106, &[2; 100]), Err(Error::CapacityExceeded { .. })));
        assert_eq!(usage.used(), 4106);
    }

    #[test]
    fn test_write_near_max_offset() {
        let usage = Usage::new(1 << 20);
        let list = MappingList::default();
        match write(&list, &usage, u64::MAX - 4, b"abcd") {
            Err(Error::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::EFBIG)),
            other => panic!("unexpected {:?}", other.err()),
        }
        assert!(list.is_empty());
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn test_populate_chunks() {
        let data: Vec<u8> = (0..10000u32).map(|x| x as u8).collect();
        let list = populate(&mut data.as_slice(), data.len() as u64, 4096, &HeapAlloc).unwrap();
        assert_eq!(list.layout(), vec![(0, 4096, 4096), (4096, 4096, 4096), (8192, 1808, 1808)]);
        assert_eq!(list.allocated(), 10000);
        let m = read_prepare(&list, 4000, 200);
        assert_eq!(m.len(), 2);
        assert_eq!(m.to_vec(), data[4000..4200].to_vec());
    }

    #[test]
    fn test_concurrent_readers_and_tail_writer() {
        let usage = Arc::new(Usage::new(64 << 20));
        let list = Arc::new(MappingList::new(vec![filled(0, 4096, 4096, 0)]));
        let mut hs = Vec::new();
        for _ in 0..4 {
            let list = list.clone();
            hs.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    // readers stay below the region being written
                    let m = read_prepare(&list, i % 4096, 64);
                    assert!(m.size() <= 64);
                    for w in m.iter().collect::<Vec<_>>().windows(2) {
                        assert!(w[0].end() <= w[1].pos());
                    }
                }
            }));
        }
        for i in 0..64u64 {
            write(&list, &usage, 4096 + i * 1000, &[7; 1000]).unwrap();
        }
        for h in hs {
            h.join().unwrap();
        }
        let layout = list.layout();
        for w in layout.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
        for (_, size, bytes) in layout {
            assert!(bytes <= size);
        }
    }
}
