//! Byte range locks over a single file.
//!
//! A `Read` request is granted when it overlaps no granted `Write`, a `Write` request when it
//! overlaps nothing granted at all. Requests that can't be granted queue up in arrival order
//! and a request never overtakes an earlier queued request it conflicts with, so a steady
//! stream of readers can't starve a writer. The token returned to the caller releases the
//! interval when dropped.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    id: u64,
    start: u64,
    end: u64,
    op: Operation,
}

impl Interval {
    // an empty interval overlaps nothing
    fn overlaps(&self, other: &Interval) -> bool {
        self.start < self.end && other.start < other.end && self.start < other.end && other.start < self.end
    }

    fn conflicts(&self, other: &Interval) -> bool {
        self.overlaps(other) && (self.op == Operation::Write || other.op == Operation::Write)
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    granted: Vec<Interval>,
    waiting: VecDeque<Interval>,
}

impl State {
    fn grantable(&self, req: &Interval) -> bool {
        if self.granted.iter().any(|g| g.conflicts(req)) {
            return false;
        }
        for w in &self.waiting {
            if w.id == req.id {
                break;
            }
            if w.conflicts(req) {
                return false;
            }
        }
        true
    }

    fn withdraw(&mut self, id: u64) {
        self.waiting.retain(|w| w.id != id);
    }
}

#[derive(Default)]
pub struct RangeLockManager {
    state: Mutex<State>,
    cond: Condvar,
}

impl RangeLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// block until `[start, end)` is granted for `op`
    pub fn lock(&self, start: u64, end: u64, op: Operation) -> RangeLock<'_> {
        let mut st = self.state.lock().unwrap();
        let req = Self::enqueue(&mut st, start, end, op);
        while !st.grantable(&req) {
            st = self.cond.wait(st).unwrap();
        }
        self.grant(&mut st, req)
    }

    /// same as `lock` but gives up after `timeout`, the queued request is withdrawn so it no
    /// longer holds back later requests
    pub fn lock_timeout(&self, start: u64, end: u64, op: Operation, timeout: Duration) -> Result<RangeLock<'_>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        let req = Self::enqueue(&mut st, start, end, op);
        while !st.grantable(&req) {
            let now = Instant::now();
            if now >= deadline {
                st.withdraw(req.id);
                drop(st);
                self.cond.notify_all();
                log::warn!("range lock [{start}, {end}) {op:?} timed out");
                return Err(Error::RangeTimeout { start, end });
            }
            st = self.cond.wait_timeout(st, deadline - now).unwrap().0;
        }
        Ok(self.grant(&mut st, req))
    }

    /// number of currently granted intervals
    pub fn granted(&self) -> usize {
        self.state.lock().unwrap().granted.len()
    }

    fn enqueue(st: &mut State, start: u64, end: u64, op: Operation) -> Interval {
        assert!(start <= end, "invalid range [{start}, {end})");
        let req = Interval {
            id: st.next_id,
            start,
            end,
            op,
        };
        st.next_id += 1;
        st.waiting.push_back(req);
        req
    }

    fn grant(&self, st: &mut State, req: Interval) -> RangeLock<'_> {
        st.withdraw(req.id);
        st.granted.push(req);
        RangeLock { mgr: self, iv: req }
    }

    fn release(&self, id: u64) {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.granted.iter().position(|g| g.id == id) {
            st.granted.swap_remove(pos);
        }
        drop(st);
        self.cond.notify_all();
    }
}

/// A granted interval, released on drop
pub struct RangeLock<'a> {
    mgr: &'a RangeLockManager,
    iv: Interval,
}

impl RangeLock<'_> {
    pub fn start(&self) -> u64 {
        self.iv.start
    }

    pub fn end(&self) -> u64 {
        self.iv.end
    }

    pub fn op(&self) -> Operation {
        self.iv.op
    }

    /// a write lock also covers reads of its range
    pub fn covers(&self, start: u64, end: u64, op: Operation) -> bool {
        self.iv.start <= start && end <= self.iv.end && (op == Operation::Read || self.iv.op == Operation::Write)
    }

    pub(crate) fn granted_by(&self, mgr: &RangeLockManager) -> bool {
        std::ptr::eq(self.mgr, mgr)
    }
}

impl Drop for RangeLock<'_> {
    fn drop(&mut self) {
        self.mgr.release(self.iv.id);
    }
}

#[cfg(test)]
mod test {
    use super::{Operation, RangeLockManager};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_readers() {
        let m = RangeLockManager::new();
        let a = m.lock(0, 100, Operation::Read);
        let b = m.lock(50, 150, Operation::Read);
        assert_eq!(m.granted(), 2);
        // disjoint writer is not blocked by readers
        let c = m.lock(150, 200, Operation::Write);
        assert_eq!(m.granted(), 3);
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(m.granted(), 0);
    }

    #[test]
    fn test_covers() {
        let m = RangeLockManager::new();
        let w = m.lock(10, 20, Operation::Write);
        assert!(w.covers(10, 20, Operation::Write));
        assert!(w.covers(12, 15, Operation::Read));
        assert!(!w.covers(5, 15, Operation::Read));
        drop(w);
        let r = m.lock(10, 20, Operation::Read);
        assert!(r.covers(10, 20, Operation::Read));
        assert!(!r.covers(10, 20, Operation::Write));
    }

    #[test]
    fn test_writer_excludes_reader() {
        let m = Arc::new(RangeLockManager::new());
        let w = m.lock(0, 4096, Operation::Write);
        let (tx, rx) = mpsc::channel();
        let m2 = m.clone();
        let h = thread::spawn(move || {
            let _r = m2.lock(100, 200, Operation::Read);
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(w);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn test_queued_writer_blocks_later_reader() {
        let m = Arc::new(RangeLockManager::new());
        let r1 = m.lock(0, 100, Operation::Read);

        let (wtx, wrx) = mpsc::channel();
        let m2 = m.clone();
        let writer = thread::spawn(move || {
            let _w = m2.lock(0, 100, Operation::Write);
            wtx.send(()).unwrap();
            thread::sleep(Duration::from_millis(50));
        });
        // let the writer queue up behind r1
        while m.state.lock().unwrap().waiting.is_empty() {
            thread::yield_now();
        }

        // a new reader would be compatible with r1 but must not overtake the writer
        let r2 = m.lock_timeout(50, 60, Operation::Read, Duration::from_millis(50));
        assert!(r2.is_err());

        drop(r1);
        wrx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        let r3 = m.lock_timeout(50, 60, Operation::Read, Duration::from_secs(5));
        assert!(r3.is_ok());
    }

    #[test]
    fn test_timeout_withdraws_request() {
        let m = RangeLockManager::new();
        let _w = m.lock(0, 10, Operation::Write);
        let r = m.lock_timeout(0, 10, Operation::Write, Duration::from_millis(20));
        assert!(matches!(r, Err(crate::Error::RangeTimeout { start: 0, end: 10 })));
        assert!(m.state.lock().unwrap().waiting.is_empty());
        // the withdrawn request doesn't block unrelated readers
        let _r = m.lock(10, 20, Operation::Read);
    }

    #[test]
    fn test_empty_range() {
        let m = RangeLockManager::new();
        let _w = m.lock(0, 10, Operation::Write);
        let _e = m.lock(5, 5, Operation::Write);
        assert_eq!(m.granted(), 2);
    }

    #[test]
    fn test_write_exclusion() {
        let m = Arc::new(RangeLockManager::new());
        let busy = Arc::new(AtomicBool::new(false));
        let readers = Arc::new(AtomicU32::new(0));
        let mut hs = Vec::new();

        for i in 0..8u64 {
            let m = m.clone();
            let busy = busy.clone();
            let readers = readers.clone();
            hs.push(thread::spawn(move || {
                for j in 0..200u64 {
                    let start = (i * 7 + j) % 64;
                    if (i + j) % 3 == 0 {
                        let _w = m.lock(start, start + 64, Operation::Write);
                        assert!(!busy.swap(true, Ordering::SeqCst));
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        busy.store(false, Ordering::SeqCst);
                    } else {
                        let _r = m.lock(start, start + 64, Operation::Read);
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert!(!busy.load(Ordering::SeqCst));
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(m.granted(), 0);
    }
}
