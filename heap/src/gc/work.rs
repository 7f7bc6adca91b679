//! Mark work buffers.
//!
//! Grey objects live in fixed-size buffers. Each slot's [`GcWork`] keeps two
//! of them locally and trades whole buffers with the global lists, so the
//! global lock is taken once per few hundred objects.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::lock::{Lock, LockRank};

pub const WORKBUF_CAP: usize = 253;

pub struct WorkBuf {
    nobj: usize,
    obj: [usize; WORKBUF_CAP],
}

impl WorkBuf {
    fn new() -> Box<Self> {
        Box::new(Self {
            nobj: 0,
            obj: [0; WORKBUF_CAP],
        })
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.nobj == WORKBUF_CAP
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.nobj == 0
    }

    #[inline]
    fn push(&mut self, obj: usize) {
        self.obj[self.nobj] = obj;
        self.nobj += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<usize> {
        if self.nobj == 0 {
            return None;
        }
        self.nobj -= 1;
        Some(self.obj[self.nobj])
    }

    pub fn len(&self) -> usize {
        self.nobj
    }
}

#[derive(Default)]
struct WorkLists {
    full: Vec<Box<WorkBuf>>,
    empty: Vec<Box<WorkBuf>>,
}

/// Global buffer lists.
pub struct WorkBufs {
    lists: Lock<WorkLists>,
    nfull: AtomicUsize,
}

impl Default for WorkBufs {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkBufs {
    pub fn new() -> Self {
        Self {
            lists: Lock::new(LockRank::WorkBufs, WorkLists::default()),
            nfull: AtomicUsize::new(0),
        }
    }

    fn get_empty(&self) -> Box<WorkBuf> {
        self.lists.lock().empty.pop().unwrap_or_else(WorkBuf::new)
    }

    fn put_empty(&self, buf: Box<WorkBuf>) {
        debug_assert!(buf.is_empty());
        self.lists.lock().empty.push(buf);
    }

    fn put_full(&self, buf: Box<WorkBuf>) {
        debug_assert!(!buf.is_empty());
        let mut lists = self.lists.lock();
        lists.full.push(buf);
        self.nfull.fetch_add(1, Ordering::Release);
    }

    fn try_get_full(&self) -> Option<Box<WorkBuf>> {
        if self.nfull.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut lists = self.lists.lock();
        let buf = lists.full.pop()?;
        self.nfull.fetch_sub(1, Ordering::Release);
        Some(buf)
    }

    /// No published work. Work may still sit in slot-local buffers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nfull.load(Ordering::Acquire) == 0
    }

    pub fn full_count(&self) -> usize {
        self.nfull.load(Ordering::Acquire)
    }
}

/// A producer/consumer of grey objects.
#[derive(Default)]
pub struct GcWork {
    wbuf1: Option<Box<WorkBuf>>,
    wbuf2: Option<Box<WorkBuf>>,
    /// Bytes marked since the last flush.
    pub bytes_marked: u64,
    /// Bytes scanned since the last flush.
    pub scan_work: u64,
}

impl std::fmt::Debug for GcWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcWork")
            .field("wbuf1", &self.wbuf1.as_ref().map(|b| b.nobj))
            .field("wbuf2", &self.wbuf2.as_ref().map(|b| b.nobj))
            .field("bytes_marked", &self.bytes_marked)
            .field("scan_work", &self.scan_work)
            .finish()
    }
}

impl GcWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a grey object.
    pub fn put(&mut self, bufs: &WorkBufs, obj: usize) {
        if self.wbuf1.as_ref().is_none_or(|b| b.is_full()) {
            std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
            match &self.wbuf1 {
                None => self.wbuf1 = Some(bufs.get_empty()),
                Some(b) if b.is_full() => {
                    if let Some(full) = self.wbuf1.replace(bufs.get_empty()) {
                        bufs.put_full(full);
                    }
                }
                Some(_) => {}
            }
        }
        if let Some(b) = self.wbuf1.as_mut() {
            b.push(obj);
        }
    }

    /// Take a grey object, local buffers first, then the global list.
    pub fn try_get(&mut self, bufs: &WorkBufs) -> Option<usize> {
        if let Some(obj) = self.wbuf1.as_mut().and_then(|b| b.pop()) {
            return Some(obj);
        }
        std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
        if let Some(obj) = self.wbuf1.as_mut().and_then(|b| b.pop()) {
            return Some(obj);
        }
        let full = bufs.try_get_full()?;
        if let Some(old) = self.wbuf1.replace(full) {
            bufs.put_empty(old);
        }
        self.wbuf1.as_mut().and_then(|b| b.pop())
    }

    /// Nothing queued locally.
    pub fn is_empty(&self) -> bool {
        self.wbuf1.as_ref().is_none_or(|b| b.is_empty())
            && self.wbuf2.as_ref().is_none_or(|b| b.is_empty())
    }

    /// Give a buffer to the global list when others have nothing to do.
    pub fn balance(&mut self, bufs: &WorkBufs) {
        if !bufs.is_empty() {
            return;
        }
        if let Some(b) = self.wbuf2.take_if(|b| !b.is_empty()) {
            bufs.put_full(b);
            self.wbuf2 = Some(bufs.get_empty());
        } else if let Some(b) = self.wbuf1.take_if(|b| b.len() > 4) {
            bufs.put_full(b);
            self.wbuf1 = Some(bufs.get_empty());
        }
    }

    /// Publish all local work. Returns whether there was any.
    pub fn flush(&mut self, bufs: &WorkBufs) -> bool {
        let mut published = false;
        for slot in [&mut self.wbuf1, &mut self.wbuf2] {
            if let Some(b) = slot.take() {
                if b.is_empty() {
                    bufs.put_empty(b);
                } else {
                    bufs.put_full(b);
                    published = true;
                }
            }
        }
        published
    }

    /// Take the accumulated counters.
    pub fn take_counters(&mut self) -> (u64, u64) {
        (
            std::mem::take(&mut self.bytes_marked),
            std::mem::take(&mut self.scan_work),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_spills_full_buffers() {
        let bufs = WorkBufs::new();
        let mut w = GcWork::new();
        for i in 0..3 * WORKBUF_CAP {
            w.put(&bufs, 8 * (i + 1));
        }
        assert!(bufs.full_count() >= 1);

        let mut seen = Vec::new();
        while let Some(obj) = w.try_get(&bufs) {
            seen.push(obj);
        }
        seen.sort_unstable();
        assert_eq!(seen.len(), 3 * WORKBUF_CAP);
        assert_eq!(seen[0], 8);
        assert!(bufs.is_empty());
    }

    #[test]
    fn flush_publishes_to_other_workers() {
        let bufs = WorkBufs::new();
        let mut a = GcWork::new();
        let mut b = GcWork::new();
        a.put(&bufs, 0x1000);
        a.put(&bufs, 0x2000);
        assert!(b.try_get(&bufs).is_none());
        assert!(a.flush(&bufs));
        assert!(a.is_empty());
        let mut got = vec![b.try_get(&bufs).unwrap(), b.try_get(&bufs).unwrap()];
        got.sort_unstable();
        assert_eq!(got, vec![0x1000, 0x2000]);
        assert!(!a.flush(&bufs));
    }

    #[test]
    fn balance_shares_when_global_is_empty() {
        let bufs = WorkBufs::new();
        let mut w = GcWork::new();
        for i in 0..10 {
            w.put(&bufs, 8 * (i + 1));
        }
        w.balance(&bufs);
        assert_eq!(bufs.full_count(), 1);
        w.balance(&bufs);
        assert_eq!(bufs.full_count(), 1);
    }
}
