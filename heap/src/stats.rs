//! Heap statistics.
//!
//! Slots count their allocations locally and fold them in here when their
//! cache is flushed. Sweeping counts frees directly. Everything is an
//! atomic so metrics can be read from any thread without locks; the fold
//! itself is serialized so a snapshot never sees half a fold.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    lock::{Lock, LockRank},
    sizeclass::{NUM_SIZE_CLASSES, class_size},
};

fn counters<const N: usize>() -> [AtomicU64; N] {
    std::array::from_fn(|_| AtomicU64::new(0))
}

/// Allocation counts a slot accumulates between flushes.
#[derive(Debug, Clone)]
pub struct LocalStats {
    pub tiny_allocs: u64,
    pub small_allocs: [u64; NUM_SIZE_CLASSES],
    pub large_allocs: u64,
    pub large_bytes: u64,
    /// Bytes allocated in scannable objects.
    pub scan_alloc: u64,
}

impl Default for LocalStats {
    fn default() -> Self {
        Self {
            tiny_allocs: 0,
            small_allocs: [0; NUM_SIZE_CLASSES],
            large_allocs: 0,
            large_bytes: 0,
            scan_alloc: 0,
        }
    }
}

impl LocalStats {
    pub fn is_empty(&self) -> bool {
        self.tiny_allocs == 0
            && self.large_allocs == 0
            && self.scan_alloc == 0
            && self.small_allocs.iter().all(|&n| n == 0)
    }
}

pub struct HeapStats {
    fold: Lock<()>,
    /// Bytes in spans handed to slots plus large objects, minus what was
    /// returned unused. Drives the pacer.
    pub heap_live: AtomicU64,
    /// Bytes marked by the last completed cycle.
    pub heap_marked: AtomicU64,
    pub small_allocs: [AtomicU64; NUM_SIZE_CLASSES],
    pub small_frees: [AtomicU64; NUM_SIZE_CLASSES],
    pub tiny_allocs: AtomicU64,
    pub large_allocs: AtomicU64,
    pub large_frees: AtomicU64,
    pub large_bytes_allocated: AtomicU64,
    pub large_bytes_freed: AtomicU64,
    pub scan_alloc: AtomicU64,

    pub cycles: AtomicU64,
    pub forced_cycles: AtomicU64,
    pub pause_total_ns: AtomicU64,
    pub last_pause_ns: AtomicU64,
    pub max_pause_ns: AtomicU64,
    /// Nanoseconds since heap creation at the end of the last cycle.
    pub last_gc_ns: AtomicU64,
    pub assist_ns: AtomicU64,
    pub bg_mark_ns: AtomicU64,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStats {
    pub fn new() -> Self {
        Self {
            fold: Lock::new(LockRank::Heap, ()),
            heap_live: AtomicU64::new(0),
            heap_marked: AtomicU64::new(0),
            small_allocs: counters(),
            small_frees: counters(),
            tiny_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            large_frees: AtomicU64::new(0),
            large_bytes_allocated: AtomicU64::new(0),
            large_bytes_freed: AtomicU64::new(0),
            scan_alloc: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            forced_cycles: AtomicU64::new(0),
            pause_total_ns: AtomicU64::new(0),
            last_pause_ns: AtomicU64::new(0),
            max_pause_ns: AtomicU64::new(0),
            last_gc_ns: AtomicU64::new(0),
            assist_ns: AtomicU64::new(0),
            bg_mark_ns: AtomicU64::new(0),
        }
    }

    /// Fold a slot's local counters and reset them.
    pub fn fold(&self, local: &mut LocalStats) {
        if local.is_empty() {
            return;
        }
        let _g = self.fold.lock();
        self.tiny_allocs
            .fetch_add(local.tiny_allocs, Ordering::Relaxed);
        for (global, n) in self.small_allocs.iter().zip(local.small_allocs) {
            if n != 0 {
                global.fetch_add(n, Ordering::Relaxed);
            }
        }
        self.large_allocs
            .fetch_add(local.large_allocs, Ordering::Relaxed);
        self.large_bytes_allocated
            .fetch_add(local.large_bytes, Ordering::Relaxed);
        self.scan_alloc.fetch_add(local.scan_alloc, Ordering::Relaxed);
        *local = LocalStats::default();
    }

    pub(crate) fn count_small_frees(&self, class: u8, n: u64) {
        self.small_frees[class as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_large_free(&self, bytes: u64) {
        self.large_frees.fetch_add(1, Ordering::Relaxed);
        self.large_bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_pause(&self, ns: u64) {
        self.pause_total_ns.fetch_add(ns, Ordering::Relaxed);
        self.last_pause_ns.store(ns, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let _g = self.fold.lock();
        let mut snap = StatsSnapshot::default();
        for class in 1..NUM_SIZE_CLASSES {
            let allocs = self.small_allocs[class].load(Ordering::Relaxed);
            let frees = self.small_frees[class].load(Ordering::Relaxed);
            let live = allocs.saturating_sub(frees);
            snap.objects += live;
            snap.bytes_in_use += live * class_size(class as u8) as u64;
            snap.total_allocs += allocs;
            snap.total_frees += frees;
        }
        let large_live = self
            .large_allocs
            .load(Ordering::Relaxed)
            .saturating_sub(self.large_frees.load(Ordering::Relaxed));
        snap.objects += large_live;
        snap.bytes_in_use += self
            .large_bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.large_bytes_freed.load(Ordering::Relaxed));
        snap.total_allocs += self.large_allocs.load(Ordering::Relaxed)
            + self.tiny_allocs.load(Ordering::Relaxed);
        snap.total_frees += self.large_frees.load(Ordering::Relaxed);
        snap.heap_live = self.heap_live.load(Ordering::Relaxed);
        snap.heap_marked = self.heap_marked.load(Ordering::Relaxed);
        snap.cycles = self.cycles.load(Ordering::Relaxed);
        snap.forced_cycles = self.forced_cycles.load(Ordering::Relaxed);
        snap.pause_total_ns = self.pause_total_ns.load(Ordering::Relaxed);
        snap.last_pause_ns = self.last_pause_ns.load(Ordering::Relaxed);
        snap.max_pause_ns = self.max_pause_ns.load(Ordering::Relaxed);
        snap.assist_ns = self.assist_ns.load(Ordering::Relaxed);
        snap.bg_mark_ns = self.bg_mark_ns.load(Ordering::Relaxed);
        snap
    }
}

/// Point-in-time copy of the counters in a form metrics consumers want.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes in live (allocated, not yet swept free) objects.
    pub bytes_in_use: u64,
    pub objects: u64,
    pub total_allocs: u64,
    pub total_frees: u64,
    pub heap_live: u64,
    pub heap_marked: u64,
    pub cycles: u64,
    pub forced_cycles: u64,
    pub pause_total_ns: u64,
    pub last_pause_ns: u64,
    pub max_pause_ns: u64,
    pub assist_ns: u64,
    pub bg_mark_ns: u64,
}
