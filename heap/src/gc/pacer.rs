//! Heap goal and trigger.
//!
//! After each cycle the next goal is the marked heap grown by `gc_percent`.
//! A cycle starts once the live heap crosses the trigger, placed most of the
//! way between the marked heap and the goal so marking has runway to finish
//! before the goal is reached. During marking the assist ratio converts
//! allocated bytes into scan work owed.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Goal floor at `gc_percent = 100`; scaled linearly for other values.
pub const MIN_HEAP: u64 = 4 << 20;

/// Fraction of the runway between marked heap and goal used before the
/// trigger fires.
const TRIGGER_RUNWAY: f64 = 0.85;

pub struct Pacer {
    gc_percent: AtomicI32,
    goal: AtomicU64,
    trigger: AtomicU64,
    last_marked: AtomicU64,
    /// Scan work done by the last cycle, the estimate for the next one.
    last_scan_work: AtomicU64,
    assist_work_per_byte: AtomicU64,
    assist_bytes_per_work: AtomicU64,
}

fn store_f64(cell: &AtomicU64, v: f64) {
    cell.store(v.to_bits(), Ordering::Relaxed);
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

impl Pacer {
    pub fn new(gc_percent: i32) -> Self {
        let pacer = Self {
            gc_percent: AtomicI32::new(gc_percent),
            goal: AtomicU64::new(0),
            trigger: AtomicU64::new(0),
            last_marked: AtomicU64::new(0),
            last_scan_work: AtomicU64::new(0),
            assist_work_per_byte: AtomicU64::new(0),
            assist_bytes_per_work: AtomicU64::new(0),
        };
        pacer.commit(0);
        pacer
    }

    pub fn gc_percent(&self) -> i32 {
        self.gc_percent.load(Ordering::Relaxed)
    }

    /// Change the growth ratio. Returns the previous value.
    pub fn set_gc_percent(&self, pct: i32) -> i32 {
        let old = self.gc_percent.swap(pct, Ordering::Relaxed);
        self.commit(self.last_marked.load(Ordering::Relaxed));
        old
    }

    pub fn goal(&self) -> u64 {
        self.goal.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Relaxed)
    }

    /// Recompute goal and trigger from the marked heap.
    fn commit(&self, marked: u64) {
        let pct = self.gc_percent();
        if pct < 0 {
            self.goal.store(u64::MAX, Ordering::Relaxed);
            self.trigger.store(u64::MAX, Ordering::Relaxed);
            return;
        }
        let pct = pct as u64;
        let goal = (marked + marked * pct / 100).max(MIN_HEAP * pct / 100);
        let runway = goal.saturating_sub(marked) as f64;
        let trigger = marked + (runway * TRIGGER_RUNWAY) as u64;
        self.goal.store(goal, Ordering::Relaxed);
        self.trigger.store(trigger, Ordering::Relaxed);
    }

    /// The live heap reached the point where a cycle should start.
    pub fn should_trigger(&self, heap_live: u64) -> bool {
        self.gc_percent() >= 0 && heap_live >= self.trigger()
    }

    /// A cycle is starting with `heap_live` bytes live.
    pub fn start_cycle(&self, heap_live: u64) {
        self.revise(heap_live, 0);
    }

    /// Refresh the assist ratio from progress so far.
    pub fn revise(&self, heap_live: u64, scan_done: u64) {
        let expected = self
            .last_scan_work
            .load(Ordering::Relaxed)
            .max(self.last_marked.load(Ordering::Relaxed))
            .max(MIN_HEAP / 4);
        let remaining_work = expected.saturating_sub(scan_done).max(1000) as f64;
        let goal = self.goal();
        // Past the goal the runway is nearly gone; assists work hardest.
        let runway = if goal > heap_live {
            (goal - heap_live) as f64
        } else {
            (expected as f64 * 0.05).max(1.0)
        };
        let work_per_byte = remaining_work / runway;
        store_f64(&self.assist_work_per_byte, work_per_byte);
        store_f64(&self.assist_bytes_per_work, 1.0 / work_per_byte);
    }

    pub fn assist_work_per_byte(&self) -> f64 {
        load_f64(&self.assist_work_per_byte)
    }

    pub fn assist_bytes_per_work(&self) -> f64 {
        load_f64(&self.assist_bytes_per_work)
    }

    /// A cycle finished having marked `marked` bytes with `scan_work` bytes
    /// of scanning.
    pub fn end_cycle(&self, marked: u64, scan_work: u64) {
        self.last_marked.store(marked, Ordering::Relaxed);
        self.last_scan_work.store(scan_work, Ordering::Relaxed);
        self.commit(marked);
    }
}
