//! GC CPU limiter.
//!
//! A leaky bucket of CPU time. GC time (assists, the dedicated background
//! share while a cycle runs, whole stop-the-world windows) fills it; mutator
//! time drains it. The capacity is one second per slot. While the bucket is
//! full the limiter reports `limiting` and assists stand down; the excess GC
//! time that could not fit is kept as `overflow`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::{
    fatal::throw,
    lock::{Lock, LockRank},
};

pub const CAPACITY_PER_PROC: u64 = 1_000_000_000;

/// Share of the total CPU the background mark workers aim for.
pub const BACKGROUND_UTILIZATION: f64 = 0.25;

const UPDATE_PERIOD_NS: i64 = 10_000_000;

#[derive(Debug)]
struct Bucket {
    fill: u64,
    capacity: u64,
    overflow: u64,
    nprocs: i64,
    gc_enabled: bool,
    transitioning: bool,
}

pub struct CpuLimiter {
    bucket: Lock<Bucket>,
    enabled: AtomicBool,
    assist_pool: AtomicI64,
    idle_pool: AtomicI64,
    last_update: AtomicI64,
    /// Cycle during which limiting last switched on.
    last_enabled_cycle: AtomicU64,
    cycle: AtomicU64,
}

impl CpuLimiter {
    pub fn new(now: i64, nprocs: usize) -> Self {
        let nprocs = nprocs.max(1) as i64;
        Self {
            bucket: Lock::new(
                LockRank::Leaf,
                Bucket {
                    fill: 0,
                    capacity: nprocs as u64 * CAPACITY_PER_PROC,
                    overflow: 0,
                    nprocs,
                    gc_enabled: false,
                    transitioning: false,
                },
            ),
            enabled: AtomicBool::new(false),
            assist_pool: AtomicI64::new(0),
            idle_pool: AtomicI64::new(0),
            last_update: AtomicI64::new(now),
            last_enabled_cycle: AtomicU64::new(0),
            cycle: AtomicU64::new(0),
        }
    }

    /// GC work is over its budget. Assists should not run.
    #[inline]
    pub fn limiting(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn add_assist_time(&self, ns: i64) {
        self.assist_pool.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn add_idle_time(&self, ns: i64) {
        self.idle_pool.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn need_update(&self, now: i64) -> bool {
        now - self.last_update.load(Ordering::Relaxed) > UPDATE_PERIOD_NS
    }

    pub fn set_cycle(&self, cycle: u64) {
        self.cycle.store(cycle, Ordering::Relaxed);
    }

    pub fn last_enabled_cycle(&self) -> u64 {
        self.last_enabled_cycle.load(Ordering::Relaxed)
    }

    /// Account for time since the last update. Skipped if another thread is
    /// updating or a stop-the-world transition is in progress.
    pub fn update(&self, now: i64) {
        let Some(mut bucket) = self.bucket.try_lock() else {
            return;
        };
        if bucket.transitioning {
            return;
        }
        self.update_locked(&mut bucket, now);
    }

    /// The world is about to stop to turn the collector on or off.
    pub fn start_transition(&self, enable_gc: bool, now: i64) {
        let mut bucket = self.bucket.lock();
        if bucket.gc_enabled == enable_gc {
            throw("gc cpu limiter transitioning to its current state");
        }
        self.update_locked(&mut bucket, now);
        bucket.gc_enabled = enable_gc;
        bucket.transitioning = true;
    }

    /// The world restarts. The whole window counts as GC time on every slot.
    pub fn finish_transition(&self, now: i64) {
        let mut bucket = self.bucket.lock();
        if !bucket.transitioning {
            throw("finish of gc cpu limiter transition that never started");
        }
        let last = self.last_update.load(Ordering::Relaxed);
        if now >= last {
            let nprocs = bucket.nprocs;
            self.accumulate(&mut bucket, 0, (now - last) * nprocs);
        }
        self.last_update.store(now, Ordering::Relaxed);
        bucket.transitioning = false;
    }

    /// The number of slots changed.
    pub fn reset_capacity(&self, now: i64, nprocs: usize) {
        let mut bucket = self.bucket.lock();
        self.update_locked(&mut bucket, now);
        bucket.nprocs = nprocs.max(1) as i64;
        bucket.capacity = bucket.nprocs as u64 * CAPACITY_PER_PROC;
        if bucket.fill > bucket.capacity {
            bucket.fill = bucket.capacity;
            self.enable();
        } else if bucket.fill < bucket.capacity {
            self.enabled.store(false, Ordering::Relaxed);
        }
    }

    fn update_locked(&self, bucket: &mut Bucket, now: i64) {
        let last = self.last_update.load(Ordering::Relaxed);
        if now < last {
            return;
        }
        let mut window_total = (now - last) * bucket.nprocs;
        self.last_update.store(now, Ordering::Relaxed);

        let assist = self.assist_pool.swap(0, Ordering::Relaxed);
        let idle = self.idle_pool.swap(0, Ordering::Relaxed);

        let mut window_gc = assist;
        if bucket.gc_enabled {
            window_gc += (window_total as f64 * BACKGROUND_UTILIZATION) as i64;
        }
        // Background share is relative to real time, so idle time comes off
        // the total only afterwards.
        window_total -= idle;
        self.accumulate(bucket, window_total - window_gc, window_gc);
    }

    fn accumulate(&self, bucket: &mut Bucket, mutator: i64, gc: i64) {
        let headroom = bucket.capacity - bucket.fill;
        let was_enabled = headroom == 0;
        let change = gc - mutator;

        if change > 0 && headroom <= change as u64 {
            bucket.overflow += change as u64 - headroom;
            bucket.fill = bucket.capacity;
            if !was_enabled {
                self.enable();
            }
            return;
        }
        if change < 0 && bucket.fill <= change.unsigned_abs() {
            bucket.fill = 0;
        } else {
            bucket.fill = bucket.fill.wrapping_add_signed(change);
        }
        if change != 0 && was_enabled {
            self.enabled.store(false, Ordering::Relaxed);
        }
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
        self.last_enabled_cycle
            .store(self.cycle.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }

    pub fn fill(&self) -> u64 {
        self.bucket.lock().fill
    }

    pub fn capacity(&self) -> u64 {
        self.bucket.lock().capacity
    }

    /// GC CPU time in excess of the limit, in CPU-nanoseconds.
    pub fn overflow(&self) -> u64 {
        self.bucket.lock().overflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;
    const PROCS: i64 = 14;

    struct Clock(i64);

    impl Clock {
        fn advance(&mut self, ns: i64) -> i64 {
            self.0 += ns;
            self.0
        }
    }

    fn assist(l: &CpuLimiter, window: i64, frac: f64) {
        l.add_assist_time((frac * window as f64 * PROCS as f64) as i64);
    }

    #[test]
    fn bucket_fills_drains_and_overflows() {
        let mut clock = Clock(0);
        let l = CpuLimiter::new(0, PROCS as usize);
        assert_eq!(l.capacity(), PROCS as u64 * CAPACITY_PER_PROC);
        assert_eq!(l.fill(), 0);

        // Mutator time alone never fills it.
        l.update(clock.advance(10 * MS));
        l.update(clock.advance(1000 * MS));
        l.update(clock.advance(3_600_000 * MS));
        assert_eq!(l.fill(), 0);

        // A stop-the-world window counts fully.
        l.start_transition(true, clock.advance(109 * MS));
        l.finish_transition(clock.advance(2 * MS + 1000));
        let fill = (2 * MS + 1000) * PROCS;
        assert_eq!(l.fill(), fill as u64);

        // With only the background share running, drain to exactly PROCS.
        let factor = 1.0 / (1.0 - 2.0 * BACKGROUND_UTILIZATION);
        l.update(clock.advance((factor * (fill - PROCS) as f64 / PROCS as f64) as i64));
        assert_eq!(l.fill(), PROCS as u64);

        l.update(clock.advance(2 * CAPACITY_PER_PROC as i64));
        assert_eq!(l.fill(), 0);

        // 50% GC leaves the bucket alone.
        assist(&l, 10 * MS, 0.5 - BACKGROUND_UTILIZATION);
        l.update(clock.advance(10 * MS));
        assert_eq!(l.fill(), 0);

        // 100% GC adds everything.
        assist(&l, MS, 1.0 - BACKGROUND_UTILIZATION);
        l.update(clock.advance(MS));
        assert_eq!(l.fill(), (PROCS * MS) as u64);
        assert!(!l.limiting());

        // Fill exactly to capacity.
        let rest = CAPACITY_PER_PROC as i64 - MS;
        assist(&l, rest, 1.0 - BACKGROUND_UTILIZATION);
        l.update(clock.advance(rest));
        assert_eq!(l.fill(), l.capacity());
        assert!(l.limiting());
        assert_eq!(l.overflow(), 0);

        // Balanced work keeps it full without overflow.
        assist(&l, 1000 * MS, 0.5 - BACKGROUND_UTILIZATION);
        l.update(clock.advance(1000 * MS));
        assert_eq!(l.fill(), l.capacity());
        assert!(l.limiting());
        assert_eq!(l.overflow(), 0);

        // Drain by half.
        l.update(clock.advance(CAPACITY_PER_PROC as i64));
        assert_eq!(l.fill(), l.capacity() / 2);
        assert!(!l.limiting());

        // Overfill.
        assist(&l, CAPACITY_PER_PROC as i64, 1.0 - BACKGROUND_UTILIZATION);
        l.update(clock.advance(CAPACITY_PER_PROC as i64));
        assert_eq!(l.fill(), l.capacity());
        assert!(l.limiting());
        let half = CAPACITY_PER_PROC as i64 / 2;
        assert_eq!(l.overflow(), (half * PROCS) as u64);

        // End the cycle with assists left over.
        assist(&l, MS, 1.0 - BACKGROUND_UTILIZATION);
        l.start_transition(false, clock.advance(MS));
        assert!(l.limiting());
        assert_eq!(l.overflow(), ((half + MS) * PROCS) as u64);

        // Updates are skipped mid-transition.
        l.update(clock.advance(2 * MS));
        assert_eq!(l.overflow(), ((half + MS) * PROCS) as u64);

        // The stopped window lands in the bucket.
        l.finish_transition(clock.advance(3 * MS));
        assert_eq!(l.fill(), l.capacity());
        assert!(l.limiting());
        let overflow = ((half + 6 * MS) * PROCS) as u64;
        assert_eq!(l.overflow(), overflow);

        // More slots: capacity grows, limiting stops.
        let old_capacity = l.capacity();
        l.reset_capacity(clock.advance(0), (PROCS + 10) as usize);
        assert_eq!(l.fill(), old_capacity);
        assert!(!l.limiting());
        assert_eq!(l.overflow(), overflow);

        // Fewer slots: the bucket is clamped and limiting resumes.
        l.reset_capacity(clock.advance(0), (PROCS - 10) as usize);
        assert_eq!(l.fill(), l.capacity());
        assert!(l.limiting());
        assert_eq!(l.overflow(), overflow);
    }

    #[test]
    #[should_panic(expected = "transitioning to its current state")]
    fn double_enable_is_fatal() {
        let l = CpuLimiter::new(0, 1);
        l.start_transition(true, 1);
        l.finish_transition(2);
        l.start_transition(true, 3);
    }
}
