//! Concurrent tri-color mark-sweep collector.
//!
//! ```text
//!        start_cycle (STW)          mark_done          (STW)
//!  Off ───────────────────▶ Mark ─────────────▶ MarkTermination
//!   ▲                                                  │
//!   └──────────── last span swept ◀──── Sweep ◀────────┘
//! ```
//!
//! The heap crate owns the mechanisms; the embedder supplies a [`World`]
//! that can stop its mutators, run closures on every slot cache and scan
//! its roots.

pub mod barrier;
pub mod cycle;
pub mod finalizer;
pub mod limiter;
pub mod mark;
pub mod pacer;
pub mod sweep;
pub mod work;
pub mod world;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::{
    gc::{limiter::CpuLimiter, pacer::Pacer, sweep::SweepState, work::WorkBufs},
    lock::{Lock, LockRank},
};

pub use cycle::{MarkDone, Trigger};
pub use world::{LocalWorld, RootKind, World};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Off = 0,
    Mark = 1,
    MarkTermination = 2,
    Sweep = 3,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            1 => Phase::Mark,
            2 => Phase::MarkTermination,
            3 => Phase::Sweep,
            _ => Phase::Off,
        }
    }
}

impl Phase {
    /// Pointer stores must shade.
    #[inline]
    pub fn barrier_enabled(self) -> bool {
        matches!(self, Phase::Mark | Phase::MarkTermination)
    }

    /// New objects start out marked.
    #[inline]
    pub fn allocate_black(self) -> bool {
        self.barrier_enabled()
    }
}

/// Phase and cycle number in one word.
#[derive(Debug)]
pub struct PhaseWord(AtomicU64);

impl PhaseWord {
    const PHASE_MASK: u64 = 0xff;
    const CYCLE_SHIFT: u32 = 8;

    #[inline(always)]
    fn pack(phase: Phase, cycle: u64) -> u64 {
        (phase as u64) | (cycle << Self::CYCLE_SHIFT)
    }

    #[inline(always)]
    fn unpack(word: u64) -> (Phase, u64) {
        (
            Phase::from((word & Self::PHASE_MASK) as u8),
            word >> Self::CYCLE_SHIFT,
        )
    }

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::pack(Phase::Off, 0)))
    }

    #[inline]
    pub fn load(&self) -> (Phase, u64) {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    fn store(&self, phase: Phase, cycle: u64) {
        self.0.store(Self::pack(phase, cycle), Ordering::Release);
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        let (phase, cycle) = self.load();
        phase == from
            && self
                .0
                .compare_exchange(
                    Self::pack(from, cycle),
                    Self::pack(to, cycle),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }
}

impl Default for PhaseWord {
    fn default() -> Self {
        Self::new()
    }
}

/// Root jobs handed out to markers. Jobs below [`HEAP_ROOT_JOBS`] are the
/// heap's own; the rest belong to the [`World`].
#[derive(Debug, Default)]
pub struct RootJobs {
    next: AtomicUsize,
    total: AtomicUsize,
    done: AtomicUsize,
}

/// Finalizer queue and specials.
pub const HEAP_ROOT_JOBS: usize = 2;

impl RootJobs {
    fn reset(&self, total: usize) {
        self.next.store(0, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Release);
    }

    pub(crate) fn claim(&self) -> Option<usize> {
        let total = self.total.load(Ordering::Acquire);
        if self.next.load(Ordering::Relaxed) >= total {
            return None;
        }
        let job = self.next.fetch_add(1, Ordering::AcqRel);
        (job < total).then_some(job)
    }

    pub(crate) fn finish(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
    }

    pub fn all_done(&self) -> bool {
        self.done.load(Ordering::Acquire) >= self.total.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

/// Collector state shared by every slot.
pub struct Collector {
    state: PhaseWord,
    pub sweep: SweepState,
    pub work: WorkBufs,
    pub roots: RootJobs,
    pub pacer: Pacer,
    pub limiter: CpuLimiter,
    /// Markers currently draining.
    active_markers: AtomicUsize,
    bytes_marked: AtomicU64,
    scan_work: AtomicU64,
    /// Scan work done by background workers that assists may claim.
    bg_credit: AtomicI64,
    forced: AtomicBool,
    start_lock: Lock<()>,
    mark_done_lock: Lock<()>,
    /// Completed cycles, for threads that block on a collection.
    completed: Mutex<u64>,
    completed_cv: Condvar,
}

impl Collector {
    pub(crate) fn new(gc_percent: i32, nprocs: usize, now: i64) -> Self {
        Self {
            state: PhaseWord::new(),
            sweep: SweepState::new(),
            work: WorkBufs::new(),
            roots: RootJobs::default(),
            pacer: Pacer::new(gc_percent),
            limiter: CpuLimiter::new(now, nprocs),
            active_markers: AtomicUsize::new(0),
            bytes_marked: AtomicU64::new(0),
            scan_work: AtomicU64::new(0),
            bg_credit: AtomicI64::new(0),
            forced: AtomicBool::new(false),
            start_lock: Lock::new(LockRank::GcStart, ()),
            mark_done_lock: Lock::new(LockRank::MarkDone, ()),
            completed: Mutex::new(0),
            completed_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.state.load().0
    }

    /// Cycles started so far. The running cycle, if any, is this number.
    #[inline]
    pub fn cycle(&self) -> u64 {
        self.state.load().1
    }

    pub fn completed_cycles(&self) -> u64 {
        *self.completed.lock()
    }

    /// Block the calling thread until `n` cycles have completed. Not for
    /// threads that hold a slot.
    pub fn wait_completed(&self, n: u64) {
        let mut done = self.completed.lock();
        while *done < n {
            self.completed_cv.wait(&mut done);
        }
    }

    fn publish_completed(&self, cycle: u64) {
        let mut done = self.completed.lock();
        *done = cycle;
        self.completed_cv.notify_all();
    }

    pub(crate) fn try_end_sweep(&self) {
        if self.sweep.remaining() == 0 && self.state.transition(Phase::Sweep, Phase::Off) {
            log::debug!("gc {}: sweep done", self.cycle());
        }
    }

    /// No root jobs, published work or active markers are left.
    pub fn mark_work_exhausted(&self) -> bool {
        self.roots.all_done()
            && self.work.is_empty()
            && self.active_markers.load(Ordering::Acquire) == 0
    }

    /// Wait until no marker is draining. Markers that start from here on
    /// see the phase has moved on and leave at once.
    pub(crate) fn wait_for_markers(&self) {
        while self.active_markers.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
    }

    fn reset_counters(&self) {
        self.bytes_marked.store(0, Ordering::Relaxed);
        self.scan_work.store(0, Ordering::Relaxed);
        self.bg_credit.store(0, Ordering::Relaxed);
    }

    pub fn bytes_marked(&self) -> u64 {
        self.bytes_marked.load(Ordering::Relaxed)
    }

    pub fn scan_work(&self) -> u64 {
        self.scan_work.load(Ordering::Relaxed)
    }

    pub(crate) fn add_counters(&self, bytes_marked: u64, scan_work: u64) {
        if bytes_marked != 0 {
            self.bytes_marked.fetch_add(bytes_marked, Ordering::Relaxed);
        }
        if scan_work != 0 {
            self.scan_work.fetch_add(scan_work, Ordering::Relaxed);
        }
    }

    /// Background workers bank their scan work for assists to claim.
    pub fn add_background_credit(&self, work: u64) {
        self.bg_credit.fetch_add(work as i64, Ordering::Relaxed);
    }

    /// Take up to `want` units of background credit.
    pub(crate) fn steal_background_credit(&self, want: i64) -> i64 {
        let mut cur = self.bg_credit.load(Ordering::Relaxed);
        loop {
            if cur <= 0 {
                return 0;
            }
            let take = cur.min(want);
            match self.bg_credit.compare_exchange_weak(
                cur,
                cur - take,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return take,
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_word_packs_cycle() {
        let w = PhaseWord::new();
        assert_eq!(w.load(), (Phase::Off, 0));
        w.store(Phase::Mark, 7);
        assert_eq!(w.load(), (Phase::Mark, 7));
        assert!(!w.transition(Phase::Sweep, Phase::Off));
        assert!(w.transition(Phase::Mark, Phase::MarkTermination));
        assert_eq!(w.load(), (Phase::MarkTermination, 7));
    }

    #[test]
    fn root_jobs_are_claimed_once() {
        let r = RootJobs::default();
        r.reset(3);
        let mut got = Vec::new();
        while let Some(j) = r.claim() {
            got.push(j);
            r.finish();
        }
        assert_eq!(got, vec![0, 1, 2]);
        assert!(r.all_done());
    }

    #[test]
    fn background_credit_is_shared_out() {
        let c = Collector::new(100, 1, 0);
        c.add_background_credit(100);
        assert_eq!(c.steal_background_credit(60), 60);
        assert_eq!(c.steal_background_credit(60), 40);
        assert_eq!(c.steal_background_credit(60), 0);
    }
}
