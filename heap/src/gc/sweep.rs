//! Sweeping.
//!
//! Each span carries the sweep generation it was last swept in. Relative to
//! the heap's generation `h`, which advances by two at every mark
//! termination:
//!
//! * `h - 2`: needs sweeping
//! * `h - 1`: being swept right now
//! * `h`:     swept, ready to use
//!
//! Claiming a span for sweeping is a CAS from `h - 2` to `h - 1`, so every
//! span is swept exactly once per cycle no matter who gets to it first: the
//! background sweeper, an allocating slot refilling its cache, or
//! [`ensure_swept`](HeapInner::ensure_swept).

use std::{
    io::Write,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
    thread,
};

use crate::{
    fatal::throw_with,
    gc::{Phase, finalizer::PendingCleanup},
    heap::HeapInner,
    sizeclass::NUM_SPAN_CLASSES,
    span::{SpanPtr, SpanState},
};

pub struct SweepState {
    sweepgen: AtomicU32,
    /// Spans not yet swept this cycle.
    remaining: AtomicUsize,
    /// Sweeps in progress.
    active: AtomicUsize,
    /// Span class the background sweeper looks at next.
    cursor: AtomicUsize,
    pub(crate) pages_swept: AtomicUsize,
}

impl Default for SweepState {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepState {
    pub fn new() -> Self {
        Self {
            sweepgen: AtomicU32::new(0),
            remaining: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            pages_swept: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// What happened to a swept span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepResult {
    /// Still holds live objects (or was preserved for the caller).
    Kept { live: usize },
    /// Returned to the page heap.
    Freed,
}

impl HeapInner {
    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.gc.sweep.sweepgen()
    }

    /// Claim `span` for sweeping. False if it is already swept or being
    /// swept.
    pub(crate) fn try_claim(&self, span: SpanPtr) -> bool {
        let sg = self.sweepgen();
        if span.sweepgen.load(Ordering::Acquire) != sg.wrapping_sub(2) {
            return false;
        }
        if span
            .sweepgen
            .compare_exchange(
                sg.wrapping_sub(2),
                sg.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.gc.sweep.active.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Sweep a claimed span: free unmarked objects, queue cleanups of dead
    /// objects that have them, and clear the mark bits for the next cycle.
    /// With `preserve` an empty span is kept for the caller instead of being
    /// returned to the page heap.
    pub(crate) fn sweep_span(&self, span: SpanPtr, preserve: bool) -> SweepResult {
        let sg = self.sweepgen();
        let state = span.sweepgen.load(Ordering::Acquire);
        if state != sg.wrapping_sub(1) || span.state() != SpanState::InUse {
            throw_with("sweep of a span that was not claimed", |out| {
                let _ = writeln!(out, "{span:?} heap sweepgen {sg}");
            });
        }

        let (base, limit) = (span.base(), span.limit());
        let is_marked = |obj: usize| {
            self.pages
                .arena_of(obj)
                .is_some_and(|arena| arena.is_marked(obj))
        };
        // Specials on tiny objects sit inside their block.
        let block_of = |obj: usize| span.object_addr(span.object_index(obj));

        // Dead objects with cleanups survive this cycle; their cleanup runs
        // first and the next cycle frees them.
        let dead = self
            .specials
            .take_dead(base, limit, |obj| !is_marked(block_of(obj)));
        let mut resurrected = Vec::with_capacity(dead.len());
        let mut pending = Vec::new();
        for (obj, cleanups) in dead {
            resurrected.push(block_of(obj));
            pending.extend(cleanups.into_iter().map(|c| PendingCleanup {
                obj,
                func: c.func,
                arg: c.arg,
            }));
        }

        let mut live = 0;
        let mut freed = 0;
        for i in 0..span.nelems() {
            let obj = span.object_addr(i);
            let Some(arena) = self.pages.arena_of(obj) else {
                continue;
            };
            if !arena.is_allocated(obj) {
                continue;
            }
            if arena.is_marked(obj) || resurrected.contains(&obj) {
                live += 1;
                arena.clear_mark(obj);
            } else {
                arena.set_allocated(obj, false);
                freed += 1;
            }
        }

        span.set_alloc_count(live);
        span.set_free_index(0);
        if freed > 0 {
            span.set_needzero(true);
        }
        span.sweepgen.store(sg, Ordering::Release);

        let class = span.spanclass().sizeclass();
        if class == 0 {
            if freed > 0 {
                self.stats.count_large_free(span.bytes() as u64);
            }
        } else if freed > 0 {
            self.stats.count_small_frees(class, freed as u64);
        }
        if !pending.is_empty() {
            self.finq.push(pending);
        }

        self.gc
            .sweep
            .pages_swept
            .fetch_add(span.npages(), Ordering::Relaxed);
        let result = if live == 0 && !preserve {
            self.pages.free_span(span);
            SweepResult::Freed
        } else {
            SweepResult::Kept { live }
        };
        self.finish_one_sweep();
        result
    }

    fn finish_one_sweep(&self) {
        self.gc.sweep.active.fetch_sub(1, Ordering::AcqRel);
        if self.gc.sweep.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gc.try_end_sweep();
        }
    }

    /// Sweep `span` in place if it still needs it. The span stays on
    /// whatever list it is on.
    pub fn ensure_swept(&self, span: SpanPtr) {
        if span.state() != SpanState::InUse {
            return;
        }
        if self.try_claim(span) {
            self.sweep_span(span, true);
            return;
        }
        self.wait_swept(span);
    }

    /// Wait out a sweep of `span` running on another thread. A span popped
    /// off a list may still be swept in place by `ensure_swept`; it must
    /// not be used or filed before that sweep is done.
    pub(crate) fn wait_swept(&self, span: SpanPtr) {
        let sg = self.sweepgen();
        while span.sweepgen.load(Ordering::Acquire) == sg.wrapping_sub(1) {
            thread::yield_now();
        }
    }

    /// Sweep one span off the unswept lists. Returns the number of pages
    /// swept, or `None` if nothing is left.
    pub fn sweep_one(&self) -> Option<usize> {
        if self.gc.sweep.remaining() == 0 {
            return None;
        }
        let sg = self.sweepgen();
        let start = self.gc.sweep.cursor.load(Ordering::Relaxed);
        for k in 0..NUM_SPAN_CLASSES {
            let idx = (start + k) % NUM_SPAN_CLASSES;
            let central = &self.central[idx];
            while let Some(span) = central.pop_unswept(sg) {
                let npages = span.npages();
                if self.try_claim(span) {
                    if let SweepResult::Kept { .. } = self.sweep_span(span, false) {
                        central.push_swept(span, sg);
                    }
                    self.gc.sweep.cursor.store(idx, Ordering::Relaxed);
                    return Some(npages);
                }
                // Swept in place by `ensure_swept`, maybe still running.
                self.wait_swept(span);
                central.push_swept(span, sg);
            }
        }
        while let Some(span) = self.large.pop_unswept(sg) {
            let npages = span.npages();
            if self.try_claim(span) {
                if let SweepResult::Kept { .. } = self.sweep_span(span, false) {
                    self.large.push_swept(span, sg);
                }
                return Some(npages);
            }
            self.wait_swept(span);
            self.large.push_swept(span, sg);
        }
        None
    }

    /// Sweep before allocating `npages` so the heap does not grow ahead of
    /// what the last cycle freed.
    pub(crate) fn deduct_sweep_credit(&self, npages: usize) {
        if self.gc.phase() != Phase::Sweep {
            return;
        }
        let mut swept = 0;
        while swept < npages {
            match self.sweep_one() {
                Some(n) => swept += n,
                None => break,
            }
        }
    }

    /// Sweep everything left and wait for concurrent sweeps to finish.
    pub fn finish_sweep(&self) {
        while self.sweep_one().is_some() {}
        while self.gc.sweep.active.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
        if self.gc.phase() == Phase::Sweep {
            self.gc.try_end_sweep();
        }
    }

    /// Advance the sweep generation. World stopped, every cache released.
    pub(crate) fn start_sweep(&self) {
        let sweep = &self.gc.sweep;
        let sg = sweep.sweepgen.load(Ordering::Relaxed).wrapping_add(2);
        let total =
            self.central.iter().map(|c| c.len()).sum::<usize>() + self.large.len();
        sweep.remaining.store(total, Ordering::Release);
        sweep.pages_swept.store(0, Ordering::Relaxed);
        sweep.sweepgen.store(sg, Ordering::Release);
        log::debug!("sweep generation {sg}: {total} spans to sweep");
    }
}
