//! Marking.
//!
//! White objects have no mark bit. Grey objects have the bit and sit in some
//! work buffer. Black objects have the bit and were scanned (or hold no
//! pointers). Markers pull grey objects, shade everything their pointer
//! words refer to and move on.

use std::{
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use crate::{
    fatal::throw_with,
    gc::{HEAP_ROOT_JOBS, Phase, World, work::GcWork},
    heap::HeapInner,
    pageheap::{ARENA_SIZE, Arena},
    sizeclass::WORD,
    span::{SpanPtr, SpanState},
};

/// Minimum scan work an assist does once it runs, so assists do not
/// trickle in tiny slices.
const ASSIST_MIN_WORK: u64 = 64 << 10;

impl HeapInner {
    /// Grey the object `ptr` points into if it is white. Pointers outside
    /// the heap, into stacks, and null are ignored.
    pub fn shade(&self, ptr: usize, gcw: &mut GcWork) {
        if ptr < self.pages.start() || ptr >= self.pages.committed_end() {
            return;
        }
        let Some(span) = self.pages.span_of(ptr) else {
            self.bad_pointer(ptr, None, "pointer to a free heap page");
            return;
        };
        if span.state() != SpanState::InUse {
            return;
        }
        let obj = span.object_addr(span.object_index(ptr));
        let Some(arena) = self.pages.arena_of(obj) else {
            return;
        };
        if !arena.is_allocated(obj) {
            self.bad_pointer(ptr, Some(span), "pointer to an unallocated object");
            return;
        }
        self.grey_object(obj, span, arena, gcw);
    }

    #[inline]
    fn grey_object(&self, obj: usize, span: SpanPtr, arena: &Arena, gcw: &mut GcWork) {
        if !arena.try_mark(obj) {
            return;
        }
        gcw.bytes_marked += span.elemsize() as u64;
        if !span.spanclass().noscan() {
            gcw.put(&self.gc.work, obj);
        }
    }

    #[cold]
    fn bad_pointer(&self, ptr: usize, span: Option<SpanPtr>, what: &str) {
        if !self.config.invalid_ptr_check {
            return;
        }
        throw_with("found bad pointer in heap", |out| {
            let _ = writeln!(out, "{what}: {ptr:#x}");
            if let Some(span) = span {
                let _ = writeln!(out, "{span:?}");
            }
        });
    }

    /// Shade every pointer word of `obj`, turning it black.
    pub fn scan_object(&self, obj: usize, gcw: &mut GcWork) {
        let Some(span) = self.pages.span_of(obj) else {
            return;
        };
        let size = span.elemsize();
        let end = obj + size;
        let mut addr = obj;
        while addr < end {
            let Some(arena) = self.pages.arena_of(addr) else {
                break;
            };
            let arena_end = (arena.base() + ARENA_SIZE).min(end);
            while addr < arena_end {
                if arena.is_pointer(addr) {
                    // SAFETY: `addr` is a word inside a live heap object
                    let value = unsafe { AtomicUsize::from_ptr(addr as *mut usize) }
                        .load(Ordering::Acquire);
                    if value != 0 {
                        self.shade(value, gcw);
                    }
                }
                addr += WORD;
            }
        }
        gcw.scan_work += size as u64;
    }

    /// Shade the words of `[base, base + nwords * WORD)` selected by `bits`.
    ///
    /// # Safety
    /// The range must be readable and stay unchanged while this runs.
    pub unsafe fn scan_block(&self, base: usize, nwords: usize, bits: &[u64], gcw: &mut GcWork) {
        for i in 0..nwords {
            let set = bits.get(i / 64).is_some_and(|w| w & (1 << (i % 64)) != 0);
            if !set {
                continue;
            }
            // SAFETY: caller guarantees the range
            let value = unsafe { *((base + i * WORD) as *const usize) };
            if value != 0 {
                self.shade(value, gcw);
            }
        }
        gcw.scan_work += (nwords * WORD) as u64;
    }

    /// Shade a root value held outside the heap.
    #[inline]
    pub fn shade_root(&self, value: usize, gcw: &mut GcWork) {
        if value != 0 {
            self.shade(value, gcw);
        }
    }

    /// Mark an object allocated while marking is in progress.
    #[inline]
    pub(crate) fn mark_new_object(&self, obj: usize, size: usize, gcw: &mut GcWork) {
        if !self.gc.phase().allocate_black() {
            return;
        }
        let Some(arena) = self.pages.arena_of(obj) else {
            return;
        };
        if arena.try_mark(obj) {
            gcw.bytes_marked += size as u64;
        }
    }

    fn mark_heap_root(&self, job: usize, gcw: &mut GcWork) {
        match job {
            0 => self.finq.for_each_root(|p| self.shade_root(p, gcw)),
            1 => {
                // Objects with cleanups keep what they reference alive but
                // not themselves.
                let mut objs = Vec::with_capacity(self.specials.len());
                self.specials.for_each(|obj, c| objs.push((obj, c.arg)));
                for (obj, arg) in objs {
                    if let Some(info) = self.find_object(obj) {
                        self.scan_object(info.base, gcw);
                    }
                    self.shade_root(arg, gcw);
                }
            }
            _ => unreachable!("heap root job {job}"),
        }
    }

    /// Drain root jobs and grey objects until there is nothing left or
    /// `stop` says so. `stop` sees the scan work done so far. Returns the
    /// scan work done. Does nothing once mark termination has begun.
    pub fn drain(
        &self,
        world: &dyn World,
        gcw: &mut GcWork,
        mut stop: impl FnMut(u64) -> bool,
    ) -> u64 {
        self.drain_phase(world, gcw, Phase::Mark, |work| {
            self.gc.phase() != Phase::Mark || stop(work)
        })
    }

    /// Drain on behalf of the phase `phase`. Markers entering after the
    /// phase moved on leave without touching any work.
    pub(crate) fn drain_phase(
        &self,
        world: &dyn World,
        gcw: &mut GcWork,
        phase: Phase,
        mut stop: impl FnMut(u64) -> bool,
    ) -> u64 {
        self.gc.active_markers.fetch_add(1, Ordering::AcqRel);
        if self.gc.phase() != phase {
            self.gc.active_markers.fetch_sub(1, Ordering::AcqRel);
            return 0;
        }
        let start_work = gcw.scan_work;
        loop {
            let done = gcw.scan_work - start_work;
            if stop(done) {
                break;
            }
            if let Some(job) = self.gc.roots.claim() {
                if job < HEAP_ROOT_JOBS {
                    self.mark_heap_root(job, gcw);
                } else {
                    world.mark_root(job - HEAP_ROOT_JOBS, self, gcw);
                }
                self.gc.roots.finish();
                continue;
            }
            if self.gc.work.is_empty() {
                gcw.balance(&self.gc.work);
            }
            match gcw.try_get(&self.gc.work) {
                Some(obj) => self.scan_object(obj, gcw),
                None => break,
            }
        }
        let work = gcw.scan_work - start_work;
        // Leftover local work is published before this marker counts as idle.
        self.publish_work(gcw);
        self.gc.active_markers.fetch_sub(1, Ordering::AcqRel);
        work
    }

    /// Hand `gcw`'s grey objects and counters to the collector. True if any
    /// object was published.
    pub fn publish_work(&self, gcw: &mut GcWork) -> bool {
        let (marked, scanned) = gcw.take_counters();
        self.gc.add_counters(marked, scanned);
        gcw.flush(&self.gc.work)
    }

    /// Pay for allocating `bytes` with mark work. `credit` is the caller's
    /// running balance in bytes: positive credit is spent first, debt is paid
    /// off with background credit, then by marking. Does nothing while the
    /// CPU limiter is limiting.
    pub fn assist_alloc(&self, world: &dyn World, credit: &mut i64, bytes: usize) {
        if self.gc.phase() != Phase::Mark {
            return;
        }
        *credit -= bytes as i64;
        if *credit >= 0 || self.gc.limiter.limiting() {
            return;
        }
        let pacer = &self.gc.pacer;
        let debt_work = ((-*credit) as f64 * pacer.assist_work_per_byte()) as i64;
        let stolen = self.gc.steal_background_credit(debt_work);
        *credit += (stolen as f64 * pacer.assist_bytes_per_work()) as i64;
        if *credit >= 0 {
            return;
        }

        let want = ((-*credit) as f64 * pacer.assist_work_per_byte()) as u64 + ASSIST_MIN_WORK;
        let start = Instant::now();
        let mut gcw = GcWork::new();
        let done = self.drain(world, &mut gcw, |work| work >= want);
        *credit += (done as f64 * pacer.assist_bytes_per_work()) as i64;
        if *credit < 0 && self.gc.work.is_empty() && self.gc.roots.all_done() {
            // Nothing left to mark here; mark_done finishes the cycle.
            *credit = 0;
        }

        let ns = start.elapsed().as_nanos() as u64;
        self.stats.assist_ns.fetch_add(ns, Ordering::Relaxed);
        self.gc.limiter.add_assist_time(ns as i64);
        pacer.revise(
            self.stats.heap_live.load(Ordering::Relaxed),
            self.gc.scan_work(),
        );
        log::trace!("assist: {done} work in {ns}ns, credit {credit}");
    }
}
