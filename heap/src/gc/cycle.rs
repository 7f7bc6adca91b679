//! Cycle driver: starting a cycle, detecting the end of marking, mark
//! termination, and forced collections.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Instant,
};

use crate::{
    fatal::throw,
    gc::{HEAP_ROOT_JOBS, Phase, World, limiter::BACKGROUND_UTILIZATION, work::GcWork},
    heap::HeapInner,
};

/// Why a cycle is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The live heap crossed the pacer's trigger.
    Heap,
    /// Too long since the last cycle.
    Time,
    /// Somebody asked for a collection.
    Forced,
}

impl Trigger {
    fn holds(self, heap: &HeapInner) -> bool {
        match self {
            // A limited collector does not start cycles on its own.
            Trigger::Heap => {
                !heap.gc.limiter.limiting()
                    && heap
                        .gc
                        .pacer
                        .should_trigger(heap.stats.heap_live.load(Ordering::Relaxed))
            }
            Trigger::Time => heap.gc.pacer.gc_percent() >= 0,
            Trigger::Forced => true,
        }
    }
}

/// Outcome of [`HeapInner::mark_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDone {
    /// Marking is over and the sweep has started.
    Terminated,
    /// Grey objects or root jobs remain.
    MoreWork,
    /// Not marking, or another thread is deciding.
    Busy,
}

impl HeapInner {
    /// Whether `trigger` would start a cycle right now.
    pub fn should_start(&self, trigger: Trigger) -> bool {
        !self.gc.phase().barrier_enabled() && trigger.holds(self)
    }

    /// Start a cycle if `trigger` holds and none is running. Returns true
    /// if this call started one.
    pub fn start_cycle(&self, world: &dyn World, trigger: Trigger) -> bool {
        if !self.should_start(trigger) {
            return false;
        }
        let Some(_start) = self.gc.start_lock.try_lock() else {
            return false;
        };
        if self.gc.phase() == Phase::Sweep {
            self.finish_sweep();
        }
        if self.gc.phase() != Phase::Off || !trigger.holds(self) {
            return false;
        }

        let pause = Instant::now();
        world.stop_the_world("gc start");
        self.gc.limiter.start_transition(true, self.nanotime());

        self.gc.reset_counters();
        self.gc.roots.reset(HEAP_ROOT_JOBS + world.root_jobs());
        let cycle = self.gc.cycle() + 1;
        world.handshake(&|cache| cache.prepare_for_mark(cycle));
        self.gc.state.store(Phase::Mark, cycle);
        self.gc.limiter.set_cycle(cycle);
        self.gc
            .pacer
            .start_cycle(self.stats.heap_live.load(Ordering::Relaxed));
        self.gc
            .forced
            .store(trigger == Trigger::Forced, Ordering::Relaxed);

        let ns = pause.elapsed().as_nanos() as u64;
        self.stats.record_pause(ns);
        self.gc.limiter.finish_transition(self.nanotime());
        world.start_the_world();

        log::debug!(
            "gc {cycle}: start ({trigger:?}), heap live {} goal {}, pause {ns}ns",
            self.stats.heap_live.load(Ordering::Relaxed),
            self.gc.pacer.goal(),
        );
        let workers = ((world.nprocs() as f64 * BACKGROUND_UTILIZATION).ceil() as usize).max(1);
        world.mark_workers(workers);
        true
    }

    /// Called by a marker that ran out of work. Finishes the cycle if no
    /// grey object is left anywhere.
    pub fn mark_done(&self, world: &dyn World) -> MarkDone {
        let Some(_done) = self.gc.mark_done_lock.try_lock() else {
            return MarkDone::Busy;
        };
        if self.gc.phase() != Phase::Mark {
            return MarkDone::Busy;
        }
        if !self.gc.mark_work_exhausted() {
            return MarkDone::MoreWork;
        }
        // Slots may still hold barrier buffers and local work.
        let flushed = AtomicBool::new(false);
        world.handshake(&|cache| {
            if cache.flush_mark_work() {
                flushed.store(true, Ordering::Relaxed);
            }
        });
        if flushed.load(Ordering::Relaxed) || !self.gc.mark_work_exhausted() {
            return MarkDone::MoreWork;
        }
        self.mark_termination(world);
        MarkDone::Terminated
    }

    fn mark_termination(&self, world: &dyn World) {
        let pause = Instant::now();
        world.stop_the_world("gc mark termination");
        self.gc.limiter.start_transition(false, self.nanotime());
        let cycle = self.gc.cycle();
        if !self
            .gc
            .state
            .transition(Phase::Mark, Phase::MarkTermination)
        {
            throw("mark termination outside the mark phase");
        }

        world.handshake(&|cache| {
            cache.flush_mark_work();
        });
        // Markers without a slot may still be finishing their last batch.
        self.gc.wait_for_markers();
        let mut gcw = GcWork::new();
        self.drain_phase(world, &mut gcw, Phase::MarkTermination, |_| false);
        if !self.gc.roots.all_done() || !self.gc.work.is_empty() {
            throw("mark termination found work left");
        }
        world.handshake(&|cache| cache.release_all());

        let marked = self.gc.bytes_marked();
        self.stats.heap_marked.store(marked, Ordering::Relaxed);
        self.stats.heap_live.store(marked, Ordering::Relaxed);
        self.gc.pacer.end_cycle(marked, self.gc.scan_work());

        self.start_sweep();
        let phase = if self.gc.sweep.remaining() == 0 {
            Phase::Off
        } else {
            Phase::Sweep
        };
        self.gc.state.store(phase, cycle);

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        if self.gc.forced.load(Ordering::Relaxed) {
            self.stats.forced_cycles.fetch_add(1, Ordering::Relaxed);
        }
        let ns = pause.elapsed().as_nanos() as u64;
        self.stats.record_pause(ns);
        self.stats
            .last_gc_ns
            .store(self.nanotime() as u64, Ordering::Relaxed);
        self.gc.limiter.finish_transition(self.nanotime());
        world.start_the_world();

        self.gc.publish_completed(cycle);
        world.cycle_done(cycle);

        if self.config.gc_trace {
            log::info!(
                "gc {cycle}: {marked} bytes marked, goal {}, pause {ns}ns, {} finalizers queued",
                self.gc.pacer.goal(),
                self.finq.len(),
            );
        } else {
            log::debug!("gc {cycle}: done, {marked} bytes marked, pause {ns}ns");
        }
    }

    /// Help marking until cycle `cycle` has completed.
    pub fn finish_cycle(&self, world: &dyn World, cycle: u64) {
        while self.gc.completed_cycles() < cycle {
            if self.gc.phase() == Phase::Mark {
                let mut gcw = GcWork::new();
                self.drain(world, &mut gcw, |_| false);
                if self.mark_done(world) == MarkDone::Terminated {
                    continue;
                }
            }
            world.safepoint();
            thread::yield_now();
        }
    }

    /// Run a complete cycle, including its sweep, and return its number.
    /// A cycle already marking is finished first, since it may have started
    /// before the caller dropped its references.
    pub fn run_cycle_blocking(&self, world: &dyn World) -> u64 {
        let before = self.gc.cycle();
        self.finish_cycle(world, before);
        while self.gc.cycle() == before && !self.start_cycle(world, Trigger::Forced) {
            world.safepoint();
            thread::yield_now();
        }
        let target = before + 1;
        self.finish_cycle(world, target);
        self.finish_sweep();
        target
    }
}
