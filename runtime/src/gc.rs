//! The scheduler as the collector sees it.
//!
//! Root job 0 is the global table; job `i + 1` is the stack of task record
//! `i`. A stack is scanned by whoever gets the task's scan bit while it is
//! not running, or by the task itself at its next safe point.
//!
//! Three helpers run beside the mutators: background mark workers (plain
//! threads, woken per cycle), the sweeper task and the finalizer task.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use heap::{
    AllocError, GcWork, HeapInner, Lock, LockRank, MarkDone, Phase, RootKind, SlotCache, World,
};

use crate::{
    context::TaskContext,
    parker::Note,
    runtime::RuntimeInner,
    task::{TaskFlags, TaskId, TaskStatus, WaitReason},
    worker::current,
};

/// Spans swept between yields of the sweeper task.
const SWEEP_BATCH: usize = 32;

// ── Globals ───────────────────────────────────────────────────────────

/// Handle to a global root word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(usize);

/// Root words owned by the embedder. Every one is scanned as a possible
/// pointer.
pub(crate) struct Globals {
    words: Lock<Vec<usize>>,
}

impl Globals {
    pub(crate) fn new() -> Self {
        Self {
            words: Lock::new(LockRank::Leaf, Vec::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<usize> {
        self.words.lock().clone()
    }
}

impl RuntimeInner {
    pub(crate) fn add_global(&self, value: usize) -> GlobalId {
        let id = {
            let mut words = self.globals.words.lock();
            words.push(0);
            GlobalId(words.len() - 1)
        };
        self.set_global(id, value);
        id
    }

    /// Store `value` into a global. Shades both the old and the new value
    /// while marking, since the global may already have been scanned.
    pub(crate) fn set_global(&self, id: GlobalId, value: usize) {
        let old = std::mem::replace(&mut self.globals.words.lock()[id.0], value);
        if self.heap.phase().barrier_enabled() {
            let mut gcw = GcWork::new();
            self.heap.shade_root(old, &mut gcw);
            self.heap.shade_root(value, &mut gcw);
            self.heap.publish_work(&mut gcw);
        }
    }

    pub(crate) fn global(&self, id: GlobalId) -> usize {
        self.globals.words.lock()[id.0]
    }

    // ── Stack scanning ────────────────────────────────────────────────

    fn scan_task(&self, index: usize, heap: &HeapInner, gcw: &mut GcWork) {
        let Some(task) = self.tasks.by_index(index) else {
            return;
        };
        let cycle = heap.gc.cycle();
        let me = current();
        loop {
            if task.scanned_cycle.load(Ordering::Acquire) >= cycle {
                return;
            }
            if me.rt == self.id() && me.task == task.id().to_raw() {
                self.scan_stack(heap, &task, gcw);
                task.scanned_cycle.store(cycle, Ordering::Release);
                return;
            }
            if let Some(status) = task.suspend_for_scan() {
                if task.scanned_cycle.load(Ordering::Acquire) < cycle {
                    self.scan_stack(heap, &task, gcw);
                    self.maybe_shrink_stack(&task, status);
                    task.scanned_cycle.store(cycle, Ordering::Release);
                }
                task.resume_from_scan();
                return;
            }
            match task.status() {
                // No stack to scan.
                TaskStatus::Idle | TaskStatus::Dead => {
                    task.scanned_cycle.fetch_max(cycle, Ordering::AcqRel);
                    return;
                }
                TaskStatus::Running => {
                    task.set_flags(TaskFlags::SCAN_REQUEST);
                    self.preempt(&task);
                }
                _ => {}
            }
            // Our own slot may be what the task waits for.
            self.safepoint();
            thread::yield_now();
        }
    }

    // ── Background marking ────────────────────────────────────────────

    fn mark_worker_main(self: Arc<Self>, index: usize, note: Arc<Note>) {
        log::debug!("mark worker {index} started");
        loop {
            note.park();
            if self.is_shutdown() {
                break;
            }
            self.background_mark();
        }
    }

    fn background_mark(&self) {
        let heap = &self.heap;
        let mut gcw = GcWork::new();
        while heap.phase() == Phase::Mark && !self.is_shutdown() {
            let start = heap.nanotime();
            let work = heap.drain(self, &mut gcw, |_| self.is_shutdown());
            heap.gc.add_background_credit(work);
            heap.stats
                .bg_mark_ns
                .fetch_add((heap.nanotime() - start) as u64, Ordering::Relaxed);
            match heap.mark_done(self) {
                MarkDone::Terminated => break,
                MarkDone::MoreWork => {}
                MarkDone::Busy => thread::sleep(Duration::from_micros(50)),
            }
        }
    }

    // ── System tasks ──────────────────────────────────────────────────

    pub(crate) fn start_system_tasks(&self) -> Result<(), AllocError> {
        let sweeper = self.spawn_task(TaskFlags::SYSTEM, |cx| async move {
            cx.rt().sweep_loop(&cx).await;
            Ok(())
        })?;
        self.system
            .sweeper
            .store(sweeper.to_raw(), Ordering::Release);

        let fing = self.spawn_task(TaskFlags::SYSTEM, |cx| async move {
            cx.rt().finalizer_loop(&cx).await;
            Ok(())
        })?;
        self.system.fing.store(fing.to_raw(), Ordering::Release);
        Ok(())
    }

    async fn sweep_loop(&self, cx: &TaskContext) {
        while !self.is_shutdown() {
            let mut n = 0;
            while self.heap.sweep_one().is_some() {
                n += 1;
                if n % SWEEP_BATCH == 0 {
                    cx.yield_now().await;
                }
            }
            if n > 0 {
                log::trace!("background sweep: {n} spans");
            }
            if self.heap.phase() != Phase::Sweep {
                cx.park(WaitReason::SweepWait).await;
            }
        }
    }

    async fn finalizer_loop(&self, cx: &TaskContext) {
        while !self.is_shutdown() {
            let n = self.heap.finq.run_pending();
            if n > 0 {
                log::debug!("ran {n} cleanups");
            }
            if self.heap.finq.is_empty() {
                cx.park(WaitReason::FinalizerWait).await;
            }
        }
    }

    /// Ready the finalizer task.
    pub(crate) fn wake_finalizers(&self) {
        if let Some(id) = TaskId::from_raw(self.system.fing.load(Ordering::Acquire)) {
            self.ready(id);
        }
    }
}

/// The runtime's helper tasks and threads.
pub(crate) struct SystemTasks {
    pub sweeper: AtomicU64,
    pub fing: AtomicU64,
    /// Cleanups were queued. The queue's hook may run under heap locks, so
    /// it only sets this and the scheduler does the wake-up.
    pub fing_wake: AtomicBool,
    pub markers: Lock<Vec<Arc<Note>>>,
}

impl SystemTasks {
    pub(crate) fn new() -> Self {
        Self {
            sweeper: AtomicU64::new(TaskId::NONE_RAW),
            fing: AtomicU64::new(TaskId::NONE_RAW),
            fing_wake: AtomicBool::new(false),
            markers: Lock::new(LockRank::Leaf, Vec::new()),
        }
    }
}

impl World for RuntimeInner {
    fn stop_the_world(&self, reason: &'static str) {
        self.stop_world(reason);
    }

    fn start_the_world(&self) {
        self.start_world();
    }

    fn handshake(&self, f: &(dyn Fn(&mut SlotCache) + Sync)) {
        for slot in self.sched.slots.iter() {
            f(&mut slot.cache.lock());
        }
    }

    fn root_jobs(&self) -> usize {
        1 + self.tasks.len()
    }

    fn mark_root(&self, job: usize, heap: &HeapInner, gcw: &mut GcWork) {
        match job {
            0 => {
                for value in self.globals.snapshot() {
                    heap.shade_root(value, gcw);
                }
            }
            _ => self.scan_task(job - 1, heap, gcw),
        }
    }

    fn visit_roots(&self, f: &mut dyn FnMut(RootKind, usize, usize)) {
        for (i, value) in self.globals.snapshot().into_iter().enumerate() {
            if value != 0 {
                f(RootKind::Global, i, value);
            }
        }
        for task in self.tasks.snapshot() {
            if matches!(task.status(), TaskStatus::Idle | TaskStatus::Dead) {
                continue;
            }
            let goid = task.goid();
            self.stack_roots(&task, |deferred, value| {
                if value != 0 {
                    let kind = if deferred {
                        RootKind::Defer(goid)
                    } else {
                        RootKind::Stack(goid)
                    };
                    f(kind, 0, value);
                }
            });
        }
    }

    fn mark_workers(&self, n: usize) {
        let Some(rt) = self.this.upgrade() else {
            return;
        };
        let mut markers = self.system.markers.lock();
        while markers.len() < n {
            let index = markers.len();
            let note = Arc::new(Note::new());
            let worker_note = note.clone();
            let rt = rt.clone();
            let spawned = thread::Builder::new()
                .name(format!("runtime-mark-{index}"))
                .spawn(move || rt.mark_worker_main(index, worker_note));
            match spawned {
                Ok(handle) => {
                    self.threads.lock().push(handle);
                    markers.push(note);
                }
                Err(err) => {
                    log::warn!("cannot start mark worker: {err}");
                    break;
                }
            }
        }
        for note in markers.iter().take(n) {
            note.unpark();
        }
    }

    fn safepoint(&self) {
        RuntimeInner::safepoint(self);
    }

    fn cycle_done(&self, cycle: u64) {
        log::trace!("cycle {cycle} done, waking sweeper");
        if let Some(id) = TaskId::from_raw(self.system.sweeper.load(Ordering::Acquire)) {
            self.ready(id);
        }
    }

    fn nprocs(&self) -> usize {
        self.sched.slots.len()
    }
}
