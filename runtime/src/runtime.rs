//! The runtime object.
//!
//! [`Runtime`] is the embedder's handle: it owns the heap, the slots, the
//! task table and the helper threads, and shuts all of them down when
//! dropped. Everything the scheduler and the collector share lives in
//! [`RuntimeInner`], which worker threads and tasks hold through an `Arc`.

use std::{
    future::Future,
    io::Write,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use heap::{
    AllocError, DumpError, Heap, Phase, fatal::throw, lock::set_rank_checking,
};
use parking_lot::Mutex;

use crate::{
    config::{ConfigError, RuntimeConfig},
    context::TaskContext,
    defer::Exception,
    funcs::{FuncId, FuncInfo, FuncTable},
    gc::{GlobalId, Globals, SystemTasks},
    parker::Note,
    poll::{NoPoller, Poller},
    slot::Slot,
    sched::Sched,
    stack::{MIN_STACK, STACK_GUARD, StackAllocator},
    task::{TaskFlags, TaskId, TaskStatus, TaskTable},
    timer::Timers,
    worker::current,
};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("heap: {0}")]
    Alloc(#[from] AllocError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot start thread: {0}")]
    Thread(#[from] std::io::Error),
    #[error("task raised: {}", .0.message)]
    Task(Exception),
}

pub(crate) struct RuntimeInner {
    pub config: RuntimeConfig,
    pub heap: Heap,
    pub tasks: TaskTable,
    pub funcs: FuncTable,
    pub stacks: StackAllocator,
    pub sched: Sched,
    pub timers: Timers,
    pub poller: Box<dyn Poller>,
    pub globals: Globals,
    pub system: SystemTasks,
    /// Wakes the monitor out of its sleep.
    pub monitor_note: Note,
    shutdown: AtomicBool,
    pub threads: Mutex<Vec<JoinHandle<()>>>,
    pub this: Weak<RuntimeInner>,
}

impl RuntimeInner {
    /// Address of this runtime, which tags the threads working for it.
    #[inline]
    pub(crate) fn id(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Create a task running `body` and queue it.
    pub(crate) fn spawn_task<F, Fut>(&self, flags: TaskFlags, body: F) -> Result<TaskId, AllocError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<(), Exception>> + Send + 'static,
    {
        let Some(rt) = self.this.upgrade() else {
            throw("spawn on a runtime being dropped");
        };
        let stack = self.stacks.alloc(MIN_STACK)?;
        let task = self.tasks.alloc(flags);
        task.stack_lo.store(stack.lo, Ordering::Relaxed);
        task.stack_hi.store(stack.hi, Ordering::Relaxed);
        task.sp.store(stack.hi, Ordering::Relaxed);
        task.fp.store(0, Ordering::Relaxed);
        task.stack_guard.store(stack.lo + STACK_GUARD, Ordering::Relaxed);
        // Born black: nothing on a fresh stack needs scanning this cycle.
        let cycle = self.heap.gc.cycle();
        let scanned = if self.heap.phase().barrier_enabled() {
            cycle
        } else {
            0
        };
        task.scanned_cycle.store(scanned, Ordering::Release);
        task.assist_cycle.store(cycle, Ordering::Relaxed);

        let future = body(TaskContext::new(rt, task.clone()));
        *task.future.lock() = Some(Box::pin(future));
        let id = task.id();
        let from = task.status();
        task.cas_status(from, TaskStatus::Runnable);
        log::trace!("spawned task {} ({id:?})", task.goid());

        if self.current_slot().is_some() {
            self.push_runnable(id, true);
        } else {
            self.sched.global.push(id);
        }
        self.wakep();
        Ok(id)
    }

    fn stop_all(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("runtime shutting down");
        for worker in self.sched.idle_workers.lock().drain(..) {
            worker.note.unpark();
        }
        for note in self.system.markers.lock().iter() {
            note.unpark();
        }
        self.monitor_note.unpark();

        let me = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("runtime thread panicked during shutdown");
            }
        }
        // Task bodies hold the runtime; dropping them breaks the cycle.
        for task in self.tasks.snapshot() {
            let future = task.future.lock().take();
            drop(future);
        }
    }

    /// Slot states for a fatal error report. Takes no locks.
    fn write_sched_state(&self, out: &mut dyn Write) {
        let _ = writeln!(
            out,
            "runtime: {} slots, {} tasks live, gc phase {:?} cycle {}",
            self.sched.slots.len(),
            self.tasks.live(),
            self.heap.phase(),
            self.heap.gc.cycle()
        );
        for slot in self.sched.slots.iter() {
            let _ = writeln!(
                out,
                "  slot {}: {:?}, running {:?}, {} queued",
                slot.id,
                slot.status(),
                slot.current_task(),
                slot.runq.len()
            );
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────────

/// A running runtime. Dropping it stops every thread it started.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_poller(config, NoPoller)
    }

    /// A runtime whose workers ask `poller` for tasks with completed I/O.
    pub fn with_poller(config: RuntimeConfig, poller: impl Poller + 'static) -> Result<Self, RuntimeError> {
        set_rank_checking(config.lock_rank);
        let heap = Heap::new(config.heap_config())?;
        let slots = (0..config.procs)
            .map(|id| Slot::new(id, heap.new_cache()))
            .collect();
        log::info!(
            "runtime: {} procs, gc percent {}, max stack {}",
            config.procs,
            config.gc_percent,
            config.max_stack
        );

        let inner = Arc::new_cyclic(|this| RuntimeInner {
            stacks: StackAllocator::new(heap.clone()),
            heap,
            tasks: TaskTable::new(),
            funcs: FuncTable::default(),
            sched: Sched::new(slots),
            timers: Timers::new(),
            poller: Box::new(poller),
            globals: Globals::new(),
            system: SystemTasks::new(),
            monitor_note: Note::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            this: this.clone(),
            config,
        });
        let rt = Self { inner };

        // The hook may fire with heap locks held, so it only leaves a note
        // for the scheduler.
        let weak = Arc::downgrade(&rt.inner);
        rt.inner.heap.finq.set_wake_hook(move || {
            if let Some(rt) = weak.upgrade() {
                rt.system.fing_wake.store(true, Ordering::Release);
                rt.monitor_note.unpark();
            }
        });
        let weak = Arc::downgrade(&rt.inner);
        heap::fatal::set_dump_hook(move |out| {
            if let Some(rt) = weak.upgrade() {
                rt.write_sched_state(out);
            }
        });

        rt.inner.start_system_tasks()?;
        let monitor = rt.inner.clone();
        let handle = thread::Builder::new()
            .name("runtime-monitor".into())
            .spawn(move || monitor.monitor_main())?;
        rt.inner.threads.lock().push(handle);
        Ok(rt)
    }

    /// Settings from `RUNTIME_DEBUG` on top of the defaults.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn heap(&self) -> &Heap {
        &self.inner.heap
    }

    /// Start a task running `body`.
    pub fn spawn<F, Fut>(&self, body: F) -> Result<TaskId, RuntimeError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<(), Exception>> + Send + 'static,
    {
        Ok(self.inner.spawn_task(TaskFlags::empty(), body)?)
    }

    /// Run `body` as a task and wait for it on the calling thread, which
    /// must not be one of the runtime's own.
    pub fn block_on<F, Fut, R>(&self, body: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<R, Exception>> + Send + 'static,
        R: Send + 'static,
    {
        if current().rt == self.inner.id() {
            throw("block_on from inside the runtime");
        }
        let done = Arc::new((Mutex::new(None), Note::new()));
        let tx = done.clone();
        self.spawn(move |cx| {
            let fut = body(cx);
            async move {
                let result = fut.await;
                *tx.0.lock() = Some(result);
                tx.1.unpark();
                Ok(())
            }
        })?;
        loop {
            if let Some(result) = done.0.lock().take() {
                return result.map_err(RuntimeError::from);
            }
            done.1.park();
        }
    }

    pub fn ready(&self, id: TaskId) {
        self.inner.ready(id);
    }

    /// Run a full collection, sweep included, from outside any task.
    pub fn gc(&self) {
        self.inner.heap.run_cycle_blocking(&*self.inner);
    }

    /// Collect and give every free page back to the OS.
    pub fn free_os_memory(&self) -> usize {
        self.inner.heap.free_os_memory(&*self.inner)
    }

    pub fn register_func(&self, info: FuncInfo) -> FuncId {
        self.inner.funcs.register(info)
    }

    pub fn add_global(&self, value: usize) -> GlobalId {
        self.inner.add_global(value)
    }

    pub fn set_global(&self, id: GlobalId, value: usize) {
        self.inner.set_global(id, value);
    }

    pub fn global(&self, id: GlobalId) -> usize {
        self.inner.global(id)
    }

    /// Heap and scheduler counters.
    pub fn metrics(&self) -> Vec<(&'static str, u64)> {
        let rt = &self.inner;
        let sched = &rt.sched;
        let mut m = rt.heap.metrics();
        m.extend([
            ("/sched/procs", sched.slots.len() as u64),
            ("/sched/tasks-live", rt.tasks.live() as u64),
            ("/sched/workers", sched.nworkers.load(Ordering::Relaxed) as u64),
            ("/sched/global-queue", sched.global.len() as u64),
            ("/sched/steals", sched.steals.load(Ordering::Relaxed)),
            ("/sched/stop-the-world", sched.stw_count.load(Ordering::Relaxed)),
            ("/sched/stack-in-use-bytes", rt.stacks.in_use() as u64),
            ("/sched/timers", rt.timers.len() as u64),
        ]);
        m
    }

    /// Write a heap dump. Stops the world while it runs.
    pub fn dump_heap(&self, out: impl Write) -> Result<(), DumpError> {
        self.inner.heap.write_dump(&*self.inner, out)
    }

    pub fn gc_phase(&self) -> Phase {
        self.inner.heap.phase()
    }

    /// Stop all threads and drop every task. Idempotent.
    pub fn shutdown(&self) {
        self.inner.stop_all();
    }
}

impl From<Exception> for RuntimeError {
    fn from(exc: Exception) -> Self {
        RuntimeError::Task(exc)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.stop_all();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("procs", &self.inner.sched.slots.len())
            .field("tasks", &self.inner.tasks.live())
            .field("heap", &self.inner.heap)
            .finish()
    }
}
