//! The mutator API.
//!
//! A task receives a [`TaskContext`] when it starts and goes through it for
//! everything that touches managed memory: allocating, loading and storing
//! pointers, frames, suspension points.
//!
//! Heap addresses are plain `usize`s. The collector finds them only in
//! frame locals marked as pointers, in globals, in deferred call arguments
//! and in other heap objects, so an address kept in a Rust local is valid
//! only until the next safe point (any `await` on a runtime future, any
//! allocation, any frame push). Keep it in a local slot across those.

use std::{
    fmt,
    future::Future,
    io::Write,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use heap::{
    AllocError, AllocMode, CleanupFn, CleanupHandle, Phase, PtrMap, Trigger,
    fatal::throw_with,
    gc::barrier,
};

use crate::{
    defer::Exception,
    funcs::{FuncId, FuncInfo},
    gc::GlobalId,
    runtime::RuntimeInner,
    task::{Task, TaskFlags, TaskId, WaitReason},
    worker::current,
};

#[derive(Clone)]
pub struct TaskContext {
    rt: Arc<RuntimeInner>,
    task: Arc<Task>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub(crate) fn new(rt: Arc<RuntimeInner>, task: Arc<Task>) -> Self {
        Self { rt, task }
    }

    #[inline]
    pub(crate) fn rt(&self) -> &RuntimeInner {
        &self.rt
    }

    #[inline]
    pub(crate) fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn goid(&self) -> u64 {
        self.task.goid()
    }

    /// The slot this task is running on. Using a context from anywhere but
    /// its own task is fatal.
    fn slot(&self) -> usize {
        let cur = current();
        match self.rt.current_slot() {
            Some(slot) if cur.task == self.task.id().to_raw() => slot,
            _ => throw_with("task context used outside its task", |out| {
                let _ = writeln!(out, "task {}", self.task.goid());
            }),
        }
    }

    // ── Memory ────────────────────────────────────────────────────────

    /// Allocate `size` zeroed bytes. Running out of memory is fatal.
    pub fn alloc(&self, size: usize, ptrs: PtrMap<'_>) -> usize {
        match self.alloc_mode(size, ptrs, AllocMode::Fatal) {
            Ok(obj) => obj,
            // Fatal mode does not return errors.
            Err(err) => throw_with("out of memory", |out| {
                let _ = writeln!(out, "{err}");
            }),
        }
    }

    /// Allocate `size` zeroed bytes, reporting exhaustion to the caller.
    pub fn try_alloc(&self, size: usize, ptrs: PtrMap<'_>) -> Result<usize, AllocError> {
        self.alloc_mode(size, ptrs, AllocMode::NonFatal)
    }

    fn alloc_mode(&self, size: usize, ptrs: PtrMap<'_>, mode: AllocMode) -> Result<usize, AllocError> {
        let rt = &*self.rt;
        let heap = &rt.heap;
        let slot = self.slot();
        rt.safepoint();
        if heap.should_start(Trigger::Heap) {
            heap.start_cycle(rt, Trigger::Heap);
        }
        if heap.phase() == Phase::Mark {
            self.assist(size);
        }
        let obj = rt.sched.slots[slot].cache.lock().allocate(size, ptrs, mode)?;
        Ok(obj)
    }

    /// Pay for an allocation with mark work.
    fn assist(&self, size: usize) {
        let rt = &*self.rt;
        let heap = &rt.heap;
        let task = &self.task;
        let cycle = heap.gc.cycle();
        if task.assist_cycle.swap(cycle, Ordering::Relaxed) != cycle {
            task.assist_credit.store(0, Ordering::Relaxed);
        }
        let mut credit = task.assist_credit.load(Ordering::Relaxed);
        heap.assist_alloc(rt, &mut credit, size);
        task.assist_credit.store(credit, Ordering::Relaxed);
        if heap.gc.mark_work_exhausted() {
            heap.mark_done(rt);
        }
    }

    /// Store pointer `value` into the word at `slot` of a heap object or
    /// global.
    ///
    /// # Safety
    /// `slot` must be an aligned pointer word of a live object or global.
    pub unsafe fn store_ptr(&self, slot: usize, value: usize) {
        let s = self.slot();
        let mut cache = self.rt.sched.slots[s].cache.lock();
        // SAFETY: caller guarantees the slot
        unsafe { cache.write_barrier(slot, value) };
    }

    /// # Safety
    /// `slot` must be an aligned word of a live object or global.
    pub unsafe fn load_ptr(&self, slot: usize) -> usize {
        // SAFETY: caller guarantees the slot
        unsafe { barrier::load_ptr(slot) }
    }

    /// Store a non-pointer word.
    ///
    /// # Safety
    /// `slot` must be an aligned non-pointer word of a live object.
    pub unsafe fn store_word(&self, slot: usize, value: usize) {
        // SAFETY: caller guarantees the slot
        unsafe { barrier::store_word(slot, value) }
    }

    /// # Safety
    /// `slot` must be an aligned word of a live object.
    pub unsafe fn load_word(&self, slot: usize) -> usize {
        // SAFETY: caller guarantees the slot
        unsafe { barrier::load_ptr(slot) }
    }

    /// Run `func(obj, arg)` on the finalizer task once `obj` is unreachable.
    pub fn register_cleanup(&self, obj: usize, func: CleanupFn, arg: usize) -> CleanupHandle {
        self.rt.heap.register_cleanup(obj, func, arg)
    }

    pub fn cancel_cleanup(&self, handle: CleanupHandle) -> bool {
        self.rt.heap.cancel_cleanup(handle)
    }

    /// Run a full collection cycle, sweep included.
    pub fn gc(&self) {
        self.slot();
        self.rt.heap.run_cycle_blocking(&*self.rt);
    }

    pub fn register_func(&self, info: FuncInfo) -> FuncId {
        self.rt.funcs.register(info)
    }

    pub fn add_global(&self, value: usize) -> GlobalId {
        self.rt.add_global(value)
    }

    pub fn set_global(&self, id: GlobalId, value: usize) {
        self.rt.set_global(id, value);
    }

    pub fn global(&self, id: GlobalId) -> usize {
        self.rt.global(id)
    }

    // ── Scheduling ────────────────────────────────────────────────────

    /// Start a new task. It goes on this slot's queue and runs next.
    pub fn spawn<F, Fut>(&self, body: F) -> Result<TaskId, AllocError>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Result<(), Exception>> + Send + 'static,
    {
        self.rt.spawn_task(TaskFlags::empty(), body)
    }

    /// Make another task runnable.
    pub fn ready(&self, id: TaskId) {
        self.rt.ready(id);
    }

    /// Run `f`, which may block, without holding up other tasks. `f` must
    /// not touch managed memory.
    pub fn syscall<R>(&self, f: impl FnOnce() -> R) -> R {
        let slot = self.slot();
        self.rt.enter_syscall(slot, &self.task);
        let r = f();
        self.rt.exit_syscall(slot, &self.task);
        r
    }

    /// Serve pending stop and scan requests and give up the slot if asked
    /// to.
    pub fn safepoint(&self) -> Safepoint<'_> {
        Safepoint { cx: self, yielded: false }
    }

    /// Let other tasks run.
    pub fn yield_now(&self) -> YieldNow<'_> {
        YieldNow { cx: self, yielded: false }
    }

    /// Wait until somebody calls `ready` on this task. May return early;
    /// callers recheck their condition.
    pub fn park(&self, reason: WaitReason) -> Park<'_> {
        Park {
            cx: self,
            reason,
            parked: false,
        }
    }

    pub fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Sleep {
            cx: self,
            deadline: Instant::now() + duration,
            seq: 0,
        }
    }

    pub fn sleep_until(&self, deadline: Instant) -> Sleep<'_> {
        Sleep {
            cx: self,
            deadline,
            seq: 0,
        }
    }
}

// ── Suspension points ─────────────────────────────────────────────────

#[must_use = "futures do nothing unless awaited"]
pub struct Safepoint<'a> {
    cx: &'a TaskContext,
    yielded: bool,
}

impl Future for Safepoint<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        let cx = self.cx;
        cx.rt.safepoint();
        if cx.task.flags().contains(TaskFlags::PREEMPT) {
            cx.task.set_flags(TaskFlags::YIELD);
            self.yielded = true;
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow<'a> {
    cx: &'a TaskContext,
    yielded: bool,
}

impl Future for YieldNow<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        self.cx.task.set_flags(TaskFlags::YIELD);
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Park<'a> {
    cx: &'a TaskContext,
    reason: WaitReason,
    parked: bool,
}

impl Future for Park<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            return Poll::Ready(());
        }
        self.parked = true;
        self.cx.task.set_wait_reason(self.reason);
        Poll::Pending
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct Sleep<'a> {
    cx: &'a TaskContext,
    deadline: Instant,
    /// Timer armed for this sleep, 0 before the first poll.
    seq: u64,
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<()> {
        let task = &self.cx.task;
        if Instant::now() >= self.deadline {
            let _ = task
                .sleep_seq
                .compare_exchange(self.seq, 0, Ordering::AcqRel, Ordering::Relaxed);
            return Poll::Ready(());
        }
        if self.seq == 0 || task.sleep_seq.load(Ordering::Acquire) != self.seq {
            let seq = self.cx.rt.timers.add(self.deadline, task.id());
            task.sleep_seq.store(seq, Ordering::Release);
            self.seq = seq;
        }
        task.set_wait_reason(WaitReason::Sleep);
        Poll::Pending
    }
}

impl Drop for Sleep<'_> {
    fn drop(&mut self) {
        if self.seq != 0 {
            let _ = self.cx.task.sleep_seq.compare_exchange(
                self.seq,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}
