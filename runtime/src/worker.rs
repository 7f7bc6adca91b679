//! Worker threads.
//!
//! A worker loops: hold a slot, find a runnable task, poll it once, repeat.
//! Without work it gives the slot back and sleeps on its [`Note`] until a
//! `wakep` hands it one, or until the next timer is due.

use std::{
    cell::Cell,
    io::Write,
    sync::{
        Arc,
        Weak,
        atomic::{AtomicBool, AtomicU64, Ordering, fence},
    },
    task::{Context, Poll, Wake, Waker},
    thread,
    time::{Duration, Instant},
};

use heap::{
    Phase,
    fatal::{throw, throw_with},
};
use rand::{SeedableRng, rngs::SmallRng};

use crate::{
    parker::Note,
    runtime::RuntimeInner,
    slot::SlotStatus,
    stack::{STACK_GUARD, STACK_PREEMPT, Stack},
    task::{Task, TaskFlags, TaskId, TaskStatus, WaitReason},
};

pub(crate) const NO_SLOT: usize = usize::MAX;

/// Longest an idle worker sleeps before looking around again.
const IDLE_PARK: Duration = Duration::from_millis(20);

/// What the current thread is doing for which runtime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Current {
    /// Address of the runtime, 0 for threads that belong to none.
    pub rt: usize,
    pub slot: usize,
    /// Raw id of the task being polled.
    pub task: u64,
}

impl Current {
    pub(crate) const NONE: Self = Self {
        rt: 0,
        slot: NO_SLOT,
        task: TaskId::NONE_RAW,
    };
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Current> = const { Cell::new(Current::NONE) };
    static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn current() -> Current {
    CURRENT.with(Cell::get)
}

#[inline]
pub(crate) fn set_current(cur: Current) {
    CURRENT.with(|c| c.set(cur));
}

#[inline]
pub(crate) fn update_current(f: impl FnOnce(&mut Current)) {
    CURRENT.with(|c| {
        let mut cur = c.get();
        f(&mut cur);
        c.set(cur);
    });
}

/// Nonzero number identifying the calling thread.
#[inline]
pub(crate) fn thread_token() -> u64 {
    TOKEN.with(|t| *t)
}

pub(crate) struct Worker {
    pub id: usize,
    pub note: Note,
    /// Set by whoever wakes the worker to make it a spinning worker.
    pub spinning: AtomicBool,
}

struct TaskWaker {
    rt: Weak<RuntimeInner>,
    id: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(rt) = self.rt.upgrade() {
            rt.ready(self.id);
        }
    }
}

impl RuntimeInner {
    /// Hand work to a parked worker or a new thread.
    pub(crate) fn start_worker(&self, spinning: bool) {
        let parked = self.sched.idle_workers.lock().pop();
        if let Some(worker) = parked {
            worker.spinning.store(spinning, Ordering::Release);
            worker.note.unpark();
            return;
        }
        let Some(rt) = self.this.upgrade() else {
            return;
        };
        let n = self.sched.nworkers.fetch_add(1, Ordering::AcqRel);
        if n >= self.config.max_threads || self.is_shutdown() {
            self.sched.nworkers.fetch_sub(1, Ordering::AcqRel);
            if spinning {
                self.sched.nspinning.fetch_sub(1, Ordering::AcqRel);
            }
            return;
        }
        let worker = Arc::new(Worker {
            id: n,
            note: Note::new(),
            spinning: AtomicBool::new(spinning),
        });
        let spawned = thread::Builder::new()
            .name(format!("runtime-worker-{n}"))
            .spawn(move || rt.worker_main(worker));
        match spawned {
            Ok(handle) => self.threads.lock().push(handle),
            Err(err) => throw_with("cannot create worker thread", |out| {
                let _ = writeln!(out, "{err}");
            }),
        }
    }

    fn worker_main(self: Arc<Self>, worker: Arc<Worker>) {
        set_current(Current {
            rt: self.id(),
            ..Current::NONE
        });
        log::debug!("worker {} started", worker.id);
        let mut rng = SmallRng::from_entropy();
        let mut spinning = worker.spinning.swap(false, Ordering::AcqRel);

        while !self.is_shutdown() {
            let slot = current().slot;
            if slot == NO_SLOT {
                if let Some(slot) = self.acquire_idle_slot() {
                    update_current(|c| c.slot = slot);
                    continue;
                }
                if spinning {
                    spinning = false;
                    self.sched.nspinning.fetch_sub(1, Ordering::AcqRel);
                }
                spinning = self.park_worker(&worker);
                continue;
            }

            self.safepoint();
            match self.find_runnable(slot, &mut spinning, &mut rng) {
                Some(id) => {
                    if spinning {
                        spinning = false;
                        // The last spinner found work; somebody else should
                        // look for more.
                        if self.sched.nspinning.fetch_sub(1, Ordering::AcqRel) == 1 {
                            self.wakep();
                        }
                    }
                    self.execute(id);
                }
                None => {
                    if spinning {
                        spinning = false;
                        self.sched.nspinning.fetch_sub(1, Ordering::AcqRel);
                    }
                    self.sched.slots[slot].release(thread_token());
                    update_current(|c| c.slot = NO_SLOT);
                    if !self.work_visible() {
                        spinning = self.park_worker(&worker);
                    }
                }
            }
        }

        let slot = current().slot;
        if slot != NO_SLOT {
            self.sched.slots[slot].release(thread_token());
        }
        set_current(Current::NONE);
        log::debug!("worker {} exiting", worker.id);
    }

    /// Work an idle slot could pick up, checked after giving a slot back.
    fn work_visible(&self) -> bool {
        !self.sched.global.is_empty()
            || self.system.fing_wake.load(Ordering::Acquire)
            || self.poller.pending()
            || self
                .timers
                .next_deadline()
                .is_some_and(|when| when <= Instant::now())
            || self
                .sched
                .slots
                .iter()
                .any(|s| s.status() == SlotStatus::Idle && !s.runq.is_empty())
    }

    /// Sleep until woken or until the next timer. Returns whether the waker
    /// made this a spinning worker.
    fn park_worker(&self, worker: &Arc<Worker>) -> bool {
        let timeout = self
            .timers
            .next_deadline()
            .map_or(IDLE_PARK, |when| when.saturating_duration_since(Instant::now()))
            .min(IDLE_PARK);
        self.sched.idle_workers.lock().push(worker.clone());
        let start = self.heap.nanotime();
        if !worker.note.park_timeout(timeout) {
            let removed = {
                let mut idle = self.sched.idle_workers.lock();
                let pos = idle.iter().position(|w| Arc::ptr_eq(w, worker));
                pos.map(|i| idle.swap_remove(i)).is_some()
            };
            if !removed {
                // Popped by a waker that is about to unpark us.
                worker.note.park();
            }
        }
        if self.heap.phase() == Phase::Mark {
            self.heap
                .gc
                .limiter
                .add_idle_time(self.heap.nanotime() - start);
        }
        self.run_timers(Instant::now());
        worker.spinning.swap(false, Ordering::AcqRel)
    }

    /// Poll task `id` once on the current slot.
    fn execute(&self, id: TaskId) {
        let Some(task) = self.tasks.get(id) else {
            throw_with("scheduled a stale task", |out| {
                let _ = writeln!(out, "{id:?}");
            });
        };
        task.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        let slot = &self.sched.slots[current().slot];
        slot.current.store(id.to_raw(), Ordering::Release);
        slot.sched_tick.fetch_add(1, Ordering::Relaxed);
        update_current(|c| c.task = id.to_raw());
        task.clear_flags(TaskFlags::PREEMPT | TaskFlags::YIELD);
        let lo = task.stack_lo.load(Ordering::Relaxed);
        let _ = task.stack_guard.compare_exchange(
            STACK_PREEMPT,
            lo + STACK_GUARD,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );

        let waker = Waker::from(Arc::new(TaskWaker {
            rt: self.this.clone(),
            id,
        }));
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let mut future = task.future.lock();
            match future.as_mut() {
                Some(f) => f.as_mut().poll(&mut cx),
                None => throw("task without a body"),
            }
        };

        // A syscall inside the poll may have moved us to another slot.
        let slot = &self.sched.slots[current().slot];
        slot.current.store(TaskId::NONE_RAW, Ordering::Release);
        update_current(|c| c.task = TaskId::NONE_RAW);

        match poll {
            Poll::Ready(Ok(())) => self.exit(&task),
            Poll::Ready(Err(exc)) => throw_with("unrecovered exception", |out| {
                let _ = writeln!(out, "task {}: {exc:?}", task.goid());
            }),
            Poll::Pending if task.take_flags(TaskFlags::YIELD) => {
                task.cas_status(TaskStatus::Running, TaskStatus::Runnable);
                self.sched.global.push(id);
            }
            Poll::Pending => {
                task.cas_status(TaskStatus::Running, TaskStatus::Waiting);
                fence(Ordering::SeqCst);
                if task.notified.swap(false, Ordering::AcqRel)
                    && task.try_cas_status(TaskStatus::Waiting, TaskStatus::Runnable)
                {
                    task.set_wait_reason(WaitReason::None);
                    slot.runq.push(id, false, &self.sched.global);
                }
            }
        }
    }

    fn exit(&self, task: &Task) {
        task.cas_status(TaskStatus::Running, TaskStatus::Dead);
        let stack = Stack {
            lo: task.stack_lo.swap(0, Ordering::Relaxed),
            hi: task.stack_hi.swap(0, Ordering::Relaxed),
        };
        task.sp.store(0, Ordering::Relaxed);
        task.fp.store(0, Ordering::Relaxed);
        if stack.lo != 0 {
            self.stacks.free(stack);
        }
        let future = task.future.lock().take();
        drop(future);
        log::trace!("task {} exited", task.goid());
        self.tasks.release(task);
    }
}
