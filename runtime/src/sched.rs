//! Scheduler.
//!
//! Finding work, readying tasks, stopping the world and syscall hand-off.
//!
//! A worker that runs out of local work looks, in order, at the global
//! queue, the poller, the timers and finally the other slots' queues. Only a
//! limited number of workers spin looking for work to steal; `wakep` starts
//! one whenever new work appears and nobody is spinning.

use std::{
    io::Write,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence},
    },
    thread,
    time::{Duration, Instant},
};

use heap::{
    GcWork, Lock, LockRank, Phase,
    fatal::{throw, throw_with},
};
use parking_lot::{Condvar, Mutex};
use rand::{Rng, rngs::SmallRng};

use crate::{
    runq::{GlobalQueue, RUNQ_LEN},
    runtime::RuntimeInner,
    slot::{Slot, SlotStatus},
    stack::STACK_PREEMPT,
    task::{Task, TaskFlags, TaskId, TaskStatus, WaitReason},
    worker::{NO_SLOT, Worker, current, thread_token, update_current},
};

/// Every this many ticks the global queue goes first.
const GLOBAL_CHECK_TICKS: u32 = 61;

const STEAL_ROUNDS: usize = 4;

/// How long the world stopper sleeps between looks at the slots.
const STW_POLL: Duration = Duration::from_micros(100);

pub(crate) struct Sched {
    pub slots: Box<[Slot]>,
    pub global: GlobalQueue,
    pub idle_workers: Lock<Vec<Arc<Worker>>>,
    pub nspinning: AtomicUsize,
    pub nworkers: AtomicUsize,
    gcwaiting: AtomicBool,
    /// Token of the thread that stopped the world, 0 if none.
    stw_owner: AtomicU64,
    stw_lock: Mutex<()>,
    stw_cv: Condvar,
    pub stw_count: AtomicU64,
    pub steals: AtomicU64,
}

impl Sched {
    pub(crate) fn new(slots: Vec<Slot>) -> Self {
        Self {
            slots: slots.into_boxed_slice(),
            global: GlobalQueue::new(),
            idle_workers: Lock::new(LockRank::Sched, Vec::new()),
            nspinning: AtomicUsize::new(0),
            nworkers: AtomicUsize::new(0),
            gcwaiting: AtomicBool::new(false),
            stw_owner: AtomicU64::new(0),
            stw_lock: Mutex::new(()),
            stw_cv: Condvar::new(),
            stw_count: AtomicU64::new(0),
            steals: AtomicU64::new(0),
        }
    }

    pub(crate) fn idle_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status() == SlotStatus::Idle)
            .count()
    }
}

impl RuntimeInner {
    /// Slot held by the calling thread for this runtime.
    #[inline]
    pub(crate) fn current_slot(&self) -> Option<usize> {
        let cur = current();
        (cur.rt == self.id() && cur.slot != NO_SLOT).then_some(cur.slot)
    }

    pub(crate) fn acquire_idle_slot(&self) -> Option<usize> {
        let token = thread_token();
        self.sched
            .slots
            .iter()
            .find(|s| s.try_acquire(token))
            .map(|s| s.id)
    }

    /// Make sure some worker looks at newly queued work.
    pub(crate) fn wakep(&self) {
        if self.sched.idle_slots() == 0 {
            return;
        }
        if self
            .sched
            .nspinning
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.start_worker(true);
    }

    /// Queue a runnable task: on the caller's slot if it has one, else
    /// globally.
    pub(crate) fn push_runnable(&self, id: TaskId, next: bool) {
        match self.current_slot() {
            Some(slot) => self.sched.slots[slot]
                .runq
                .push(id, next, &self.sched.global),
            None => self.sched.global.push(id),
        }
    }

    /// Make task `id` runnable. A task that is not waiting yet keeps the
    /// wake-up and skips its next park; stale ids are ignored.
    pub fn ready(&self, id: TaskId) {
        let Some(task) = self.tasks.get(id) else {
            log::trace!("ready of finished {id:?}");
            return;
        };
        loop {
            match task.status() {
                TaskStatus::Waiting => {
                    if self.wake_waiting(&task, id) {
                        return;
                    }
                }
                TaskStatus::Idle | TaskStatus::Dead => {
                    log::trace!("ready of {:?} task {}", task.status(), task.goid());
                    return;
                }
                _ => {
                    task.notified.store(true, Ordering::Release);
                    fence(Ordering::SeqCst);
                    if task.status() == TaskStatus::Waiting
                        && task.notified.swap(false, Ordering::AcqRel)
                    {
                        self.wake_waiting(&task, id);
                    }
                    return;
                }
            }
        }
    }

    fn wake_waiting(&self, task: &Task, id: TaskId) -> bool {
        if !task.try_cas_status(TaskStatus::Waiting, TaskStatus::Runnable) {
            return false;
        }
        task.set_wait_reason(WaitReason::None);
        self.push_runnable(id, true);
        self.wakep();
        true
    }

    /// Ready every sleeper whose timer is due.
    pub(crate) fn run_timers(&self, now: Instant) -> usize {
        let due = self.timers.expired(now);
        let mut n = 0;
        for (seq, id) in due {
            let live = self
                .tasks
                .get(id)
                .is_some_and(|t| t.sleep_seq.load(Ordering::Acquire) == seq);
            if live {
                self.ready(id);
                n += 1;
            }
        }
        n
    }

    /// Hand tasks whose I/O completed back to the scheduler.
    fn run_poller(&self) -> usize {
        let ready = self.poller.poll();
        let n = ready.len();
        for id in ready {
            self.ready(id);
        }
        n
    }

    pub(crate) fn find_runnable(
        &self,
        slot: usize,
        spinning: &mut bool,
        rng: &mut SmallRng,
    ) -> Option<TaskId> {
        let sched = &self.sched;
        let me = &sched.slots[slot];

        if self.system.fing_wake.swap(false, Ordering::AcqRel) {
            self.wake_finalizers();
        }
        if me.sched_tick.load(Ordering::Relaxed) % GLOBAL_CHECK_TICKS == 0 {
            if let Some(id) = sched.global.take(&me.runq, sched.slots.len(), 1) {
                return Some(id);
            }
        }
        if let Some(id) = me.runq.pop() {
            return Some(id);
        }
        if let Some(id) = sched.global.take(&me.runq, sched.slots.len(), RUNQ_LEN / 2) {
            return Some(id);
        }
        if self.run_poller() > 0 || self.run_timers(Instant::now()) > 0 {
            if let Some(id) = me.runq.pop() {
                return Some(id);
            }
        }

        let busy = sched.slots.len() - sched.idle_slots();
        if !*spinning && 2 * sched.nspinning.load(Ordering::Acquire) >= busy {
            return None;
        }
        if !*spinning {
            *spinning = true;
            sched.nspinning.fetch_add(1, Ordering::AcqRel);
        }
        self.steal_work(slot, rng)
    }

    /// Take half of a random other slot's queue.
    fn steal_work(&self, slot: usize, rng: &mut SmallRng) -> Option<TaskId> {
        let sched = &self.sched;
        let n = sched.slots.len();
        if n < 2 {
            return None;
        }
        let me = &sched.slots[slot];
        for round in 0..STEAL_ROUNDS {
            let start = rng.gen_range(0..n);
            for i in 0..n {
                let victim = &sched.slots[(start + i) % n];
                if victim.id == slot {
                    continue;
                }
                // Run-next tasks are only taken on the last round; their
                // slot is probably about to run them.
                if let Some(id) = me.runq.steal_from(&victim.runq, round == STEAL_ROUNDS - 1) {
                    sched.steals.fetch_add(1, Ordering::Relaxed);
                    return Some(id);
                }
            }
            if sched.gcwaiting.load(Ordering::Acquire) {
                return None;
            }
        }
        None
    }

    // ── Stopping the world ────────────────────────────────────────────

    /// Ask a running task to come to a safe point.
    pub(crate) fn preempt(&self, task: &Task) {
        task.set_flags(TaskFlags::PREEMPT);
        task.stack_guard.store(STACK_PREEMPT, Ordering::Release);
    }

    pub(crate) fn stop_world(&self, reason: &'static str) {
        let token = thread_token();
        let mine = self.current_slot();
        while self
            .sched
            .stw_owner
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Somebody else is stopping us.
            self.safepoint();
            thread::yield_now();
        }
        let start = Instant::now();
        {
            let _g = self.sched.stw_lock.lock();
            self.sched.gcwaiting.store(true, Ordering::SeqCst);
        }
        loop {
            let mut pending = 0;
            for slot in self.sched.slots.iter() {
                if Some(slot.id) == mine {
                    continue;
                }
                let stopped = match slot.status() {
                    SlotStatus::Stopped => true,
                    SlotStatus::Idle => {
                        slot.transition(SlotStatus::Idle, 0, SlotStatus::Stopped, 0)
                    }
                    SlotStatus::Syscall => slot.take_from_syscall(SlotStatus::Stopped),
                    SlotStatus::Running => {
                        if let Some(task) = slot.current_task().and_then(|id| self.tasks.get(id)) {
                            self.preempt(&task);
                        }
                        false
                    }
                };
                if !stopped {
                    pending += 1;
                }
            }
            if pending == 0 {
                break;
            }
            let mut g = self.sched.stw_lock.lock();
            self.sched.stw_cv.wait_for(&mut g, STW_POLL);
        }
        self.sched.stw_count.fetch_add(1, Ordering::Relaxed);
        log::trace!("world stopped for {reason} in {:?}", start.elapsed());
    }

    pub(crate) fn start_world(&self) {
        if self.sched.stw_owner.load(Ordering::Acquire) != thread_token() {
            throw("start of a world this thread did not stop");
        }
        for slot in self.sched.slots.iter() {
            slot.transition(SlotStatus::Stopped, 0, SlotStatus::Idle, 0);
        }
        {
            let _g = self.sched.stw_lock.lock();
            self.sched.gcwaiting.store(false, Ordering::SeqCst);
            self.sched.stw_owner.store(0, Ordering::Release);
        }
        self.sched.stw_cv.notify_all();
        let queued = !self.sched.global.is_empty()
            || self
                .sched
                .slots
                .iter()
                .any(|s| s.status() == SlotStatus::Idle && !s.runq.is_empty());
        if queued {
            self.wakep();
        }
    }

    /// Park the calling thread's slot until the world restarts.
    fn stop_self(&self, slot: usize) {
        let token = thread_token();
        let s = &self.sched.slots[slot];
        if !s.transition(SlotStatus::Running, token, SlotStatus::Stopped, token) {
            return;
        }
        {
            let mut g = self.sched.stw_lock.lock();
            self.sched.stw_cv.notify_all();
            while self.sched.gcwaiting.load(Ordering::SeqCst) {
                self.sched.stw_cv.wait(&mut g);
            }
        }
        if !s.transition(SlotStatus::Stopped, token, SlotStatus::Running, token) {
            throw_with("slot lost while stopped", |out| {
                let _ = writeln!(out, "slot {slot}: {:?}", s.status());
            });
        }
    }

    pub(crate) fn world_stopped(&self) -> bool {
        self.sched.gcwaiting.load(Ordering::Acquire)
    }

    /// Serve stop and scan requests. A no-op for threads without a slot.
    pub fn safepoint(&self) {
        let Some(slot) = self.current_slot() else {
            return;
        };
        if self.sched.gcwaiting.load(Ordering::Acquire)
            && self.sched.stw_owner.load(Ordering::Acquire) != thread_token()
        {
            self.stop_self(slot);
        }
        let Some(id) = TaskId::from_raw(current().task) else {
            return;
        };
        if let Some(task) = self.tasks.get(id) {
            if task.flags().contains(TaskFlags::SCAN_REQUEST) {
                self.scan_self(&task);
            }
        }
    }

    /// Scan the calling task's own stack for the running cycle.
    pub(crate) fn scan_self(&self, task: &Task) {
        let heap = &self.heap;
        let cycle = heap.gc.cycle();
        if heap.phase() == Phase::Mark && task.scanned_cycle.load(Ordering::Acquire) < cycle {
            let mut gcw = GcWork::new();
            self.scan_stack(heap, task, &mut gcw);
            heap.publish_work(&mut gcw);
            task.scanned_cycle.store(cycle, Ordering::Release);
            log::trace!("task {}: scanned own stack", task.goid());
        }
        task.clear_flags(TaskFlags::SCAN_REQUEST);
    }

    // ── Syscalls ──────────────────────────────────────────────────────

    /// Leave the slot for others while `task` blocks outside the runtime.
    pub(crate) fn enter_syscall(&self, slot: usize, task: &Task) {
        let s = &self.sched.slots[slot];
        task.cas_status(TaskStatus::Running, TaskStatus::Syscall);
        s.syscall_when
            .store(self.heap.nanotime() as u64, Ordering::Relaxed);
        let token = thread_token();
        if !s.transition(SlotStatus::Running, token, SlotStatus::Syscall, token) {
            throw("syscall entered on a slot that was not running");
        }
        update_current(|c| c.slot = NO_SLOT);
    }

    /// Get a slot back after a syscall: the old one if nobody took it,
    /// else any idle one.
    pub(crate) fn exit_syscall(&self, slot: usize, task: &Task) {
        let token = thread_token();
        let s = &self.sched.slots[slot];
        let slot = if s.transition(SlotStatus::Syscall, token, SlotStatus::Running, token) {
            slot
        } else {
            let mut backoff = Duration::from_micros(20);
            loop {
                if let Some(slot) = self.acquire_idle_slot() {
                    break slot;
                }
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(1));
            }
        };
        update_current(|c| c.slot = slot);
        let s = &self.sched.slots[slot];
        s.current.store(task.id().to_raw(), Ordering::Release);
        task.cas_status(TaskStatus::Syscall, TaskStatus::Running);
        // Serve a stop that started while we were out.
        self.safepoint();
    }
}
