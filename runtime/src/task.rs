//! Task records.
//!
//! Records live in one table and are never freed: a finished task's record
//! goes onto a free list and is reused by a later spawn with a bumped
//! generation, so stale [`TaskId`]s can be told apart from live ones.

use std::{
    fmt,
    future::Future,
    io::Write,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
};

use bitflags::bitflags;
use heap::{Lock, LockRank, fatal::throw_with};

use crate::defer::{Defer, Exception};

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Exception>> + Send>>;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub(crate) const NONE_RAW: u64 = u64::MAX;

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub(crate) fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        (raw != Self::NONE_RAW).then(|| Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        })
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Allocated, never started.
    Idle = 0,
    Runnable = 1,
    Running = 2,
    Syscall = 3,
    Waiting = 4,
    Dead = 5,
    /// Its stack is being moved. Invisible to run queues and stack scans.
    Copystack = 6,
}

/// Set on top of a status while somebody scans the stack. The task cannot
/// change status until it is cleared.
pub(crate) const SCAN: u32 = 0x1000;

impl TaskStatus {
    fn from_raw(raw: u32) -> Self {
        match raw & !SCAN {
            0 => TaskStatus::Idle,
            1 => TaskStatus::Runnable,
            2 => TaskStatus::Running,
            3 => TaskStatus::Syscall,
            4 => TaskStatus::Waiting,
            5 => TaskStatus::Dead,
            _ => TaskStatus::Copystack,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Runtime-internal task, not counted as user work.
        const SYSTEM = 1 << 0;
        /// Give up the slot at the next safe point.
        const PREEMPT = 1 << 1;
        /// Scan your own stack at the next safe point.
        const SCAN_REQUEST = 1 << 2;
        /// Requeue instead of parking when the current poll returns.
        const YIELD = 1 << 3;
        /// Running deferred calls; `recover` is allowed.
        const IN_DEFER = 1 << 4;
        /// A handoff peer left a value in `handoff_value`.
        const HANDOFF = 1 << 5;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None = 0,
    Park,
    Sleep,
    Semaphore,
    Handoff,
    IoWait,
    FinalizerWait,
    SweepWait,
}

impl WaitReason {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => WaitReason::Park,
            2 => WaitReason::Sleep,
            3 => WaitReason::Semaphore,
            4 => WaitReason::Handoff,
            5 => WaitReason::IoWait,
            6 => WaitReason::FinalizerWait,
            7 => WaitReason::SweepWait,
            _ => WaitReason::None,
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────

pub struct Task {
    index: u32,
    generation: AtomicU32,
    status: AtomicU32,
    flags: AtomicU32,
    /// Readied while still running; the worker requeues it instead of
    /// letting it wait.
    pub(crate) notified: AtomicBool,
    wait_reason: AtomicU8,
    /// Number shown in traces and dumps. Never reused.
    goid: AtomicU64,

    pub(crate) stack_lo: AtomicUsize,
    pub(crate) stack_hi: AtomicUsize,
    pub(crate) sp: AtomicUsize,
    /// Innermost frame, 0 when there is none.
    pub(crate) fp: AtomicUsize,
    /// `push_frame` takes the slow path below this. Poisoned to request
    /// preemption.
    pub(crate) stack_guard: AtomicUsize,

    /// Cycle whose stack scan this task has had.
    pub(crate) scanned_cycle: AtomicU64,
    pub(crate) assist_credit: AtomicI64,
    pub(crate) assist_cycle: AtomicU64,

    /// Timer sequence number the task is sleeping on, 0 if none.
    pub(crate) sleep_seq: AtomicU64,
    /// Word passed in by a handoff peer. Scanned as a root.
    pub(crate) handoff_value: AtomicUsize,

    pub(crate) defers: Lock<Vec<Defer>>,
    /// One entry per active `protect`, innermost last.
    pub(crate) panic: Lock<Vec<Option<Exception>>>,
    pub(crate) future: parking_lot::Mutex<Option<TaskFuture>>,
}

impl Task {
    fn new(index: u32) -> Self {
        Self {
            index,
            generation: AtomicU32::new(0),
            status: AtomicU32::new(TaskStatus::Idle as u32),
            flags: AtomicU32::new(0),
            notified: AtomicBool::new(false),
            wait_reason: AtomicU8::new(0),
            goid: AtomicU64::new(0),
            stack_lo: AtomicUsize::new(0),
            stack_hi: AtomicUsize::new(0),
            sp: AtomicUsize::new(0),
            fp: AtomicUsize::new(0),
            stack_guard: AtomicUsize::new(0),
            scanned_cycle: AtomicU64::new(0),
            assist_credit: AtomicI64::new(0),
            assist_cycle: AtomicU64::new(0),
            sleep_seq: AtomicU64::new(0),
            handoff_value: AtomicUsize::new(0),
            defers: Lock::new(LockRank::Leaf, Vec::new()),
            panic: Lock::new(LockRank::Leaf, Vec::new()),
            future: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        TaskId::new(self.index, self.generation.load(Ordering::Acquire))
    }

    #[inline]
    pub fn goid(&self) -> u64 {
        self.goid.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn raw_status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Move from `from` to `to`, waiting out a stack scan. Any other current
    /// status is a runtime defect.
    #[track_caller]
    pub(crate) fn cas_status(&self, from: TaskStatus, to: TaskStatus) {
        let mut spins = 0u32;
        loop {
            match self.status.compare_exchange_weak(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(cur) if cur == from as u32 => {}
                Err(cur) if cur == from as u32 | SCAN => {
                    spins += 1;
                    if spins > 64 {
                        thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Err(cur) => throw_with("bad task status transition", |out| {
                    let _ = writeln!(
                        out,
                        "task {}: {:?} -> {:?}, found {:?} (raw {cur:#x})",
                        self.goid(),
                        from,
                        to,
                        TaskStatus::from_raw(cur)
                    );
                }),
            }
        }
    }

    /// Like [`cas_status`](Self::cas_status) but gives up if the status is
    /// not `from`.
    pub(crate) fn try_cas_status(&self, from: TaskStatus, to: TaskStatus) -> bool {
        loop {
            match self.status.compare_exchange_weak(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) if cur == from as u32 => {}
                Err(cur) if cur == from as u32 | SCAN => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    /// Take the scan bit if the task is not running. Returns the status it
    /// was in.
    pub(crate) fn suspend_for_scan(&self) -> Option<TaskStatus> {
        let cur = self.status.load(Ordering::Acquire);
        if cur & SCAN != 0 {
            return None;
        }
        let status = TaskStatus::from_raw(cur);
        match status {
            TaskStatus::Runnable | TaskStatus::Waiting | TaskStatus::Syscall => self
                .status
                .compare_exchange(cur, cur | SCAN, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| status),
            _ => None,
        }
    }

    pub(crate) fn resume_from_scan(&self) {
        self.status.fetch_and(!SCAN, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_flags(&self, f: TaskFlags) {
        self.flags.fetch_or(f.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flags(&self, f: TaskFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
    }

    /// Clear `f` and report whether any of it was set.
    #[inline]
    pub(crate) fn take_flags(&self, f: TaskFlags) -> bool {
        self.flags.fetch_and(!f.bits(), Ordering::AcqRel) & f.bits() != 0
    }

    pub fn wait_reason(&self) -> WaitReason {
        WaitReason::from_raw(self.wait_reason.load(Ordering::Relaxed))
    }

    pub(crate) fn set_wait_reason(&self, r: WaitReason) {
        self.wait_reason.store(r as u8, Ordering::Relaxed);
    }

    /// Bytes of stack in use.
    pub fn stack_used(&self) -> usize {
        self.stack_hi.load(Ordering::Relaxed) - self.sp.load(Ordering::Relaxed)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_hi.load(Ordering::Relaxed) - self.stack_lo.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("goid", &self.goid())
            .field("status", &self.status())
            .field("wait", &self.wait_reason())
            .field("flags", &self.flags())
            .finish()
    }
}

// ── Task table ────────────────────────────────────────────────────────

pub(crate) struct TaskTable {
    all: Lock<Vec<Arc<Task>>>,
    free: Lock<Vec<u32>>,
    live: AtomicUsize,
    next_goid: AtomicU64,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self {
            all: Lock::new(LockRank::AllTasks, Vec::new()),
            free: Lock::new(LockRank::TaskFree, Vec::new()),
            live: AtomicUsize::new(0),
            next_goid: AtomicU64::new(1),
        }
    }

    /// The record `id` names, if it has not been reused since.
    pub(crate) fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        let task = self.by_index(id.index())?;
        (task.generation.load(Ordering::Acquire) == id.generation).then_some(task)
    }

    pub(crate) fn by_index(&self, index: usize) -> Option<Arc<Task>> {
        self.all.lock().get(index).cloned()
    }

    /// Records ever created. Stable while the world is stopped.
    pub(crate) fn len(&self) -> usize {
        self.all.lock().len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Task>> {
        self.all.lock().clone()
    }

    /// A dead or fresh record, prepared for a new task with `flags`.
    pub(crate) fn alloc(&self, flags: TaskFlags) -> Arc<Task> {
        let reused = self.free.lock().pop();
        let task = match reused.and_then(|i| self.by_index(i as usize)) {
            Some(task) => task,
            None => {
                let mut all = self.all.lock();
                let task = Arc::new(Task::new(all.len() as u32));
                all.push(task.clone());
                task
            }
        };
        task.flags.store(flags.bits(), Ordering::Relaxed);
        task.notified.store(false, Ordering::Relaxed);
        task.set_wait_reason(WaitReason::None);
        task.goid
            .store(self.next_goid.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        task.assist_credit.store(0, Ordering::Relaxed);
        task.sleep_seq.store(0, Ordering::Relaxed);
        task.handoff_value.store(0, Ordering::Relaxed);
        task.defers.lock().clear();
        task.panic.lock().clear();
        self.live.fetch_add(1, Ordering::Relaxed);
        task
    }

    /// Retire a dead task's record. Outstanding ids stop matching it.
    pub(crate) fn release(&self, task: &Task) {
        task.generation.fetch_add(1, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(task.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_pack_and_go_stale() {
        let table = TaskTable::new();
        let t = table.alloc(TaskFlags::empty());
        let id = t.id();
        assert_eq!(TaskId::from_raw(id.to_raw()), Some(id));
        assert_eq!(TaskId::from_raw(TaskId::NONE_RAW), None);
        assert!(table.get(id).is_some());

        t.cas_status(TaskStatus::Idle, TaskStatus::Dead);
        table.release(&t);
        assert!(table.get(id).is_none());
        let again = table.alloc(TaskFlags::SYSTEM);
        assert_eq!(again.id().index(), id.index());
        assert_ne!(again.id(), id);
        assert!(again.flags().contains(TaskFlags::SYSTEM));
        assert_eq!(table.live(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn scan_bit_blocks_transitions() {
        let table = TaskTable::new();
        let t = table.alloc(TaskFlags::empty());
        assert!(t.suspend_for_scan().is_none(), "idle tasks have no stack");
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        assert_eq!(t.suspend_for_scan(), Some(TaskStatus::Runnable));
        assert!(t.suspend_for_scan().is_none());
        assert_eq!(t.status(), TaskStatus::Runnable);

        let t2 = t.clone();
        let h = thread::spawn(move || t2.cas_status(TaskStatus::Runnable, TaskStatus::Running));
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(t.status(), TaskStatus::Runnable);
        t.resume_from_scan();
        h.join().unwrap();
        assert_eq!(t.status(), TaskStatus::Running);
        assert!(!t.try_cas_status(TaskStatus::Waiting, TaskStatus::Runnable));
    }

    #[test]
    fn flags() {
        let table = TaskTable::new();
        let t = table.alloc(TaskFlags::empty());
        t.set_flags(TaskFlags::PREEMPT | TaskFlags::YIELD);
        assert!(t.take_flags(TaskFlags::YIELD));
        assert!(!t.take_flags(TaskFlags::YIELD));
        assert!(t.flags().contains(TaskFlags::PREEMPT));
        t.clear_flags(TaskFlags::PREEMPT);
        assert!(t.flags().is_empty());
    }
}
