//! Execution slots.
//!
//! A worker thread must hold a slot to run task code. The slot carries
//! what belongs to "a processor" rather than a thread: the local run queue
//! and the allocation cache. Slots are handed between threads whenever a
//! worker blocks in a syscall or goes idle.
//!
//! Status and owning thread share one word so that taking a slot away from
//! a thread in a syscall and that thread coming back race on a single CAS.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use heap::SlotCache;
use parking_lot::Mutex;

use crate::{runq::RunQueue, task::TaskId};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle = 0,
    Running = 1,
    Syscall = 2,
    Stopped = 3,
}

impl SlotStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SlotStatus::Running,
            2 => SlotStatus::Syscall,
            3 => SlotStatus::Stopped,
            _ => SlotStatus::Idle,
        }
    }
}

#[inline]
fn pack(status: SlotStatus, owner: u64) -> u64 {
    (owner << 8) | status as u64
}

pub(crate) struct Slot {
    pub id: usize,
    /// Status in the low byte, owning thread's token above it (0 when
    /// unowned).
    state: AtomicU64,
    pub runq: RunQueue,
    /// Locked by the owner around each allocation and by the collector for
    /// handshakes. Never held across a safe point.
    pub cache: Mutex<SlotCache>,
    /// Task running on the slot, raw id.
    pub current: AtomicU64,
    /// Bumped per task switch; the monitor compares it to spot long runs.
    pub sched_tick: AtomicU32,
    pub(crate) monitor_tick: AtomicU32,
    pub(crate) monitor_when: AtomicU64,
    /// Nanotime of syscall entry.
    pub syscall_when: AtomicU64,
}

impl Slot {
    pub(crate) fn new(id: usize, cache: SlotCache) -> Self {
        Self {
            id,
            state: AtomicU64::new(pack(SlotStatus::Idle, 0)),
            runq: RunQueue::new(),
            cache: Mutex::new(cache),
            current: AtomicU64::new(TaskId::NONE_RAW),
            sched_tick: AtomicU32::new(0),
            monitor_tick: AtomicU32::new(0),
            monitor_when: AtomicU64::new(0),
            syscall_when: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn status(&self) -> SlotStatus {
        SlotStatus::from_raw(self.state.load(Ordering::Acquire) as u8)
    }

    #[inline]
    pub(crate) fn owner(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 8
    }

    /// Move from `from` owned by `owner` to `to` owned by `new_owner`.
    #[inline]
    pub(crate) fn transition(
        &self,
        from: SlotStatus,
        owner: u64,
        to: SlotStatus,
        new_owner: u64,
    ) -> bool {
        self.state
            .compare_exchange(
                pack(from, owner),
                pack(to, new_owner),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim an idle slot for the thread with `token`.
    pub(crate) fn try_acquire(&self, token: u64) -> bool {
        self.transition(SlotStatus::Idle, 0, SlotStatus::Running, token)
    }

    /// Give the slot up. The caller must own it and be running.
    pub(crate) fn release(&self, token: u64) {
        self.current.store(TaskId::NONE_RAW, Ordering::Relaxed);
        if !self.transition(SlotStatus::Running, token, SlotStatus::Idle, 0) {
            heap::fatal::throw("released a slot that was not running");
        }
    }

    /// Take the slot from whoever is in a syscall on it.
    pub(crate) fn take_from_syscall(&self, to: SlotStatus) -> bool {
        let cur = self.state.load(Ordering::Acquire);
        SlotStatus::from_raw(cur as u8) == SlotStatus::Syscall
            && self
                .state
                .compare_exchange(cur, pack(to, 0), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        TaskId::from_raw(self.current.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use heap::{Heap, HeapConfig};

    use super::*;

    fn slot() -> Slot {
        let heap = Heap::new(HeapConfig {
            limit: 8 << 20,
            ..HeapConfig::default()
        })
        .unwrap();
        Slot::new(0, heap.new_cache())
    }

    #[test]
    fn acquire_release() {
        let slot = slot();
        assert!(slot.try_acquire(7));
        assert!(!slot.try_acquire(8));
        assert_eq!(slot.owner(), 7);
        assert_eq!(slot.status(), SlotStatus::Running);
        slot.release(7);
        assert_eq!(slot.owner(), 0);
        assert_eq!(slot.status(), SlotStatus::Idle);
        assert!(slot.transition(SlotStatus::Idle, 0, SlotStatus::Stopped, 0));
        assert!(!slot.try_acquire(9));
    }

    #[test]
    fn syscall_return_loses_to_retake() {
        let slot = slot();
        assert!(slot.try_acquire(3));
        assert!(slot.transition(SlotStatus::Running, 3, SlotStatus::Syscall, 3));
        assert!(slot.take_from_syscall(SlotStatus::Idle));
        // Reacquired by another thread that also entered a syscall.
        assert!(slot.try_acquire(4));
        assert!(slot.transition(SlotStatus::Running, 4, SlotStatus::Syscall, 4));
        assert!(!slot.transition(SlotStatus::Syscall, 3, SlotStatus::Running, 3));
        assert!(slot.transition(SlotStatus::Syscall, 4, SlotStatus::Running, 4));
    }
}
