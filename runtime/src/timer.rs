//! Timers.
//!
//! One heap of deadlines for the whole runtime. A timer belongs to a
//! sleeping task and is identified by a sequence number stored in the task,
//! so a timer that outlived its sleep fires into nothing.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use heap::{Lock, LockRank};

use crate::task::TaskId;

pub(crate) struct Timers {
    heap: Lock<BinaryHeap<Reverse<(Instant, u64, u64)>>>,
    next_seq: AtomicU64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            heap: Lock::new(LockRank::Timers, BinaryHeap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Arrange for `task` to come up at `when`. Returns the timer's sequence
    /// number, never 0.
    pub(crate) fn add(&self, when: Instant, task: TaskId) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Reverse((when, seq, task.to_raw())));
        seq
    }

    /// Remove every timer due at `now` and return them.
    pub(crate) fn expired(&self, now: Instant) -> Vec<(u64, TaskId)> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(&Reverse((when, seq, raw))) = heap.peek() {
            if when > now {
                break;
            }
            heap.pop();
            due.extend(TaskId::from_raw(raw).map(|id| (seq, id)));
        }
        due
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse((when, ..))| *when)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn expire_in_deadline_order() {
        let timers = Timers::new();
        let now = Instant::now();
        let a = timers.add(now + Duration::from_millis(30), TaskId::new(1, 0));
        let b = timers.add(now + Duration::from_millis(10), TaskId::new(2, 0));
        let c = timers.add(now + Duration::from_secs(60), TaskId::new(3, 0));
        assert!(a != 0 && b != a && c != b);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));

        assert!(timers.expired(now).is_empty());
        let due = timers.expired(now + Duration::from_millis(40));
        assert_eq!(due, vec![(b, TaskId::new(2, 0)), (a, TaskId::new(1, 0))]);
        assert_eq!(timers.len(), 1);
    }
}
