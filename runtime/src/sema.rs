//! Counting semaphore for tasks.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
};

use heap::{Lock, LockRank};

use crate::{
    context::TaskContext,
    task::{TaskId, WaitReason},
};

/// Waiters park instead of blocking their worker. Not FIFO: a task that
/// arrives while a woken waiter is on its way may take the unit first, and
/// the waiter queues again.
pub struct Semaphore {
    count: AtomicU32,
    waiters: Lock<VecDeque<TaskId>>,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
            waiters: Lock::new(LockRank::Leaf, VecDeque::new()),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut n = self.count.load(Ordering::Acquire);
        while n > 0 {
            match self
                .count
                .compare_exchange_weak(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(cur) => n = cur,
            }
        }
        false
    }

    pub async fn acquire(&self, cx: &TaskContext) {
        let me = cx.id();
        loop {
            if self.try_acquire() {
                return;
            }
            {
                let mut waiters = self.waiters.lock();
                // A release between the first try and taking the lock.
                if self.try_acquire() {
                    return;
                }
                if !waiters.contains(&me) {
                    waiters.push_back(me);
                }
            }
            cx.park(WaitReason::Semaphore).await;
            self.waiters.lock().retain(|&id| id != me);
        }
    }

    pub fn release(&self, cx: &TaskContext) {
        self.count.fetch_add(1, Ordering::AcqRel);
        let next = self.waiters.lock().pop_front();
        if let Some(id) = next {
            cx.ready(id);
        }
    }

    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.available())
            .finish_non_exhaustive()
    }
}
