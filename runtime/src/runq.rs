//! Run queues.
//!
//! Each slot has a fixed ring that only its owner pushes to, plus a
//! `run_next` cell for a task that should run as soon as the current one
//! yields the slot. Thieves take half of a ring with one CAS on its head.
//! Overflow goes to the global queue.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use heap::{Lock, LockRank};

use crate::task::TaskId;

pub const RUNQ_LEN: usize = 256;

pub struct RunQueue {
    head: AtomicU32,
    tail: AtomicU32,
    ring: [AtomicU64; RUNQ_LEN],
    next: AtomicU64,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            ring: std::array::from_fn(|_| AtomicU64::new(TaskId::NONE_RAW)),
            next: AtomicU64::new(TaskId::NONE_RAW),
        }
    }

    /// Owner only. With `next`, `id` takes the run-next cell and whatever
    /// was there goes to the tail.
    pub fn push(&self, id: TaskId, next: bool, global: &GlobalQueue) {
        let mut id = id;
        if next {
            let old = self.next.swap(id.to_raw(), Ordering::AcqRel);
            match TaskId::from_raw(old) {
                Some(old) => id = old,
                None => return,
            }
        }
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if t.wrapping_sub(h) < RUNQ_LEN as u32 {
                self.ring[t as usize % RUNQ_LEN].store(id.to_raw(), Ordering::Relaxed);
                self.tail.store(t.wrapping_add(1), Ordering::Release);
                return;
            }
            if self.push_slow(id, h, t, global) {
                return;
            }
            // A thief made room; retry the fast path.
        }
    }

    /// Move half the ring and `id` to the global queue.
    fn push_slow(&self, id: TaskId, h: u32, t: u32, global: &GlobalQueue) -> bool {
        let n = t.wrapping_sub(h) / 2;
        let mut batch = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            let raw = self.ring[h.wrapping_add(i) as usize % RUNQ_LEN].load(Ordering::Relaxed);
            batch.extend(TaskId::from_raw(raw));
        }
        if self
            .head
            .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        batch.push(id);
        global.push_batch(batch);
        true
    }

    /// Owner only. `run_next` first, then the head of the ring.
    pub fn pop(&self) -> Option<TaskId> {
        let next = self.next.load(Ordering::Relaxed);
        if next != TaskId::NONE_RAW
            && self
                .next
                .compare_exchange(next, TaskId::NONE_RAW, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return TaskId::from_raw(next);
        }
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if t == h {
                return None;
            }
            let raw = self.ring[h as usize % RUNQ_LEN].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(h, h.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return TaskId::from_raw(raw);
            }
        }
    }

    /// Take half of the queue into `out`. With `steal_next`, an otherwise
    /// empty queue gives up its run-next task.
    fn grab(&self, out: &mut Vec<TaskId>, steal_next: bool) -> usize {
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            let avail = t.wrapping_sub(h);
            let n = avail - avail / 2;
            if n == 0 {
                if steal_next {
                    let next = self.next.load(Ordering::Acquire);
                    if next != TaskId::NONE_RAW
                        && self
                            .next
                            .compare_exchange(
                                next,
                                TaskId::NONE_RAW,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        out.extend(TaskId::from_raw(next));
                        return 1;
                    }
                }
                return 0;
            }
            // Read an inconsistent head and tail.
            if n > (RUNQ_LEN / 2) as u32 {
                continue;
            }
            let start = out.len();
            for i in 0..n {
                let raw = self.ring[h.wrapping_add(i) as usize % RUNQ_LEN].load(Ordering::Relaxed);
                out.extend(TaskId::from_raw(raw));
            }
            if self
                .head
                .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return n as usize;
            }
            out.truncate(start);
        }
    }

    /// Steal half of `victim` into this (empty, owned) queue and return one
    /// task to run.
    pub fn steal_from(&self, victim: &RunQueue, steal_next: bool) -> Option<TaskId> {
        let mut batch = Vec::new();
        if victim.grab(&mut batch, steal_next) == 0 {
            return None;
        }
        let first = batch.pop();
        let t = self.tail.load(Ordering::Relaxed);
        for (i, id) in batch.iter().enumerate() {
            self.ring[t.wrapping_add(i as u32) as usize % RUNQ_LEN]
                .store(id.to_raw(), Ordering::Relaxed);
        }
        self.tail
            .store(t.wrapping_add(batch.len() as u32), Ordering::Release);
        first
    }

    /// Queued tasks, `run_next` included. Racy unless owner.
    pub fn len(&self) -> usize {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        let ring = t.wrapping_sub(h) as usize;
        ring.min(RUNQ_LEN) + usize::from(self.next.load(Ordering::Acquire) != TaskId::NONE_RAW)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Global queue ──────────────────────────────────────────────────────

pub struct GlobalQueue {
    queue: Lock<VecDeque<TaskId>>,
    len: AtomicUsize,
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalQueue {
    pub fn new() -> Self {
        Self {
            queue: Lock::new(LockRank::Sched, VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, id: TaskId) {
        let mut q = self.queue.lock();
        q.push_back(id);
        self.len.store(q.len(), Ordering::Release);
    }

    pub fn push_batch(&self, batch: Vec<TaskId>) {
        let mut q = self.queue.lock();
        q.extend(batch);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Take one task to run and move up to `max` more into `local`. The
    /// batch is the queue's fair share for one of `nslots` slots.
    pub fn take(&self, local: &RunQueue, nslots: usize, max: usize) -> Option<TaskId> {
        if self.is_empty() {
            return None;
        }
        let mut q = self.queue.lock();
        let share = (q.len() / nslots.max(1) + 1).min(max).min(RUNQ_LEN / 2);
        let first = q.pop_front()?;
        let mut moved = Vec::with_capacity(share.saturating_sub(1));
        for _ in 1..share {
            match q.pop_front() {
                Some(id) => moved.push(id),
                None => break,
            }
        }
        self.len.store(q.len(), Ordering::Release);
        drop(q);
        for id in moved {
            local.push(id, false, self);
        }
        Some(first)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: u32) -> TaskId {
        TaskId::new(i, 0)
    }

    #[test]
    fn fifo_with_run_next() {
        let g = GlobalQueue::new();
        let q = RunQueue::new();
        q.push(id(1), false, &g);
        q.push(id(2), false, &g);
        q.push(id(3), true, &g);
        q.push(id(4), true, &g);
        assert_eq!(q.len(), 4);
        assert_eq!(q.pop(), Some(id(4)));
        assert_eq!(q.pop(), Some(id(1)));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn overflow_moves_half_to_global() {
        let g = GlobalQueue::new();
        let q = RunQueue::new();
        for i in 0..=RUNQ_LEN as u32 {
            q.push(id(i), false, &g);
        }
        assert_eq!(g.len(), RUNQ_LEN / 2 + 1);
        assert_eq!(q.len(), RUNQ_LEN / 2);
        // Oldest tasks went to the global queue.
        assert_eq!(q.pop(), Some(id(RUNQ_LEN as u32 / 2)));
    }

    #[test]
    fn steal_takes_half() {
        let g = GlobalQueue::new();
        let victim = RunQueue::new();
        let thief = RunQueue::new();
        for i in 0..10 {
            victim.push(id(i), false, &g);
        }
        let got = thief.steal_from(&victim, false);
        assert_eq!(got, Some(id(4)));
        assert_eq!(thief.len(), 4);
        assert_eq!(victim.len(), 5);
        assert_eq!(thief.pop(), Some(id(0)));
        assert_eq!(victim.pop(), Some(id(5)));
    }

    #[test]
    fn steal_run_next_only_when_asked() {
        let g = GlobalQueue::new();
        let victim = RunQueue::new();
        let thief = RunQueue::new();
        victim.push(id(7), true, &g);
        assert_eq!(thief.steal_from(&victim, false), None);
        assert_eq!(thief.steal_from(&victim, true), Some(id(7)));
        assert!(victim.is_empty());
    }

    #[test]
    fn global_take_moves_a_share() {
        let g = GlobalQueue::new();
        let local = RunQueue::new();
        g.push_batch((0..20).map(id).collect());
        let first = g.take(&local, 4, RUNQ_LEN);
        assert_eq!(first, Some(id(0)));
        assert_eq!(local.len(), 5);
        assert_eq!(g.len(), 14);
    }

    #[test]
    fn concurrent_steals_lose_nothing() {
        use std::{sync::Arc, thread};

        let g = Arc::new(GlobalQueue::new());
        let victim = Arc::new(RunQueue::new());
        for i in 0..200 {
            victim.push(id(i), false, &g);
        }
        let thieves: Vec<_> = (0..4)
            .map(|_| {
                let victim = victim.clone();
                thread::spawn(move || {
                    let mine = RunQueue::new();
                    let mut got = Vec::new();
                    while let Some(t) = mine.steal_from(&victim, false) {
                        got.push(t);
                        while let Some(t) = mine.pop() {
                            got.push(t);
                        }
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<u32> = thieves
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|t| t.index() as u32)
            .collect();
        while let Some(t) = victim.pop() {
            all.push(t.index() as u32);
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }
}
