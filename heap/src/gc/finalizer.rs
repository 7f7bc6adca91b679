//! Cleanup callbacks.
//!
//! Registered cleanups are specials keyed by object address. While marking,
//! every object with a special has its referents (and the callback argument)
//! marked, but not the object itself. When the sweeper finds such an object
//! unmarked it keeps it alive one more cycle and moves the record to the
//! finalizer queue, which is itself a root until a single drain task has run
//! the callback.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        OnceLock,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use crate::lock::{Lock, LockRank};

/// A cleanup routine. Receives the object and the registered argument.
pub type CleanupFn = fn(obj: usize, arg: usize);

/// Identifies one registration for [`cancel`](Specials::cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupHandle {
    obj: usize,
    id: u64,
}

impl CleanupHandle {
    pub fn object(&self) -> usize {
        self.obj
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Cleanup {
    id: u64,
    pub func: CleanupFn,
    /// Argument word. Kept alive as a pointer if it points into the heap.
    pub arg: usize,
}

pub struct Specials {
    map: Lock<BTreeMap<usize, Vec<Cleanup>>>,
    next_id: AtomicU64,
    count: AtomicUsize,
}

impl Default for Specials {
    fn default() -> Self {
        Self::new()
    }
}

impl Specials {
    pub fn new() -> Self {
        Self {
            map: Lock::new(LockRank::Specials, BTreeMap::new()),
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, obj: usize, func: CleanupFn, arg: usize) -> CleanupHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map
            .lock()
            .entry(obj)
            .or_default()
            .push(Cleanup { id, func, arg });
        self.count.fetch_add(1, Ordering::Relaxed);
        CleanupHandle { obj, id }
    }

    /// Remove a registration. False if it already ran or was cancelled.
    pub fn cancel(&self, handle: CleanupHandle) -> bool {
        let mut map = self.map.lock();
        let Some(list) = map.get_mut(&handle.obj) else {
            return false;
        };
        let Some(pos) = list.iter().position(|c| c.id == handle.id) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            map.remove(&handle.obj);
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Relaxed) == 0
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn has_cleanup(&self, obj: usize) -> bool {
        !self.is_empty() && self.map.lock().contains_key(&obj)
    }

    /// Remove every special on an object in `[from, to)` for which `dead`
    /// holds.
    pub fn take_dead(
        &self,
        from: usize,
        to: usize,
        mut dead: impl FnMut(usize) -> bool,
    ) -> Vec<(usize, Vec<Cleanup>)> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut map = self.map.lock();
        let victims: Vec<usize> = map
            .range(from..to)
            .map(|(&obj, _)| obj)
            .filter(|&obj| dead(obj))
            .collect();
        let mut out = Vec::with_capacity(victims.len());
        for obj in victims {
            if let Some(list) = map.remove(&obj) {
                self.count.fetch_sub(list.len(), Ordering::Relaxed);
                out.push((obj, list));
            }
        }
        out
    }

    /// Visit every registration. `f` must not touch the specials.
    pub fn for_each(&self, mut f: impl FnMut(usize, &Cleanup)) {
        let map = self.map.lock();
        for (&obj, list) in map.iter() {
            for c in list {
                f(obj, c);
            }
        }
    }

    /// Registrations on objects in `[from, to)`.
    pub fn in_range(&self, from: usize, to: usize) -> Vec<(usize, Cleanup)> {
        let map = self.map.lock();
        map.range(from..to)
            .flat_map(|(&obj, list)| list.iter().map(move |c| (obj, *c)))
            .collect()
    }
}

/// A cleanup whose object died, waiting for the drain task.
#[derive(Debug, Clone, Copy)]
pub struct PendingCleanup {
    pub obj: usize,
    pub func: CleanupFn,
    pub arg: usize,
}

type WakeHook = Box<dyn Fn() + Send + Sync>;

pub struct FinalizerQueue {
    queue: Lock<VecDeque<PendingCleanup>>,
    wake: OnceLock<WakeHook>,
    queued: AtomicU64,
    ran: AtomicU64,
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self {
            queue: Lock::new(LockRank::Finalizer, VecDeque::new()),
            wake: OnceLock::new(),
            queued: AtomicU64::new(0),
            ran: AtomicU64::new(0),
        }
    }

    /// Called whenever work is queued. Installed once by the drain task's
    /// owner.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.wake.set(Box::new(hook));
    }

    pub fn push(&self, items: impl IntoIterator<Item = PendingCleanup>) {
        let n = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.extend(items);
            queue.len() - before
        };
        if n == 0 {
            return;
        }
        self.queued.fetch_add(n as u64, Ordering::Relaxed);
        log::trace!("queued {n} cleanups");
        if let Some(wake) = self.wake.get() {
            wake();
        }
    }

    pub fn pop(&self) -> Option<PendingCleanup> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run queued callbacks in order until the queue is empty. Callbacks run
    /// without any runtime lock held.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while let Some(item) = self.pop() {
            (item.func)(item.obj, item.arg);
            self.ran.fetch_add(1, Ordering::Relaxed);
            n += 1;
        }
        n
    }

    /// Copy of the queue, oldest first.
    pub fn pending(&self) -> Vec<PendingCleanup> {
        self.queue.lock().iter().copied().collect()
    }

    /// Queued objects and arguments, for root marking.
    pub fn for_each_root(&self, mut f: impl FnMut(usize)) {
        let queue = self.queue.lock();
        for item in queue.iter() {
            f(item.obj);
            f(item.arg);
        }
    }

    pub fn total_queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn total_run(&self) -> u64 {
        self.ran.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count(_obj: usize, arg: usize) {
        CALLS.fetch_add(arg, Ordering::SeqCst);
    }

    fn noop(_: usize, _: usize) {}

    #[test]
    fn cancel_removes_only_its_registration() {
        let s = Specials::new();
        let a = s.register(0x1000, noop, 0);
        let b = s.register(0x1000, noop, 1);
        assert_eq!(s.len(), 2);
        assert!(s.cancel(a));
        assert!(!s.cancel(a));
        assert!(s.has_cleanup(0x1000));
        assert!(s.cancel(b));
        assert!(!s.has_cleanup(0x1000));
        assert!(s.is_empty());
    }

    #[test]
    fn take_dead_respects_range_and_predicate() {
        let s = Specials::new();
        s.register(0x1000, noop, 0);
        s.register(0x2000, noop, 0);
        s.register(0x3000, noop, 0);
        let dead = s.take_dead(0x1000, 0x3000, |obj| obj != 0x2000);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0, 0x1000);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn queue_runs_each_cleanup_once_and_wakes() {
        let q = FinalizerQueue::new();
        let woken = std::sync::Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        q.set_wake_hook(move || {
            w.fetch_add(1, Ordering::SeqCst);
        });
        q.push([
            PendingCleanup {
                obj: 0x10,
                func: count,
                arg: 1,
            },
            PendingCleanup {
                obj: 0x20,
                func: count,
                arg: 10,
            },
        ]);
        q.push(Vec::new());
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        let mut roots = Vec::new();
        q.for_each_root(|p| roots.push(p));
        assert_eq!(roots, vec![0x10, 1, 0x20, 10]);

        assert_eq!(q.run_pending(), 2);
        assert_eq!(q.run_pending(), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 11);
        assert_eq!(q.total_run(), 2);
    }
}
