//! The mutator side as the collector sees it.

use parking_lot::Mutex;

use crate::{Heap, HeapInner, cache::SlotCache, gc::work::GcWork};

/// Where a root lives, for heap dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Global,
    /// A stack slot of the given task.
    Stack(u64),
    /// A deferred call argument of the given task.
    Defer(u64),
    Finalizer,
    Other,
}

impl RootKind {
    pub fn code(self) -> (u64, u64) {
        match self {
            RootKind::Global => (0, 0),
            RootKind::Stack(t) => (1, t),
            RootKind::Defer(t) => (2, t),
            RootKind::Finalizer => (3, 0),
            RootKind::Other => (4, 0),
        }
    }

    pub fn from_code(code: u64, task: u64) -> Self {
        match code {
            0 => RootKind::Global,
            1 => RootKind::Stack(task),
            2 => RootKind::Defer(task),
            3 => RootKind::Finalizer,
            _ => RootKind::Other,
        }
    }
}

/// Everything the collector needs from whoever runs the mutators.
///
/// Implementations must make [`stop_the_world`](World::stop_the_world)
/// return only once no mutator can run, and must treat a slot whose owner
/// is the calling thread as already stopped.
pub trait World: Send + Sync {
    fn stop_the_world(&self, reason: &'static str);

    fn start_the_world(&self);

    /// Run `f` once on every slot's cache and return after all of them did.
    /// A cache is never used by its slot and by `f` at the same time.
    fn handshake(&self, f: &(dyn Fn(&mut SlotCache) + Sync));

    /// Number of root jobs this cycle. Called with the world stopped.
    fn root_jobs(&self) -> usize;

    /// Shade everything root job `job` refers to.
    fn mark_root(&self, job: usize, heap: &HeapInner, gcw: &mut GcWork);

    /// Visit every root for diagnostics. World stopped.
    fn visit_roots(&self, _f: &mut dyn FnMut(RootKind, usize, usize)) {}

    /// Wake up to `n` background mark workers.
    fn mark_workers(&self, _n: usize) {}

    /// Called by collector loops that wait on other threads. Threads that
    /// own a slot must serve stop requests here.
    fn safepoint(&self) {}

    fn cycle_done(&self, _cycle: u64) {}

    fn nprocs(&self) -> usize;
}

/// A world of explicitly driven slot caches with a plain root set. The
/// caller promises that no cache is in use while a collection runs on
/// another thread.
pub struct LocalWorld {
    caches: Vec<Mutex<SlotCache>>,
    roots: Mutex<Vec<usize>>,
}

impl LocalWorld {
    pub fn new(heap: &Heap, nslots: usize) -> Self {
        Self {
            caches: (0..nslots.max(1))
                .map(|_| Mutex::new(heap.new_cache()))
                .collect(),
            roots: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cache<R>(&self, slot: usize, f: impl FnOnce(&mut SlotCache) -> R) -> R {
        f(&mut self.caches[slot].lock())
    }

    pub fn add_root(&self, ptr: usize) {
        self.roots.lock().push(ptr);
    }

    pub fn remove_root(&self, ptr: usize) {
        let mut roots = self.roots.lock();
        if let Some(pos) = roots.iter().position(|&r| r == ptr) {
            roots.swap_remove(pos);
        }
    }

    pub fn clear_roots(&self) {
        self.roots.lock().clear();
    }

    pub fn roots(&self) -> Vec<usize> {
        self.roots.lock().clone()
    }
}

impl World for LocalWorld {
    fn stop_the_world(&self, reason: &'static str) {
        log::trace!("local world stop: {reason}");
    }

    fn start_the_world(&self) {}

    fn handshake(&self, f: &(dyn Fn(&mut SlotCache) + Sync)) {
        for cache in &self.caches {
            f(&mut cache.lock());
        }
    }

    fn root_jobs(&self) -> usize {
        1
    }

    fn mark_root(&self, _job: usize, heap: &HeapInner, gcw: &mut GcWork) {
        let roots = self.roots.lock().clone();
        for ptr in roots {
            heap.shade(ptr, gcw);
        }
    }

    fn visit_roots(&self, f: &mut dyn FnMut(RootKind, usize, usize)) {
        for &ptr in self.roots.lock().iter() {
            f(RootKind::Global, 0, ptr);
        }
    }

    fn nprocs(&self) -> usize {
        self.caches.len()
    }
}
