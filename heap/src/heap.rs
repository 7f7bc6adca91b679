//! Size-class segregated heap with a concurrent mark-sweep collector.
//!
//! Small objects are rounded up to a size class and carved out of spans
//! that slots cache privately; large objects get a span of their own.
//! Allocation, mark and pointer metadata all live in side tables, so
//! objects carry no header.
//!
//! This crate is decoupled from any scheduler. Consumers provide:
//! - A [`World`] that can stop mutators, hand the collector each slot's
//!   [`SlotCache`] and enumerate roots.
//! - A pointer map per allocation saying which words hold pointers.

use std::{
    collections::HashMap,
    io::Write,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    cache::{PtrMap, SlotCache, TINY_CLASS},
    central::{Central, LargeSpans},
    error::AllocError,
    fatal::{throw, throw_with},
    gc::{
        Collector, Phase, World,
        finalizer::{CleanupFn, CleanupHandle, FinalizerQueue, Specials},
        work::GcWork,
    },
    pageheap::PageHeap,
    sizeclass::{NUM_SPAN_CLASSES, PAGE_SIZE, SpanClass, WORD},
    span::{SpanLocation, SpanPtr, SpanState},
    stats::HeapStats,
};

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Address space reserved for the heap. Growth past it is out of memory.
    pub limit: usize,
    /// Heap growth between cycles in percent. Negative disables the pacer.
    pub gc_percent: i32,
    /// Execution slots sharing the heap, for the CPU limiter.
    pub procs: usize,
    /// Pointers to free pages or unallocated objects are fatal while
    /// marking. When off they are ignored.
    pub invalid_ptr_check: bool,
    /// Log a line per cycle at info level.
    pub gc_trace: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            limit: 1 << 30, // 1 GiB
            gc_percent: 100,
            procs: 1,
            invalid_ptr_check: true,
            gc_trace: false,
        }
    }
}

/// An allocated object as [`HeapInner::find_object`] sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub base: usize,
    pub size: usize,
    pub span: SpanPtr,
    pub noscan: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    #[error("span {base:#x} is on {count} lists")]
    Duplicated { base: usize, count: usize },
    #[error("in-use span {base:#x} is on no list")]
    Dropped { base: usize },
    #[error("span {base:#x} is on a list but its location says {location:?}")]
    Misfiled { base: usize, location: SpanLocation },
    #[error("span {base:#x} has {counted} objects allocated but claims {claimed}")]
    Miscounted {
        base: usize,
        counted: usize,
        claimed: usize,
    },
}

/// Where the in-use spans are, per [`HeapInner::verify_span_accounting`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanAccounting {
    pub central: usize,
    pub cached: usize,
    pub large: usize,
    pub manual: usize,
}

// ── HeapInner ─────────────────────────────────────────────────────────

pub struct HeapInner {
    pub config: HeapConfig,
    pub pages: PageHeap,
    pub(crate) central: Box<[Central]>,
    pub(crate) large: LargeSpans,
    pub stats: HeapStats,
    pub gc: Collector,
    pub specials: Specials,
    pub finq: FinalizerQueue,
    next_slot: AtomicU32,
    epoch: Instant,
}

impl HeapInner {
    pub fn new(config: HeapConfig) -> Result<Self, AllocError> {
        let pages = PageHeap::new(config.limit)?;
        let central = (0..NUM_SPAN_CLASSES)
            .map(|i| Central::new(SpanClass::from_raw(i as u8)))
            .collect();
        log::debug!(
            "heap: limit {} bytes, gc percent {}, {} procs",
            pages.limit(),
            config.gc_percent,
            config.procs
        );
        Ok(Self {
            gc: Collector::new(config.gc_percent, config.procs, 0),
            config,
            pages,
            central,
            large: LargeSpans::new(),
            stats: HeapStats::new(),
            specials: Specials::new(),
            finq: FinalizerQueue::new(),
            next_slot: AtomicU32::new(0),
            epoch: Instant::now(),
        })
    }

    /// Monotonic nanoseconds since the heap was created.
    #[inline]
    pub fn nanotime(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    /// Set the pointer bits of the words of `[obj, obj + elemsize)`. Words
    /// past `size` never hold pointers.
    pub(crate) fn set_pointer_bits(
        &self,
        obj: usize,
        elemsize: usize,
        size: usize,
        ptrs: PtrMap<'_>,
    ) {
        let used = size.div_ceil(WORD);
        for word in 0..elemsize / WORD {
            let addr = obj + word * WORD;
            if let Some(arena) = self.pages.arena_of(addr) {
                arena.set_pointer(addr, word < used && ptrs.is_pointer(word));
            }
        }
    }

    /// The allocated object containing `addr`, if any.
    pub fn find_object(&self, addr: usize) -> Option<ObjectInfo> {
        let span = self.pages.span_of(addr)?;
        if span.state() != SpanState::InUse {
            return None;
        }
        let base = span.object_addr(span.object_index(addr));
        if !self.pages.arena_of(base)?.is_allocated(base) {
            return None;
        }
        Some(ObjectInfo {
            base,
            size: span.elemsize(),
            span,
            noscan: span.spanclass().noscan(),
        })
    }

    /// Run `func(obj, arg)` on the finalizer task once `obj` is
    /// unreachable. `obj` stays allocated until the callback has run.
    pub fn register_cleanup(&self, obj: usize, func: CleanupFn, arg: usize) -> CleanupHandle {
        let Some(info) = self.find_object(obj) else {
            throw_with("cleanup registered on a pointer outside the heap", |out| {
                let _ = writeln!(out, "pointer {obj:#x}");
            });
        };
        // Tiny objects share a block, so theirs are keyed by their own
        // address inside it.
        let tiny = info.noscan && info.span.spanclass().sizeclass() == TINY_CLASS;
        if info.base != obj && !tiny {
            throw_with("cleanup pointer not at the start of an object", |out| {
                let _ = writeln!(out, "pointer {obj:#x}, object {:#x}", info.base);
            });
        }
        if self.find_object(arg).is_some_and(|a| a.base == obj) {
            throw("cleanup argument is the object itself, it would never run");
        }
        // A dead object in an unswept span must not be revived by this.
        self.ensure_swept(info.span);
        let handle = self.specials.register(obj, func, arg);
        if self.gc.phase().barrier_enabled() {
            // The specials root job may already have run this cycle.
            let mut gcw = GcWork::new();
            self.shade_root(arg, &mut gcw);
            self.publish_work(&mut gcw);
        }
        handle
    }

    /// Remove a cleanup. False if it already ran, is queued to run, or was
    /// cancelled before.
    pub fn cancel_cleanup(&self, handle: CleanupHandle) -> bool {
        self.specials.cancel(handle)
    }

    /// Named counters for external consumption.
    pub fn metrics(&self) -> Vec<(&'static str, u64)> {
        let snap = self.stats.snapshot();
        let pages = |n: &AtomicUsize| (n.load(Ordering::Relaxed) * PAGE_SIZE) as u64;
        let c = &self.pages.counters;
        vec![
            ("/heap/bytes-in-use", snap.bytes_in_use),
            ("/heap/objects", snap.objects),
            ("/heap/allocs", snap.total_allocs),
            ("/heap/frees", snap.total_frees),
            ("/heap/bytes-committed", c.committed.load(Ordering::Relaxed) as u64),
            ("/heap/bytes-free", pages(&c.free)),
            ("/heap/bytes-released", pages(&c.released)),
            ("/heap/stack-bytes", pages(&c.manual)),
            ("/gc/cycles", snap.cycles),
            ("/gc/forced-cycles", snap.forced_cycles),
            ("/gc/pause-total-ns", snap.pause_total_ns),
            ("/gc/last-pause-ns", snap.last_pause_ns),
            ("/gc/max-pause-ns", snap.max_pause_ns),
            ("/gc/heap-goal", self.gc.pacer.goal()),
            ("/gc/heap-live", snap.heap_live),
            ("/gc/heap-marked", snap.heap_marked),
            ("/gc/assist-ns", snap.assist_ns),
            ("/gc/bg-mark-ns", snap.bg_mark_ns),
            ("/gc/limiter-overflow-ns", self.gc.limiter.overflow()),
            ("/gc/finalizers-queued", self.finq.total_queued()),
            ("/gc/finalizers-run", self.finq.total_run()),
        ]
    }

    /// Collect, then return every free page to the OS. Returns the bytes
    /// released.
    pub fn free_os_memory(&self, world: &dyn World) -> usize {
        self.run_cycle_blocking(world);
        let released = self.pages.scavenge(usize::MAX);
        log::info!("released {released} bytes to the OS");
        released
    }

    /// Check that every in-use span is on exactly one of: a central list, a
    /// slot's cache, the large list. Stops the world.
    pub fn verify_span_accounting(
        &self,
        world: &dyn World,
    ) -> Result<SpanAccounting, AccountingError> {
        world.stop_the_world("span accounting");
        let result = self.verify_span_accounting_stopped(world);
        world.start_the_world();
        result
    }

    fn verify_span_accounting_stopped(
        &self,
        world: &dyn World,
    ) -> Result<SpanAccounting, AccountingError> {
        let mut seen: HashMap<usize, (usize, bool)> = HashMap::new();
        let mut file = |span: SpanPtr, ok: bool| {
            let e = seen.entry(span.base()).or_insert((0, true));
            e.0 += 1;
            e.1 &= ok;
        };
        for central in self.central.iter() {
            central.for_each(|span| file(span, span.location() == SpanLocation::Central));
        }
        self.large
            .for_each(|span| file(span, span.location() == SpanLocation::Large));
        let cached = Mutex::new(Vec::new());
        world.handshake(&|cache| {
            let id = cache.id();
            cached
                .lock()
                .extend(cache.cached_spans().map(|span| (span, id)));
        });
        for (span, id) in cached.into_inner() {
            file(span, span.location() == SpanLocation::Cached(id));
        }

        let mut report = SpanAccounting::default();
        for span in self.pages.spans() {
            let base = span.base();
            match span.state() {
                SpanState::Manual => {
                    report.manual += 1;
                    continue;
                }
                SpanState::Dead => continue,
                SpanState::InUse => {}
            }
            match seen.get(&base) {
                None => return Err(AccountingError::Dropped { base }),
                Some(&(count, _)) if count > 1 => {
                    return Err(AccountingError::Duplicated { base, count });
                }
                Some(&(_, false)) => {
                    return Err(AccountingError::Misfiled {
                        base,
                        location: span.location(),
                    });
                }
                Some(_) => {}
            }
            let counted = (0..span.nelems())
                .filter(|&i| {
                    let obj = span.object_addr(i);
                    self.pages
                        .arena_of(obj)
                        .is_some_and(|a| a.is_allocated(obj))
                })
                .count();
            if counted != span.alloc_count() {
                return Err(AccountingError::Miscounted {
                    base,
                    counted,
                    claimed: span.alloc_count(),
                });
            }
            match span.location() {
                SpanLocation::Central => report.central += 1,
                SpanLocation::Cached(_) => report.cached += 1,
                SpanLocation::Large => report.large += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    /// Every allocated object in `span`.
    pub fn objects_in(&self, span: SpanPtr, mut f: impl FnMut(usize)) {
        for i in 0..span.nelems() {
            let obj = span.object_addr(i);
            if self
                .pages
                .arena_of(obj)
                .is_some_and(|a| a.is_allocated(obj))
            {
                f(obj);
            }
        }
    }

    /// Collector phase, for embedders deciding whether to assist.
    #[inline]
    pub fn phase(&self) -> Phase {
        self.gc.phase()
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self, AllocError> {
        Ok(Self(Arc::new(HeapInner::new(config)?)))
    }

    /// A cache for a new execution slot.
    #[must_use]
    pub fn new_cache(&self) -> SlotCache {
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        SlotCache::new(self.clone(), id)
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("start", &format_args!("{:#x}", self.pages.start()))
            .field("limit", &self.pages.limit())
            .field("phase", &self.gc.phase())
            .field("cycle", &self.gc.cycle())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::AllocMode,
        gc::{LocalWorld, MarkDone, Trigger, barrier::load_ptr},
    };

    fn create_test_env() -> (Heap, LocalWorld) {
        let heap = Heap::new(HeapConfig {
            limit: 64 << 20,
            gc_percent: -1,
            ..HeapConfig::default()
        })
        .expect("heap");
        let world = LocalWorld::new(&heap, 1);
        (heap, world)
    }

    fn alloc(world: &LocalWorld, size: usize, ptrs: PtrMap<'_>) -> usize {
        world
            .with_cache(0, |c| c.allocate(size, ptrs, AllocMode::Fatal))
            .expect("allocate")
    }

    #[test]
    fn test_allocation_basic() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 64, PtrMap::NoScan);
        let b = alloc(&world, 64, PtrMap::NoScan);
        assert_ne!(a, b);
        assert_eq!(a % WORD, 0);

        let info = heap.find_object(a + 10).expect("interior pointer");
        assert_eq!(info.base, a);
        assert_eq!(info.size, 64);
        assert!(info.noscan);
        assert!(heap.find_object(heap.pages.start() - 8).is_none());

        // SAFETY: fresh 64 byte object
        let bytes = unsafe { std::slice::from_raw_parts(a as *const u8, 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tiny_objects_share_a_block() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 4, PtrMap::NoScan);
        let b = alloc(&world, 4, PtrMap::NoScan);
        let c = alloc(&world, 8, PtrMap::NoScan);
        assert_eq!(b, a + 4);
        assert_eq!(c, a + 8);
        assert_eq!(heap.find_object(c).expect("tiny").base, a);
        // Scannable objects never go into tiny blocks.
        let d = alloc(&world, 8, PtrMap::All);
        assert!(heap.find_object(d).is_some_and(|i| !i.noscan));
    }

    #[test]
    fn test_zero_size_allocations_share_an_address() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 0, PtrMap::NoScan);
        let b = alloc(&world, 0, PtrMap::All);
        assert_eq!(a, b);
        assert!(heap.find_object(a).is_none());
    }

    #[test]
    fn test_unreachable_objects_are_reclaimed() {
        let (heap, world) = create_test_env();
        for i in 0..10_000 {
            let obj = alloc(&world, 64, PtrMap::NoScan);
            if i % 1000 == 0 {
                world.add_root(obj);
            }
        }
        heap.run_cycle_blocking(&world);
        let snap = heap.stats.snapshot();
        assert_eq!(snap.total_allocs, 10_000);
        assert_eq!(snap.objects, 10);
        assert_eq!(snap.bytes_in_use, 640);
        for root in world.roots() {
            assert!(heap.find_object(root).is_some());
        }
        assert_eq!(heap.gc.phase(), Phase::Off);
        assert_eq!(heap.stats.cycles.load(Ordering::Relaxed), 1);
        assert_eq!(heap.stats.forced_cycles.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reachable_graph_survives() {
        let (heap, world) = create_test_env();
        // A list of two-word nodes: [next, payload].
        let mut nodes = Vec::new();
        let mut head = 0;
        for _ in 0..500 {
            let node = alloc(&world, 16, PtrMap::All);
            // SAFETY: `node` is a live two-word object
            world.with_cache(0, |c| unsafe { c.write_barrier(node, head) });
            head = node;
            nodes.push(node);
        }
        world.add_root(head);
        heap.run_cycle_blocking(&world);
        for &node in &nodes {
            assert!(heap.find_object(node).is_some(), "node {node:#x} freed");
        }

        // Cut the list after the tenth node.
        let cut = nodes[nodes.len() - 10];
        // SAFETY: as above
        world.with_cache(0, |c| unsafe { c.write_barrier(cut, 0) });
        heap.run_cycle_blocking(&world);
        let alive = nodes
            .iter()
            .filter(|&&n| heap.find_object(n).is_some())
            .count();
        assert_eq!(alive, 10);
        // SAFETY: `head` is still reachable
        assert_ne!(unsafe { load_ptr(head) }, 0);
    }

    #[test]
    fn test_write_barrier_keeps_moved_pointer() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 16, PtrMap::All);
        let b = alloc(&world, 16, PtrMap::NoScan);
        // SAFETY: `a` is a live pointer object
        world.with_cache(0, |cache| unsafe { cache.write_barrier(a, b) });
        world.add_root(a);

        assert!(heap.start_cycle(&world, Trigger::Forced));
        let cycle = heap.gc.cycle();
        // Move `b` into an object allocated black, which is never scanned,
        // and drop the only other reference before any root is marked.
        let c = alloc(&world, 16, PtrMap::All);
        world.with_cache(0, |cache| {
            // SAFETY: `a` and `c` are live pointer objects
            unsafe {
                cache.write_barrier(c, b);
                cache.write_barrier(a, 0);
            }
        });
        world.add_root(c);
        heap.finish_cycle(&world, cycle);
        heap.finish_sweep();
        assert!(heap.find_object(b).is_some());
        assert!(heap.find_object(c).is_some());
    }

    #[test]
    fn test_mark_done_waits_for_work() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 32, PtrMap::All);
        world.add_root(a);
        assert_eq!(heap.mark_done(&world), MarkDone::Busy);
        assert!(heap.start_cycle(&world, Trigger::Forced));
        assert!(!heap.start_cycle(&world, Trigger::Forced));
        assert_eq!(heap.mark_done(&world), MarkDone::MoreWork);
        let mut gcw = GcWork::new();
        heap.drain(&world, &mut gcw, |_| false);
        assert_eq!(heap.mark_done(&world), MarkDone::Terminated);
        assert_eq!(heap.gc.completed_cycles(), 1);
    }

    static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    fn count_cleanup(_obj: usize, arg: usize) {
        CLEANUPS.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn test_cleanup_runs_once_before_free() {
        let (heap, world) = create_test_env();
        let obj = alloc(&world, 48, PtrMap::NoScan);
        heap.register_cleanup(obj, count_cleanup, 1);

        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(obj).is_some(), "freed before cleanup ran");
        assert_eq!(heap.finq.len(), 1);
        assert_eq!(heap.finq.run_pending(), 1);
        assert_eq!(CLEANUPS.load(Ordering::SeqCst), 1);

        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(obj).is_none());
        heap.run_cycle_blocking(&world);
        assert_eq!(heap.finq.run_pending(), 0);
        assert_eq!(CLEANUPS.load(Ordering::SeqCst), 1);
    }

    static NEVER: AtomicUsize = AtomicUsize::new(0);

    fn never(_obj: usize, _arg: usize) {
        NEVER.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_cancelled_cleanup_does_not_run() {
        let (heap, world) = create_test_env();
        let obj = alloc(&world, 48, PtrMap::NoScan);
        let handle = heap.register_cleanup(obj, never, 0);
        assert!(heap.cancel_cleanup(handle));
        assert!(!heap.cancel_cleanup(handle));
        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(obj).is_none());
        assert_eq!(heap.finq.run_pending(), 0);
        assert_eq!(NEVER.load(Ordering::SeqCst), 0);
    }

    static TINY_CLEANED: AtomicUsize = AtomicUsize::new(0);

    fn record_tiny(obj: usize, _arg: usize) {
        TINY_CLEANED.store(obj, Ordering::SeqCst);
    }

    #[test]
    fn test_cleanup_on_tiny_object_inside_a_block() {
        let (heap, world) = create_test_env();
        let a = alloc(&world, 8, PtrMap::NoScan);
        let b = alloc(&world, 8, PtrMap::NoScan);
        assert_eq!(heap.find_object(b).expect("tiny").base, a);
        heap.register_cleanup(b, record_tiny, 0);

        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(a).is_some(), "block freed before cleanup ran");
        assert_eq!(heap.finq.run_pending(), 1);
        assert_eq!(TINY_CLEANED.load(Ordering::SeqCst), b);

        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(a).is_none());
    }

    #[test]
    #[should_panic(expected = "cleanup pointer not at the start of an object")]
    fn test_cleanup_on_interior_pointer_is_fatal() {
        let (heap, world) = create_test_env();
        let obj = alloc(&world, 48, PtrMap::NoScan);
        heap.register_cleanup(obj + 8, never, 0);
    }

    #[test]
    fn test_span_accounting() {
        let (heap, world) = create_test_env();
        let sizes = [8, 24, 64, 200, 1000, 5000, 40_000];
        for round in 0..3 {
            for i in 0..600 {
                let size = sizes[i % sizes.len()];
                let ptrs = if i % 2 == 0 { PtrMap::All } else { PtrMap::NoScan };
                let obj = alloc(&world, size, ptrs);
                if i % 7 == round {
                    world.add_root(obj);
                }
            }
            let report = heap.verify_span_accounting(&world).expect("accounting");
            assert!(report.cached > 0);
            assert!(report.large > 0);
            heap.run_cycle_blocking(&world);
            let report = heap.verify_span_accounting(&world).expect("accounting");
            assert_eq!(report.cached, 0);
        }
    }

    #[test]
    fn test_large_objects() {
        let (heap, world) = create_test_env();
        let big = alloc(&world, 100_000, PtrMap::All);
        let info = heap.find_object(big + 99_999).expect("large object");
        assert_eq!(info.base, big);
        assert_eq!(info.size, 100_000usize.div_ceil(PAGE_SIZE) * PAGE_SIZE);
        heap.run_cycle_blocking(&world);
        assert!(heap.find_object(big).is_none());
        assert_eq!(heap.stats.snapshot().bytes_in_use, 0);
    }

    #[test]
    fn test_non_fatal_out_of_memory() {
        let heap = Heap::new(HeapConfig {
            limit: 2 << 20,
            ..HeapConfig::default()
        })
        .expect("heap");
        let world = LocalWorld::new(&heap, 1);
        let err = world
            .with_cache(0, |c| c.allocate(8 << 20, PtrMap::NoScan, AllocMode::NonFatal))
            .unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        let err = world
            .with_cache(0, |c| c.allocate(usize::MAX, PtrMap::NoScan, AllocMode::NonFatal))
            .unwrap_err();
        assert!(matches!(err, AllocError::SizeOverflow(_)));
    }

    #[test]
    fn test_free_os_memory_releases_pages() {
        let (heap, world) = create_test_env();
        for _ in 0..2000 {
            alloc(&world, 1024, PtrMap::NoScan);
        }
        let released = heap.free_os_memory(&world);
        assert!(released > 0);
        let metrics = heap.metrics();
        let get = |name: &str| {
            metrics
                .iter()
                .find(|(n, _)| *n == name)
                .map(|&(_, v)| v)
                .expect(name)
        };
        assert_eq!(get("/heap/bytes-released"), released as u64);
        assert_eq!(get("/gc/cycles"), 1);
        assert_eq!(get("/heap/bytes-in-use"), 0);
    }
}
