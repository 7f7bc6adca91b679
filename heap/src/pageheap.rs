//! Page-level heap.
//!
//! The whole heap lives in one reservation, committed front to back in
//! arenas of 1 MiB. Each arena carries its side tables:
//!
//! ```text
//! arena (1 MiB = 128 pages = 131072 words)
//! +--------------------------------------------------------------+
//! | spans:      page -> *Span          (128 entries)             |
//! | ptr_bits:   word holds a pointer   (1 bit per word)          |
//! | mark_bits:  object starting here is marked                   |
//! | alloc_bits: object starting here is allocated                |
//! +--------------------------------------------------------------+
//! ```
//!
//! Free page runs are kept in an address-ordered map, allocated first-fit
//! from the lowest address and coalesced on free.

use std::{
    collections::BTreeMap,
    io::Write,
    ptr::{self, NonNull},
    sync::{
        OnceLock,
        atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
    },
};

use crate::{
    error::AllocError,
    fatal::{throw, throw_with},
    lock::{Lock, LockRank},
    sizeclass::{PAGE_SHIFT, PAGE_SIZE, SpanClass, WORD},
    span::{Span, SpanLocation, SpanPtr, SpanState},
    system,
};

pub const ARENA_SHIFT: usize = 20;
pub const ARENA_SIZE: usize = 1 << ARENA_SHIFT;
pub const PAGES_PER_ARENA: usize = ARENA_SIZE / PAGE_SIZE;
const BITMAP_LEN: usize = ARENA_SIZE / WORD / 64;

fn new_bitmap(len: usize) -> Box<[AtomicU64]> {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

/// Side tables for one arena.
pub struct Arena {
    base: usize,
    spans: Box<[AtomicPtr<Span>]>,
    ptr_bits: Box<[AtomicU64]>,
    mark_bits: Box<[AtomicU64]>,
    alloc_bits: Box<[AtomicU64]>,
}

impl Arena {
    fn new(base: usize) -> Self {
        Self {
            base,
            spans: (0..PAGES_PER_ARENA)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            ptr_bits: new_bitmap(BITMAP_LEN),
            mark_bits: new_bitmap(BITMAP_LEN),
            alloc_bits: new_bitmap(BITMAP_LEN),
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline(always)]
    fn bit(&self, addr: usize) -> (usize, u64) {
        let w = (addr - self.base) / WORD;
        (w / 64, 1u64 << (w % 64))
    }

    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        let (i, m) = self.bit(addr);
        self.mark_bits[i].load(Ordering::Relaxed) & m != 0
    }

    /// Set the mark bit. True if this call marked it.
    #[inline]
    pub fn try_mark(&self, addr: usize) -> bool {
        let (i, m) = self.bit(addr);
        if self.mark_bits[i].load(Ordering::Relaxed) & m != 0 {
            return false;
        }
        self.mark_bits[i].fetch_or(m, Ordering::AcqRel) & m == 0
    }

    #[inline]
    pub fn clear_mark(&self, addr: usize) {
        let (i, m) = self.bit(addr);
        self.mark_bits[i].fetch_and(!m, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_allocated(&self, addr: usize) -> bool {
        let (i, m) = self.bit(addr);
        self.alloc_bits[i].load(Ordering::Acquire) & m != 0
    }

    #[inline]
    pub fn set_allocated(&self, addr: usize, allocated: bool) {
        let (i, m) = self.bit(addr);
        if allocated {
            self.alloc_bits[i].fetch_or(m, Ordering::Release);
        } else {
            self.alloc_bits[i].fetch_and(!m, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_pointer(&self, addr: usize) -> bool {
        let (i, m) = self.bit(addr);
        self.ptr_bits[i].load(Ordering::Relaxed) & m != 0
    }

    #[inline]
    pub fn set_pointer(&self, addr: usize, is_ptr: bool) {
        let (i, m) = self.bit(addr);
        if is_ptr {
            self.ptr_bits[i].fetch_or(m, Ordering::Relaxed);
        } else {
            self.ptr_bits[i].fetch_and(!m, Ordering::Relaxed);
        }
    }

    /// Clear mark and alloc bits for `[from, to)`. Both are page aligned.
    fn clear_bits(&self, from: usize, to: usize) {
        let (a, _) = self.bit(from);
        let b = (to - self.base) / WORD / 64;
        for i in a..b {
            self.mark_bits[i].store(0, Ordering::Relaxed);
            self.alloc_bits[i].store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    fn page(&self, addr: usize) -> usize {
        (addr - self.base) >> PAGE_SHIFT
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRun {
    npages: usize,
    /// Pages of the run already returned to the OS.
    scavenged: usize,
    needzero: bool,
}

#[derive(Default)]
struct PageState {
    free: BTreeMap<usize, FreeRun>,
    records: Vec<SpanPtr>,
    pool: Vec<SpanPtr>,
}

/// Page accounting. Written under the heap lock, read anywhere.
#[derive(Debug, Default)]
pub struct PageCounters {
    pub in_use: AtomicUsize,
    pub manual: AtomicUsize,
    pub free: AtomicUsize,
    pub released: AtomicUsize,
    pub committed: AtomicUsize,
}

pub struct PageHeap {
    mapping: NonNull<u8>,
    mapping_len: usize,
    start: usize,
    end: usize,
    committed_end: AtomicUsize,
    arenas: Box<[OnceLock<Box<Arena>>]>,
    state: Lock<PageState>,
    pub counters: PageCounters,
}

// SAFETY: the mapping is plain memory; all shared state is behind atomics
// or the heap lock
unsafe impl Send for PageHeap {}
// SAFETY: as above
unsafe impl Sync for PageHeap {}

impl PageHeap {
    /// Reserve `limit` bytes (rounded up to whole arenas).
    pub fn new(limit: usize) -> Result<Self, AllocError> {
        let limit = limit.max(ARENA_SIZE).div_ceil(ARENA_SIZE) * ARENA_SIZE;
        let mapping_len = limit + PAGE_SIZE;
        let mapping = system::reserve_memory(mapping_len).ok_or(AllocError::Reserve(limit))?;
        let start = (mapping.as_ptr() as usize).next_multiple_of(PAGE_SIZE);
        let narenas = limit / ARENA_SIZE;
        log::debug!("page heap reserved {limit} bytes at {start:#x}");
        Ok(Self {
            mapping,
            mapping_len,
            start,
            end: start + limit,
            committed_end: AtomicUsize::new(start),
            arenas: (0..narenas).map(|_| OnceLock::new()).collect(),
            state: Lock::new(LockRank::Heap, PageState::default()),
            counters: PageCounters::default(),
        })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Size of the reservation.
    #[inline]
    pub fn limit(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn committed_end(&self) -> usize {
        self.committed_end.load(Ordering::Acquire)
    }

    #[inline]
    pub fn arena_of(&self, addr: usize) -> Option<&Arena> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        self.arenas[(addr - self.start) >> ARENA_SHIFT]
            .get()
            .map(|a| &**a)
    }

    /// Span covering `addr`, if any live span does.
    #[inline]
    pub fn span_of(&self, addr: usize) -> Option<SpanPtr> {
        let arena = self.arena_of(addr)?;
        SpanPtr::from_raw(arena.spans[arena.page(addr)].load(Ordering::Acquire))
    }

    /// Allocate a heap span of `npages` carved for `spanclass`.
    pub fn alloc_span(&self, npages: usize, spanclass: SpanClass) -> Result<SpanPtr, AllocError> {
        let span = self.alloc_pages(npages, SpanState::InUse)?;
        span.set_class(spanclass);
        span.set_location(SpanLocation::PageHeap);
        self.publish(span);
        Ok(span)
    }

    /// Allocate a span of runtime-managed memory.
    pub fn alloc_manual(&self, npages: usize) -> Result<SpanPtr, AllocError> {
        let span = self.alloc_pages(npages, SpanState::Manual)?;
        span.set_location(SpanLocation::Manual);
        self.publish(span);
        Ok(span)
    }

    /// Return an in-use heap span's pages. Collector only.
    pub fn free_span(&self, span: SpanPtr) {
        if span.state() != SpanState::InUse {
            throw_with("free of span that is not in use", |out| {
                let _ = writeln!(out, "{span:?}");
            });
        }
        self.free_pages(span);
    }

    pub fn free_manual(&self, span: SpanPtr) {
        if span.state() != SpanState::Manual {
            throw_with("free of span that is not manual", |out| {
                let _ = writeln!(out, "{span:?}");
            });
        }
        self.free_pages(span);
    }

    /// Commit at least `min_pages` more pages and add them to the free runs.
    /// Returns the new range as `(base, npages)`.
    pub fn grow(&self, min_pages: usize) -> Result<(usize, usize), AllocError> {
        let mut state = self.state.lock();
        self.grow_locked(&mut state, min_pages)
    }

    fn grow_locked(
        &self,
        state: &mut PageState,
        min_pages: usize,
    ) -> Result<(usize, usize), AllocError> {
        let bytes = (min_pages * PAGE_SIZE).div_ceil(ARENA_SIZE).max(1) * ARENA_SIZE;
        let base = self.committed_end.load(Ordering::Relaxed);
        if base + bytes > self.end {
            return Err(AllocError::OutOfMemory {
                requested: min_pages * PAGE_SIZE,
                limit: self.limit(),
            });
        }
        for a in (base - self.start) / ARENA_SIZE..(base + bytes - self.start) / ARENA_SIZE {
            let arena_base = self.start + a * ARENA_SIZE;
            let _ = self.arenas[a].get_or_init(|| Box::new(Arena::new(arena_base)));
        }
        self.committed_end.store(base + bytes, Ordering::Release);
        self.counters.committed.fetch_add(bytes, Ordering::Relaxed);

        let npages = bytes / PAGE_SIZE;
        self.insert_free(
            state,
            self.page_index(base),
            FreeRun {
                npages,
                scavenged: 0,
                needzero: false,
            },
        );
        log::debug!("heap grew by {bytes} bytes to {:#x}", base + bytes);
        Ok((base, npages))
    }

    fn alloc_pages(&self, npages: usize, state_after: SpanState) -> Result<SpanPtr, AllocError> {
        debug_assert!(npages > 0);
        let mut state = self.state.lock();
        let found = state
            .free
            .iter()
            .find(|(_, run)| run.npages >= npages)
            .map(|(&page, &run)| (page, run));
        let (page, run) = match found {
            Some(hit) => hit,
            None => {
                self.grow_locked(&mut state, npages)?;
                state
                    .free
                    .iter()
                    .find(|(_, run)| run.npages >= npages)
                    .map(|(&page, &run)| (page, run))
                    .unwrap_or_else(|| throw("heap grow did not produce a fitting run"))
            }
        };

        state.free.remove(&page);
        let mut released = run.scavenged;
        if run.npages > npages {
            let rest = FreeRun {
                npages: run.npages - npages,
                scavenged: run.scavenged.min(run.npages - npages),
                needzero: run.needzero,
            };
            released -= rest.scavenged;
            state.free.insert(page + npages, rest);
        }
        self.counters.free.fetch_sub(npages, Ordering::Relaxed);
        self.counters.released.fetch_sub(released, Ordering::Relaxed);
        match state_after {
            SpanState::Manual => self.counters.manual.fetch_add(npages, Ordering::Relaxed),
            _ => self.counters.in_use.fetch_add(npages, Ordering::Relaxed),
        };

        let span = match state.pool.pop() {
            Some(span) => span,
            None => {
                let span = SpanPtr::from_box(Box::new(Span::new()));
                state.records.push(span);
                span
            }
        };
        drop(state);

        let base = self.page_addr(page);
        span.init(base, npages, run.needzero);
        self.clear_bits(base, base + npages * PAGE_SIZE);
        span.set_state(state_after);
        Ok(span)
    }

    fn free_pages(&self, span: SpanPtr) {
        let (base, npages, manual) = (
            span.base(),
            span.npages(),
            span.state() == SpanState::Manual,
        );
        self.unpublish(span);
        span.set_state(SpanState::Dead);
        span.set_location(SpanLocation::PageHeap);

        let mut state = self.state.lock();
        if manual {
            self.counters.manual.fetch_sub(npages, Ordering::Relaxed);
        } else {
            self.counters.in_use.fetch_sub(npages, Ordering::Relaxed);
        }
        self.insert_free(
            &mut state,
            self.page_index(base),
            FreeRun {
                npages,
                scavenged: 0,
                needzero: true,
            },
        );
        state.pool.push(span);
    }

    fn insert_free(&self, state: &mut PageState, page: usize, mut run: FreeRun) {
        self.counters.free.fetch_add(run.npages, Ordering::Relaxed);
        let end = page + run.npages;
        let mut start = page;
        let prev = state
            .free
            .range(..page)
            .next_back()
            .map(|(&p, &r)| (p, r));
        if let Some((p, prev)) = prev {
            if p + prev.npages == page {
                state.free.remove(&p);
                start = p;
                run = merge(prev, run);
            } else if p + prev.npages > page {
                throw("free page run overlaps its predecessor");
            }
        }
        if let Some(next) = state.free.remove(&end) {
            run = merge(run, next);
        }
        state.free.insert(start, run);
    }

    /// Return up to `bytes` of free memory to the OS, highest addresses
    /// first. Returns the number of bytes released.
    pub fn scavenge(&self, bytes: usize) -> usize {
        let want = bytes.div_ceil(PAGE_SIZE);
        let mut state = self.state.lock();
        let mut released = 0;
        for (&page, run) in state.free.iter_mut().rev() {
            if released >= want {
                break;
            }
            if run.scavenged == run.npages {
                continue;
            }
            let addr = self.page_addr(page);
            if system::return_to_os(addr, run.npages * PAGE_SIZE) {
                released += run.npages - run.scavenged;
                run.scavenged = run.npages;
                run.needzero = false;
            }
        }
        self.counters.released.fetch_add(released, Ordering::Relaxed);
        drop(state);
        if released > 0 {
            log::debug!("scavenged {} bytes", released * PAGE_SIZE);
        }
        released * PAGE_SIZE
    }

    /// Every live span, in address order. Callers must keep the span set
    /// stable (world stopped, or a quiescent test heap).
    pub fn spans(&self) -> Vec<SpanPtr> {
        let mut out = Vec::new();
        let end = self.committed_end();
        let mut addr = self.start;
        while addr < end {
            match self.span_of(addr) {
                Some(span) if span.base() == addr => {
                    addr = span.limit();
                    out.push(span);
                }
                _ => addr += PAGE_SIZE,
            }
        }
        out
    }

    /// Free runs as `(base, npages)`.
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        let state = self.state.lock();
        state
            .free
            .iter()
            .map(|(&p, r)| (self.page_addr(p), r.npages))
            .collect()
    }

    fn publish(&self, span: SpanPtr) {
        let mut addr = span.base();
        while addr < span.limit() {
            let arena = self.arena(addr);
            arena.spans[arena.page(addr)].store(span.as_ptr(), Ordering::Release);
            addr += PAGE_SIZE;
        }
    }

    fn unpublish(&self, span: SpanPtr) {
        let mut addr = span.base();
        while addr < span.limit() {
            let arena = self.arena(addr);
            let prev = arena.spans[arena.page(addr)].swap(ptr::null_mut(), Ordering::Release);
            if prev != span.as_ptr() {
                throw("page table does not point at the span being freed");
            }
            addr += PAGE_SIZE;
        }
    }

    fn clear_bits(&self, from: usize, to: usize) {
        let mut addr = from;
        while addr < to {
            let arena = self.arena(addr);
            let arena_end = (arena.base + ARENA_SIZE).min(to);
            arena.clear_bits(addr, arena_end);
            addr = arena_end;
        }
    }

    #[inline]
    fn arena(&self, addr: usize) -> &Arena {
        self.arena_of(addr)
            .unwrap_or_else(|| throw("address outside the committed heap"))
    }

    #[inline]
    fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) >> PAGE_SHIFT
    }

    #[inline]
    fn page_addr(&self, page: usize) -> usize {
        self.start + (page << PAGE_SHIFT)
    }
}

fn merge(a: FreeRun, b: FreeRun) -> FreeRun {
    FreeRun {
        npages: a.npages + b.npages,
        scavenged: a.scavenged + b.scavenged,
        needzero: a.needzero || b.needzero,
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for span in state.records.drain(..) {
            // SAFETY: nothing references the records once the heap drops
            unsafe { span.free() };
        }
        system::release_memory(self.mapping, self.mapping_len);
    }
}
