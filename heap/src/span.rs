//! Span records.
//!
//! A span is a run of pages carved into equally sized objects (or holding a
//! single large object, or a stack). Records are allocated once by the page
//! heap and recycled; they are never freed while the heap lives, so a
//! [`SpanPtr`] read from the page table or a span list stays dereferenceable.
//!
//! All fields are atomics. Layout fields change only while the record is
//! owned exclusively by the page heap (state `Dead`); the rest follow the
//! ownership rules of the list the span sits on.

use std::{
    fmt,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering},
};

use crate::sizeclass::{PAGE_SIZE, SpanClass, class_nelems, class_size};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Record is in the pool, describes nothing.
    Dead = 0,
    /// Holds heap objects.
    InUse = 1,
    /// Holds runtime-managed memory (stacks). Never scanned or swept.
    Manual = 2,
}

impl From<u8> for SpanState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::InUse,
            2 => Self::Manual,
            _ => Self::Dead,
        }
    }
}

/// Which structure currently owns a span. Every live span has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanLocation {
    PageHeap,
    Central,
    Cached(u32),
    Large,
    Manual,
}

const CACHED_BIT: u32 = 0x8000_0000;

impl SpanLocation {
    fn encode(self) -> u32 {
        match self {
            Self::PageHeap => 0,
            Self::Central => 1,
            Self::Large => 2,
            Self::Manual => 3,
            Self::Cached(slot) => CACHED_BIT | slot,
        }
    }

    fn decode(v: u32) -> Self {
        if v & CACHED_BIT != 0 {
            return Self::Cached(v & !CACHED_BIT);
        }
        match v {
            1 => Self::Central,
            2 => Self::Large,
            3 => Self::Manual,
            _ => Self::PageHeap,
        }
    }
}

pub struct Span {
    base: AtomicUsize,
    npages: AtomicUsize,
    spanclass: AtomicU8,
    elemsize: AtomicUsize,
    nelems: AtomicUsize,
    /// Scan for free objects starts here.
    free_index: AtomicUsize,
    alloc_count: AtomicUsize,
    /// Compared with the heap's sweep generation, see `sweep`.
    pub(crate) sweepgen: AtomicU32,
    state: AtomicU8,
    location: AtomicU32,
    needzero: AtomicBool,
}

impl Span {
    pub(crate) const fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            npages: AtomicUsize::new(0),
            spanclass: AtomicU8::new(0),
            elemsize: AtomicUsize::new(0),
            nelems: AtomicUsize::new(0),
            free_index: AtomicUsize::new(0),
            alloc_count: AtomicUsize::new(0),
            sweepgen: AtomicU32::new(0),
            state: AtomicU8::new(SpanState::Dead as u8),
            location: AtomicU32::new(0),
            needzero: AtomicBool::new(false),
        }
    }

    /// Describe a fresh page run. Only the page heap calls this, on a
    /// `Dead` record.
    pub(crate) fn init(&self, base: usize, npages: usize, needzero: bool) {
        debug_assert_eq!(self.state(), SpanState::Dead);
        self.base.store(base, Ordering::Relaxed);
        self.npages.store(npages, Ordering::Relaxed);
        self.spanclass.store(0, Ordering::Relaxed);
        self.elemsize.store(npages * PAGE_SIZE, Ordering::Relaxed);
        self.nelems.store(1, Ordering::Relaxed);
        self.free_index.store(0, Ordering::Relaxed);
        self.alloc_count.store(0, Ordering::Relaxed);
        self.needzero.store(needzero, Ordering::Relaxed);
    }

    /// Carve the span into objects of `spanclass`.
    pub(crate) fn set_class(&self, spanclass: SpanClass) {
        self.spanclass.store(spanclass.raw(), Ordering::Relaxed);
        let class = spanclass.sizeclass();
        if class == 0 {
            self.elemsize.store(self.npages() * PAGE_SIZE, Ordering::Relaxed);
            self.nelems.store(1, Ordering::Relaxed);
        } else {
            self.elemsize.store(class_size(class), Ordering::Relaxed);
            self.nelems.store(class_nelems(class), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.base() + self.npages() * PAGE_SIZE
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.npages() * PAGE_SIZE
    }

    #[inline]
    pub fn spanclass(&self) -> SpanClass {
        SpanClass::from_raw(self.spanclass.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn elemsize(&self) -> usize {
        self.elemsize.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.nelems.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        SpanState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SpanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn location(&self) -> SpanLocation {
        SpanLocation::decode(self.location.load(Ordering::Relaxed))
    }

    pub(crate) fn set_location(&self, loc: SpanLocation) {
        self.location.store(loc.encode(), Ordering::Relaxed);
    }

    #[inline]
    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_alloc_count(&self, n: usize) {
        self.alloc_count.store(n, Ordering::Relaxed);
    }

    pub(crate) fn bump_alloc_count(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn free_index(&self) -> usize {
        self.free_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_free_index(&self, i: usize) {
        self.free_index.store(i, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.alloc_count() == self.nelems()
    }

    #[inline]
    pub fn free_objects(&self) -> usize {
        self.nelems() - self.alloc_count()
    }

    #[inline]
    pub fn needzero(&self) -> bool {
        self.needzero.load(Ordering::Relaxed)
    }

    pub(crate) fn set_needzero(&self, v: bool) {
        self.needzero.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.limit()
    }

    /// Index of the object containing `addr`. Interior pointers resolve to
    /// their object.
    #[inline]
    pub fn object_index(&self, addr: usize) -> usize {
        (addr - self.base()) / self.elemsize()
    }

    #[inline]
    pub fn object_addr(&self, index: usize) -> usize {
        self.base() + index * self.elemsize()
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("npages", &self.npages())
            .field("class", &self.spanclass())
            .field("elemsize", &self.elemsize())
            .field("nelems", &self.nelems())
            .field("alloc_count", &self.alloc_count())
            .field("sweepgen", &self.sweepgen.load(Ordering::Relaxed))
            .field("state", &self.state())
            .field("location", &self.location())
            .finish()
    }
}

/// Handle to a span record owned by the page heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanPtr(NonNull<Span>);

// SAFETY: records are shared through atomics only
unsafe impl Send for SpanPtr {}
// SAFETY: records are shared through atomics only
unsafe impl Sync for SpanPtr {}

impl SpanPtr {
    pub(crate) fn from_box(span: Box<Span>) -> Self {
        Self(NonNull::from(Box::leak(span)))
    }

    pub(crate) fn from_raw(ptr: *mut Span) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub(crate) fn as_ptr(self) -> *mut Span {
        self.0.as_ptr()
    }

    /// # Safety
    /// Must be called once per record, after the heap stopped using it.
    pub(crate) unsafe fn free(self) {
        // SAFETY: created by `from_box`
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

impl Deref for SpanPtr {
    type Target = Span;

    #[inline]
    fn deref(&self) -> &Span {
        // SAFETY: span records outlive every SpanPtr handed out by the heap
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for SpanPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizeclass::size_to_class;

    #[test]
    fn location_encoding_round_trips() {
        for loc in [
            SpanLocation::PageHeap,
            SpanLocation::Central,
            SpanLocation::Large,
            SpanLocation::Manual,
            SpanLocation::Cached(0),
            SpanLocation::Cached(63),
        ] {
            assert_eq!(SpanLocation::decode(loc.encode()), loc);
        }
    }

    #[test]
    fn small_span_layout() {
        let span = Span::new();
        span.init(0x10_0000, 1, false);
        span.set_class(SpanClass::new(size_to_class(48), false));
        assert_eq!(span.elemsize(), 48);
        assert_eq!(span.nelems(), PAGE_SIZE / 48);
        assert_eq!(span.object_index(0x10_0000 + 50), 1);
        assert_eq!(span.object_addr(1), 0x10_0000 + 48);
        assert!(span.contains(0x10_0000 + PAGE_SIZE - 1));
        assert!(!span.contains(0x10_0000 + PAGE_SIZE));
    }

    #[test]
    fn large_span_is_one_object() {
        let span = Span::new();
        span.init(0x20_0000, 5, true);
        span.set_class(SpanClass::new(0, true));
        assert_eq!(span.nelems(), 1);
        assert_eq!(span.elemsize(), 5 * PAGE_SIZE);
        assert_eq!(span.object_index(0x20_0000 + 3 * PAGE_SIZE), 0);
        assert!(span.needzero());
    }
}
