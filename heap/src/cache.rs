//! Per-slot allocation cache.
//!
//! Each execution slot owns one [`SlotCache`]. It holds the span it
//! currently allocates from for every span class, the tiny block, local
//! allocation counters, a mark work buffer and the write barrier buffer.
//! Nothing in here is locked; only the owning slot touches it, except
//! during a handshake when the collector runs a closure on it in the
//! owner's place.

use std::{io::Write, ptr, sync::atomic::Ordering};

use crate::{
    Heap,
    error::AllocError,
    fatal::throw_with,
    gc::work::GcWork,
    sizeclass::{
        MAX_SMALL_SIZE, NUM_SPAN_CLASSES, PAGE_SIZE, SpanClass, TINY_SIZE, class_size,
        size_to_class,
    },
    span::SpanPtr,
    stats::LocalStats,
};

/// Address returned for zero-sized allocations.
static ZERO_BASE: u64 = 0;

/// Size class of the 16 byte blocks tiny objects are packed into.
pub(crate) const TINY_CLASS: u8 = 2;

/// Entries in the write barrier buffer before it is flushed.
pub(crate) const WB_BUF_LEN: usize = 512;

/// Which words of an object hold pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrMap<'a> {
    /// No pointers. The object is never scanned.
    NoScan,
    /// Every word may hold a pointer.
    All,
    /// Word `i` holds a pointer if bit `i % 64` of `bits[i / 64]` is set.
    /// Words past the end of the map hold no pointers.
    Bits(&'a [u64]),
}

impl PtrMap<'_> {
    #[inline]
    pub fn is_noscan(&self) -> bool {
        match self {
            PtrMap::NoScan => true,
            PtrMap::All => false,
            PtrMap::Bits(bits) => bits.iter().all(|&w| w == 0),
        }
    }

    #[inline]
    pub fn is_pointer(&self, word: usize) -> bool {
        match self {
            PtrMap::NoScan => false,
            PtrMap::All => true,
            PtrMap::Bits(bits) => bits
                .get(word / 64)
                .is_some_and(|w| w & (1 << (word % 64)) != 0),
        }
    }
}

/// What to do when the heap cannot grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocMode {
    /// Out of memory is a fatal error.
    #[default]
    Fatal,
    /// Out of memory is returned to the caller.
    NonFatal,
}

pub struct SlotCache {
    heap: Heap,
    id: u32,
    alloc: [Option<SpanPtr>; NUM_SPAN_CLASSES],
    tiny: usize,
    tiny_offset: usize,
    local: LocalStats,
    /// Grey objects found by this slot's barrier and allocations.
    pub gcw: GcWork,
    pub(crate) wbbuf: Vec<usize>,
    observed_cycle: u64,
}

impl SlotCache {
    pub(crate) fn new(heap: Heap, id: u32) -> Self {
        let observed_cycle = heap.gc.cycle();
        Self {
            heap,
            id,
            alloc: [None; NUM_SPAN_CLASSES],
            tiny: 0,
            tiny_offset: 0,
            local: LocalStats::default(),
            gcw: GcWork::new(),
            wbbuf: Vec::with_capacity(WB_BUF_LEN),
            observed_cycle,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Allocate `size` bytes whose pointer words are described by `ptrs`.
    /// The memory is zeroed. Contains no safe point.
    pub fn allocate(
        &mut self,
        size: usize,
        ptrs: PtrMap<'_>,
        mode: AllocMode,
    ) -> Result<usize, AllocError> {
        let result = if size == 0 {
            Ok(ptr::addr_of!(ZERO_BASE) as usize)
        } else if ptrs.is_noscan() && size < TINY_SIZE {
            self.alloc_tiny(size)
        } else if size <= MAX_SMALL_SIZE {
            self.alloc_small(size, ptrs)
        } else {
            self.alloc_large(size, ptrs)
        };
        match result {
            Ok(obj) => Ok(obj),
            Err(err) if mode == AllocMode::NonFatal => Err(err),
            Err(err) => throw_with("out of memory", |out| {
                let _ = writeln!(out, "{err}");
            }),
        }
    }

    fn alloc_tiny(&mut self, size: usize) -> Result<usize, AllocError> {
        let mut off = self.tiny_offset;
        if size & 7 == 0 {
            off = off.next_multiple_of(8);
        } else if size & 3 == 0 {
            off = off.next_multiple_of(4);
        } else if size & 1 == 0 {
            off = off.next_multiple_of(2);
        }
        if self.tiny != 0 && off + size <= TINY_SIZE {
            self.tiny_offset = off + size;
            self.local.tiny_allocs += 1;
            return Ok(self.tiny + off);
        }

        let spc = SpanClass::new(TINY_CLASS, true);
        let block = self.next_free(spc)?;
        self.local.small_allocs[TINY_CLASS as usize] += 1;
        self.local.tiny_allocs += 1;
        // Keep whichever block has more room left.
        if self.tiny == 0 || size < self.tiny_offset {
            self.tiny = block;
            self.tiny_offset = size;
        }
        Ok(block)
    }

    fn alloc_small(&mut self, size: usize, ptrs: PtrMap<'_>) -> Result<usize, AllocError> {
        let noscan = ptrs.is_noscan();
        let class = size_to_class(size);
        let spc = SpanClass::new(class, noscan);
        let obj = self.next_free(spc)?;
        let elemsize = class_size(class);
        if !noscan {
            self.heap.set_pointer_bits(obj, elemsize, size, ptrs);
            self.local.scan_alloc += elemsize as u64;
        }
        self.local.small_allocs[class as usize] += 1;
        Ok(obj)
    }

    fn alloc_large(&mut self, size: usize, ptrs: PtrMap<'_>) -> Result<usize, AllocError> {
        let npages = size
            .checked_add(PAGE_SIZE - 1)
            .ok_or(AllocError::SizeOverflow(size))?
            / PAGE_SIZE;
        let noscan = ptrs.is_noscan();
        let heap = &*self.heap;
        heap.deduct_sweep_credit(npages);
        let span = heap.pages.alloc_span(npages, SpanClass::new(0, noscan))?;
        let sg = heap.sweepgen();
        span.sweepgen.store(sg, Ordering::Release);

        let obj = span.base();
        if span.needzero() {
            // SAFETY: the span's pages are ours and committed
            unsafe { ptr::write_bytes(obj as *mut u8, 0, span.bytes()) };
        }
        if !noscan {
            heap.set_pointer_bits(obj, span.bytes(), size, ptrs);
            self.local.scan_alloc += span.bytes() as u64;
        }
        if let Some(arena) = heap.pages.arena_of(obj) {
            arena.set_allocated(obj, true);
        }
        span.set_alloc_count(1);
        span.set_free_index(1);
        heap.mark_new_object(obj, span.bytes(), &mut self.gcw);
        heap.large.push_swept(span, sg);
        heap.stats
            .heap_live
            .fetch_add(span.bytes() as u64, Ordering::Relaxed);

        self.local.large_allocs += 1;
        self.local.large_bytes += span.bytes() as u64;
        log::trace!("large object {obj:#x}: {npages} pages");
        Ok(obj)
    }

    /// Take a free object of `spc`, refilling from the central list when the
    /// cached span is full. The object is zeroed and marked if allocating
    /// black.
    fn next_free(&mut self, spc: SpanClass) -> Result<usize, AllocError> {
        let span = match self.alloc[spc.index()] {
            Some(span) if !span.is_full() => span,
            _ => self.refill(spc)?,
        };
        let obj = self.take_object(span).unwrap_or_else(|| {
            throw_with("cached span has no free object", |out| {
                let _ = writeln!(out, "{span:?}");
            })
        });
        let size = span.elemsize();
        if span.needzero() {
            // SAFETY: `obj` is a free object inside a span we own
            unsafe { ptr::write_bytes(obj as *mut u8, 0, size) };
        }
        self.heap.mark_new_object(obj, size, &mut self.gcw);
        Ok(obj)
    }

    fn take_object(&self, span: SpanPtr) -> Option<usize> {
        for i in span.free_index()..span.nelems() {
            let obj = span.object_addr(i);
            let arena = self.heap.pages.arena_of(obj)?;
            if !arena.is_allocated(obj) {
                arena.set_allocated(obj, true);
                span.set_free_index(i + 1);
                span.bump_alloc_count();
                return Some(obj);
            }
        }
        None
    }

    fn refill(&mut self, spc: SpanClass) -> Result<SpanPtr, AllocError> {
        let central = &self.heap.central[spc.index()];
        if let Some(old) = self.alloc[spc.index()].take() {
            central.uncache_span(&self.heap, old);
        }
        let span = central.cache_span(&self.heap, self.id)?;
        self.alloc[spc.index()] = Some(span);
        Ok(span)
    }

    /// Hand every cached span back to the central lists and fold the local
    /// counters.
    pub fn release_all(&mut self) {
        for idx in 0..NUM_SPAN_CLASSES {
            if let Some(span) = self.alloc[idx].take() {
                self.heap.central[idx].uncache_span(&self.heap, span);
            }
        }
        self.tiny = 0;
        self.tiny_offset = 0;
        self.flush_stats();
    }

    pub fn flush_stats(&mut self) {
        self.heap.stats.fold(&mut self.local);
    }

    /// Publish buffered barrier pointers and grey objects. True if there was
    /// anything to publish.
    pub fn flush_mark_work(&mut self) -> bool {
        let had_barrier = !self.wbbuf.is_empty();
        self.flush_write_barrier();
        let published = self.heap.publish_work(&mut self.gcw);
        had_barrier || published
    }

    /// Called in the mark start handshake.
    pub fn prepare_for_mark(&mut self, cycle: u64) {
        // The tiny block may be white; new tiny objects go into a black one.
        self.tiny = 0;
        self.tiny_offset = 0;
        self.observed_cycle = cycle;
    }

    /// Last cycle this slot acknowledged.
    #[inline]
    pub fn observed_cycle(&self) -> u64 {
        self.observed_cycle
    }

    pub fn cached_spans(&self) -> impl Iterator<Item = SpanPtr> + '_ {
        self.alloc.iter().flatten().copied()
    }
}

impl Drop for SlotCache {
    fn drop(&mut self) {
        self.flush_mark_work();
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_map_words() {
        let bits = [0b101u64];
        let map = PtrMap::Bits(&bits);
        assert!(map.is_pointer(0));
        assert!(!map.is_pointer(1));
        assert!(map.is_pointer(2));
        assert!(!map.is_pointer(64));
        assert!(!map.is_noscan());
        assert!(PtrMap::Bits(&[0, 0]).is_noscan());
        assert!(PtrMap::All.is_pointer(1000));
    }
}
