//! Central span lists.
//!
//! One [`Central`] per span class holds the spans no slot has cached. Spans
//! are split by whether they have free objects and by whether they have
//! been swept this cycle. The swept/unswept halves swap roles whenever the
//! sweep generation advances by two, so flipping a cycle touches no list.

use std::{io::Write, sync::atomic::Ordering};

use crate::{
    error::AllocError,
    fatal::throw_with,
    heap::HeapInner,
    lock::{Lock, LockRank},
    sizeclass::{SpanClass, class_npages},
    span::{SpanLocation, SpanPtr},
};

/// Unswept full spans examined per refill before growing the heap instead.
const FULL_SWEEP_BUDGET: usize = 100;

#[inline]
fn swept(sweepgen: u32) -> usize {
    (sweepgen / 2 % 2) as usize
}

#[inline]
fn unswept(sweepgen: u32) -> usize {
    1 - swept(sweepgen)
}

#[derive(Default)]
struct SpanLists {
    /// Spans with at least one free object.
    partial: [Vec<SpanPtr>; 2],
    full: [Vec<SpanPtr>; 2],
}

pub struct Central {
    spanclass: SpanClass,
    lists: Lock<SpanLists>,
}

impl Central {
    pub(crate) fn new(spanclass: SpanClass) -> Self {
        Self {
            spanclass,
            lists: Lock::new(LockRank::Central, SpanLists::default()),
        }
    }

    pub fn spanclass(&self) -> SpanClass {
        self.spanclass
    }

    /// Hand a span with free objects to `slot`, sweeping or growing the heap
    /// as needed.
    pub(crate) fn cache_span(&self, heap: &HeapInner, slot: u32) -> Result<SpanPtr, AllocError> {
        let npages = class_npages(self.spanclass.sizeclass());
        heap.deduct_sweep_credit(npages);

        let sg = heap.sweepgen();
        let found = 'found: {
            let mut lists = self.lists.lock();
            if let Some(span) = lists.partial[swept(sg)].pop() {
                break 'found Some(span);
            }
            if let Some(span) = lists.partial[unswept(sg)].pop() {
                drop(lists);
                if heap.try_claim(span) {
                    heap.sweep_span(span, true);
                } else {
                    heap.wait_swept(span);
                }
                break 'found Some(span);
            }
            for _ in 0..FULL_SWEEP_BUDGET {
                let Some(span) = lists.full[unswept(sg)].pop() else {
                    break;
                };
                drop(lists);
                if heap.try_claim(span) {
                    heap.sweep_span(span, true);
                } else {
                    heap.wait_swept(span);
                }
                if !span.is_full() {
                    break 'found Some(span);
                }
                lists = self.lists.lock();
                lists.full[swept(sg)].push(span);
            }
            None
        };

        let span = match found {
            Some(span) => span,
            None => {
                let span = heap.pages.alloc_span(npages, self.spanclass)?;
                span.sweepgen.store(sg, Ordering::Release);
                log::trace!("{:?}: new span {:#x}", self.spanclass, span.base());
                span
            }
        };
        if span.is_full() {
            throw_with("span from central list has no free objects", |out| {
                let _ = writeln!(out, "{span:?}");
            });
        }
        span.set_location(SpanLocation::Cached(slot));
        heap.stats.heap_live.fetch_add(
            (span.free_objects() * span.elemsize()) as u64,
            Ordering::Relaxed,
        );
        Ok(span)
    }

    /// Take back a span a slot no longer allocates from.
    pub(crate) fn uncache_span(&self, heap: &HeapInner, span: SpanPtr) {
        let sg = heap.sweepgen();
        if span.sweepgen.load(Ordering::Acquire) != sg {
            throw_with("uncached span has a stale sweep generation", |out| {
                let _ = writeln!(out, "{span:?} heap sweepgen {sg}");
            });
        }
        let unused = (span.free_objects() * span.elemsize()) as u64;
        let _ = heap
            .stats
            .heap_live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(unused))
            });
        self.push_swept(span, sg);
    }

    /// File a swept span.
    pub(crate) fn push_swept(&self, span: SpanPtr, sg: u32) {
        span.set_location(SpanLocation::Central);
        let mut lists = self.lists.lock();
        if span.is_full() {
            lists.full[swept(sg)].push(span);
        } else {
            lists.partial[swept(sg)].push(span);
        }
    }

    /// Remove a span that still needs sweeping, if any.
    pub(crate) fn pop_unswept(&self, sg: u32) -> Option<SpanPtr> {
        let mut lists = self.lists.lock();
        lists.partial[unswept(sg)]
            .pop()
            .or_else(|| lists.full[unswept(sg)].pop())
    }

    /// Spans on any list.
    pub fn len(&self) -> usize {
        let lists = self.lists.lock();
        lists.partial.iter().chain(&lists.full).map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(SpanPtr)) {
        let lists = self.lists.lock();
        for span in lists.partial.iter().chain(&lists.full).flatten() {
            f(*span);
        }
    }
}

/// Spans holding one large object each.
pub struct LargeSpans {
    lists: Lock<[Vec<SpanPtr>; 2]>,
}

impl Default for LargeSpans {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeSpans {
    pub fn new() -> Self {
        Self {
            lists: Lock::new(LockRank::LargeSpans, [Vec::new(), Vec::new()]),
        }
    }

    pub(crate) fn push_swept(&self, span: SpanPtr, sg: u32) {
        span.set_location(SpanLocation::Large);
        self.lists.lock()[swept(sg)].push(span);
    }

    pub(crate) fn pop_unswept(&self, sg: u32) -> Option<SpanPtr> {
        self.lists.lock()[unswept(sg)].pop()
    }

    pub fn len(&self) -> usize {
        let lists = self.lists.lock();
        lists[0].len() + lists[1].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(SpanPtr)) {
        let lists = self.lists.lock();
        for span in lists.iter().flatten() {
            f(*span);
        }
    }
}
