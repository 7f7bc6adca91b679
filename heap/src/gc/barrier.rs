//! Write barrier.
//!
//! While marking, every pointer store shades both the value being
//! overwritten (so nothing reachable at mark start is lost when a black
//! object takes over the only reference) and the value being written (so
//! objects handed to a black object from a stack are not missed). Shading
//! is deferred through a per-slot buffer and done in batches.

use std::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::cache::{SlotCache, WB_BUF_LEN};

/// Load a pointer word.
///
/// # Safety
/// `slot` must be an aligned word in a live object or root region.
#[inline]
pub unsafe fn load_ptr(slot: usize) -> usize {
    // SAFETY: caller guarantees the slot
    unsafe { AtomicUsize::from_ptr(slot as *mut usize) }.load(Ordering::Acquire)
}

/// Store a word that the collector never treats as a pointer.
///
/// # Safety
/// As for [`load_ptr`], and the word must not be marked as a pointer.
#[inline]
pub unsafe fn store_word(slot: usize, value: usize) {
    // SAFETY: caller guarantees the slot
    unsafe { AtomicUsize::from_ptr(slot as *mut usize) }.store(value, Ordering::Relaxed);
}

impl SlotCache {
    /// Store pointer `new` into `slot`.
    ///
    /// # Safety
    /// `slot` must be an aligned pointer word in a live heap object or in a
    /// root region the collector scans.
    #[inline]
    pub unsafe fn write_barrier(&mut self, slot: usize, new: usize) {
        // SAFETY: caller guarantees the slot
        let cell = unsafe { AtomicUsize::from_ptr(slot as *mut usize) };
        if self.heap().gc.phase().barrier_enabled() {
            let old = cell.load(Ordering::Relaxed);
            self.buffer_barrier(old, new);
        }
        cell.store(new, Ordering::Release);
    }

    #[inline]
    fn buffer_barrier(&mut self, old: usize, new: usize) {
        if old == 0 && new == 0 {
            return;
        }
        if self.wbbuf.len() + 2 > WB_BUF_LEN {
            self.flush_write_barrier();
        }
        self.wbbuf.push(old);
        self.wbbuf.push(new);
    }

    /// Shade everything in the barrier buffer.
    pub fn flush_write_barrier(&mut self) {
        if self.wbbuf.is_empty() {
            return;
        }
        let mut buf = mem::take(&mut self.wbbuf);
        let heap = self.heap().clone();
        for &ptr in &buf {
            heap.shade_root(ptr, &mut self.gcw);
        }
        buf.clear();
        self.wbbuf = buf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_word_access() {
        let mut word = 0usize;
        let slot = std::ptr::addr_of_mut!(word) as usize;
        // SAFETY: `word` lives for the whole test
        unsafe {
            store_word(slot, 42);
            assert_eq!(load_ptr(slot), 42);
        }
    }
}
