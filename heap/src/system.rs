//! Thin OS memory layer: reserve address space once, hand pages back with
//! `madvise` when the scavenger asks for it.

use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    #[cfg(target_os = "linux")]
    pub const MADV_DONTNEED: i32 = 4;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and madvise
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// Reserve `len` bytes of read/write address space without committing
    /// swap for it.
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn reserve(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping, no fd involved
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// # Safety
    /// range must lie inside a live mapping
    #[inline]
    pub unsafe fn dont_need(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Reserve the whole heap range up front. Pages are touched lazily, so
/// the reservation costs address space only.
#[must_use]
pub fn reserve_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mapping with no aliasing
    let ptr = unsafe { unix::reserve(size) };
    NonNull::new(ptr)
}

pub fn release_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from reserve_memory with the same size
    unsafe { unix::release(ptr.as_ptr(), size) };
}

/// Tell the OS the pages are unused. Their contents read back as zero.
pub fn return_to_os(addr: usize, size: usize) -> bool {
    debug_assert!(addr.is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: callers only pass free page runs inside the reservation
    unsafe { unix::dont_need(addr as *mut u8, size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_write_release() {
        let size = 16 * OS_PAGE_SIZE;
        let base = reserve_memory(size).expect("reserve");
        let p = base.as_ptr();
        // SAFETY: inside the fresh mapping
        unsafe {
            *p = 7;
            *p.add(size - 1) = 9;
        }
        assert!(return_to_os(p as usize, size));
        // SAFETY: DONTNEED pages read back as zero
        unsafe {
            assert_eq!(*p, 0);
            assert_eq!(*p.add(size - 1), 0);
        }
        release_memory(base, size);
    }
}
