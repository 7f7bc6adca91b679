//! The runtime's mutual-exclusion word.
//!
//! ```text
//!  63                         10   9    8    7 .. 2   1        0
//! +-----------------------------+----+----+-------+--------+--------+
//! | waiter stack head (high bits)| SL | SP | unused| SLEEPING| LOCKED |
//! +-----------------------------+----+----+-------+--------+--------+
//! ```
//!
//! Waiters are thread-local records aligned to 1024 bytes, so a pointer to
//! one fits in the bits above `M_MASK`. They form a LIFO stack linked through
//! [`Waiter::next`]. One contender at a time may hold `SPINNING`; everyone
//! else sleeps on their semaphore. `STACK_LOCK` grants the right to pop or
//! unlink sleeping waiters.

use std::{
    cell::Cell,
    hint,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use parking_lot::{Condvar, Mutex};

use crate::fatal::throw;

const LOCKED: usize = 0x001;
const SLEEPING: usize = 0x002;
const SPINNING: usize = 0x100;
const STACK_LOCK: usize = 0x200;
const M_MASK: usize = 0x3FF;

const ACTIVE_SPIN: usize = 4;
const ACTIVE_SPIN_SIZE: usize = 30;
const PASSIVE_SPIN: usize = 1;

/// Every Nth contended release wakes the oldest waiter instead of the newest.
const TAIL_WAKE_PERIOD: u32 = 16;

/// Per-thread sleep record.
#[repr(C, align(1024))]
struct Waiter {
    next: AtomicUsize,
    sema: Sema,
}

/// Binary semaphore used to sleep a single waiter.
struct Sema {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl Sema {
    fn sleep(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.cv.wait(&mut woken);
        }
        *woken = false;
    }

    fn wakeup(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cv.notify_one();
    }
}

thread_local! {
    static WAITER: Box<Waiter> = Box::new(Waiter {
        next: AtomicUsize::new(0),
        sema: Sema { woken: Mutex::new(false), cv: Condvar::new() },
    });
    static WAKE_RNG: Cell<u32> = const { Cell::new(0) };
}

fn current_waiter() -> *const Waiter {
    WAITER.with(|w| &**w as *const Waiter)
}

/// # Safety
/// `addr` must be a waiter that is parked on this mutex; waiters never die
/// while parked.
unsafe fn waiter<'a>(addr: usize) -> &'a Waiter {
    // SAFETY: guaranteed by caller
    unsafe { &*(addr as *const Waiter) }
}

fn anti_starve() -> bool {
    WAKE_RNG.with(|c| {
        let mut x = c.get();
        if x == 0 {
            x = (current_waiter() as usize >> 10) as u32 | 1;
        }
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        c.set(x);
        x.is_multiple_of(TAIL_WAKE_PERIOD)
    })
}

/// Raw lock word. See the module docs for the layout.
#[derive(Debug, Default)]
pub struct RawMutex {
    key: AtomicUsize,
}

impl RawMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self { key: AtomicUsize::new(0) }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.key.load(Ordering::Relaxed) & LOCKED != 0
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.key.fetch_or(LOCKED, Ordering::Acquire) & LOCKED == 0
    }

    #[inline]
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let me = current_waiter();
        // SAFETY: our own thread-local waiter
        let me_ref = unsafe { &*me };
        debug_assert_eq!(me as usize & M_MASK, 0);

        let mut we_spin = false;
        let mut at_tail = false;
        let mut v = self.key.load(Ordering::Relaxed);
        let mut i = 0;
        loop {
            if v & LOCKED == 0 {
                if we_spin {
                    let mut next = (v & !SPINNING) | SLEEPING | LOCKED;
                    if next & !M_MASK == 0 {
                        next &= !SLEEPING;
                    }
                    if self
                        .key
                        .compare_exchange(v, next, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                } else {
                    let prev = self.key.fetch_or(LOCKED | SLEEPING, Ordering::Acquire);
                    if prev & LOCKED == 0 {
                        return;
                    }
                }
                v = self.key.load(Ordering::Relaxed);
                i += 1;
                continue;
            }

            if !we_spin
                && v & SPINNING == 0
                && self
                    .key
                    .compare_exchange(v, v | SPINNING, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                v |= SPINNING;
                we_spin = true;
            }

            if we_spin || at_tail {
                if i < ACTIVE_SPIN {
                    for _ in 0..ACTIVE_SPIN_SIZE {
                        hint::spin_loop();
                    }
                    v = self.key.load(Ordering::Relaxed);
                    i += 1;
                    continue;
                } else if i < ACTIVE_SPIN + PASSIVE_SPIN {
                    thread::yield_now();
                    v = self.key.load(Ordering::Relaxed);
                    i += 1;
                    continue;
                }
            }

            // Go to sleep: push ourselves on the waiter stack.
            me_ref.next.store(v & !M_MASK, Ordering::Relaxed);
            let mut next = (me as usize & !M_MASK) | (v & M_MASK) | SLEEPING;
            if we_spin {
                next &= !SPINNING;
            }
            if self
                .key
                .compare_exchange(v, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                we_spin = false;
                me_ref.sema.sleep();
                at_tail = me_ref.next.load(Ordering::Relaxed) == 0;
                i = 0;
            }
            me_ref.next.store(0, Ordering::Relaxed);
            v = self.key.load(Ordering::Relaxed);
        }
    }

    /// # Panics
    /// Aborts the process if the word is not locked.
    #[inline]
    pub fn unlock(&self) {
        let prev = self.key.fetch_and(!0xFF, Ordering::Release);
        if prev & LOCKED == 0 {
            throw("unlock of unlocked lock");
        }
        if prev & SLEEPING != 0 {
            self.unlock_wake();
        }
    }

    #[cold]
    fn unlock_wake(&self) {
        let mut v = self.key.load(Ordering::Relaxed);
        let anti_starve = anti_starve();
        if !(anti_starve || v & SPINNING == 0) {
            return;
        }

        loop {
            if v & !M_MASK == 0 || v & STACK_LOCK != 0 {
                // Empty stack, or the stack lock owner makes the same call.
                return;
            }
            if self
                .key
                .compare_exchange(v, v | STACK_LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                v |= STACK_LOCK;
                break;
            }
            v = self.key.load(Ordering::Relaxed);
        }

        // We own the stack lock: new waiters may still push, but only we can
        // pop or unlink.
        let mut committed: usize = 0;
        loop {
            let mut head = v & !M_MASK;
            let flags = v & (M_MASK & !STACK_LOCK);
            let mut wake = committed;
            if committed == 0 {
                if v & SPINNING == 0 {
                    wake = head;
                }
                if anti_starve {
                    // Walk to the bottom and unlink the oldest waiter.
                    let mut prev = 0;
                    let mut cur = head;
                    loop {
                        // SAFETY: parked waiters stay alive while on the stack
                        let next = unsafe { waiter(cur) }.next.load(Ordering::Relaxed);
                        if next == 0 {
                            break;
                        }
                        prev = cur;
                        cur = next;
                    }
                    wake = cur;
                    if prev != 0 {
                        // SAFETY: as above; we hold the stack lock
                        unsafe { waiter(prev) }.next.store(0, Ordering::Relaxed);
                        committed = wake;
                    }
                }
            }
            if wake != 0 && wake == head {
                // SAFETY: head is a parked waiter
                head = unsafe { waiter(head) }.next.load(Ordering::Relaxed) & !M_MASK;
            }
            let next = head | flags;
            if self
                .key
                .compare_exchange(v, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if wake != 0 {
                    // SAFETY: we claimed this waiter
                    unsafe { waiter(wake) }.sema.wakeup();
                }
                return;
            }
            v = self.key.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::UnsafeCell,
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;

    struct Counter {
        lock: RawMutex,
        value: UnsafeCell<u64>,
    }
    // SAFETY: value only touched under `lock`
    unsafe impl Sync for Counter {}

    #[test]
    fn uncontended_lock_unlock() {
        let m = RawMutex::new();
        m.lock();
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "unlock of unlocked lock")]
    fn double_unlock_is_fatal() {
        let m = RawMutex::new();
        m.lock();
        m.unlock();
        m.unlock();
    }

    #[test]
    fn waiter_fits_in_packed_bits() {
        assert_eq!(std::mem::align_of::<Waiter>(), 1024);
        assert_eq!(current_waiter() as usize & M_MASK, 0);
    }

    #[test]
    fn contended_increments_are_exclusive() {
        let threads = 8;
        let iters = 20_000;
        let counter = Arc::new(Counter {
            lock: RawMutex::new(),
            value: UnsafeCell::new(0),
        });
        let start = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..iters {
                        counter.lock.lock();
                        // SAFETY: guarded by the lock
                        unsafe { *counter.value.get() += 1 };
                        counter.lock.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(!counter.lock.is_locked());
        // SAFETY: all threads joined
        assert_eq!(unsafe { *counter.value.get() }, (threads * iters) as u64);
    }

    #[test]
    fn sleepers_are_woken_after_long_hold() {
        let m = Arc::new(RawMutex::new());
        m.lock();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    m.lock();
                    m.unlock();
                })
            })
            .collect();
        // Long enough for every contender to exhaust its spins and sleep.
        thread::sleep(std::time::Duration::from_millis(50));
        m.unlock();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.key.load(Ordering::Relaxed) & !M_MASK, 0);
    }
}
