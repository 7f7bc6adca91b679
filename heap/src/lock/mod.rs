//! Ranked runtime locks.

mod mutex;
pub mod rank;

use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

pub use mutex::RawMutex;
pub use rank::{LockRank, RankChecker, RankViolation, check_order, set_rank_checking};

thread_local! {
    static LOCKS_HELD: Cell<u32> = const { Cell::new(0) };
}

/// Number of runtime locks the current thread holds. Parking a task or
/// blocking a worker with this non-zero is a defect.
#[inline]
#[must_use]
pub fn held_count() -> u32 {
    LOCKS_HELD.with(Cell::get)
}

/// A non-reentrant lock with a static rank.
pub struct Lock<T: ?Sized> {
    raw: RawMutex,
    rank: LockRank,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Send for Lock<T> {}
// SAFETY: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Sync for Lock<T> {}

impl<T> Lock<T> {
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            rank,
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Lock<T> {
    #[inline]
    pub fn lock(&self) -> LockGuard<'_, T> {
        rank::acquire_rank(self.rank, self.addr());
        self.raw.lock();
        LOCKS_HELD.with(|c| c.set(c.get() + 1));
        LockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<LockGuard<'_, T>> {
        if !self.raw.try_lock() {
            return None;
        }
        rank::acquire_rank(self.rank, self.addr());
        LOCKS_HELD.with(|c| c.set(c.get() + 1));
        Some(LockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    #[inline]
    #[must_use]
    pub fn rank(&self) -> LockRank {
        self.rank
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn addr(&self) -> usize {
        self as *const Self as *const u8 as usize
    }
}

impl<T: ?Sized + Default> Default for Lock<T> {
    fn default() -> Self {
        Self::new(LockRank::Leaf, T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Lock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("rank", &self.rank)
            .field("locked", &self.raw.is_locked())
            .finish_non_exhaustive()
    }
}

#[must_use = "the lock is released when the guard drops"]
pub struct LockGuard<'a, T: ?Sized> {
    lock: &'a Lock<T>,
    // Released on the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for LockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for LockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for LockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.unlock();
        rank::release_rank(self.lock.rank, self.lock.addr());
        LOCKS_HELD.with(|c| c.set(c.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn guard_counts_held_locks() {
        let a = Lock::new(LockRank::Sched, 1);
        let b = Lock::new(LockRank::Heap, 2);
        assert_eq!(held_count(), 0);
        {
            let ga = a.lock();
            let gb = b.lock();
            assert_eq!(*ga + *gb, 3);
            assert_eq!(held_count(), 2);
        }
        assert_eq!(held_count(), 0);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let l = Lock::new(LockRank::Leaf, ());
        let g = l.lock();
        assert!(l.try_lock().is_none());
        drop(g);
        assert!(l.try_lock().is_some());
    }

    #[test]
    fn shared_vector_under_contention() {
        let l = Arc::new(Lock::new(LockRank::Leaf, Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let l = Arc::clone(&l);
                thread::spawn(move || {
                    for i in 0..1000 {
                        l.lock().push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut v = Arc::try_unwrap(l).unwrap().into_inner();
        v.sort_unstable();
        assert_eq!(v, (0..4000).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "lock ordering problem")]
    fn live_checker_rejects_inversion() {
        set_rank_checking(true);
        let sched = Lock::new(LockRank::Sched, ());
        let heap = Lock::new(LockRank::Heap, ());
        let _h = heap.lock();
        let _s = sched.lock();
    }

    #[test]
    fn live_checker_tracks_out_of_order_release() {
        set_rank_checking(true);
        let a = Lock::new(LockRank::Timers, ());
        let b = Lock::new(LockRank::Sched, ());
        let ga = a.lock();
        let gb = b.lock();
        drop(ga);
        assert_eq!(rank::held_ranks(), vec![LockRank::Sched]);
        drop(gb);
        assert!(rank::held_ranks().is_empty());
    }
}
