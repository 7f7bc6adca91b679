//! Static lock ranks.
//!
//! Every runtime lock carries a rank. A thread may only acquire a lock whose
//! rank is strictly greater than every lock it already holds, with a short
//! list of ranks that may be held more than once at a time. `Leaf` locks can
//! be taken under anything but never nest among themselves.

use std::{
    cell::RefCell,
    fmt,
    io::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::fatal::throw_with;

/// Acquisition order, lowest first.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// Serializes collection cycle starts.
    GcStart = 1,
    /// Serializes mark completion checks.
    MarkDone,
    /// Held for the duration of a stop-the-world window.
    World,
    /// Tasks waiting for a cycle to finish.
    GcWaiters,
    Timers,
    Sched,
    AllTasks,
    TaskFree,
    Finalizer,
    Specials,
    StackPool,
    Central,
    LargeSpans,
    Heap,
    WorkBufs,
    Leaf = 1000,
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ranks that may be held several times at once. The central lists of
/// different span classes are locked together when verifying accounting,
/// always in class order.
const SAME_RANK_ALLOWED: &[LockRank] = &[LockRank::Central];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lock ordering problem: acquiring {acquiring} while holding {held}")]
pub struct RankViolation {
    pub held: LockRank,
    pub acquiring: LockRank,
}

/// Check whether `next` may be acquired while `held` is the most recently
/// acquired lock.
pub fn check_order(held: LockRank, next: LockRank) -> Result<(), RankViolation> {
    let ok = if next == LockRank::Leaf {
        held < LockRank::Leaf
    } else if held == next {
        SAME_RANK_ALLOWED.contains(&next)
    } else {
        held < next
    };
    if ok {
        Ok(())
    } else {
        Err(RankViolation {
            held,
            acquiring: next,
        })
    }
}

/// Replays a sequence of acquisitions and releases against the rank order
/// without touching real locks.
#[derive(Debug, Default)]
pub struct RankChecker {
    held: Vec<LockRank>,
}

impl RankChecker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, rank: LockRank) -> Result<(), RankViolation> {
        if let Some(&top) = self.held.last() {
            check_order(top, rank)?;
        }
        self.held.push(rank);
        Ok(())
    }

    /// Release the most recent lock with `rank`. Releases may happen in any
    /// order.
    pub fn release(&mut self, rank: LockRank) {
        if let Some(pos) = self.held.iter().rposition(|&r| r == rank) {
            self.held.remove(pos);
        }
    }

    #[must_use]
    pub fn held(&self) -> &[LockRank] {
        &self.held
    }
}

static CHECKING: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// Turn live rank checking on or off for the whole process.
pub fn set_rank_checking(enabled: bool) {
    CHECKING.store(enabled, Ordering::Relaxed);
}

#[inline]
#[must_use]
pub fn rank_checking() -> bool {
    CHECKING.load(Ordering::Relaxed)
}

const MAX_HELD: usize = 16;

#[derive(Clone, Copy)]
struct HeldLock {
    rank: LockRank,
    addr: usize,
}

struct HeldLocks {
    len: usize,
    locks: [HeldLock; MAX_HELD],
}

thread_local! {
    static HELD: RefCell<HeldLocks> = const {
        RefCell::new(HeldLocks {
            len: 0,
            locks: [HeldLock { rank: LockRank::Leaf, addr: 0 }; MAX_HELD],
        })
    };
}

fn print_held(out: &mut dyn Write, held: &HeldLocks) {
    for h in &held.locks[..held.len] {
        let _ = writeln!(out, "  held: {:>5} {} {:#x}", h.rank as u16, h.rank, h.addr);
    }
}

pub(crate) fn acquire_rank(rank: LockRank, addr: usize) {
    if !rank_checking() {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if held.len > 0 {
            let top = held.locks[held.len - 1];
            if let Err(violation) = check_order(top.rank, rank) {
                let snapshot = HeldLocks {
                    len: held.len,
                    locks: held.locks,
                };
                drop(held);
                throw_with(&violation.to_string(), |out| {
                    print_held(out, &snapshot);
                    let _ = writeln!(out, "  want: {:>5} {} {addr:#x}", rank as u16, rank);
                });
            }
        }
        if held.len == MAX_HELD {
            drop(held);
            throw_with("too many locks held concurrently for rank checking", |_| {});
        }
        let len = held.len;
        held.locks[len] = HeldLock { rank, addr };
        held.len += 1;
    });
}

pub(crate) fn release_rank(rank: LockRank, addr: usize) {
    if !rank_checking() {
        return;
    }
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        let len = held.len;
        // Checking may have been switched on while this lock was held.
        if let Some(i) = (0..len)
            .rev()
            .find(|&i| held.locks[i].addr == addr && held.locks[i].rank == rank)
        {
            held.locks.copy_within(i + 1..len, i);
            held.len -= 1;
        }
    });
}

/// Ranks of the locks the current thread holds, oldest first.
#[must_use]
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| {
        let held = held.borrow();
        held.locks[..held.len].iter().map(|h| h.rank).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &[LockRank] = &[
        LockRank::GcStart,
        LockRank::MarkDone,
        LockRank::World,
        LockRank::GcWaiters,
        LockRank::Timers,
        LockRank::Sched,
        LockRank::AllTasks,
        LockRank::TaskFree,
        LockRank::Finalizer,
        LockRank::Specials,
        LockRank::StackPool,
        LockRank::Central,
        LockRank::LargeSpans,
        LockRank::Heap,
        LockRank::WorkBufs,
    ];

    #[test]
    fn increasing_sequences_never_report() {
        // Every subsequence of the total order, taken in order, is acyclic.
        for mask in 0u32..(1 << ORDER.len()) {
            let mut checker = RankChecker::new();
            for (i, &rank) in ORDER.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    checker.acquire(rank).expect("acyclic order reported");
                }
            }
            checker.acquire(LockRank::Leaf).expect("leaf under anything");
        }
    }

    #[test]
    fn release_then_reacquire_lower_is_fine() {
        let mut checker = RankChecker::new();
        checker.acquire(LockRank::Heap).unwrap();
        checker.release(LockRank::Heap);
        checker.acquire(LockRank::Sched).unwrap();
        checker.acquire(LockRank::Heap).unwrap();
        assert_eq!(checker.held(), &[LockRank::Sched, LockRank::Heap]);
    }

    #[test]
    fn injected_cycle_is_reported() {
        // Thread A: Sched then Heap. Thread B: Heap then Sched.
        let mut a = RankChecker::new();
        a.acquire(LockRank::Sched).unwrap();
        a.acquire(LockRank::Heap).unwrap();

        let mut b = RankChecker::new();
        b.acquire(LockRank::Heap).unwrap();
        let err = b.acquire(LockRank::Sched).unwrap_err();
        assert_eq!(
            err,
            RankViolation {
                held: LockRank::Heap,
                acquiring: LockRank::Sched
            }
        );
    }

    #[test]
    fn every_descending_pair_is_reported() {
        for (i, &lo) in ORDER.iter().enumerate() {
            for &hi in &ORDER[i + 1..] {
                assert!(check_order(hi, lo).is_err(), "{hi} then {lo}");
            }
        }
    }

    #[test]
    fn same_rank_needs_exception() {
        assert!(check_order(LockRank::Heap, LockRank::Heap).is_err());
        assert!(check_order(LockRank::Central, LockRank::Central).is_ok());
        assert!(check_order(LockRank::Leaf, LockRank::Leaf).is_err());
    }
}
