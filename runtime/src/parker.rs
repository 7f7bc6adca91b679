//! One-shot thread wake-up token.
//!
//! A [`Note`] holds at most one token. `unpark` leaves a token, `park`
//! consumes one and sleeps until there is one. Used for idle worker threads,
//! background mark workers and callers blocked in `block_on`.

use std::{
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed, Release},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

const PARKED: u8 = 0b01;
const TOKEN: u8 = 0b10;

#[derive(Debug, Default)]
pub struct Note {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Note {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self) {
        self.park_until(None);
    }

    /// Park for at most `timeout`. True if woken by a token.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        self.park_until(Some(Instant::now() + timeout))
    }

    fn park_until(&self, deadline: Option<Instant>) -> bool {
        // Fast path: unpark before park.
        if self.try_consume_token() {
            return true;
        }

        self.state.fetch_or(PARKED, Release);
        if self.try_consume_token() {
            self.state.fetch_and(!PARKED, AcqRel);
            return true;
        }

        let mut guard = self.lock.lock();
        let woken = loop {
            if self.try_consume_token() {
                break true;
            }
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut guard, d).timed_out() {
                        break self.try_consume_token();
                    }
                }
                None => self.cv.wait(&mut guard),
            }
        };
        drop(guard);

        self.state.fetch_and(!PARKED, AcqRel);
        woken
    }

    #[inline]
    fn try_consume_token(&self) -> bool {
        let mut s = self.state.load(Acquire);
        while s & TOKEN != 0 {
            match self
                .state
                .compare_exchange_weak(s, s & !TOKEN, AcqRel, Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn unpark(&self) {
        let prev = self.state.fetch_or(TOKEN, Release);
        if prev & PARKED != 0 {
            let _g = self.lock.lock();
            self.cv.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering::SeqCst},
        },
        thread,
    };

    use super::*;

    #[test]
    fn token_is_consumed_when_present() {
        let n = Note::new();
        n.unpark();
        assert!(n.try_consume_token());
        assert!(!n.try_consume_token());
    }

    #[test]
    fn unpark_before_park_does_not_block() {
        let n = Note::new();
        n.unpark();
        n.park();
        assert_eq!(n.state.load(Acquire), 0);
    }

    #[test]
    fn park_timeout_expires_without_token() {
        let n = Note::new();
        let start = Instant::now();
        assert!(!n.park_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(n.state.load(Acquire) & PARKED, 0);
    }

    #[test]
    fn unpark_wakes_a_parked_thread() {
        let n = Arc::new(Note::new());
        let done = Arc::new(AtomicBool::new(false));
        let t = {
            let n = n.clone();
            let done = done.clone();
            thread::spawn(move || {
                n.park();
                done.store(true, SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!done.load(SeqCst));
        n.unpark();
        t.join().unwrap();
        assert!(done.load(SeqCst));
        assert_eq!(n.state.load(Acquire) & (PARKED | TOKEN), 0);
    }
}
