//! I/O readiness hook.
//!
//! The runtime does no I/O of its own. An embedder that does plugs in a
//! [`Poller`]; idle workers ask it for tasks whose I/O completed before they
//! go looking for work on other slots.

use std::sync::Arc;

use heap::{Lock, LockRank};

use crate::task::TaskId;

pub trait Poller: Send + Sync {
    /// Tasks whose I/O is ready. Must not block.
    fn poll(&self) -> Vec<TaskId>;

    /// Whether any I/O is outstanding, so idle workers keep checking.
    fn pending(&self) -> bool {
        false
    }
}

/// No I/O.
#[derive(Debug, Default)]
pub struct NoPoller;

impl Poller for NoPoller {
    fn poll(&self) -> Vec<TaskId> {
        Vec::new()
    }
}

/// A poller fed by hand: completions posted by any thread come back out of
/// the next `poll`.
pub struct QueuePoller {
    ready: Lock<Vec<TaskId>>,
}

impl QueuePoller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Lock::new(LockRank::Leaf, Vec::new()),
        })
    }

    pub fn complete(&self, task: TaskId) {
        self.ready.lock().push(task);
    }
}

impl Poller for QueuePoller {
    fn poll(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.ready.lock())
    }

    fn pending(&self) -> bool {
        !self.ready.lock().is_empty()
    }
}

impl<P: Poller + ?Sized> Poller for Arc<P> {
    fn poll(&self) -> Vec<TaskId> {
        (**self).poll()
    }

    fn pending(&self) -> bool {
        (**self).pending()
    }
}
