//! Coroutine-style transfer between two tasks.
//!
//! A [`Handoff`] holds the one task waiting to be resumed. Transferring
//! hands a word to that task, wakes it and takes its place, so two tasks
//! calling [`Handoff::transfer`] in turn pass control and a value back and
//! forth. The word travels in the receiver's `handoff_value`, which the
//! collector scans and stack moves relocate.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    context::TaskContext,
    task::{TaskFlags, TaskId, WaitReason},
};

pub struct Handoff {
    /// Raw id of whoever resumes next.
    next: AtomicU64,
}

impl Default for Handoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(TaskId::NONE_RAW),
        }
    }

    /// The task parked in the handoff, if any.
    pub fn waiting(&self) -> Option<TaskId> {
        TaskId::from_raw(self.next.load(Ordering::Acquire))
    }

    /// Give `value` to the waiting peer and wait for one back. The first
    /// caller only waits.
    pub async fn transfer(&self, cx: &TaskContext, value: usize) -> usize {
        let me = cx.task();
        let peer = self.next.swap(cx.id().to_raw(), Ordering::AcqRel);
        self.deliver(cx, peer, value);
        loop {
            if me.take_flags(TaskFlags::HANDOFF) {
                return me.handoff_value.swap(0, Ordering::AcqRel);
            }
            cx.park(WaitReason::Handoff).await;
        }
    }

    /// Give `value` to the waiting peer and carry on. Returns false if
    /// nobody was waiting.
    pub fn give(&self, cx: &TaskContext, value: usize) -> bool {
        let peer = self.next.swap(TaskId::NONE_RAW, Ordering::AcqRel);
        self.deliver(cx, peer, value)
    }

    fn deliver(&self, cx: &TaskContext, peer: u64, value: usize) -> bool {
        let Some(peer) = TaskId::from_raw(peer) else {
            return false;
        };
        match cx.rt().tasks.get(peer) {
            Some(task) => {
                task.handoff_value.store(value, Ordering::Release);
                task.set_flags(TaskFlags::HANDOFF);
                cx.ready(peer);
                true
            }
            None => {
                log::warn!("handoff peer {peer:?} exited before resuming");
                false
            }
        }
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("waiting", &self.waiting())
            .finish()
    }
}
