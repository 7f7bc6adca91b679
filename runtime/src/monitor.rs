//! Monitor thread.
//!
//! Runs without a slot and watches the others: takes slots away from
//! threads stuck in syscalls, asks long-running tasks to yield, forces a
//! collection when none ran for a while and returns memory to the OS. Its
//! sleep doubles from 20 µs up to 10 ms while nothing happens.

use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use heap::{Phase, Trigger, sizeclass::PAGE_SIZE};

use crate::{runtime::RuntimeInner, slot::SlotStatus};

const MIN_SLEEP: Duration = Duration::from_micros(20);
const MAX_SLEEP: Duration = Duration::from_millis(10);

/// A task running this long without a switch is asked to yield.
const FORCE_PREEMPT_NS: u64 = 10_000_000;

/// A slot in a syscall this long is retaken even if nothing else is queued.
const SYSCALL_RETAKE_NS: u64 = 10_000_000;

/// A slot in a syscall this long is retaken when there is other work.
const SYSCALL_BUSY_NS: u64 = 20_000;

/// Retained memory beyond the heap goal by this factor is scavenged.
const SCAVENGE_SLACK: f64 = 1.1;

impl RuntimeInner {
    pub(crate) fn monitor_main(self: Arc<Self>) {
        log::debug!("monitor started");
        let mut sleep = MIN_SLEEP;
        let mut last_scavenge = Instant::now();
        while !self.is_shutdown() {
            self.monitor_note.park_timeout(sleep);
            if self.is_shutdown() {
                break;
            }
            let mut busy = false;

            let now = Instant::now();
            busy |= self.run_timers(now) > 0;
            if self.system.fing_wake.swap(false, Ordering::AcqRel) {
                self.wake_finalizers();
                busy = true;
            }
            if !self.world_stopped() {
                busy |= self.retake() > 0;
            }
            self.force_gc();
            if now.duration_since(last_scavenge) >= self.config.scavenge {
                last_scavenge = now;
                self.scavenge();
            }
            let ns = self.heap.nanotime();
            if self.heap.gc.limiter.need_update(ns) {
                self.heap.gc.limiter.update(ns);
            }

            sleep = if busy {
                MIN_SLEEP
            } else {
                (sleep * 2).min(MAX_SLEEP)
            };
        }
        log::debug!("monitor exiting");
    }

    /// Retake slots from syscalls and preempt long runs. Returns the
    /// number of slots retaken.
    fn retake(&self) -> usize {
        let now = self.heap.nanotime() as u64;
        let mut retaken = 0;
        let other_work = !self.sched.global.is_empty();
        for slot in self.sched.slots.iter() {
            let tick = slot.sched_tick.load(Ordering::Relaxed);
            if slot.monitor_tick.swap(tick, Ordering::Relaxed) != tick {
                slot.monitor_when.store(now, Ordering::Relaxed);
                continue;
            }
            let since_switch = now.saturating_sub(slot.monitor_when.load(Ordering::Relaxed));
            match slot.status() {
                SlotStatus::Running if since_switch > FORCE_PREEMPT_NS => {
                    if let Some(task) = slot.current_task().and_then(|id| self.tasks.get(id)) {
                        log::trace!("preempting task {}", task.goid());
                        self.preempt(&task);
                    }
                    slot.monitor_when.store(now, Ordering::Relaxed);
                }
                SlotStatus::Syscall => {
                    let in_syscall =
                        now.saturating_sub(slot.syscall_when.load(Ordering::Relaxed));
                    let wanted = other_work || !slot.runq.is_empty();
                    if (in_syscall > SYSCALL_BUSY_NS && wanted) || in_syscall > SYSCALL_RETAKE_NS {
                        if slot.take_from_syscall(SlotStatus::Idle) {
                            log::trace!("retook slot {} after {in_syscall}ns in syscall", slot.id);
                            retaken += 1;
                            if wanted {
                                self.start_worker(false);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        retaken
    }

    fn force_gc(&self) {
        let heap = &self.heap;
        if heap.phase() != Phase::Off || self.config.force_gc.is_zero() {
            return;
        }
        let last = heap.stats.last_gc_ns.load(Ordering::Relaxed);
        let idle_ns = heap.nanotime() as u64 - last;
        if idle_ns as u128 > self.config.force_gc.as_nanos() && heap.should_start(Trigger::Time) {
            log::debug!("forcing a collection after {idle_ns}ns");
            heap.start_cycle(self, Trigger::Time);
        }
    }

    /// Give free memory back when the heap retains well past its goal.
    fn scavenge(&self) {
        let heap = &self.heap;
        let c = &heap.pages.counters;
        let released = c.released.load(Ordering::Relaxed) * PAGE_SIZE;
        let retained = c.committed.load(Ordering::Relaxed).saturating_sub(released) as u64;
        let goal = heap.gc.pacer.goal();
        let limit = (goal as f64 * SCAVENGE_SLACK) as u64;
        if retained > limit {
            let released = heap.pages.scavenge((retained - limit) as usize);
            if released > 0 {
                log::debug!("scavenged {released} bytes, goal {goal}");
            }
        }
    }
}
