mod common;

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use runtime::{Handoff, PtrMap, QueuePoller, Runtime, Semaphore, WaitReason};

use common::{config, metric, runtime, wait_for};

#[test]
fn thousand_parked_tasks_readied_in_reverse() {
    let rt = runtime(4);
    let n = 1000;
    let released: Arc<Vec<AtomicBool>> = Arc::new((0..n).map(|_| AtomicBool::new(false)).collect());
    let finished = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::with_capacity(n)));

    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let released = released.clone();
        let finished = finished.clone();
        let order = order.clone();
        let id = rt
            .spawn(move |cx| async move {
                while !released[i].load(Ordering::Acquire) {
                    cx.park(WaitReason::Park).await;
                }
                order.lock().push(i);
                finished.fetch_add(1, Ordering::AcqRel);
                Ok(())
            })
            .unwrap();
        ids.push(id);
    }

    thread::sleep(Duration::from_millis(20));
    assert_eq!(finished.load(Ordering::Acquire), 0);
    for (i, id) in ids.iter().enumerate().rev() {
        released[i].store(true, Ordering::Release);
        rt.ready(*id);
    }
    assert!(
        wait_for(Duration::from_secs(20), || finished.load(Ordering::Acquire) == n),
        "only {} of {n} tasks finished",
        finished.load(Ordering::Acquire)
    );
    let order = order.lock();
    let unique: HashSet<_> = order.iter().collect();
    assert_eq!(unique.len(), n);
    // Stale ids are ignored.
    rt.ready(ids[0]);
}

#[test]
fn work_spreads_across_workers() {
    let rt = runtime(4);
    let threads = Arc::new(Mutex::new(HashSet::new()));
    let seen = threads.clone();
    rt.block_on(move |cx| async move {
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..64 {
            let done = done.clone();
            let seen = seen.clone();
            let spawned = cx.spawn(move |cx| async move {
                for _ in 0..50 {
                    seen.lock().insert(thread::current().id());
                    let start = Instant::now();
                    while start.elapsed() < Duration::from_micros(200) {
                        std::hint::spin_loop();
                    }
                    cx.yield_now().await;
                }
                done.release(&cx);
                Ok(())
            });
            if let Err(err) = spawned {
                return Err(cx.exception(err.to_string(), 0));
            }
        }
        for _ in 0..64 {
            done.acquire(&cx).await;
        }
        Ok(())
    })
    .unwrap();

    let n = threads.lock().len();
    assert!(n >= 2, "all tasks ran on {n} thread");
    assert!(metric(&rt, "/sched/workers") >= 2);
}

#[test]
fn sleep_waits_for_its_deadline() {
    let rt = runtime(2);
    let elapsed = rt
        .block_on(|cx| async move {
            let start = Instant::now();
            cx.sleep(Duration::from_millis(30)).await;
            Ok(start.elapsed())
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(30), "woke after {elapsed:?}");
    assert_eq!(metric(&rt, "/sched/timers"), 0);
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let rt = runtime(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));
    for (i, ms) in [40u64, 10, 25].into_iter().enumerate() {
        let order = order.clone();
        let done = done.clone();
        rt.spawn(move |cx| async move {
            cx.sleep(Duration::from_millis(ms)).await;
            order.lock().push(i);
            done.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
        .unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::Acquire) == 3));
    assert_eq!(*order.lock(), vec![1, 2, 0]);
}

#[test]
fn poller_completions_ready_tasks() {
    let poller = QueuePoller::new();
    let rt = Runtime::with_poller(common::config(2), poller.clone()).unwrap();
    let io_done = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (flag, fin) = (io_done.clone(), finished.clone());
    let id = rt
        .spawn(move |cx| async move {
            while !flag.load(Ordering::Acquire) {
                cx.park(WaitReason::IoWait).await;
            }
            fin.store(true, Ordering::Release);
            Ok(())
        })
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    assert!(!finished.load(Ordering::Acquire));
    io_done.store(true, Ordering::Release);
    poller.complete(id);
    assert!(wait_for(Duration::from_secs(5), || finished.load(Ordering::Acquire)));
}

#[test]
fn semaphore_bounds_concurrency() {
    let rt = runtime(4);
    let (inside, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let observed = peak.clone();
    rt.block_on(move |cx| async move {
        let sem = Arc::new(Semaphore::new(2));
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..8 {
            let (sem, done) = (sem.clone(), done.clone());
            let (inside, peak) = (inside.clone(), peak.clone());
            let spawned = cx.spawn(move |cx| async move {
                for _ in 0..10 {
                    sem.acquire(&cx).await;
                    let now = inside.fetch_add(1, Ordering::AcqRel) + 1;
                    peak.fetch_max(now, Ordering::AcqRel);
                    cx.yield_now().await;
                    inside.fetch_sub(1, Ordering::AcqRel);
                    sem.release(&cx);
                }
                done.release(&cx);
                Ok(())
            });
            if let Err(err) = spawned {
                return Err(cx.exception(err.to_string(), 0));
            }
        }
        for _ in 0..8 {
            done.acquire(&cx).await;
        }
        Ok(())
    })
    .unwrap();
    let peak = observed.load(Ordering::Acquire);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
}

#[test]
fn handoff_passes_values_back_and_forth() {
    let rt = runtime(2);
    let (ours, theirs) = rt
        .block_on(|cx| async move {
            let handoff = Arc::new(Handoff::new());
            let done = Arc::new(Semaphore::new(0));
            let theirs = Arc::new(AtomicUsize::new(0));
            let (h, d, t) = (handoff.clone(), done.clone(), theirs.clone());
            let spawned = cx.spawn(move |cx| async move {
                // Answers every value with its double until it gets 0.
                let mut sum = 0;
                let mut v = h.transfer(&cx, 0).await;
                while v != 0 {
                    sum += v;
                    v = h.transfer(&cx, v * 2).await;
                }
                t.store(sum, Ordering::Release);
                d.release(&cx);
                Ok(())
            });
            if let Err(err) = spawned {
                return Err(cx.exception(err.to_string(), 0));
            }
            while handoff.waiting().is_none() {
                cx.yield_now().await;
            }
            let mut ours = 0;
            for i in 1..=100 {
                ours += handoff.transfer(&cx, i).await;
            }
            let gave = handoff.give(&cx, 0);
            done.acquire(&cx).await;
            if !gave {
                return Err(cx.exception("peer was not waiting", 0));
            }
            Ok((ours, theirs.load(Ordering::Acquire)))
        })
        .unwrap();
    assert_eq!(theirs, (1..=100).sum::<usize>());
    assert_eq!(ours, 2 * theirs);
}

#[test]
fn syscall_frees_the_slot() {
    let rt = runtime(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicUsize::new(0));

    let (o, d) = (order.clone(), done.clone());
    rt.spawn(move |cx| async move {
        cx.syscall(|| thread::sleep(Duration::from_millis(200)));
        o.lock().push("syscall");
        d.fetch_add(1, Ordering::AcqRel);
        Ok(())
    })
    .unwrap();
    thread::sleep(Duration::from_millis(20));
    let (o, d) = (order.clone(), done.clone());
    rt.spawn(move |cx| async move {
        cx.alloc(64, PtrMap::NoScan);
        o.lock().push("other");
        d.fetch_add(1, Ordering::AcqRel);
        Ok(())
    })
    .unwrap();

    assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::Acquire) == 2));
    assert_eq!(*order.lock(), vec!["other", "syscall"]);
}

#[test]
fn shutdown_is_idempotent() {
    let rt = Runtime::new(config(2)).unwrap();
    rt.spawn(|cx| async move {
        for _ in 0..10_000 {
            cx.sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    })
    .unwrap();
    thread::sleep(Duration::from_millis(20));
    rt.shutdown();
    rt.shutdown();
}

#[test]
fn idle_slots_steal_from_a_blocked_slot() {
    let rt = runtime(3);
    let n = 8;
    let done = Arc::new(AtomicUsize::new(0));
    let threads = Arc::new(Mutex::new(Vec::new()));

    let (d, t) = (done.clone(), threads.clone());
    let (finished, owner) = rt
        .block_on(move |cx| async move {
            for _ in 0..n {
                let (d, t) = (d.clone(), t.clone());
                let spawned = cx.spawn(move |_cx| async move {
                    t.lock().push(thread::current().id());
                    d.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                });
                if let Err(err) = spawned {
                    return Err(cx.exception(format!("spawn: {err}"), 0));
                }
            }
            // Hold the slot without reaching a safe point; everything
            // queued behind us has to be stolen.
            let deadline = Instant::now() + Duration::from_secs(5);
            while d.load(Ordering::Acquire) < n && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            Ok((d.load(Ordering::Acquire), thread::current().id()))
        })
        .unwrap();

    assert_eq!(finished, n);
    let threads = threads.lock();
    assert!(threads.iter().all(|id| *id != owner));
    assert!(metric(&rt, "/sched/steals") >= 1);
}
