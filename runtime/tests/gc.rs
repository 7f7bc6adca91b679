mod common;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use heap::{Phase, sizeclass::WORD};
use runtime::{FuncInfo, PtrMap};

use common::{metric, runtime, wait_for};

#[test]
fn unreachable_objects_are_reclaimed() {
    let rt = runtime(2);
    let heap = rt.heap().clone();
    let keep = rt.register_func(FuncInfo::new("keep", 10).pointers(&[0x3ff]));

    let (snap, kept) = rt
        .block_on(move |cx| async move {
            cx.push_frame(keep);
            for i in 0..10_000 {
                let obj = cx.alloc(64, PtrMap::NoScan);
                if i % 1000 == 0 {
                    cx.set_local(i / 1000, obj);
                }
            }
            cx.gc();
            let snap = heap.stats.snapshot();
            let kept: Vec<bool> = (0..10)
                .map(|i| heap.find_object(cx.local(i)).is_some())
                .collect();
            cx.pop_frame();
            Ok((snap, kept))
        })
        .unwrap();

    assert_eq!(snap.total_allocs, 10_000);
    assert_eq!(snap.objects, 10);
    assert_eq!(snap.bytes_in_use, 640);
    assert!(kept.iter().all(|&k| k), "a rooted object was freed: {kept:?}");
    assert_eq!(rt.gc_phase(), Phase::Off);

    // The frame is gone with the task.
    rt.gc();
    assert_eq!(rt.heap().stats.snapshot().objects, 0);
}

#[test]
fn lists_survive_cycles_on_busy_tasks() {
    let rt = runtime(4);
    let holder = rt.register_func(FuncInfo::new("holder", 1).pointers(&[0b1]));
    let done = std::sync::Arc::new(runtime::Semaphore::new(0));

    let sums = rt
        .block_on(move |cx| async move {
            let results = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
            for t in 0..4usize {
                let done = done.clone();
                let results = results.clone();
                let spawned = cx.spawn(move |cx| async move {
                    cx.push_frame(holder);
                    for i in 0..2_000usize {
                        let node = cx.alloc(2 * WORD, PtrMap::Bits(&[0b01]));
                        // SAFETY: fresh node, word 0 is its pointer
                        unsafe {
                            cx.store_ptr(node, cx.local(0));
                            cx.store_word(node + WORD, t * 10_000 + i);
                        }
                        cx.set_local(0, node);
                        if i % 500 == 0 {
                            cx.gc();
                            cx.yield_now().await;
                        }
                    }
                    cx.gc();
                    let (mut n, mut sum) = (0usize, 0usize);
                    let mut p = cx.local(0);
                    while p != 0 {
                        n += 1;
                        // SAFETY: p is reachable from local 0
                        unsafe {
                            sum += cx.load_word(p + WORD) - t * 10_000;
                            p = cx.load_ptr(p);
                        }
                    }
                    cx.pop_frame();
                    results.lock().push((n, sum));
                    done.release(&cx);
                    Ok(())
                });
                if let Err(err) = spawned {
                    return Err(cx.exception(err.to_string(), 0));
                }
            }
            for _ in 0..4 {
                done.acquire(&cx).await;
            }
            let sums = results.lock().clone();
            Ok(sums)
        })
        .unwrap();

    assert_eq!(sums.len(), 4);
    for (n, sum) in sums {
        assert_eq!(n, 2_000);
        assert_eq!(sum, (0..2_000).sum::<usize>());
    }
    assert!(metric(&rt, "/gc/cycles") >= 4);
}

#[test]
fn globals_are_roots() {
    let rt = runtime(2);
    let g = rt.add_global(0);
    let obj = rt
        .block_on(move |cx| async move {
            let obj = cx.alloc(48, PtrMap::NoScan);
            cx.set_global(g, obj);
            Ok(obj)
        })
        .unwrap();

    rt.gc();
    rt.gc();
    assert!(rt.heap().find_object(obj).is_some());
    assert_eq!(rt.global(g), obj);

    rt.set_global(g, 0);
    rt.gc();
    assert!(rt.heap().find_object(obj).is_none());
}

static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

fn count_cleanup(_obj: usize, arg: usize) {
    CLEANUPS.fetch_add(arg, Ordering::SeqCst);
}

#[test]
fn cleanup_runs_exactly_once() {
    let rt = runtime(2);
    let obj = rt
        .block_on(|cx| async move {
            let obj = cx.alloc(32, PtrMap::NoScan);
            cx.register_cleanup(obj, count_cleanup, 1);
            Ok(obj)
        })
        .unwrap();

    rt.gc();
    assert!(
        wait_for(Duration::from_secs(10), || CLEANUPS.load(Ordering::SeqCst) == 1),
        "cleanup never ran"
    );
    rt.gc();
    rt.gc();
    assert!(rt.heap().find_object(obj).is_none());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(CLEANUPS.load(Ordering::SeqCst), 1);
    assert!(metric(&rt, "/gc/finalizers-run") >= 1);
}

static NEVER: AtomicUsize = AtomicUsize::new(0);

fn never(_obj: usize, _arg: usize) {
    NEVER.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn cancelled_cleanup_never_runs() {
    let rt = runtime(1);
    let cancelled = rt
        .block_on(|cx| async move {
            let obj = cx.alloc(32, PtrMap::NoScan);
            let handle = cx.register_cleanup(obj, never, 0);
            Ok(cx.cancel_cleanup(handle))
        })
        .unwrap();
    assert!(cancelled);

    rt.gc();
    rt.gc();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(NEVER.load(Ordering::SeqCst), 0);
}

#[test]
fn free_os_memory_releases_pages() {
    let rt = runtime(1);
    rt.block_on(|cx| async move {
        for _ in 0..64 {
            cx.alloc(64 << 10, PtrMap::NoScan);
        }
        Ok(())
    })
    .unwrap();
    let released = rt.free_os_memory();
    assert!(released >= 64 * (64 << 10), "released only {released} bytes");
    assert!(metric(&rt, "/heap/bytes-released") > 0);
}
