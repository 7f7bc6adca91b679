mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use runtime::{FuncInfo, MIN_STACK, PtrMap, Runtime, StackError, WaitReason};

use common::{config, runtime, wait_for};

/// 100 locals; local 0 holds a heap object, local 1 the address of local 0.
fn deep_func(rt: &Runtime) -> runtime::FuncId {
    rt.register_func(FuncInfo::new("deep", 100).pointers(&[0b11]))
}

#[test]
fn stack_grows_through_three_doublings() {
    let rt = runtime(2);
    let deep = deep_func(&rt);
    let heap = rt.heap().clone();

    let (size, bad) = rt
        .block_on(move |cx| async move {
            for d in 0..70usize {
                cx.push_frame(deep);
                let obj = cx.alloc(16, PtrMap::NoScan);
                // SAFETY: fresh two-word object
                unsafe { cx.store_word(obj, d) };
                cx.set_local(0, obj);
                cx.set_local(1, cx.local_addr(0));
                if d == 35 {
                    cx.gc();
                }
            }
            cx.gc();
            let size = cx.stack_size();

            let mut bad = Vec::new();
            for d in (0..70usize).rev() {
                let obj = cx.local(0);
                // SAFETY: obj is rooted by local 0
                let value = unsafe { cx.load_word(obj) };
                let self_ref = cx.local(1) == cx.local_addr(0);
                if value != d || !self_ref || heap.find_object(obj).is_none() {
                    bad.push(d);
                }
                cx.pop_frame();
            }
            Ok((size, bad))
        })
        .unwrap();

    assert_eq!(size, MIN_STACK << 3);
    assert!(bad.is_empty(), "frames with broken locals: {bad:?}");
}

#[test]
fn overflow_past_the_limit_is_reported() {
    let rt = Runtime::new(runtime::RuntimeConfig {
        max_stack: 16 << 10,
        ..config(1)
    })
    .unwrap();
    let deep = deep_func(&rt);

    let (pushed, overflow, depth_after) = rt
        .block_on(move |cx| async move {
            let mut pushed = 0;
            let overflow = loop {
                match cx.try_push_frame(deep) {
                    Ok(()) => pushed += 1,
                    Err(err) => break matches!(err, StackError::Overflow { .. }),
                }
            };
            for _ in 0..pushed {
                cx.pop_frame();
            }
            Ok((pushed, overflow, cx.depth()))
        })
        .unwrap();

    assert!(overflow);
    assert!(pushed >= 9, "only {pushed} frames fit");
    assert!(pushed < 20);
    assert_eq!(depth_after, 0);
}

#[test]
fn idle_stacks_shrink_during_collection() {
    let rt = runtime(2);
    let deep = deep_func(&rt);
    let grown = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicUsize::new(0));
    let go = Arc::new(AtomicBool::new(false));

    let (g, a, flag) = (grown.clone(), after.clone(), go.clone());
    let id = rt
        .spawn(move |cx| async move {
            for _ in 0..70 {
                cx.push_frame(deep);
            }
            g.store(cx.stack_size(), Ordering::Release);
            for _ in 0..70 {
                cx.pop_frame();
            }
            while !flag.load(Ordering::Acquire) {
                cx.park(WaitReason::Park).await;
            }
            a.store(cx.stack_size(), Ordering::Release);
            Ok(())
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || grown.load(Ordering::Acquire) != 0));
    // Let the task park.
    std::thread::sleep(Duration::from_millis(20));
    rt.gc();
    rt.gc();
    go.store(true, Ordering::Release);
    rt.ready(id);
    assert!(wait_for(Duration::from_secs(5), || after.load(Ordering::Acquire) != 0));

    let (grown, after) = (grown.load(Ordering::Acquire), after.load(Ordering::Acquire));
    assert_eq!(grown, MIN_STACK << 3);
    assert!(after < grown, "stack stayed at {after} bytes");
    assert!(after >= MIN_STACK);
}

#[test]
fn stack_addresses_in_pointer_locals_follow_a_shrink() {
    let rt = runtime(2);
    let deep = deep_func(&rt);
    let before = Arc::new(AtomicUsize::new(0));
    let result = Arc::new(parking_lot::Mutex::new(None));
    let go = Arc::new(AtomicBool::new(false));

    let (b, r, flag) = (before.clone(), result.clone(), go.clone());
    let id = rt
        .spawn(move |cx| async move {
            cx.push_frame(deep);
            cx.set_local(1, cx.local_addr(0));
            for _ in 0..69 {
                cx.push_frame(deep);
            }
            for _ in 0..69 {
                cx.pop_frame();
            }
            b.store(cx.local_addr(0), Ordering::Release);
            while !flag.load(Ordering::Acquire) {
                cx.park(WaitReason::Park).await;
            }
            *r.lock() = Some((cx.local(1), cx.local_addr(0), cx.stack_size()));
            cx.pop_frame();
            Ok(())
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || before.load(Ordering::Acquire) != 0));
    std::thread::sleep(Duration::from_millis(20));
    rt.gc();
    rt.gc();
    go.store(true, Ordering::Release);
    rt.ready(id);
    assert!(wait_for(Duration::from_secs(5), || result.lock().is_some()));

    let (held, addr, size) = result.lock().take().unwrap();
    assert!(size < MIN_STACK << 3, "stack stayed at {size} bytes");
    assert_ne!(addr, before.load(Ordering::Acquire));
    assert_eq!(held, addr);
}
