mod common;

use parking_lot::{Mutex, const_mutex};
use runtime::{Exception, FuncInfo, PtrMap, RuntimeError, TaskContext};

use common::runtime;

static ORDER: Mutex<Vec<usize>> = const_mutex(Vec::new());

fn record(_: &TaskContext, args: &[usize]) -> Result<(), Exception> {
    ORDER.lock().push(args[0]);
    Ok(())
}

static RECOVERED: Mutex<Vec<String>> = const_mutex(Vec::new());

fn rescue(cx: &TaskContext, _: &[usize]) -> Result<(), Exception> {
    if let Some(exc) = cx.recover() {
        RECOVERED.lock().push(exc.message);
    }
    Ok(())
}

fn raise_again(cx: &TaskContext, _: &[usize]) -> Result<(), Exception> {
    Err(cx.exception("from defer", 0))
}

#[test]
fn defers_run_newest_first() {
    let rt = runtime(1);
    let f = rt.register_func(FuncInfo::new("body", 0));
    let result = rt
        .block_on(move |cx| async move {
            let r = cx.protect(f, |cx| {
                for i in 1..=3 {
                    cx.defer(record, &[i], 0);
                }
                Ok(7)
            });
            Ok(r.map_err(|e| e.message))
        })
        .unwrap();
    assert_eq!(result, Ok(Some(7)));
    assert_eq!(*ORDER.lock(), vec![3, 2, 1]);
}

#[test]
fn deferred_call_recovers() {
    let rt = runtime(1);
    let f = rt.register_func(FuncInfo::new("thrower", 0));
    let (result, outside) = rt
        .block_on(move |cx| async move {
            let r = cx.protect(f, |cx| -> Result<(), Exception> {
                cx.defer(rescue, &[], 0);
                Err(cx.exception("boom", 0))
            });
            // Not in a deferred call.
            let outside = cx.recover().is_none();
            Ok((r.map_err(|e| e.message), outside))
        })
        .unwrap();
    assert_eq!(result, Ok(None));
    assert!(outside);
    assert_eq!(*RECOVERED.lock(), vec!["boom".to_string()]);
}

#[test]
fn unrecovered_exception_carries_the_trace() {
    let rt = runtime(1);
    let outer = rt.register_func(FuncInfo::new("outer", 0));
    let inner = rt.register_func(FuncInfo::new("inner", 0));
    let exc = rt
        .block_on(move |cx| async move {
            let r = cx.protect(outer, |cx| {
                cx.protect(inner, |cx| -> Result<(), Exception> { Err(cx.exception("deep", 0)) })
            });
            Ok((r.is_err(), r.err(), cx.depth()))
        })
        .unwrap();
    let (raised, exc, depth) = exc;
    assert!(raised);
    let exc = exc.unwrap();
    assert_eq!(exc.message, "deep");
    assert_eq!(exc.trace, vec!["inner".to_string(), "outer".to_string()]);
    assert_eq!(depth, 0);
}

#[test]
fn raising_defer_replaces_the_exception() {
    let rt = runtime(1);
    let f = rt.register_func(FuncInfo::new("body", 0));
    let message = rt
        .block_on(move |cx| async move {
            let r = cx.protect(f, |cx| -> Result<(), Exception> {
                cx.defer(raise_again, &[], 0);
                Err(cx.exception("first", 0))
            });
            Ok(r.err().map(|e| e.message))
        })
        .unwrap();
    assert_eq!(message.as_deref(), Some("from defer"));
}

fn keep(_: &TaskContext, _: &[usize]) -> Result<(), Exception> {
    Ok(())
}

#[test]
fn deferred_pointer_arguments_are_roots() {
    let rt = runtime(1);
    let f = rt.register_func(FuncInfo::new("holder", 0));
    let heap = rt.heap().clone();
    let alive = rt
        .block_on(move |cx| async move {
            let r = cx.protect(f, |cx| {
                let obj = cx.alloc(64, PtrMap::NoScan);
                cx.defer(keep, &[obj, 0], 0b01);
                cx.gc();
                Ok(heap.find_object(obj).is_some())
            });
            Ok(r.map_err(|e| e.message))
        })
        .unwrap();
    assert_eq!(alive, Ok(Some(true)));
}

#[test]
fn block_on_returns_task_exceptions() {
    let rt = runtime(1);
    let err = rt
        .block_on(|cx| async move { Err::<(), _>(cx.exception("task failed", 3)) })
        .unwrap_err();
    match err {
        RuntimeError::Task(exc) => {
            assert_eq!(exc.message, "task failed");
            assert_eq!(exc.value, 3);
        }
        other => panic!("unexpected error {other}"),
    }
}
