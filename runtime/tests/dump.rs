mod common;

use std::fs::File;

use heap::{RootKind, dump::read_dump, sizeclass::WORD};
use runtime::PtrMap;

use common::runtime;

#[test]
fn dump_shows_globals_and_edges() {
    let rt = runtime(2);
    let g = rt.add_global(0);
    let (a, b) = rt
        .block_on(move |cx| async move {
            let a = cx.alloc(2 * WORD, PtrMap::Bits(&[0b01]));
            cx.set_global(g, a);
            let b = cx.alloc(4 * WORD, PtrMap::NoScan);
            // SAFETY: a is a live two-word object with a pointer in word 0
            unsafe { cx.store_ptr(a, b) };
            Ok((a, b))
        })
        .unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    rt.dump_heap(file.reopen().unwrap()).unwrap();
    let dump = read_dump(File::open(file.path()).unwrap()).unwrap();

    assert_eq!(dump.params.word_size, WORD as u64);
    assert_eq!(dump.params.nprocs, 2);
    let obj = dump.object(a as u64).expect("global target in dump");
    assert_eq!(obj.edges, vec![(0, b as u64)]);
    let target = dump.object(b as u64).expect("edge target in dump");
    assert!(target.noscan);
    assert!(
        dump.roots
            .iter()
            .any(|r| r.kind == RootKind::Global && r.value == a as u64)
    );
    assert!(dump.memstat("/heap/objects").is_some());
}

#[test]
fn dump_lists_stack_roots_of_parked_tasks() {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use runtime::{FuncInfo, WaitReason};

    let rt = runtime(1);
    let holder = rt.register_func(FuncInfo::new("holder", 1).pointers(&[0b1]));
    let obj = Arc::new(AtomicUsize::new(0));
    let seen = obj.clone();
    let id = rt
        .spawn(move |cx| async move {
            cx.push_frame(holder);
            let o = cx.alloc(32, PtrMap::NoScan);
            cx.set_local(0, o);
            seen.store(o, Ordering::Release);
            cx.park(WaitReason::Park).await;
            cx.pop_frame();
            Ok(())
        })
        .unwrap();
    assert!(common::wait_for(Duration::from_secs(5), || obj.load(Ordering::Acquire) != 0));
    std::thread::sleep(Duration::from_millis(20));

    let mut out = Vec::new();
    rt.dump_heap(&mut out).unwrap();
    let dump = read_dump(out.as_slice()).unwrap();
    let o = obj.load(Ordering::Acquire) as u64;
    assert!(
        dump.roots
            .iter()
            .any(|r| matches!(r.kind, RootKind::Stack(_)) && r.value == o),
        "stack root missing: {:?}",
        dump.roots
    );
    assert!(dump.object(o).is_some());
    rt.ready(id);
}
