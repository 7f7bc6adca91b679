#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use runtime::{Runtime, RuntimeConfig};

pub fn config(procs: usize) -> RuntimeConfig {
    RuntimeConfig {
        procs,
        // Tests trigger their own cycles.
        force_gc: Duration::from_secs(3600),
        lock_rank: true,
        heap_max: 256 << 20,
        ..RuntimeConfig::default()
    }
}

pub fn runtime(procs: usize) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(config(procs)).expect("runtime starts")
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub fn metric(rt: &Runtime, name: &str) -> u64 {
    rt.metrics()
        .into_iter()
        .find(|&(n, _)| n == name)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("no metric {name}"))
}
