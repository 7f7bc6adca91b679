//! Fatal runtime defects.
//!
//! A violated invariant (corrupt span metadata, lock rank violation, stack
//! overflow past the hard limit, double free, readying a dead task) leaves
//! memory in an unknown state. There is no unwinding out of these: the
//! diagnostic goes to the log and stderr, then the process aborts.

use std::{
    io::{self, Write},
    sync::OnceLock,
};

type DumpHook = Box<dyn Fn(&mut dyn Write) + Send + Sync>;

static DUMP_HOOK: OnceLock<DumpHook> = OnceLock::new();

/// Install the routine that prints extra state (task traces) after the
/// fatal message. Only the first installation wins.
pub fn set_dump_hook(hook: impl Fn(&mut dyn Write) + Send + Sync + 'static) {
    let _ = DUMP_HOOK.set(Box::new(hook));
}

/// Abort with `msg`.
#[cold]
#[track_caller]
pub fn throw(msg: &str) -> ! {
    throw_with(msg, |_| {})
}

/// Abort with `msg`, letting `detail` append its own dump first.
#[cold]
#[track_caller]
pub fn throw_with(msg: &str, detail: impl FnOnce(&mut dyn Write)) -> ! {
    let location = std::panic::Location::caller();
    log::error!("fatal error: {msg} ({location})");

    let stderr = io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "fatal error: {msg}\n");
    detail(&mut out);
    if let Some(hook) = DUMP_HOOK.get() {
        hook(&mut out);
    }
    let _ = out.flush();
    drop(out);

    abort(msg)
}

#[cfg(not(test))]
fn abort(_msg: &str) -> ! {
    std::process::abort()
}

// Unit tests observe fatal paths through `#[should_panic]`.
#[cfg(test)]
fn abort(msg: &str) -> ! {
    panic!("fatal error: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "fatal error: span corrupt")]
    fn throw_reports_message() {
        throw("span corrupt");
    }

    #[test]
    #[should_panic(expected = "fatal error: double free")]
    fn throw_with_runs_detail() {
        throw_with("double free", |out| {
            let _ = writeln!(out, "object 0x1000");
        });
    }
}
