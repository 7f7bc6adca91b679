//! Deferred calls and recoverable exceptions.
//!
//! An [`Exception`] travels up through `Result`s like any Rust error. What
//! makes it more than that is [`TaskContext::protect`]: the frame it pushes
//! collects deferred calls, runs them last-in first-out whether the body
//! returned or raised, and lets them [`recover`](TaskContext::recover) the
//! pending exception. While pending, the exception's value word is a root.

use std::{fmt, sync::atomic::Ordering};

use heap::fatal::throw;

use crate::{
    context::TaskContext,
    funcs::FuncId,
    task::TaskFlags,
};

/// A raised program-level exception.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Exception {
    pub message: String,
    /// Payload word. Kept alive while the exception is pending in a frame.
    pub value: usize,
    /// Function names, innermost first, at the point of the raise.
    pub trace: Vec<String>,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            value: 0,
            trace: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: usize) -> Self {
        self.value = value;
        self
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exception: {}", self.message)?;
        if self.value != 0 {
            write!(f, " ({:#x})", self.value)?;
        }
        for name in &self.trace {
            write!(f, "\n    {name}")?;
        }
        Ok(())
    }
}

/// A deferred call. Receives the argument words it was registered with.
pub type DeferFn = fn(&TaskContext, &[usize]) -> Result<(), Exception>;

#[derive(Clone)]
pub struct Defer {
    pub func: DeferFn,
    pub args: Vec<usize>,
    /// Bit `i` set means `args[i]` holds a pointer.
    pub ptr_mask: u64,
    /// Frame pointer of the frame that registered it.
    pub frame: usize,
}

impl Defer {
    pub(crate) fn pointer_args(&self) -> impl Iterator<Item = usize> + '_ {
        self.args
            .iter()
            .enumerate()
            .filter(|&(i, _)| i < 64 && self.ptr_mask & (1 << i) != 0)
            .map(|(_, &arg)| arg)
    }

    /// Move pointer arguments into `[lo, hi)` by `delta`, and the frame.
    pub(crate) fn relocate(&mut self, lo: usize, hi: usize, delta: usize) {
        self.frame = self.frame.wrapping_add(delta);
        for (i, arg) in self.args.iter_mut().enumerate() {
            if i < 64 && self.ptr_mask & (1 << i) != 0 && (lo..hi).contains(arg) {
                *arg = arg.wrapping_add(delta);
            }
        }
    }
}

impl fmt::Debug for Defer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defer")
            .field("args", &self.args)
            .field("ptr_mask", &format_args!("{:#x}", self.ptr_mask))
            .field("frame", &format_args!("{:#x}", self.frame))
            .finish()
    }
}

impl TaskContext {
    /// Run `func` with `args` when the innermost frame is popped by
    /// [`protect`](Self::protect). Deferring outside any frame is fatal.
    pub fn defer(&self, func: DeferFn, args: &[usize], ptr_mask: u64) {
        let task = self.task();
        let frame = task.fp.load(Ordering::Relaxed);
        if frame == 0 {
            throw("defer outside of any frame");
        }
        task.defers.lock().push(Defer {
            func,
            args: args.to_vec(),
            ptr_mask,
            frame,
        });
    }

    /// An exception carrying the current call chain.
    pub fn exception(&self, message: impl Into<String>, value: usize) -> Exception {
        Exception {
            message: message.into(),
            value,
            trace: self.trace(),
        }
    }

    /// Run `body` in a new frame of `func`. Deferred calls registered in
    /// that frame, or in frames `body` left behind, run on the way out,
    /// newest first, whether `body` returned or raised. A deferred call
    /// raising replaces the pending exception.
    ///
    /// Returns `Ok(Some(_))` when the body returned, `Ok(None)` when it
    /// raised and a deferred call recovered, and the exception otherwise.
    pub fn protect<R>(
        &self,
        func: FuncId,
        body: impl FnOnce(&TaskContext) -> Result<R, Exception>,
    ) -> Result<Option<R>, Exception> {
        let task = self.task();
        task.panic.lock().push(None);
        self.push_frame(func);
        // Distance from the stack top survives the stack moving.
        let depth = task.stack_hi.load(Ordering::Relaxed) - task.fp.load(Ordering::Relaxed);
        let value = match body(self) {
            Ok(v) => Some(v),
            Err(exc) => {
                log::trace!("task {}: raised {}", task.goid(), exc.message);
                self.set_pending(exc);
                None
            }
        };
        loop {
            self.run_defers();
            let hi = task.stack_hi.load(Ordering::Relaxed);
            let own_frame = hi - task.fp.load(Ordering::Relaxed) >= depth;
            self.pop_frame();
            if own_frame {
                break;
            }
        }
        let pending = task.panic.lock().pop().flatten();
        match pending {
            Some(exc) => Err(exc),
            None => Ok(value),
        }
    }

    fn set_pending(&self, exc: Exception) {
        if let Some(slot) = self.task().panic.lock().last_mut() {
            *slot = Some(exc);
        }
    }

    /// Run the innermost frame's deferred calls.
    fn run_defers(&self) {
        let task = self.task();
        let outer = task.flags().contains(TaskFlags::IN_DEFER);
        loop {
            // Reloaded each time: the stack may move while a call runs.
            let frame = task.fp.load(Ordering::Relaxed);
            let next = {
                let mut defers = task.defers.lock();
                match defers.last() {
                    Some(d) if d.frame == frame => defers.pop(),
                    _ => None,
                }
            };
            let Some(d) = next else { break };
            task.set_flags(TaskFlags::IN_DEFER);
            let result = (d.func)(self, &d.args);
            if !outer {
                task.clear_flags(TaskFlags::IN_DEFER);
            }
            if let Err(exc) = result {
                self.set_pending(exc);
            }
        }
    }

    /// Take the exception pending in the innermost `protect`. Only deferred
    /// calls may recover; anywhere else this returns `None`.
    pub fn recover(&self) -> Option<Exception> {
        let task = self.task();
        if !task.flags().contains(TaskFlags::IN_DEFER) {
            return None;
        }
        task.panic.lock().last_mut().and_then(Option::take)
    }

    /// The exception being propagated through the innermost `protect`.
    pub fn pending_exception(&self) -> Option<Exception> {
        self.task().panic.lock().last().cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &TaskContext, _: &[usize]) -> Result<(), Exception> {
        Ok(())
    }

    #[test]
    fn relocate_moves_only_stack_pointers() {
        let mut d = Defer {
            func: noop,
            args: vec![0x1000, 0x1008, 0x9000, 7],
            ptr_mask: 0b0111,
            frame: 0x1010,
        };
        d.relocate(0x1000, 0x2000, 0x4000);
        assert_eq!(d.args, vec![0x5000, 0x5008, 0x9000, 7]);
        assert_eq!(d.frame, 0x5010);
        assert_eq!(d.pointer_args().collect::<Vec<_>>(), vec![0x5000, 0x5008, 0x9000]);
    }

    #[test]
    fn exception_debug_lists_trace() {
        let mut e = Exception::new("boom").with_value(0x40);
        e.trace = vec!["inner".into(), "outer".into()];
        assert_eq!(e.to_string(), "boom");
        assert_eq!(format!("{e:?}"), "exception: boom (0x40)\n    inner\n    outer");
    }
}
