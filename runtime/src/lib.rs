//! Task runtime on top of the `heap` crate: slots, workers, work stealing,
//! growable task stacks, deferred calls and the collector's helper tasks.

mod gc;
mod monitor;
mod parker;
mod runq;
mod sched;
mod slot;
mod timer;
mod worker;

pub mod config;
pub mod context;
pub mod defer;
pub mod funcs;
pub mod handoff;
pub mod poll;
pub mod runtime;
pub mod sema;
pub mod stack;
pub mod task;

pub use config::{ConfigError, RuntimeConfig};
pub use context::TaskContext;
pub use defer::{DeferFn, Exception};
pub use funcs::{FuncId, FuncInfo};
pub use gc::GlobalId;
pub use handoff::Handoff;
pub use heap::{AllocError, CleanupHandle, PtrMap};
pub use poll::{NoPoller, Poller, QueuePoller};
pub use runtime::{Runtime, RuntimeError};
pub use sema::Semaphore;
pub use stack::{MIN_STACK, StackError};
pub use task::{TaskId, TaskStatus, WaitReason};
