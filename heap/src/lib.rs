pub mod cache;
pub mod central;
pub mod dump;
pub mod error;
pub mod fatal;
pub mod gc;
mod heap;
pub mod lock;
pub mod pageheap;
pub mod sizeclass;
pub mod span;
pub mod stats;
mod system;

pub use cache::{AllocMode, PtrMap, SlotCache};
pub use error::{AllocError, DumpError};
pub use gc::{
    LocalWorld, MarkDone, Phase, RootKind, Trigger, World,
    finalizer::{CleanupFn, CleanupHandle},
    work::GcWork,
};
pub use heap::*;
pub use lock::{Lock, LockGuard, LockRank};
pub use stats::StatsSnapshot;
pub use system::OS_PAGE_SIZE;
