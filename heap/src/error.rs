use std::io;

/// Recoverable allocation failures. Only surfaced in
/// [`AllocMode::NonFatal`](crate::AllocMode::NonFatal); the default mode
/// turns them into a fatal error.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory: heap limit of {limit} bytes reached allocating {requested} bytes")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("could not reserve {0} bytes of address space")]
    Reserve(usize),
    #[error("allocation size {0} overflows")]
    SizeOverflow(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("heap dump i/o: {0}")]
    Io(#[from] io::Error),
    #[error("bad heap dump header")]
    BadHeader,
    #[error("unknown heap dump record tag {0}")]
    UnknownTag(u64),
    #[error("heap dump truncated")]
    Truncated,
}
