//! Internal bookkeeping violations.
//!
//! Every variant here means the checkpointing machinery itself can no longer
//! be trusted. Detected program faults (overflow, use-after-free, leak) are
//! not errors; they are findings that drive rollback.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("thread pool exhausted: {limit} live threads")]
    ThreadPoolExhausted { limit: usize },
    #[error("event log exhausted: capacity {capacity}")]
    EventLogExhausted { capacity: usize },
    #[error("sentinel bitmap does not cover address {addr:#x}")]
    BitmapOutOfRange { addr: usize },
    #[error("replay diverged on thread {thread}: {detail}")]
    ReplayDivergence { thread: u32, detail: String },
    #[error("epoch {epoch} rolled back more than {limit} time(s)")]
    RollbackExhausted { epoch: u64, limit: u32 },
    #[error("illegal phase transition {from} -> {to}")]
    PhaseTransition { from: &'static str, to: &'static str },
    #[error("no saved context for thread {thread}")]
    MissingContext { thread: u32 },
    #[error("stack image of {len} bytes exceeds the {capacity}-byte backup")]
    StackTooLarge { len: usize, capacity: usize },
    #[error("memory map {name}: {detail}")]
    MemoryMap { name: String, detail: String },
    #[error("thread is not registered with the engine")]
    UnregisteredThread,
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    /// Wrap the current `errno` for a failed setup call.
    #[must_use]
    pub fn last_os(call: &'static str) -> Self {
        Self::Os {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;
