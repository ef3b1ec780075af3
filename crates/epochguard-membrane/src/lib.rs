//! Memory-safety layer of EpochGuard.
//!
//! Everything here concerns bytes: where canaries live, how the heap is laid
//! out and checkpointed, and how a detected corruption is traced back to the
//! write that caused it. Epoch coordination and replay live in
//! `epochguard-core`.
//!
//! # Architecture
//!
//! The membrane consists of:
//! - **Canaries** (`canary`): sentinel constants and the short-overflow pad
//! - **Sentinel bitmap** (`sentinel`): one bit per heap word, O(#canaries) integrity scan
//! - **Object header** (`object_header`): per-allocation size and flag words
//! - **Raw allocator** (`arena`): the allocator contract and a power-of-two reference heap
//! - **Guarded heap** (`heap`): headers and sentinels layered over the raw allocator
//! - **Memory maps** (`memory_map`): working/backup pairs for the heap and global segments
//! - **Quarantine** (`quarantine`): delayed release of freed objects
//! - **Tracker** (`tracker`): implicated objects and their call-sites
//! - **Leak scan** (`leak`): conservative mark and sweep over the heap
//! - **Watchpoints** (`watchpoint`): replay-time data breakpoints
//! - **Context** (`context`): per-thread stack and register checkpoint
//! - **Reports** (`report`): JSONL fault reports and sinks
//! - **Configuration** (`config`): detection mode and tunables
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("epochguard supports x86_64 Linux only");

pub mod arena;
pub mod canary;
pub mod config;
pub mod context;
pub mod error;
pub mod heap;
pub mod leak;
pub mod memory_map;
pub mod metrics;
pub mod object_header;
pub mod quarantine;
pub mod report;
pub mod sentinel;
pub mod tracker;
pub mod watchpoint;

pub use arena::{PowerOfTwoHeap, RawAllocator};
pub use config::{DetectionLevel, EngineConfig};
pub use context::{ContextSnapshot, RegisterImage, StackBounds, StackTrampoline};
pub use error::{GuardError, Result};
pub use heap::{FreeOutcome, FreedObject, GuardedHeap, InvalidFree};
pub use leak::{LeakCheckMode, LeakScanner, LeakedObject, RootSet};
pub use memory_map::MemoryMap;
pub use metrics::{GuardMetrics, global_metrics};
pub use quarantine::{PushOutcome, Quarantine, UseAfterFree};
pub use report::{AbortingSink, FaultKind, FaultReport, FaultSink};
pub use sentinel::{ObjectExtent, OverflowFinding, SentinelBitmap};
pub use tracker::{AllocationTracker, CallSite, FaultKinds};
pub use watchpoint::{MAX_WATCHPOINTS, PerfWatchUnit, WatchHardware, WatchSlot, WatchTrap, WatchpointSet};
