//! Epoch coordination and deterministic replay for EpochGuard.
//!
//! The membrane crate knows how to guard and check memory; this crate
//! decides *when*. Execution is cut into epochs, every epoch ends with the
//! process stopped and checked, and a dirty epoch is rolled back and
//! replayed under watchpoints.
//!
//! # Architecture
//!
//! - **Phases** (`state`): the epoch lifecycle and its legal edges
//! - **Logs** (`event_log`): per-thread record logs and per-object event lists
//! - **Threads** (`thread`): thread records, the registry and interruptible waits
//! - **Quiesce** (`quiesce`): the stop barrier and its signal/cooperative transports
//! - **Signals** (`signals`): the `SIGUSR2` handler that checkpoints or rolls back a stopped thread
//! - **Synchronization** (`sync`): shadow mutexes, condition variables and barriers with replayed order
//! - **System calls** (`syscall`): call classification, the record/replay gateway and descriptor rollback
//! - **Coordinator** (`epoch`): epoch begin/end, scans, rollback, replay and reporting
//! - **Simulation** (`sim`): in-process trampoline, watch unit, kernel and sink for tests and demos
//!
//! Interposed entry points (the `malloc`/`pthread_*`/syscall shims) call
//! into [`EpochCoordinator`] through [`EpochCoordinator::intercept`], which
//! holds the quiesce signal back while engine locks are taken.

#![deny(unsafe_code)]

pub mod epoch;
pub mod event_log;
pub mod quiesce;
pub mod signals;
pub mod sim;
pub mod state;
pub mod sync;
pub mod syscall;
pub mod thread;

pub use epoch::{EngineDeps, EngineOptions, EpochCoordinator, Finding, Spawn};
pub use quiesce::{CooperativeTransport, Decision, QuiesceBarrier, QuiesceHook, QuiesceTransport, SignalTransport};
pub use state::{EpochPhase, EpochState};
pub use sync::SyncCoordinator;
pub use syscall::{CallClass, Errno, EpochControl, LibcBackend, SysResult, SyscallBackend, SyscallGateway, classify};
pub use thread::{MAX_THREADS, ThreadRecord, ThreadRegistry, ThreadStatus};
