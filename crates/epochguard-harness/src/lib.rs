//! Scenario runner for EpochGuard.
//!
//! This crate provides:
//! - Scenarios: the end-to-end detection runs (overflow, use-after-free,
//!   descriptor replay, leak) on the simulated collaborators
//! - Structured logs: JSONL run events and a schema validator

#![deny(unsafe_code)]

pub mod error;
pub mod scenarios;
pub mod structured_log;

pub use error::{HarnessError, Result};
pub use scenarios::{Scenario, ScenarioSummary, run_scenario};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, validate_log_file};
