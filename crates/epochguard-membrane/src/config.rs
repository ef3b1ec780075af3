//! Runtime configuration.
//!
//! The detection mode is set via the `EPOCHGUARD_MODE` environment variable:
//! - `localize` (default): on corruption the epoch is rolled back and replayed
//!   with hardware watchpoints armed so the faulting access is pinpointed.
//! - `detect`: corruption is reported as soon as a scan finds it. Memory is
//!   restored to the checkpoint but no replay happens.
//! - `off`: no integrity checking. Pure passthrough for benchmarking baseline.
//!
//! Everything else lives in [`EngineConfig`], read once at engine start.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

/// Quarantine ring slots per thread (one slot stays empty).
pub const DEFAULT_QUARANTINE_ENTRIES: usize = 1024;
/// Quarantine byte budget per thread.
pub const DEFAULT_QUARANTINE_BYTES: usize = 16 * 1024 * 1024;
/// Rollbacks allowed for one epoch before reporting the corruption unlocalized.
pub const DEFAULT_MAX_ROLLBACKS: u32 = 1;

/// How aggressively corruption is chased once a scan finds it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionLevel {
    /// Roll back and replay with watchpoints armed.
    #[default]
    Localize,
    /// Report on detection; restore memory but never replay.
    Detect,
    /// No checking at all.
    Off,
}

impl DetectionLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "localize" | "default" | "replay" | "full" => Self::Localize,
            "detect" | "report" | "halt" => Self::Detect,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Localize,
        }
    }

    /// Returns true if corruption triggers a replay pass.
    #[must_use]
    pub const fn replays(self) -> bool {
        matches!(self, Self::Localize)
    }

    /// Returns true if epoch-end scans run at all.
    #[must_use]
    pub const fn checks_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

// Atomic cache: 0=unresolved, 1=Localize, 2=Detect, 3=Off, 255=resolving.
// std::env::var allocates, and under interposition that allocation lands
// back in the engine, so a OnceLock initializer could deadlock on itself.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_LOCALIZE: u8 = 1;
const LEVEL_DETECT: u8 = 2;
const LEVEL_OFF: u8 = 3;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: DetectionLevel) -> u8 {
    match level {
        DetectionLevel::Localize => LEVEL_LOCALIZE,
        DetectionLevel::Detect => LEVEL_DETECT,
        DetectionLevel::Off => LEVEL_OFF,
    }
}

fn u8_to_level(v: u8) -> DetectionLevel {
    match v {
        LEVEL_DETECT => DetectionLevel::Detect,
        LEVEL_OFF => DetectionLevel::Off,
        _ => DetectionLevel::Localize,
    }
}

/// Get the configured detection level (reads env var on first call, caches thereafter).
///
/// A reentrant call that arrives while the variable is being read sees the
/// RESOLVING state and gets `Localize`.
#[must_use]
pub fn detection_level() -> DetectionLevel {
    let cached = CACHED_LEVEL.load(Ordering::Relaxed);

    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }
    if cached == LEVEL_RESOLVING {
        return DetectionLevel::Localize;
    }

    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Relaxed);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            DetectionLevel::Localize
        };
    }

    let level = std::env::var("EPOCHGUARD_MODE")
        .map(|v| DetectionLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub level: DetectionLevel,
    pub quarantine_entries: usize,
    pub quarantine_bytes: usize,
    pub leak_check: bool,
    pub max_rollbacks: u32,
    /// JSONL fault report destination; stderr when unset.
    pub fault_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            level: DetectionLevel::Localize,
            quarantine_entries: DEFAULT_QUARANTINE_ENTRIES,
            quarantine_bytes: DEFAULT_QUARANTINE_BYTES,
            leak_check: true,
            max_rollbacks: DEFAULT_MAX_ROLLBACKS,
            fault_log: None,
        }
    }
}

impl EngineConfig {
    /// Build from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.level = detection_level();
        config
    }

    /// Build from an arbitrary key lookup. Malformed numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, fallback: usize| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .filter(|&v| v > 0)
                .unwrap_or(fallback)
        };

        // A ring needs one free slot to tell full from empty.
        let quarantine_entries =
            number("EPOCHGUARD_QUARANTINE_ENTRIES", defaults.quarantine_entries).max(2);

        Self {
            level: lookup("EPOCHGUARD_MODE")
                .map(|v| DetectionLevel::from_str_loose(&v))
                .unwrap_or(defaults.level),
            quarantine_entries,
            quarantine_bytes: number("EPOCHGUARD_QUARANTINE_BYTES", defaults.quarantine_bytes),
            leak_check: lookup("EPOCHGUARD_LEAK_CHECK")
                .map(|v| !matches!(v.trim(), "0" | "false" | "off" | "no"))
                .unwrap_or(defaults.leak_check),
            max_rollbacks: number(
                "EPOCHGUARD_MAX_ROLLBACKS",
                defaults.max_rollbacks as usize,
            ) as u32,
            fault_log: lookup("EPOCHGUARD_FAULT_LOG")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        }
    }
}
