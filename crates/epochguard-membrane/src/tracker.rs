//! Objects implicated in a detected fault, and where they came from.
//!
//! Detection happens long after the faulting access, so the tracker is
//! filled at detection time and the call-sites are captured during replay,
//! when the same objects are allocated and freed again.

use std::backtrace::Backtrace;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use parking_lot::Mutex;

/// Frames kept per captured call stack.
pub const CALLSITE_MAX_FRAMES: usize = 10;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FaultKinds: u32 {
        const OVERFLOW = 1;
        const USE_AFTER_FREE = 2;
        const LEAK = 4;
        /// Armed for observation only; never reported as a fault type.
        const WATCH_ONLY = 8;
    }
}

/// A truncated, rendered call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CallSite {
    frames: Vec<String>,
}

impl CallSite {
    /// Capture the current call stack.
    #[must_use]
    pub fn capture() -> Self {
        Self::from_rendered(&Backtrace::force_capture().to_string())
    }

    /// Parse `Backtrace` display output: keep frame lines (`N: symbol`),
    /// dropping capture machinery and source-location lines.
    #[must_use]
    pub fn from_rendered(rendered: &str) -> Self {
        let frames = rendered
            .lines()
            .filter_map(|line| {
                let (index, symbol) = line.trim_start().split_once(": ")?;
                index.parse::<usize>().ok()?;
                Some(symbol.trim().to_string())
            })
            .filter(|symbol| !symbol.contains("backtrace") && !symbol.contains("CallSite::capture"))
            .take(CALLSITE_MAX_FRAMES)
            .collect();
        Self { frames }
    }

    #[must_use]
    pub fn from_frames(frames: Vec<String>) -> Self {
        Self { frames }
    }

    #[must_use]
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.frames.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedObject {
    pub start: usize,
    pub size: usize,
    pub kinds: FaultKinds,
    /// Captured during replay when the object is allocated again.
    pub alloc_site: Option<CallSite>,
    /// Captured during replay when the object is freed again.
    pub free_site: Option<CallSite>,
}

#[derive(Default)]
pub struct AllocationTracker {
    objects: Mutex<HashMap<usize, TrackedObject>>,
    reported_sites: Mutex<HashSet<u64>>,
}

impl AllocationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `start` as implicated in a fault of `kind`.
    pub fn insert(&self, start: usize, size: usize, kind: FaultKinds) {
        self.objects
            .lock()
            .entry(start)
            .and_modify(|o| o.kinds |= kind)
            .or_insert(TrackedObject {
                start,
                size,
                kinds: kind,
                alloc_site: None,
                free_site: None,
            });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    #[must_use]
    pub fn is_tracked(&self, start: usize) -> bool {
        self.objects.lock().contains_key(&start)
    }

    #[must_use]
    pub fn get(&self, start: usize) -> Option<TrackedObject> {
        self.objects.lock().get(&start).cloned()
    }

    /// Replay saw `start` allocated again; capture the call-site if tracked.
    pub fn on_allocation(&self, start: usize) {
        let mut objects = self.objects.lock();
        if let Some(o) = objects.get_mut(&start) {
            if o.alloc_site.is_none() {
                o.alloc_site = Some(CallSite::capture());
            }
        }
    }

    /// Replay saw `start` freed again; capture the call-site if tracked.
    pub fn on_free(&self, start: usize) {
        let mut objects = self.objects.lock();
        if let Some(o) = objects.get_mut(&start) {
            if o.free_site.is_none() {
                o.free_site = Some(CallSite::capture());
            }
        }
    }

    /// Classify a trapping address: inside a freed tracked object is a
    /// use-after-free, a canary word (per `is_canary`) is an overflow.
    pub fn fault_kind(&self, addr: usize, is_canary: impl Fn(usize) -> bool) -> FaultKinds {
        let objects = self.objects.lock();
        for o in objects.values() {
            if o.kinds.contains(FaultKinds::USE_AFTER_FREE) && addr >= o.start && addr < o.start + o.size.max(1) {
                return FaultKinds::USE_AFTER_FREE;
            }
        }
        if is_canary(addr & !7) {
            FaultKinds::OVERFLOW
        } else {
            FaultKinds::empty()
        }
    }

    /// True the first time a call-site is seen.
    pub fn first_report_of(&self, site: &CallSite) -> bool {
        self.reported_sites.lock().insert(site.fingerprint())
    }

    /// Tracked objects with the given kind, ordered by address.
    #[must_use]
    pub fn with_kind(&self, kind: FaultKinds) -> Vec<TrackedObject> {
        let mut out: Vec<_> = self
            .objects
            .lock()
            .values()
            .filter(|o| o.kinds.intersects(kind))
            .cloned()
            .collect();
        out.sort_by_key(|o| o.start);
        out
    }

    pub fn clear(&self) {
        self.objects.lock().clear();
        self.reported_sites.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges_kinds() {
        let t = AllocationTracker::new();
        t.insert(0x1000, 32, FaultKinds::OVERFLOW);
        t.insert(0x1000, 32, FaultKinds::LEAK);
        let o = t.get(0x1000).unwrap();
        assert_eq!(o.kinds, FaultKinds::OVERFLOW | FaultKinds::LEAK);
        assert_eq!(t.with_kind(FaultKinds::LEAK).len(), 1);
        assert!(t.with_kind(FaultKinds::USE_AFTER_FREE).is_empty());
    }

    #[test]
    fn replay_captures_sites_once() {
        let t = AllocationTracker::new();
        t.insert(0x2000, 8, FaultKinds::USE_AFTER_FREE);
        t.on_allocation(0x2000);
        t.on_allocation(0x3000);
        t.on_free(0x2000);
        let o = t.get(0x2000).unwrap();
        assert!(o.alloc_site.is_some());
        assert!(o.free_site.is_some());
        assert!(!t.is_tracked(0x3000));
    }

    #[test]
    fn classifies_trap_addresses() {
        let t = AllocationTracker::new();
        t.insert(0x4000, 64, FaultKinds::USE_AFTER_FREE);
        assert_eq!(t.fault_kind(0x4010, |_| false), FaultKinds::USE_AFTER_FREE);
        assert_eq!(t.fault_kind(0x5003, |a| a == 0x5000), FaultKinds::OVERFLOW);
        assert_eq!(t.fault_kind(0x6000, |_| false), FaultKinds::empty());
    }

    #[test]
    fn parses_rendered_backtraces() {
        let rendered = "   0: std::backtrace::Backtrace::force_capture\n             at /rustc/library/std/src/backtrace.rs:1\n   1: app::store_record\n             at src/main.rs:10:5\n   2: app::main\n";
        let site = CallSite::from_rendered(rendered);
        assert_eq!(site.frames(), &["app::store_record", "app::main"]);
        let t = AllocationTracker::new();
        assert!(t.first_report_of(&site));
        assert!(!t.first_report_of(&site));
    }
}
