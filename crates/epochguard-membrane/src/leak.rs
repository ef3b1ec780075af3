//! Conservative leak scan.
//!
//! Mark: every word in the root set that points into a live heap object
//! marks that object "checked" and queues its payload words. Sweep: walk the
//! allocator's live blocks; a live object that is not checked is a leak, and
//! the checked flags are cleared on the way. Blocks whose header no longer
//! holds a plausible live object are skipped: that damage belongs to the
//! overflow scan.

#![allow(unsafe_code)]

use tracing::debug;

use crate::arena::RawAllocator;
use crate::canary::{WORD_SIZE, align_down, align_up, load_word};
use crate::heap::GuardedHeap;
use crate::metrics::{GuardMetrics, global_metrics};
use crate::object_header::ObjectHeader;

/// Which roots were available to the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakCheckMode {
    /// Program exit: globals plus the calling thread only.
    Fast,
    /// Epoch end: globals plus every quiesced thread.
    Slow,
}

/// Memory ranges and loose words that may hold heap pointers.
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    ranges: Vec<(usize, usize)>,
    words: Vec<usize>,
}

impl RootSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`. The range must stay readable during the scan.
    pub fn add_range(&mut self, start: usize, end: usize) {
        if end > start {
            self.ranges.push((start, end));
        }
    }

    pub fn add_word(&mut self, word: usize) {
        self.words.push(word);
    }

    pub fn add_words(&mut self, words: impl IntoIterator<Item = usize>) {
        self.words.extend(words);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.words.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakedObject {
    pub start: usize,
    pub size: usize,
}

pub struct LeakScanner {
    enabled: bool,
}

impl LeakScanner {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Live heap objects unreachable from `roots`.
    pub fn scan<A: RawAllocator>(
        &self,
        heap: &GuardedHeap<A>,
        roots: &RootSet,
        mode: LeakCheckMode,
    ) -> Vec<LeakedObject> {
        if !self.enabled {
            return Vec::new();
        }
        let mut pending: Vec<usize> = roots.words.clone();
        for &(start, end) in &roots.ranges {
            let mut at = align_up(start, WORD_SIZE);
            let end = align_down(end, WORD_SIZE);
            while at < end {
                // SAFETY: root ranges are readable per `RootSet::add_range`.
                pending.push(unsafe { load_word(at) } as usize);
                at += WORD_SIZE;
            }
        }
        self.mark(heap, pending);
        let leaks = self.sweep(heap);
        debug!(?mode, leaks = leaks.len(), "leak scan finished");
        GuardMetrics::add(&global_metrics().leaks, leaks.len() as u64);
        leaks
    }

    fn mark<A: RawAllocator>(&self, heap: &GuardedHeap<A>, mut pending: Vec<usize>) {
        while let Some(candidate) = pending.pop() {
            let Some(ext) = heap.find_object(candidate) else {
                continue;
            };
            // SAFETY: `find_object` only returns live blocks of this heap.
            unsafe {
                if ObjectHeader::read(ext.header).is_checked() {
                    continue;
                }
                ObjectHeader::set_checked(ext.header, true);
            }
            let end = align_down(ext.payload + ext.size, WORD_SIZE);
            let mut at = ext.payload;
            while at < end {
                // SAFETY: words inside a live payload.
                pending.push(unsafe { load_word(at) } as usize);
                at += WORD_SIZE;
            }
        }
    }

    fn sweep<A: RawAllocator>(&self, heap: &GuardedHeap<A>) -> Vec<LeakedObject> {
        let mut leaks = Vec::new();
        for (header, _) in heap.walk_blocks() {
            let Some(ext) = heap.live_object(ObjectHeader::payload_of(header)) else {
                continue;
            };
            // SAFETY: live header of this heap.
            let h = unsafe { ObjectHeader::read(header) };
            if h.is_checked() {
                // SAFETY: as above.
                unsafe { ObjectHeader::set_checked(header, false) };
            } else {
                leaks.push(LeakedObject {
                    start: ext.payload,
                    size: ext.size,
                });
            }
        }
        leaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::store_word;

    #[test]
    fn unreferenced_object_is_leaked() {
        let heap = GuardedHeap::with_capacity(1 << 20).unwrap();
        let kept = heap.malloc(24).unwrap();
        let lost = heap.malloc(24).unwrap();
        let mut roots = RootSet::new();
        roots.add_word(kept);
        let leaks = LeakScanner::new(true)
            .scan(&heap, &roots, LeakCheckMode::Slow);
        assert_eq!(leaks, vec![LeakedObject { start: lost, size: 24 }]);
    }

    #[test]
    fn reachability_is_transitive_and_flags_reset() {
        let heap = GuardedHeap::with_capacity(1 << 20).unwrap();
        let a = heap.malloc(16).unwrap();
        let b = heap.malloc(16).unwrap();
        let c = heap.malloc(16).unwrap();
        unsafe {
            store_word(a, b as u64);
            // Interior pointer still keeps c alive.
            store_word(b + 8, (c + 4) as u64);
        }
        let root_slot = [a];
        let mut roots = RootSet::new();
        roots.add_range(
            root_slot.as_ptr() as usize,
            root_slot.as_ptr() as usize + std::mem::size_of_val(&root_slot),
        );
        let scanner = LeakScanner::new(true);
        assert!(scanner.scan(&heap, &roots, LeakCheckMode::Fast).is_empty());
        for (header, h) in heap.walk_blocks() {
            assert!(!h.is_checked(), "flag left on {header:#x}");
        }
    }

    #[test]
    fn freed_objects_are_not_leaks() {
        let heap = GuardedHeap::with_capacity(1 << 20).unwrap();
        let p = heap.malloc(100).unwrap();
        let _ = heap.free(p);
        let leaks = LeakScanner::new(true)
            .scan(&heap, &RootSet::new(), LeakCheckMode::Slow);
        assert!(leaks.is_empty());
    }

    #[test]
    fn disabled_scanner_reports_nothing() {
        let heap = GuardedHeap::with_capacity(1 << 20).unwrap();
        heap.malloc(8).unwrap();
        let leaks = LeakScanner::new(false)
            .scan(&heap, &RootSet::new(), LeakCheckMode::Slow);
        assert!(leaks.is_empty());
    }

    #[test]
    fn smashed_header_does_not_stop_the_sweep() {
        let heap = GuardedHeap::with_capacity(1 << 20).unwrap();
        let p = heap.malloc(16).unwrap();
        let q = heap.malloc(16).unwrap();
        let lost = heap.malloc(16).unwrap();
        // Run from p through q's header and into its payload.
        for at in (p..q + 8).step_by(WORD_SIZE) {
            unsafe { store_word(at, 0x4141_4141_4141_4141) };
        }
        let mut roots = RootSet::new();
        roots.add_word(p);
        let leaks = LeakScanner::new(true).scan(&heap, &roots, LeakCheckMode::Slow);
        assert_eq!(leaks, vec![LeakedObject { start: lost, size: 16 }]);
    }
}
