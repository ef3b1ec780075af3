//! Per-thread FIFO of freed objects.
//!
//! A freed payload is filled with up to [`FREE_OBJECT_CANARY_WORDS`] canary
//! words and parked here. Only when the ring runs out of slots or bytes is
//! the oldest entry evicted; its canaries are re-checked first and the block
//! goes back to the allocator only if they are intact. A write to a freed
//! object after its eviction is outside this window.

#![allow(unsafe_code)]

use std::collections::VecDeque;

use crate::canary::{FREE_OBJECT_CANARY_WORDS, SENTINEL_WORD, WORD_SIZE, align_up, load_word, store_word};
use crate::heap::FreedObject;
use crate::metrics::{GuardMetrics, global_metrics};

/// A freed object whose canaries were disturbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseAfterFree {
    pub object: FreedObject,
    /// First canary word that changed.
    pub word: usize,
    pub observed: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Evicted with intact canaries; the caller releases them.
    pub released: Vec<FreedObject>,
    /// Set when an eviction found a corrupted entry. Eviction stops there.
    pub corrupted: Option<UseAfterFree>,
    /// The object was too large to quarantine and must be released directly.
    pub rejected: Option<FreedObject>,
}

#[derive(Clone)]
struct Ring {
    entries: VecDeque<FreedObject>,
    bytes: usize,
}

pub struct Quarantine {
    ring: Ring,
    saved: Ring,
    slots: usize,
    max_bytes: usize,
}

fn canary_words(object: &FreedObject) -> usize {
    (align_up(object.size, WORD_SIZE) / WORD_SIZE).min(FREE_OBJECT_CANARY_WORDS)
}

/// First disturbed canary word of `object`.
///
/// # Safety
/// The payload must still be mapped (the block has not been released).
unsafe fn first_disturbed(object: &FreedObject) -> Option<(usize, u64)> {
    (0..canary_words(object)).find_map(|i| {
        let addr = object.payload + i * WORD_SIZE;
        // SAFETY: forwarded from the caller; the word lies in the payload.
        let value = unsafe { load_word(addr) };
        (value != SENTINEL_WORD).then_some((addr, value))
    })
}

impl Quarantine {
    /// Ring with `slots` slots (one stays empty) and a byte budget.
    #[must_use]
    pub fn new(slots: usize, max_bytes: usize) -> Self {
        let ring = Ring {
            entries: VecDeque::with_capacity(slots),
            bytes: 0,
        };
        Self {
            saved: ring.clone(),
            ring,
            slots: slots.max(2),
            max_bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.entries.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.ring.bytes
    }

    #[must_use]
    pub fn contains(&self, payload: usize) -> bool {
        self.ring.entries.iter().any(|o| o.payload == payload)
    }

    fn over_budget(&self) -> bool {
        self.ring.entries.len() > self.slots - 1 || self.ring.bytes > self.max_bytes
    }

    /// Quarantine `object`, evicting the oldest entries while over budget.
    ///
    /// # Safety
    /// `object` must be a freed, not yet released block of the heap; its
    /// payload is overwritten with canaries.
    pub unsafe fn push(&mut self, object: FreedObject) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        if object.size >= self.max_bytes {
            outcome.rejected = Some(object);
            return outcome;
        }
        for i in 0..canary_words(&object) {
            // SAFETY: the caller hands over a freed payload of `size` bytes,
            // and word-rounded payloads always fit their block.
            unsafe { store_word(object.payload + i * WORD_SIZE, SENTINEL_WORD) };
        }
        self.ring.entries.push_back(object);
        self.ring.bytes += object.size;

        while self.over_budget() {
            let Some(oldest) = self.ring.entries.pop_front() else {
                break;
            };
            self.ring.bytes -= oldest.size;
            // SAFETY: entries in the ring have not been released.
            match unsafe { first_disturbed(&oldest) } {
                None => {
                    GuardMetrics::inc(&global_metrics().quarantine_evictions);
                    outcome.released.push(oldest);
                }
                Some((word, observed)) => {
                    GuardMetrics::inc(&global_metrics().use_after_free_findings);
                    outcome.corrupted = Some(UseAfterFree {
                        object: oldest,
                        word,
                        observed,
                    });
                    break;
                }
            }
        }
        outcome
    }

    /// Check every queued entry without evicting.
    #[must_use]
    pub fn scan(&self) -> Vec<UseAfterFree> {
        self.ring
            .entries
            .iter()
            .filter_map(|object| {
                // SAFETY: queued entries are not released.
                unsafe { first_disturbed(object) }.map(|(word, observed)| UseAfterFree {
                    object: *object,
                    word,
                    observed,
                })
            })
            .collect()
    }

    /// Empty the ring. Intact entries are returned for release; the scan
    /// stops collecting findings after `limit` corrupted entries.
    pub fn drain_checked(&mut self, limit: usize) -> (Vec<FreedObject>, Vec<UseAfterFree>) {
        let mut released = Vec::new();
        let mut findings = Vec::new();
        while let Some(object) = self.ring.entries.pop_front() {
            self.ring.bytes -= object.size;
            // SAFETY: queued entries are not released.
            match unsafe { first_disturbed(&object) } {
                None => released.push(object),
                Some((word, observed)) => {
                    if findings.len() < limit {
                        findings.push(UseAfterFree {
                            object,
                            word,
                            observed,
                        });
                    }
                }
            }
        }
        (released, findings)
    }

    /// Remember the ring contents at an epoch boundary.
    pub fn backup(&mut self) {
        self.saved.clone_from(&self.ring);
    }

    /// Return to the contents of the last backup.
    pub fn restore(&mut self) {
        self.ring.clone_from(&self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slab {
        buf: Vec<u64>,
    }

    impl Slab {
        fn new(words: usize) -> Self {
            Self {
                buf: vec![0; words],
            }
        }

        fn object(&self, word: usize, size: usize) -> FreedObject {
            let payload = self.buf.as_ptr() as usize + word * 8;
            FreedObject {
                payload,
                size,
                block: payload - 16,
            }
        }
    }

    #[test]
    fn push_fills_canaries() {
        let slab = Slab::new(64);
        let mut q = Quarantine::new(8, 1 << 20);
        let obj = slab.object(2, 20);
        let out = unsafe { q.push(obj) };
        assert_eq!(out, PushOutcome::default());
        assert_eq!(&slab.buf[2..5], &[SENTINEL_WORD; 3]);
        assert_eq!(slab.buf[5], 0);
        assert!(q.contains(obj.payload));
    }

    #[test]
    fn eviction_is_fifo_and_holds_slots_minus_one() {
        let slab = Slab::new(256);
        let mut q = Quarantine::new(4, 1 << 20);
        let objs: Vec<_> = (0..5).map(|i| slab.object(i * 8, 16)).collect();
        let mut released = Vec::new();
        for o in &objs {
            released.extend(unsafe { q.push(*o) }.released);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(released, objs[..2].to_vec());
    }

    #[test]
    fn write_after_free_is_caught_at_eviction() {
        let mut slab = Slab::new(256);
        let mut q = Quarantine::new(2, 1 << 20);
        let victim = slab.object(0, 32);
        unsafe { q.push(victim) };
        slab.buf[1] = 0x4141;
        let out = unsafe { q.push(slab.object(16, 32)) };
        assert!(out.released.is_empty());
        let uaf = out.corrupted.unwrap();
        assert_eq!(uaf.object, victim);
        assert_eq!(uaf.word, victim.payload + 8);
        assert_eq!(uaf.observed, 0x4141);
    }

    #[test]
    fn byte_budget_evicts() {
        let slab = Slab::new(1024);
        let mut q = Quarantine::new(64, 100);
        unsafe { q.push(slab.object(0, 64)) };
        let out = unsafe { q.push(slab.object(64, 64)) };
        assert_eq!(out.released.len(), 1);
        assert_eq!(q.bytes(), 64);
        let big = slab.object(128, 100);
        assert_eq!(unsafe { q.push(big) }.rejected, Some(big));
    }

    #[test]
    fn backup_restore_and_drain() {
        let mut slab = Slab::new(256);
        let mut q = Quarantine::new(16, 1 << 20);
        unsafe { q.push(slab.object(0, 8)) };
        q.backup();
        unsafe { q.push(slab.object(8, 8)) };
        q.restore();
        assert_eq!(q.len(), 1);

        unsafe { q.push(slab.object(16, 8)) };
        slab.buf[16] = 1;
        assert_eq!(q.scan().len(), 1);
        let (released, findings) = q.drain_checked(4);
        assert_eq!(released.len(), 1);
        assert_eq!(findings.len(), 1);
        assert!(q.is_empty());
    }
}
