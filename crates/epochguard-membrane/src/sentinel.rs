//! Sentinel bitmap: one bit per heap word, set exactly when that word holds
//! a live canary.
//!
//! The integrity scan visits set bits only, so its cost follows the number
//! of live canaries (plus one bitmap word per 64 heap words) rather than the
//! heap size. A set bit whose word no longer holds a canary is an overflow;
//! the owning object is resolved through [`ObjectResolver`] and the first
//! divergent word of each object is reported.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::canary::{MEMALIGN_SENTINEL_WORD, SENTINEL_WORD, ShortPad, WORD_SIZE, load_word, store_word};
use crate::error::{GuardError, Result};
use crate::metrics::{GuardMetrics, global_metrics};

const BITS: usize = 64;

/// Where a live object sits in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectExtent {
    pub header: usize,
    pub payload: usize,
    /// Logical (requested) size.
    pub size: usize,
    pub block_end: usize,
}

impl ObjectExtent {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.header && addr < self.block_end
    }
}

/// Maps a canary word back to the live object it guards.
pub trait ObjectResolver {
    fn owner_of(&self, addr: usize) -> Option<ObjectExtent>;
}

/// One corrupted object, reported at its first divergent word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowFinding {
    /// Canary word that diverged.
    pub word: usize,
    /// First byte known to be overwritten.
    pub fault_addr: usize,
    pub observed: u64,
    pub object: Option<ObjectExtent>,
}

impl OverflowFinding {
    /// Byte offset of the fault from the start of the payload.
    #[must_use]
    pub fn offset(&self) -> Option<i64> {
        self.object
            .map(|o| self.fault_addr as i64 - o.payload as i64)
    }
}

pub struct SentinelBitmap {
    base: usize,
    limit: usize,
    bits: Box<[AtomicU64]>,
    saved: Mutex<Vec<u64>>,
}

impl SentinelBitmap {
    /// Bitmap covering `[base, base + len)`. `base` must be word aligned.
    #[must_use]
    pub fn new(base: usize, len: usize) -> Self {
        debug_assert_eq!(base % WORD_SIZE, 0);
        let words = len.div_ceil(WORD_SIZE);
        let bits = (0..words.div_ceil(BITS))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base,
            limit: base + len,
            bits,
            saved: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.limit
    }

    fn index(&self, addr: usize) -> Result<usize> {
        if self.covers(addr) {
            Ok((addr - self.base) / WORD_SIZE)
        } else {
            Err(GuardError::BitmapOutOfRange { addr })
        }
    }

    fn address(&self, index: usize) -> usize {
        self.base + index * WORD_SIZE
    }

    pub fn set(&self, addr: usize) -> Result<()> {
        let idx = self.index(addr)?;
        self.bits[idx / BITS].fetch_or(1 << (idx % BITS), Ordering::Relaxed);
        Ok(())
    }

    pub fn clear(&self, addr: usize) -> Result<()> {
        let idx = self.index(addr)?;
        self.bits[idx / BITS].fetch_and(!(1 << (idx % BITS)), Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn is_set(&self, addr: usize) -> bool {
        self.index(addr)
            .map(|idx| self.bits[idx / BITS].load(Ordering::Relaxed) & (1 << (idx % BITS)) != 0)
            .unwrap_or(false)
    }

    /// Write `value` at `addr` and mark the word as a canary.
    ///
    /// # Safety
    /// `addr` must be a writable, word-aligned heap word owned by the caller.
    pub unsafe fn place(&self, addr: usize, value: u64) -> Result<()> {
        self.index(addr)?;
        // SAFETY: caller guarantees the word is writable and ours.
        unsafe { store_word(addr, value) };
        self.set(addr)
    }

    /// Apply `f` to every bitmap word overlapping `[start, end)` with the
    /// mask of bits inside the range. Out-of-range parts are clamped.
    fn for_each_masked(&self, start: usize, end: usize, mut f: impl FnMut(&AtomicU64, u64)) {
        let start = start.max(self.base);
        let end = end.min(self.limit);
        if start >= end {
            return;
        }
        let first = (start - self.base) / WORD_SIZE;
        let last = (end - self.base).div_ceil(WORD_SIZE);
        let (first_word, last_word) = (first / BITS, (last - 1) / BITS);
        for w in first_word..=last_word {
            let lo = if w == first_word { first % BITS } else { 0 };
            let hi = if w == last_word { (last - 1) % BITS + 1 } else { BITS };
            let upper = if hi == BITS { u64::MAX } else { (1u64 << hi) - 1 };
            let mask = upper & !((1u64 << lo) - 1);
            f(&self.bits[w], mask);
        }
    }

    /// Clear every bit in `[start, start + size)`; used when memory is carved
    /// out for a new object.
    pub fn cleanup(&self, start: usize, size: usize) {
        self.for_each_masked(start, start + size, |word, mask| {
            word.fetch_and(!mask, Ordering::Relaxed);
        });
    }

    #[must_use]
    pub fn has_sentinels(&self, start: usize, size: usize) -> bool {
        let mut any = false;
        self.for_each_masked(start, start + size, |word, mask| {
            any |= word.load(Ordering::Relaxed) & mask != 0;
        });
        any
    }

    /// Addresses of set bits in `[begin, end)`, ascending.
    pub fn set_addresses(&self, begin: usize, end: usize) -> SetBits<'_> {
        let begin = begin.max(self.base);
        let end = end.min(self.limit).max(begin);
        let first = (begin - self.base).div_ceil(WORD_SIZE);
        let last = (end - self.base).div_ceil(WORD_SIZE);
        SetBits {
            map: self,
            next: first,
            end: last,
            pending: 0,
            pending_word: usize::MAX,
        }
    }

    /// Nearest set bit at or below `addr`, not below `floor`.
    #[must_use]
    pub fn last_set_at_or_before(&self, addr: usize, floor: usize) -> Option<usize> {
        let floor = floor.max(self.base);
        if addr < floor {
            return None;
        }
        let addr = addr.min(self.limit.checked_sub(WORD_SIZE)?);
        let idx = (addr - self.base) / WORD_SIZE;
        let floor_idx = (floor - self.base) / WORD_SIZE;
        let mut w = idx / BITS;
        let top = idx % BITS;
        let mut mask = if top == BITS - 1 { u64::MAX } else { (1u64 << (top + 1)) - 1 };
        loop {
            let bits = self.bits[w].load(Ordering::Relaxed) & mask;
            if bits != 0 {
                let bit = BITS - 1 - bits.leading_zeros() as usize;
                let found = w * BITS + bit;
                return (found >= floor_idx).then(|| self.address(found));
            }
            if w == 0 || w * BITS <= floor_idx {
                return None;
            }
            w -= 1;
            mask = u64::MAX;
        }
    }

    /// Snapshot the bits covering `[base, end)`.
    pub fn backup(&self, end: usize) {
        let end = end.clamp(self.base, self.limit);
        let words = (end - self.base).div_ceil(WORD_SIZE).div_ceil(BITS);
        let mut saved = self.saved.lock();
        saved.clear();
        saved.extend(self.bits[..words].iter().map(|w| w.load(Ordering::Relaxed)));
    }

    /// Restore the last snapshot; bits past it are cleared.
    pub fn restore(&self) {
        let saved = self.saved.lock();
        for (i, word) in self.bits.iter().enumerate() {
            word.store(saved.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Scan `[begin, end)` for canaries that no longer hold their value.
    pub fn check_integrity(
        &self,
        begin: usize,
        end: usize,
        resolver: &impl ObjectResolver,
    ) -> Vec<OverflowFinding> {
        let mut findings = Vec::new();
        let mut last_owner = None;
        for addr in self.set_addresses(begin, end) {
            // SAFETY: set bits only ever mark words inside live heap blocks.
            let value = unsafe { load_word(addr) };
            if value == SENTINEL_WORD || value == MEMALIGN_SENTINEL_WORD {
                continue;
            }
            let owner = resolver.owner_of(addr);
            let fault_addr = match owner.and_then(|o| ShortPad::for_payload(o.payload, o.size)) {
                Some(pad) if pad.word == addr => match pad.first_broken_byte(value) {
                    Some(byte) => addr + byte,
                    None => continue,
                },
                _ => addr,
            };
            if let Some(o) = owner {
                if last_owner == Some(o.payload) {
                    continue;
                }
                last_owner = Some(o.payload);
            }
            GuardMetrics::inc(&global_metrics().overflow_findings);
            findings.push(OverflowFinding {
                word: addr,
                fault_addr,
                observed: value,
                object: owner,
            });
        }
        findings
    }
}

/// Iterator over set bits, produced by [`SentinelBitmap::set_addresses`].
pub struct SetBits<'a> {
    map: &'a SentinelBitmap,
    next: usize,
    end: usize,
    pending: u64,
    pending_word: usize,
}

impl Iterator for SetBits<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.pending != 0 {
                let bit = self.pending.trailing_zeros() as usize;
                self.pending &= self.pending - 1;
                let idx = self.pending_word * BITS + bit;
                if idx < self.end {
                    return Some(self.map.address(idx));
                }
                self.pending = 0;
                return None;
            }
            if self.next >= self.end {
                return None;
            }
            let w = self.next / BITS;
            let lo = self.next % BITS;
            self.pending = self.map.bits[w].load(Ordering::Relaxed) & !((1u64 << lo) - 1);
            self.pending_word = w;
            self.next = (w + 1) * BITS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOwner;

    impl ObjectResolver for NoOwner {
        fn owner_of(&self, _addr: usize) -> Option<ObjectExtent> {
            None
        }
    }

    fn arena(words: usize) -> (Vec<u64>, usize) {
        let buf = vec![0u64; words];
        let base = buf.as_ptr() as usize;
        (buf, base)
    }

    #[test]
    fn set_clear_roundtrip() {
        let map = SentinelBitmap::new(0x10000, 0x10000);
        map.set(0x10008).unwrap();
        assert!(map.is_set(0x10008));
        assert!(!map.is_set(0x10010));
        map.clear(0x10008).unwrap();
        assert!(!map.is_set(0x10008));
        assert!(map.set(0x30000).is_err());
    }

    #[test]
    fn cleanup_clears_partial_words() {
        let map = SentinelBitmap::new(0, 64 * 8 * 4);
        for i in 0..256 {
            map.set(i * 8).unwrap();
        }
        map.cleanup(8 * 60, 8 * 10);
        assert!(map.is_set(8 * 59));
        assert!((60..70).all(|i| !map.is_set(i * 8)));
        assert!(map.is_set(8 * 70));
        assert!(map.has_sentinels(8 * 55, 8 * 10));
        assert!(!map.has_sentinels(8 * 61, 8 * 5));
    }

    #[test]
    fn iterates_set_bits_in_order() {
        let map = SentinelBitmap::new(0, 8 * 512);
        for idx in [3usize, 63, 64, 200, 511] {
            map.set(idx * 8).unwrap();
        }
        let seen: Vec<_> = map.set_addresses(0, 8 * 512).collect();
        assert_eq!(seen, vec![24, 504, 512, 1600, 4088]);
        let window: Vec<_> = map.set_addresses(8 * 64, 8 * 201).collect();
        assert_eq!(window, vec![512, 1600]);
    }

    #[test]
    fn backward_search_crosses_bitmap_words() {
        let map = SentinelBitmap::new(0, 8 * 512);
        map.set(8 * 10).unwrap();
        assert_eq!(map.last_set_at_or_before(8 * 300, 0), Some(80));
        assert_eq!(map.last_set_at_or_before(8 * 10, 0), Some(80));
        assert_eq!(map.last_set_at_or_before(8 * 300, 8 * 11), None);
        assert_eq!(map.last_set_at_or_before(8 * 9, 0), None);
    }

    #[test]
    fn backup_and_restore() {
        let map = SentinelBitmap::new(0, 8 * 256);
        map.set(8).unwrap();
        map.backup(8 * 128);
        map.set(16).unwrap();
        map.set(8 * 200).unwrap();
        map.clear(8).unwrap();
        map.restore();
        assert!(map.is_set(8));
        assert!(!map.is_set(16));
        assert!(!map.is_set(8 * 200));
    }

    #[test]
    fn intact_canaries_pass() {
        let (_buf, base) = arena(64);
        let map = SentinelBitmap::new(base, 64 * 8);
        for i in (0..64).step_by(5) {
            unsafe { map.place(base + i * 8, SENTINEL_WORD).unwrap() };
        }
        assert!(map.check_integrity(base, base + 64 * 8, &NoOwner).is_empty());
    }

    #[test]
    fn broken_canary_reported() {
        let (_buf, base) = arena(64);
        let map = SentinelBitmap::new(base, 64 * 8);
        unsafe {
            map.place(base + 16, SENTINEL_WORD).unwrap();
            map.place(base + 24, SENTINEL_WORD).unwrap();
            store_word(base + 24, 0x41);
        }
        let findings = map.check_integrity(base, base + 64 * 8, &NoOwner);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].word, base + 24);
        assert_eq!(findings[0].observed, 0x41);
        assert!(findings[0].offset().is_none());
    }
}
