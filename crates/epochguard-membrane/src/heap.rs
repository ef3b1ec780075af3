//! Guarded heap: headers and sentinels layered over a [`RawAllocator`].
//!
//! Block layout:
//!
//! ```text
//! | header (size words, front canary) | payload ... [short pad] | tail guards ... |
//! ```
//!
//! Every request reserves at least one word past the word-rounded payload, so
//! each object has a tail guard. Full canary words fill the block slack up to
//! [`MAX_TAIL_GUARD_WORDS`]. All canary words are marked in the
//! [`SentinelBitmap`]; freeing an object clears its bits after checking them.

#![allow(unsafe_code)]

use tracing::warn;

use crate::arena::{PowerOfTwoHeap, RawAllocator};
use crate::canary::{
    MAX_TAIL_GUARD_WORDS, MEMALIGN_SENTINEL_WORD, SENTINEL_WORD, ShortPad, WORD_SIZE, align_up,
    load_word, store_word,
};
use crate::error::Result;
use crate::metrics::{GuardMetrics, global_metrics};
use crate::object_header::{HEADER_SIZE, ObjectHeader};
use crate::sentinel::{ObjectExtent, ObjectResolver, OverflowFinding, SentinelBitmap};

/// Why a free was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFree {
    /// Pointer outside the heap or not at a payload start.
    NotHeap,
    DoubleFree,
    /// Header fields are garbage.
    CorruptHeader,
}

/// A freed object, still owned by the heap until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedObject {
    pub payload: usize,
    pub size: usize,
    pub block: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Header marked free; the caller quarantines or releases the block.
    Freed(FreedObject),
    /// Canaries already broken; nothing was freed.
    Overflow(OverflowFinding),
    Invalid(InvalidFree),
}

pub struct GuardedHeap<A: RawAllocator = PowerOfTwoHeap> {
    raw: A,
    bitmap: SentinelBitmap,
}

impl GuardedHeap<PowerOfTwoHeap> {
    /// Heap over a fresh [`PowerOfTwoHeap`] of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self::new(PowerOfTwoHeap::new(capacity)?))
    }
}

impl<A: RawAllocator> GuardedHeap<A> {
    #[must_use]
    pub fn new(raw: A) -> Self {
        let bitmap = SentinelBitmap::new(raw.begin(), raw.capacity());
        Self { raw, bitmap }
    }

    #[must_use]
    pub fn raw(&self) -> &A {
        &self.raw
    }

    #[must_use]
    pub fn bitmap(&self) -> &SentinelBitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn begin(&self) -> usize {
        self.raw.begin()
    }

    #[must_use]
    pub fn used_end(&self) -> usize {
        self.raw.used_end()
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.used_end()
    }

    /// Clear sentinel bits for memory carved out of `[start, start + size)`.
    pub fn cleanup(&self, start: usize, size: usize) {
        self.bitmap.cleanup(start, size);
    }

    /// Allocate `size` bytes; `malloc(0)` yields a unique one-byte object.
    pub fn malloc(&self, size: usize) -> Option<usize> {
        let size = size.max(1);
        let rounded = size.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1);
        let need = HEADER_SIZE.checked_add(rounded)?.checked_add(WORD_SIZE)?;
        let block = self.raw.allocate(need)?;
        let block_size = self.raw.block_size(block)?;
        self.bitmap.cleanup(block, block_size);
        let payload = ObjectHeader::payload_of(block);
        // SAFETY: the raw allocator just handed us [block, block + block_size).
        let placed = unsafe {
            ObjectHeader::new(block_size, size).write(block);
            match self.bitmap.set(ObjectHeader::canary_of(block)) {
                Ok(()) => self.place_tail_guards(payload, size, block + block_size),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = placed {
            warn!(error = %e, block, "sentinel placement failed");
            self.raw.release(block);
            return None;
        }
        Some(payload)
    }

    /// # Safety
    /// `[payload, block_end)` must belong to one live object of this heap.
    unsafe fn place_tail_guards(&self, payload: usize, size: usize, block_end: usize) -> Result<()> {
        let mut guard = align_up(payload + size, WORD_SIZE);
        if let Some(pad) = ShortPad::for_payload(payload, size) {
            // SAFETY: the pad word is part of the payload's last word.
            unsafe { store_word(pad.word, pad.apply(load_word(pad.word))) };
            self.bitmap.set(pad.word)?;
        }
        let limit = block_end.min(guard + MAX_TAIL_GUARD_WORDS * WORD_SIZE);
        while guard < limit {
            // SAFETY: guard words lie in the block slack past the payload.
            unsafe { self.bitmap.place(guard, SENTINEL_WORD)? };
            guard += WORD_SIZE;
        }
        Ok(())
    }

    /// `n * size` zeroed bytes; `None` on multiplication overflow.
    pub fn calloc(&self, n: usize, size: usize) -> Option<usize> {
        let total = n.checked_mul(size)?;
        let payload = self.malloc(total)?;
        // SAFETY: fresh payload of `total` bytes.
        unsafe { std::ptr::write_bytes(payload as *mut u8, 0, total) };
        Some(payload)
    }

    /// Resize in place when the block has room; returns false otherwise.
    pub fn try_resize_in_place(&self, ptr: usize, size: usize) -> bool {
        let Some(ext) = self.live_object(ptr) else {
            return false;
        };
        let size = size.max(1);
        let need = HEADER_SIZE + align_up(size, WORD_SIZE) + WORD_SIZE;
        if need > ext.block_end - ext.header {
            return false;
        }
        self.bitmap.cleanup(ext.payload, ext.block_end - ext.payload);
        // SAFETY: header and guards stay inside the object's own block.
        unsafe {
            ObjectHeader::set_object_size(ext.header, size);
            self.place_tail_guards(ext.payload, size, ext.block_end).is_ok()
        }
    }

    /// Allocation aligned to `boundary` (a power of two).
    ///
    /// For boundaries above 16 the payload is over-allocated; the word before
    /// the aligned pointer holds [`MEMALIGN_SENTINEL_WORD`] and the one before
    /// it the underlying payload address.
    pub fn memalign(&self, boundary: usize, size: usize) -> Option<usize> {
        if !boundary.is_power_of_two() || boundary < WORD_SIZE {
            return None;
        }
        if boundary <= HEADER_SIZE {
            return self.malloc(size);
        }
        let base = self.malloc(boundary.checked_add(size.max(1))?)?;
        let mut aligned = align_up(base, boundary);
        if aligned == base {
            aligned += boundary;
        }
        // SAFETY: aligned - 16 >= base because base is 16-aligned and
        // aligned > base; both words are inside the underlying payload.
        unsafe {
            store_word(aligned - 2 * WORD_SIZE, base as u64);
            if self.bitmap.place(aligned - WORD_SIZE, MEMALIGN_SENTINEL_WORD).is_err() {
                return None;
            }
        }
        Some(aligned)
    }

    /// Underlying payload for `ptr`, following a memalign marker if present.
    #[must_use]
    pub fn resolve_payload(&self, ptr: usize) -> usize {
        let marker = ptr.wrapping_sub(WORD_SIZE);
        if ptr % WORD_SIZE == 0
            && self.contains(marker)
            && self.bitmap.is_set(marker)
            // SAFETY: the bit proves the word is a heap word we wrote.
            && unsafe { load_word(marker) } == MEMALIGN_SENTINEL_WORD
        {
            // SAFETY: the word before the marker holds the base pointer.
            let base = unsafe { load_word(marker - WORD_SIZE) } as usize;
            if self.contains(base) && base < ptr {
                return base;
            }
        }
        ptr
    }

    /// Usable size of `ptr` as the program sees it.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        let base = self.resolve_payload(ptr);
        let ext = self.live_object(base)?;
        ext.size.checked_sub(ptr - base)
    }

    /// Live object whose payload starts exactly at `payload`.
    #[must_use]
    pub fn live_object(&self, payload: usize) -> Option<ObjectExtent> {
        let header = payload.checked_sub(HEADER_SIZE)?;
        let block_size = self.raw.block_size(header)?;
        // SAFETY: `header` is a live block start.
        let h = unsafe { ObjectHeader::read(header) };
        (!h.is_free() && h.is_plausible()).then_some(ObjectExtent {
            header,
            payload,
            size: h.object_size(),
            block_end: header + block_size,
        })
    }

    /// Check one object's canaries without touching any other object.
    #[must_use]
    pub fn check_object(&self, ext: &ObjectExtent) -> Option<OverflowFinding> {
        self.bitmap
            .check_integrity(ObjectHeader::canary_of(ext.header), ext.block_end, self)
            .into_iter()
            .next()
    }

    pub fn free(&self, ptr: usize) -> FreeOutcome {
        let base = self.resolve_payload(ptr);
        if base % WORD_SIZE != 0 || base < self.begin() + HEADER_SIZE || !self.contains(base) {
            return self.invalid(ptr, InvalidFree::NotHeap);
        }
        let header = ObjectHeader::header_of(base);
        let Some(block_size) = self.raw.block_size(header) else {
            return self.invalid(ptr, InvalidFree::NotHeap);
        };
        // SAFETY: `header` is a live block start.
        let h = unsafe { ObjectHeader::read(header) };
        if !h.is_plausible() || h.block_size() != block_size {
            return self.invalid(ptr, InvalidFree::CorruptHeader);
        }
        if h.is_free() {
            return self.invalid(ptr, InvalidFree::DoubleFree);
        }
        let ext = ObjectExtent {
            header,
            payload: base,
            size: h.object_size(),
            block_end: header + block_size,
        };
        if let Some(finding) = self.check_object(&ext) {
            return FreeOutcome::Overflow(finding);
        }
        self.bitmap.cleanup(header, block_size);
        // SAFETY: live header of this heap.
        unsafe { ObjectHeader::set_object_size(header, 0) };
        FreeOutcome::Freed(FreedObject {
            payload: base,
            size: ext.size,
            block: header,
        })
    }

    fn invalid(&self, ptr: usize, kind: InvalidFree) -> FreeOutcome {
        GuardMetrics::inc(&global_metrics().invalid_frees);
        warn!(ptr, ?kind, "ignoring invalid free");
        FreeOutcome::Invalid(kind)
    }

    /// Hand a freed block back to the raw allocator.
    pub fn release(&self, object: &FreedObject) {
        self.raw.release(object.block);
    }

    pub fn check_heap_integrity(&self, begin: usize, end: usize) -> Vec<OverflowFinding> {
        self.bitmap.check_integrity(begin, end, self)
    }

    /// Integrity scan over the used part of the heap.
    pub fn check_heap_overflow(&self) -> Vec<OverflowFinding> {
        self.check_heap_integrity(self.begin(), self.used_end())
    }

    /// Live object containing `addr`, for conservative pointer scans.
    #[must_use]
    pub fn find_object(&self, addr: usize) -> Option<ObjectExtent> {
        if !self.contains(addr) {
            return None;
        }
        let (block, _) = self.raw.block_containing(addr)?;
        let ext = self.live_object(ObjectHeader::payload_of(block))?;
        (addr >= ext.payload).then_some(ext)
    }

    /// Every live block with its header, in address order.
    ///
    /// Blocks come from the allocator's table, so a header smashed by an
    /// overflow still yields its block; the header itself may be garbage.
    #[must_use]
    pub fn walk_blocks(&self) -> Vec<(usize, ObjectHeader)> {
        self.raw
            .live_blocks()
            .into_iter()
            // SAFETY: every live block starts with 16 readable heap bytes.
            .map(|(block, _)| (block, unsafe { ObjectHeader::read(block) }))
            .collect()
    }

    /// Snapshot allocator metadata and sentinel bits alongside a heap backup.
    pub fn checkpoint_metadata(&self) {
        self.raw.checkpoint();
        self.bitmap.backup(self.used_end());
    }

    pub fn restore_metadata(&self) {
        self.raw.restore();
        self.bitmap.restore();
    }
}

impl<A: RawAllocator> ObjectResolver for GuardedHeap<A> {
    /// Walk back through set bits to the nearest front canary of a live block
    /// that still spans `addr`.
    fn owner_of(&self, addr: usize) -> Option<ObjectExtent> {
        let floor = self.begin();
        let mut cursor = addr;
        loop {
            let bit = self.bitmap.last_set_at_or_before(cursor, floor)?;
            let header = bit.wrapping_sub(HEADER_SIZE - WORD_SIZE);
            if bit >= floor + HEADER_SIZE - WORD_SIZE {
                if let Some(block_size) = self.raw.block_size(header) {
                    if header + block_size > addr {
                        // SAFETY: `header` is a live block start.
                        let h = unsafe { ObjectHeader::read(header) };
                        if !h.is_free() {
                            return Some(ObjectExtent {
                                header,
                                payload: ObjectHeader::payload_of(header),
                                size: h.object_size(),
                                block_end: header + block_size,
                            });
                        }
                    }
                    return None;
                }
            }
            cursor = bit.checked_sub(WORD_SIZE)?;
            if cursor < floor {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> GuardedHeap {
        GuardedHeap::with_capacity(1 << 22).unwrap()
    }

    fn write_bytes(addr: usize, bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
    }

    #[test]
    fn fresh_objects_scan_clean() {
        let heap = heap();
        let ptrs: Vec<_> = [1usize, 7, 8, 16, 17, 100, 4096]
            .iter()
            .map(|&s| heap.malloc(s).unwrap())
            .collect();
        assert!(ptrs.iter().all(|p| p % 16 == 0));
        assert!(heap.check_heap_overflow().is_empty());
    }

    #[test]
    fn seventeenth_byte_is_caught_at_offset_sixteen() {
        let heap = heap();
        let p = heap.malloc(16).unwrap();
        write_bytes(p, &[b'A'; 17]);
        let findings = heap.check_heap_overflow();
        assert_eq!(findings.len(), 1);
        let f = findings[0];
        assert_eq!(f.fault_addr, p + 16);
        assert_eq!(f.offset(), Some(16));
        let obj = f.object.unwrap();
        assert_eq!(obj.payload, p);
        assert_eq!(obj.size, 16);
    }

    #[test]
    fn short_overflow_inside_pad_word() {
        let heap = heap();
        let p = heap.malloc(13).unwrap();
        write_bytes(p, &[0x11; 13]);
        assert!(heap.check_heap_overflow().is_empty());
        write_bytes(p + 13, &[0x11]);
        let findings = heap.check_heap_overflow();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].fault_addr, p + 13);
        assert_eq!(findings[0].object.unwrap().payload, p);
    }

    #[test]
    fn one_finding_per_object() {
        let heap = heap();
        let p = heap.malloc(24).unwrap();
        write_bytes(p, &[0x55; 24 + 40]);
        let findings = heap.check_heap_overflow();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].word, p + 24);
    }

    #[test]
    fn free_detects_double_and_foreign() {
        let heap = heap();
        let p = heap.malloc(40).unwrap();
        assert!(matches!(heap.free(p), FreeOutcome::Freed(o) if o.payload == p && o.size == 40));
        assert_eq!(heap.free(p), FreeOutcome::Invalid(InvalidFree::DoubleFree));
        assert_eq!(heap.free(0x10), FreeOutcome::Invalid(InvalidFree::NotHeap));
        assert_eq!(heap.free(p + 8), FreeOutcome::Invalid(InvalidFree::NotHeap));
    }

    #[test]
    fn free_of_overflowed_object_is_refused() {
        let heap = heap();
        let p = heap.malloc(8).unwrap();
        write_bytes(p, &[0; 9]);
        match heap.free(p) {
            FreeOutcome::Overflow(f) => assert_eq!(f.fault_addr, p + 8),
            other => panic!("expected overflow, got {other:?}"),
        }
        assert!(heap.live_object(p).is_some());
    }

    #[test]
    fn freed_block_carries_no_sentinels() {
        let heap = heap();
        let p = heap.malloc(64).unwrap();
        let FreeOutcome::Freed(obj) = heap.free(p) else {
            panic!("free failed");
        };
        assert!(!heap.bitmap().has_sentinels(obj.block, 128));
        heap.release(&obj);
        assert_eq!(heap.malloc(64), Some(p));
    }

    #[test]
    fn memalign_round_trip() {
        let heap = heap();
        let p = heap.memalign(256, 100).unwrap();
        assert_eq!(p % 256, 0);
        assert_eq!(heap.usable_size(p), Some(256 + 100 - (p - heap.resolve_payload(p))));
        assert!(heap.check_heap_overflow().is_empty());
        assert!(matches!(heap.free(p), FreeOutcome::Freed(_)));
        assert!(heap.memalign(24, 8).is_none());
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let heap = heap();
        let p = heap.malloc(32).unwrap();
        write_bytes(p, &[0xFF; 32]);
        let FreeOutcome::Freed(obj) = heap.free(p) else {
            panic!("free failed");
        };
        heap.release(&obj);
        let q = heap.calloc(4, 8).unwrap();
        assert_eq!(q, p);
        let bytes = unsafe { std::slice::from_raw_parts(q as *const u8, 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(heap.calloc(usize::MAX, 2).is_none());
    }

    #[test]
    fn resize_in_place_moves_guards() {
        let heap = heap();
        let p = heap.malloc(20).unwrap();
        assert!(heap.try_resize_in_place(p, 40));
        write_bytes(p, &[1; 40]);
        assert!(heap.check_heap_overflow().is_empty());
        assert!(!heap.try_resize_in_place(p, 4096));
        assert_eq!(heap.usable_size(p), Some(40));
    }

    #[test]
    fn walk_and_find() {
        let heap = heap();
        let a = heap.malloc(10).unwrap();
        let b = heap.malloc(300).unwrap();
        let blocks = heap.walk_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(heap.find_object(b + 150).map(|e| e.payload), Some(b));
        assert_eq!(heap.find_object(a).map(|e| e.size), Some(10));
        assert_eq!(heap.find_object(a - 8), None);
    }
}
