//! Per-allocation header placed immediately before each payload.
//!
//! Layout (16 bytes): block size (u32, low bit = leak-scan "checked" flag),
//! logical size (u32, zero once freed), front canary (u64).

#![allow(unsafe_code)]

use crate::canary::SENTINEL_WORD;

pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// Largest block the header can describe.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

const CHECKED_BIT: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    block_size: u32,
    object_size: u32,
    sentinel: u64,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == 16);

impl ObjectHeader {
    #[must_use]
    pub const fn new(block_size: usize, object_size: usize) -> Self {
        Self {
            block_size: block_size as u32,
            object_size: object_size as u32,
            sentinel: SENTINEL_WORD,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        (self.block_size & !CHECKED_BIT) as usize
    }

    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size as usize
    }

    #[must_use]
    pub const fn sentinel(&self) -> u64 {
        self.sentinel
    }

    /// Freed objects keep their header with a zero logical size.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.object_size == 0
    }

    #[must_use]
    pub const fn is_checked(&self) -> bool {
        self.block_size & CHECKED_BIT != 0
    }

    /// Fields are self-consistent. The front canary is not part of this check.
    #[must_use]
    pub const fn is_plausible(&self) -> bool {
        let block = self.block_size();
        block.is_power_of_two()
            && block >= 2 * HEADER_SIZE
            && block <= MAX_BLOCK_SIZE
            && self.object_size() + HEADER_SIZE <= block
    }

    #[must_use]
    pub const fn has_front_canary(&self) -> bool {
        self.sentinel == SENTINEL_WORD
    }

    /// Address of the payload for a header at `header`.
    #[must_use]
    pub const fn payload_of(header: usize) -> usize {
        header + HEADER_SIZE
    }

    /// Address of the header for a payload at `payload`.
    #[must_use]
    pub const fn header_of(payload: usize) -> usize {
        payload - HEADER_SIZE
    }

    /// Address of the front canary word for a header at `header`.
    #[must_use]
    pub const fn canary_of(header: usize) -> usize {
        header + HEADER_SIZE - std::mem::size_of::<u64>()
    }

    /// Read the header stored at `header`.
    ///
    /// # Safety
    /// `header` must point to 16 readable, 8-byte aligned bytes.
    #[must_use]
    pub unsafe fn read(header: usize) -> Self {
        // SAFETY: caller guarantees the location is readable.
        unsafe { std::ptr::read_volatile(header as *const Self) }
    }

    /// Store `self` at `header`.
    ///
    /// # Safety
    /// `header` must point to 16 writable, 8-byte aligned bytes owned by the heap.
    pub unsafe fn write(self, header: usize) {
        // SAFETY: caller guarantees the location is writable.
        unsafe { std::ptr::write_volatile(header as *mut Self, self) }
    }

    /// Update only the logical size of the header at `header`.
    ///
    /// # Safety
    /// Same as [`ObjectHeader::write`].
    pub unsafe fn set_object_size(header: usize, size: usize) {
        // SAFETY: forwarded to the caller.
        unsafe {
            let mut h = Self::read(header);
            h.object_size = size as u32;
            h.write(header);
        }
    }

    /// Set or clear the leak-scan flag of the header at `header`.
    ///
    /// # Safety
    /// Same as [`ObjectHeader::write`].
    pub unsafe fn set_checked(header: usize, checked: bool) {
        // SAFETY: forwarded to the caller.
        unsafe {
            let mut h = Self::read(header);
            if checked {
                h.block_size |= CHECKED_BIT;
            } else {
                h.block_size &= !CHECKED_BIT;
            }
            h.write(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(ObjectHeader::payload_of(0x1000), 0x1010);
        assert_eq!(ObjectHeader::header_of(0x1010), 0x1000);
        assert_eq!(ObjectHeader::canary_of(0x1000), 0x1008);
    }

    #[test]
    fn plausibility() {
        assert!(ObjectHeader::new(64, 16).is_plausible());
        assert!(ObjectHeader::new(64, 48).is_plausible());
        assert!(!ObjectHeader::new(64, 49).is_plausible());
        assert!(!ObjectHeader::new(48, 16).is_plausible());
        assert!(!ObjectHeader::new(16, 0).is_plausible());
    }

    #[test]
    fn checked_flag_does_not_disturb_block_size() {
        let mut slot = [0u64; 2];
        let addr = slot.as_mut_ptr() as usize;
        unsafe {
            ObjectHeader::new(128, 40).write(addr);
            ObjectHeader::set_checked(addr, true);
            let h = ObjectHeader::read(addr);
            assert!(h.is_checked());
            assert_eq!(h.block_size(), 128);
            ObjectHeader::set_checked(addr, false);
            assert!(!ObjectHeader::read(addr).is_checked());
            ObjectHeader::set_object_size(addr, 0);
            assert!(ObjectHeader::read(addr).is_free());
            assert!(ObjectHeader::read(addr).has_front_canary());
        }
    }
}
