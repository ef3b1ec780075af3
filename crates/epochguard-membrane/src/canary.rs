//! Canary constants and the raw word accessors every scanner shares.
//!
//! A payload whose length is not a word multiple ends inside a word. The
//! unused bytes of that word form a short pad: the first pad byte stores
//! `pad_len - 1` when there are at least two pad bytes, and every other pad
//! byte holds [`SHORT_PAD_BYTE`]. A one-byte pad is just `SHORT_PAD_BYTE`.
//! Writing 1 to 7 bytes past the payload therefore changes at least one
//! pad byte unless the program happens to write the pad pattern itself.

#![allow(unsafe_code)]

pub const WORD_SIZE: usize = 8;
pub const SENTINEL_WORD: u64 = 0xCAFE_BABE_CAFE_BABE;
/// Marks the word just before an over-aligned pointer.
pub const MEMALIGN_SENTINEL_WORD: u64 = 0xDADE_BABE_DADE_BABE;
pub const SHORT_PAD_BYTE: u8 = 0x7E;
/// Full canary words placed after a payload, at most.
pub const MAX_TAIL_GUARD_WORDS: usize = 16;
/// Canary words written into a freed payload, at most.
pub const FREE_OBJECT_CANARY_WORDS: usize = 16;

#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[must_use]
pub const fn is_word_aligned(value: usize) -> bool {
    value & (WORD_SIZE - 1) == 0
}

/// Read one word of process memory.
///
/// # Safety
/// `addr` must be word aligned and readable.
#[must_use]
pub unsafe fn load_word(addr: usize) -> u64 {
    // SAFETY: caller guarantees alignment and readability.
    unsafe { std::ptr::read_volatile(addr as *const u64) }
}

/// Write one word of process memory.
///
/// # Safety
/// `addr` must be word aligned and writable.
pub unsafe fn store_word(addr: usize, value: u64) {
    // SAFETY: caller guarantees alignment and writability.
    unsafe { std::ptr::write_volatile(addr as *mut u64, value) }
}

/// Expected layout of the word that holds the end of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortPad {
    /// Address of the word containing the last payload byte.
    pub word: usize,
    /// Index of the first pad byte inside that word.
    pub first_pad: usize,
    bytes: [u8; WORD_SIZE],
}

impl ShortPad {
    /// Pad for a payload of `size` bytes at `payload`; `None` when the
    /// payload ends on a word boundary.
    #[must_use]
    pub fn for_payload(payload: usize, size: usize) -> Option<Self> {
        let end = payload + size;
        let used = end & (WORD_SIZE - 1);
        if used == 0 {
            return None;
        }
        let pad_len = WORD_SIZE - used;
        let mut bytes = [SHORT_PAD_BYTE; WORD_SIZE];
        if pad_len >= 2 {
            bytes[used] = (pad_len - 1) as u8;
        }
        Some(Self {
            word: align_down(end, WORD_SIZE),
            first_pad: used,
            bytes,
        })
    }

    /// `current` with its pad bytes replaced by the pad pattern.
    #[must_use]
    pub fn apply(&self, current: u64) -> u64 {
        let mut out = current.to_ne_bytes();
        out[self.first_pad..].copy_from_slice(&self.bytes[self.first_pad..]);
        u64::from_ne_bytes(out)
    }

    /// Offset inside the word of the first pad byte that no longer matches.
    #[must_use]
    pub fn first_broken_byte(&self, current: u64) -> Option<usize> {
        let seen = current.to_ne_bytes();
        (self.first_pad..WORD_SIZE).find(|&i| seen[i] != self.bytes[i])
    }

    #[must_use]
    pub fn is_intact(&self, current: u64) -> bool {
        self.first_broken_byte(current).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_payload_has_no_pad() {
        assert!(ShortPad::for_payload(0x1000, 16).is_none());
        assert!(ShortPad::for_payload(0x1000, 0).is_none());
    }

    #[test]
    fn pad_length_prefix() {
        // 3 payload bytes leave 5 pad bytes: [4, 7e, 7e, 7e, 7e].
        let pad = ShortPad::for_payload(0x1000, 3).unwrap();
        assert_eq!(pad.word, 0x1000);
        assert_eq!(pad.first_pad, 3);
        let word = pad.apply(0x0000_0000_00AA_BBCC);
        let bytes = word.to_ne_bytes();
        assert_eq!(&bytes[..3], &0x0000_0000_00AA_BBCCu64.to_ne_bytes()[..3]);
        assert_eq!(bytes[3], 4);
        assert!(bytes[4..].iter().all(|&b| b == SHORT_PAD_BYTE));
        assert!(pad.is_intact(word));
    }

    #[test]
    fn single_pad_byte_is_magic() {
        let pad = ShortPad::for_payload(0x2000, 15).unwrap();
        assert_eq!(pad.word, 0x2008);
        assert_eq!(pad.first_pad, 7);
        let word = pad.apply(0);
        assert_eq!(word.to_ne_bytes()[7], SHORT_PAD_BYTE);
    }

    #[test]
    fn one_byte_overflow_breaks_pad() {
        let pad = ShortPad::for_payload(0x3000, 5).unwrap();
        let intact = pad.apply(0);
        let mut bytes = intact.to_ne_bytes();
        bytes[5] = b'A';
        assert_eq!(pad.first_broken_byte(u64::from_ne_bytes(bytes)), Some(5));
        // Payload bytes are never part of the comparison.
        let mut bytes = intact.to_ne_bytes();
        bytes[0] = 0xFF;
        assert!(pad.is_intact(u64::from_ne_bytes(bytes)));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(17, 8), 24);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_word_aligned(0x1008));
        assert!(!is_word_aligned(0x1009));
    }
}
