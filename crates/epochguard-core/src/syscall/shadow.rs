//! Byte snapshots of C runtime structures the program holds pointers to.
//!
//! Streams and directory streams are allocated by the C runtime, outside
//! the guarded heap, so a memory rollback does not restore their buffers
//! and positions. The gateway snapshots them at every commit and copies the
//! snapshot back on rollback. This file is the only place that knows their
//! layout: the allocation size and where the descriptor number lives.

#![allow(unsafe_code)]

/// Layout facts about one foreign structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignShadow {
    pub name: &'static str,
    /// Bytes the runtime allocates for one instance.
    pub size: usize,
    /// Offset of the `int` descriptor field.
    pub fd_offset: usize,
}

impl ForeignShadow {
    /// glibc x86_64 `FILE` including its lock and wide-character state.
    pub const STREAM: Self = Self {
        name: "FILE",
        size: 0x238,
        fd_offset: 0x70,
    };

    /// glibc x86_64 `DIR` with its 32 KiB entry buffer.
    pub const DIRECTORY: Self = Self {
        name: "DIR",
        size: 0x8030,
        fd_offset: 0,
    };

    /// Copy the structure at `addr`.
    ///
    /// # Safety
    /// `addr` must point to a live instance of this structure.
    #[must_use]
    pub unsafe fn capture(&self, addr: usize) -> ShadowCopy {
        let mut bytes = vec![0u8; self.size];
        // SAFETY: forwarded from the caller; `bytes` has `size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), self.size) };
        ShadowCopy { addr, bytes }
    }

    /// Descriptor stored in the instance at `addr`.
    ///
    /// # Safety
    /// As for [`capture`](Self::capture).
    #[must_use]
    pub unsafe fn fd(&self, addr: usize) -> i32 {
        // SAFETY: forwarded; the field lies inside the instance.
        unsafe { std::ptr::read_unaligned((addr + self.fd_offset) as *const i32) }
    }

    /// Point the instance at `addr` to another descriptor number.
    ///
    /// # Safety
    /// As for [`capture`](Self::capture), and the instance must be writable.
    pub unsafe fn set_fd(&self, addr: usize, fd: i32) {
        // SAFETY: forwarded; the field lies inside the instance.
        unsafe { std::ptr::write_unaligned((addr + self.fd_offset) as *mut i32, fd) }
    }
}

/// Saved bytes of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowCopy {
    addr: usize,
    bytes: Vec<u8>,
}

impl ShadowCopy {
    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Write the saved bytes back.
    ///
    /// # Safety
    /// The instance must still be allocated.
    pub unsafe fn restore(&self) {
        // SAFETY: forwarded from the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), self.addr as *mut u8, self.bytes.len());
        }
    }
}
