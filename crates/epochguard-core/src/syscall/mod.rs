//! The system-call gateway.
//!
//! Every intercepted call falls in one [`CallClass`]. Calls that only read
//! process-local state pass through; calls whose effect escapes the process
//! end the epoch first; calls with a small observable outcome (a descriptor,
//! a pointer, a timestamp) are executed and logged during normal execution
//! and answered from the log during replay.

pub mod backend;
pub mod descriptors;
pub mod gateway;
pub mod records;
pub mod shadow;

pub use backend::{LibcBackend, SyscallBackend};
pub use descriptors::{DescriptorTable, FileKind, SHELTER_BASE};
pub use gateway::{CallClass, EpochControl, SyscallGateway, classify};
pub use records::SyscallRecord;
pub use shadow::ForeignShadow;

/// An `errno` value returned by an intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EBADF: Self = Self(libc::EBADF);
    pub const EINVAL: Self = Self(libc::EINVAL);
    pub const EMFILE: Self = Self(libc::EMFILE);
    pub const ENOENT: Self = Self(libc::ENOENT);

    /// The calling thread's current `errno`.
    #[must_use]
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

pub type SysResult<T> = std::result::Result<T, Errno>;
