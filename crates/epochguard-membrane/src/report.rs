//! Fault reports and the sink that delivers them.
//!
//! A report is one JSON line. The production sink writes it with raw
//! `write(2)` calls (the allocator may be the thing that is broken) and then
//! aborts the process.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};
use crate::tracker::CallSite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Overflow,
    UseAfterFree,
    Leak,
    /// The engine's own bookkeeping is broken.
    Internal,
}

impl FaultKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overflow => "overflow",
            Self::UseAfterFree => "use_after_free",
            Self::Leak => "leak",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub epoch: u64,
    /// True when a replay pinned down the faulting write.
    pub localized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_size: Option<usize>,
    /// Byte offset of `address` from `object_start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trap_ip: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_site: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_site: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_site: Option<Vec<String>>,
    pub message: String,
}

impl FaultReport {
    #[must_use]
    pub fn new(kind: FaultKind, epoch: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            epoch,
            localized: false,
            address: None,
            object_start: None,
            object_size: None,
            offset: None,
            observed: None,
            thread: None,
            trap_ip: None,
            call_site: None,
            alloc_site: None,
            free_site: None,
            message: message.into(),
        }
    }

    /// Report for a broken engine invariant.
    #[must_use]
    pub fn internal(epoch: u64, err: &GuardError) -> Self {
        Self::new(FaultKind::Internal, epoch, err.to_string())
    }

    #[must_use]
    pub fn localized(mut self, localized: bool) -> Self {
        self.localized = localized;
        self
    }

    #[must_use]
    pub fn with_address(mut self, addr: usize) -> Self {
        self.address = Some(addr);
        self.update_offset();
        self
    }

    #[must_use]
    pub fn with_object(mut self, start: usize, size: usize) -> Self {
        self.object_start = Some(start);
        self.object_size = Some(size);
        self.update_offset();
        self
    }

    #[must_use]
    pub fn with_observed(mut self, value: u64) -> Self {
        self.observed = Some(value);
        self
    }

    #[must_use]
    pub fn with_thread(mut self, thread: u32) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn with_trap_ip(mut self, ip: usize) -> Self {
        self.trap_ip = Some(ip);
        self
    }

    #[must_use]
    pub fn with_call_site(mut self, site: &CallSite) -> Self {
        self.call_site = (!site.is_empty()).then(|| site.frames().to_vec());
        self
    }

    #[must_use]
    pub fn with_alloc_site(mut self, site: Option<&CallSite>) -> Self {
        self.alloc_site = site.map(|s| s.frames().to_vec());
        self
    }

    #[must_use]
    pub fn with_free_site(mut self, site: Option<&CallSite>) -> Self {
        self.free_site = site.map(|s| s.frames().to_vec());
        self
    }

    fn update_offset(&mut self) {
        if let (Some(addr), Some(start)) = (self.address, self.object_start) {
            self.offset = Some(addr as i64 - start as i64);
        }
    }

    /// One JSON line, newline included.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"kind\":\"{}\",\"epoch\":{},\"localized\":false,\"message\":\"unserializable report\"}}",
                self.kind.as_str(),
                self.epoch
            )
        });
        line.push('\n');
        line
    }
}

/// Where fault reports go.
pub trait FaultSink: Send + Sync {
    /// Record a report and keep running.
    fn report(&self, report: &FaultReport);
    /// Record a report and end the process.
    fn terminate(&self, report: &FaultReport) -> !;
}

/// Writes JSONL to a descriptor and aborts on terminate.
pub struct AbortingSink {
    fd: libc::c_int,
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice; a bad fd only yields an error.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

impl AbortingSink {
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            fd: libc::STDERR_FILENO,
        }
    }

    /// Append reports to `path`.
    pub fn to_file(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| GuardError::Os {
            call: "open",
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        // SAFETY: `c_path` is NUL-terminated and outlives the call.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(GuardError::last_os("open"));
        }
        Ok(Self { fd })
    }

    /// Sink for an optional path, falling back to stderr.
    #[must_use]
    pub fn for_path(path: Option<&Path>) -> Self {
        path.and_then(|p| Self::to_file(p).ok())
            .unwrap_or_else(Self::stderr)
    }
}

impl Drop for AbortingSink {
    fn drop(&mut self) {
        if self.fd > libc::STDERR_FILENO {
            // SAFETY: the descriptor was opened by `to_file`.
            unsafe { libc::close(self.fd) };
        }
    }
}

impl FaultSink for AbortingSink {
    fn report(&self, report: &FaultReport) {
        write_all(self.fd, report.to_json_line().as_bytes());
    }

    fn terminate(&self, report: &FaultReport) -> ! {
        self.report(report);
        // SAFETY: abort never returns.
        unsafe { libc::abort() }
    }
}

/// Last resort for violations found before any sink exists.
pub fn abort_with_message(msg: &str) -> ! {
    write_all(libc::STDERR_FILENO, b"epochguard: ");
    write_all(libc::STDERR_FILENO, msg.as_bytes());
    write_all(libc::STDERR_FILENO, b"\n");
    // SAFETY: abort never returns.
    unsafe { libc::abort() }
}
