//! Outcomes of record-and-replay calls, one per call in the thread's log.

use super::SysResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallRecord {
    Open(SysResult<i32>),
    Close(SysResult<()>),
    Dup(SysResult<i32>),
    Dup2(SysResult<i32>),
    /// Stream pointer.
    Fopen(SysResult<usize>),
    Fclose(SysResult<()>),
    /// Directory stream pointer.
    Opendir(SysResult<usize>),
    Closedir(SysResult<()>),
    Mmap(SysResult<usize>),
    Munmap(SysResult<()>),
    Time(i64),
    /// `(seconds, microseconds)`.
    GetTimeOfDay(SysResult<(i64, i64)>),
    /// Elapsed clock ticks and `(utime, stime, cutime, cstime)`.
    Times(SysResult<(i64, [i64; 4])>),
    /// Registry index of the created thread.
    Clone(u32),
}

impl SyscallRecord {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Close(_) => "close",
            Self::Dup(_) => "dup",
            Self::Dup2(_) => "dup2",
            Self::Fopen(_) => "fopen",
            Self::Fclose(_) => "fclose",
            Self::Opendir(_) => "opendir",
            Self::Closedir(_) => "closedir",
            Self::Mmap(_) => "mmap",
            Self::Munmap(_) => "munmap",
            Self::Time(_) => "time",
            Self::GetTimeOfDay(_) => "gettimeofday",
            Self::Times(_) => "times",
            Self::Clone(_) => "clone",
        }
    }
}
