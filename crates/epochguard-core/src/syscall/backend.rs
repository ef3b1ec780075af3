//! The kernel and C runtime behind the gateway.
//!
//! [`LibcBackend`] issues the real calls. Tests substitute
//! [`crate::sim::FakeKernel`], which hands out descriptor numbers the way
//! the kernel does.

#![allow(unsafe_code)]

use std::ffi::CStr;

use super::{Errno, SysResult};

pub trait SyscallBackend: Send + Sync {
    fn open(&self, path: &CStr, flags: i32, mode: u32) -> SysResult<i32>;
    fn close(&self, fd: i32) -> SysResult<()>;
    fn dup(&self, fd: i32) -> SysResult<i32>;
    /// Lowest free descriptor at or above `min` referring to `fd`.
    fn dup_at_least(&self, fd: i32, min: i32) -> SysResult<i32>;
    fn dup2(&self, fd: i32, target: i32) -> SysResult<i32>;
    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> SysResult<i64>;
    fn read(&self, fd: i32, buf: &mut [u8]) -> SysResult<usize>;
    fn write(&self, fd: i32, buf: &[u8]) -> SysResult<usize>;
    fn unlink(&self, path: &CStr) -> SysResult<()>;

    fn fopen(&self, path: &CStr, mode: &CStr) -> SysResult<usize>;
    fn fclose(&self, stream: usize) -> SysResult<()>;
    fn fflush(&self, stream: usize) -> SysResult<()>;
    fn fileno(&self, stream: usize) -> SysResult<i32>;

    fn opendir(&self, path: &CStr) -> SysResult<usize>;
    fn closedir(&self, dir: usize) -> SysResult<()>;
    fn dirfd(&self, dir: usize) -> SysResult<i32>;
    fn telldir(&self, dir: usize) -> i64;
    fn seekdir(&self, dir: usize, pos: i64);

    fn mmap(&self, addr: usize, len: usize, prot: i32, flags: i32, fd: i32, offset: i64)
    -> SysResult<usize>;
    fn munmap(&self, addr: usize, len: usize) -> SysResult<()>;

    fn time(&self) -> i64;
    /// `(seconds, microseconds)`.
    fn gettimeofday(&self) -> SysResult<(i64, i64)>;
    /// Elapsed ticks and `(utime, stime, cutime, cstime)`.
    fn times(&self) -> SysResult<(i64, [i64; 4])>;
}

fn check(rc: libc::c_int) -> SysResult<i32> {
    if rc < 0 { Err(Errno::last()) } else { Ok(rc) }
}

/// Real calls through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcBackend;

impl SyscallBackend for LibcBackend {
    fn open(&self, path: &CStr, flags: i32, mode: u32) -> SysResult<i32> {
        // SAFETY: `path` is NUL-terminated.
        check(unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })
    }

    fn close(&self, fd: i32) -> SysResult<()> {
        // SAFETY: closing an integer descriptor has no memory effects.
        check(unsafe { libc::close(fd) }).map(drop)
    }

    fn dup(&self, fd: i32) -> SysResult<i32> {
        // SAFETY: plain descriptor call.
        check(unsafe { libc::dup(fd) })
    }

    fn dup_at_least(&self, fd: i32, min: i32) -> SysResult<i32> {
        // SAFETY: plain descriptor call.
        check(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) })
    }

    fn dup2(&self, fd: i32, target: i32) -> SysResult<i32> {
        // SAFETY: plain descriptor call.
        check(unsafe { libc::dup2(fd, target) })
    }

    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> SysResult<i64> {
        // SAFETY: plain descriptor call.
        let pos = unsafe { libc::lseek(fd, offset, whence) };
        if pos < 0 { Err(Errno::last()) } else { Ok(pos) }
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        // SAFETY: `buf` is writable for its length.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 { Err(Errno::last()) } else { Ok(n as usize) }
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SysResult<usize> {
        // SAFETY: `buf` is readable for its length.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 { Err(Errno::last()) } else { Ok(n as usize) }
    }

    fn unlink(&self, path: &CStr) -> SysResult<()> {
        // SAFETY: `path` is NUL-terminated.
        check(unsafe { libc::unlink(path.as_ptr()) }).map(drop)
    }

    fn fopen(&self, path: &CStr, mode: &CStr) -> SysResult<usize> {
        // SAFETY: both strings are NUL-terminated.
        let f = unsafe { libc::fopen(path.as_ptr(), mode.as_ptr()) };
        if f.is_null() { Err(Errno::last()) } else { Ok(f as usize) }
    }

    fn fclose(&self, stream: usize) -> SysResult<()> {
        // SAFETY: `stream` came from `fopen` and is closed once.
        check(unsafe { libc::fclose(stream as *mut libc::FILE) }).map(drop)
    }

    fn fflush(&self, stream: usize) -> SysResult<()> {
        // SAFETY: `stream` is an open FILE.
        check(unsafe { libc::fflush(stream as *mut libc::FILE) }).map(drop)
    }

    fn fileno(&self, stream: usize) -> SysResult<i32> {
        // SAFETY: `stream` is an open FILE.
        check(unsafe { libc::fileno(stream as *mut libc::FILE) })
    }

    fn opendir(&self, path: &CStr) -> SysResult<usize> {
        // SAFETY: `path` is NUL-terminated.
        let d = unsafe { libc::opendir(path.as_ptr()) };
        if d.is_null() { Err(Errno::last()) } else { Ok(d as usize) }
    }

    fn closedir(&self, dir: usize) -> SysResult<()> {
        // SAFETY: `dir` came from `opendir` and is closed once.
        check(unsafe { libc::closedir(dir as *mut libc::DIR) }).map(drop)
    }

    fn dirfd(&self, dir: usize) -> SysResult<i32> {
        // SAFETY: `dir` is an open directory stream.
        check(unsafe { libc::dirfd(dir as *mut libc::DIR) })
    }

    fn telldir(&self, dir: usize) -> i64 {
        // SAFETY: `dir` is an open directory stream.
        unsafe { libc::telldir(dir as *mut libc::DIR) }
    }

    fn seekdir(&self, dir: usize, pos: i64) {
        // SAFETY: `dir` is open and `pos` came from `telldir` on it.
        unsafe { libc::seekdir(dir as *mut libc::DIR, pos) }
    }

    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> SysResult<usize> {
        // SAFETY: the kernel validates every argument; no existing Rust
        // object is affected unless MAP_FIXED is requested by the caller.
        let p = unsafe { libc::mmap(addr as *mut libc::c_void, len, prot, flags, fd, offset) };
        if p == libc::MAP_FAILED { Err(Errno::last()) } else { Ok(p as usize) }
    }

    fn munmap(&self, addr: usize, len: usize) -> SysResult<()> {
        // SAFETY: the caller owns the mapping.
        check(unsafe { libc::munmap(addr as *mut libc::c_void, len) }).map(drop)
    }

    fn time(&self) -> i64 {
        // SAFETY: a null argument is allowed.
        unsafe { libc::time(std::ptr::null_mut()) }
    }

    fn gettimeofday(&self) -> SysResult<(i64, i64)> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        // SAFETY: `tv` is a valid out-parameter; the timezone is unused.
        check(unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) })?;
        Ok((tv.tv_sec, tv.tv_usec))
    }

    fn times(&self) -> SysResult<(i64, [i64; 4])> {
        let mut t = libc::tms {
            tms_utime: 0,
            tms_stime: 0,
            tms_cutime: 0,
            tms_cstime: 0,
        };
        // SAFETY: `t` is a valid out-parameter.
        let ticks = unsafe { libc::times(&mut t) };
        if ticks == (-1i64) as libc::clock_t {
            return Err(Errno::last());
        }
        Ok((ticks, [t.tms_utime, t.tms_stime, t.tms_cutime, t.tms_cstime]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_at_least_lands_above_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("f").to_str().unwrap()).unwrap();
        let b = LibcBackend;
        let fd = b.open(&path, libc::O_CREAT | libc::O_RDWR, 0o600).unwrap();
        let high = b.dup_at_least(fd, 1000).unwrap();
        assert!(high >= 1000);
        assert_eq!(b.write(high, b"abc").unwrap(), 3);
        // Both numbers share one file position.
        assert_eq!(b.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 3);
        b.close(high).unwrap();
        b.close(fd).unwrap();
        assert_eq!(b.close(fd), Err(Errno::EBADF));
    }

    #[test]
    fn clocks_answer() {
        let b = LibcBackend;
        assert!(b.time() > 0);
        let (sec, usec) = b.gettimeofday().unwrap();
        assert!(sec > 0 && (0..1_000_000).contains(&usec));
        assert!(b.times().is_ok());
    }
}
