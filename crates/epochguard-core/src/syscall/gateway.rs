use std::ffi::CStr;
use std::sync::Arc;

use epochguard_membrane::{GuardError, GuardMetrics, Result, global_metrics};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::backend::SyscallBackend;
use super::descriptors::{DescriptorTable, FileKind};
use super::records::SyscallRecord;
use super::{Errno, SysResult};
use crate::quiesce::QuiesceHook;
use crate::state::EpochState;
use crate::thread::ThreadRecord;

/// How an intercepted call is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Reads process-local state; re-executing it during replay is harmless.
    Passthrough,
    /// Visible outside the process; the epoch ends before it.
    ForceCommit,
    /// Executed and logged; replay returns the logged outcome.
    RecordReplay,
    /// Logged now, really performed at commit.
    Deferred,
}

/// Classification of the calls the gateway knows by name. Anything else
/// is treated as irrevocable.
#[must_use]
pub fn classify(name: &str) -> CallClass {
    match name {
        "read" | "pread" | "readv" | "lseek" | "fstat" | "stat" | "lstat" | "access"
        | "fread" | "fgets" | "fgetc" | "fseek" | "ftell" | "readdir" | "getcwd" | "getpid"
        | "getuid" | "sysconf" => CallClass::Passthrough,
        "open" | "openat" | "creat" | "fopen" | "opendir" | "dup" | "dup2" | "mmap" | "time"
        | "gettimeofday" | "times" | "clone" => CallClass::RecordReplay,
        "close" | "fclose" | "closedir" | "munmap" => CallClass::Deferred,
        _ => CallClass::ForceCommit,
    }
}

/// Epoch operations the gateway needs from the coordinator.
pub trait EpochControl: QuiesceHook {
    /// Check and commit (or roll back) without starting a new epoch.
    fn end_epoch(&self, me: &ThreadRecord);
    /// Take a new checkpoint.
    fn begin_epoch(&self, me: &ThreadRecord);
    /// Make `[addr, addr + len)` part of the current checkpoint.
    fn commit_output(&self, addr: usize, len: usize);
}

pub struct SyscallGateway {
    backend: Arc<dyn SyscallBackend>,
    state: Arc<EpochState>,
    descriptors: DescriptorTable,
    /// Unmaps performed at the next commit.
    unmaps: Mutex<Vec<(usize, usize)>>,
}

fn divergence(me: &ThreadRecord, detail: String) -> GuardError {
    GuardError::ReplayDivergence {
        thread: me.index(),
        detail,
    }
}

impl SyscallGateway {
    #[must_use]
    pub fn new(backend: Arc<dyn SyscallBackend>, state: Arc<EpochState>) -> Self {
        Self {
            descriptors: DescriptorTable::new(Arc::clone(&backend)),
            backend,
            state,
            unmaps: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &dyn SyscallBackend {
        &*self.backend
    }

    #[must_use]
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    fn replaying(&self) -> bool {
        self.state.is_replaying()
    }

    /// Commit first if `me`'s log cannot take another record. During replay
    /// the same point is where the original epoch ended.
    fn ensure_room(&self, me: &ThreadRecord, ctl: &dyn EpochControl) {
        let full = {
            let log = me.syscalls.lock();
            log.is_full() && (!self.replaying() || log.is_drained())
        };
        if full {
            debug!(thread = me.index(), "syscall log full, committing");
            ctl.end_epoch(me);
            ctl.begin_epoch(me);
        }
    }

    fn record(&self, me: &ThreadRecord, ctl: &dyn EpochControl, rec: SyscallRecord) {
        trace!(thread = me.index(), call = rec.name(), "recorded");
        if let Err(e) = me.syscalls.lock().push(rec) {
            ctl.fatal(e);
        }
    }

    /// Next logged outcome, which must be of the kind `pick` accepts.
    fn replayed<T>(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        call: &'static str,
        pick: impl FnOnce(SyscallRecord) -> Option<T>,
    ) -> T {
        let next = me.syscalls.lock().advance().copied();
        let Some(rec) = next else {
            ctl.fatal(divergence(me, format!("{call}: syscall log exhausted")));
        };
        pick(rec).unwrap_or_else(|| {
            ctl.fatal(divergence(me, format!("{call}: log holds {}", rec.name())))
        })
    }

    fn reinstall(&self, me: &ThreadRecord, ctl: &dyn EpochControl, kind: FileKind) {
        if let Err(e) = self.descriptors.reinstall(kind) {
            ctl.fatal(divergence(me, format!("no sheltered file for {kind:?}: {e}")));
        }
    }

    /// Run an irrevocable call between an epoch end and a new begin.
    pub fn irrevocable<T>(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        call: impl FnOnce(&dyn SyscallBackend) -> T,
    ) -> T {
        GuardMetrics::inc(&global_metrics().forced_commits);
        ctl.end_epoch(me);
        let out = call(&*self.backend);
        ctl.begin_epoch(me);
        out
    }

    // ---- plain descriptors ------------------------------------------------

    pub fn open(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        path: &CStr,
        flags: i32,
        mode: u32,
    ) -> SysResult<i32> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "open", |r| match r {
                SyscallRecord::Open(v) => Some(v),
                _ => None,
            });
            if let Ok(fd) = r {
                self.reinstall(me, ctl, FileKind::Fd(fd));
            }
            return r;
        }
        let r = self.backend.open(path, flags, mode);
        if let Ok(fd) = r {
            self.descriptors.opened(FileKind::Fd(fd), fd);
        }
        self.record(me, ctl, SyscallRecord::Open(r));
        r
    }

    /// Closing 0, 1 or 2 is a no-op.
    pub fn close(&self, me: &ThreadRecord, ctl: &dyn EpochControl, fd: i32) -> SysResult<()> {
        if (0..=2).contains(&fd) {
            return Ok(());
        }
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "close", |r| match r {
                SyscallRecord::Close(v) => Some(v),
                _ => None,
            });
            if r.is_ok() {
                if let Err(e) = self.descriptors.close(FileKind::Fd(fd)) {
                    ctl.fatal(divergence(me, format!("replayed close({fd}) failed: {e}")));
                }
            }
            return r;
        }
        let r = self.descriptors.close(FileKind::Fd(fd));
        self.record(me, ctl, SyscallRecord::Close(r));
        r
    }

    pub fn dup(&self, me: &ThreadRecord, ctl: &dyn EpochControl, fd: i32) -> SysResult<i32> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "dup", |r| match r {
                SyscallRecord::Dup(v) => Some(v),
                _ => None,
            });
            if let Ok(new) = r {
                self.reinstall(me, ctl, FileKind::Fd(new));
            }
            return r;
        }
        let r = self.backend.dup(fd);
        if let Ok(new) = r {
            self.descriptors.opened(FileKind::Fd(new), new);
        }
        self.record(me, ctl, SyscallRecord::Dup(r));
        r
    }

    /// The implicit close of `target` is sheltered like any other close.
    pub fn dup2(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        fd: i32,
        target: i32,
    ) -> SysResult<i32> {
        ctl.safe_point(me);
        if fd == target || (0..=2).contains(&target) {
            return self.irrevocable(me, ctl, |b| b.dup2(fd, target));
        }
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "dup2", |r| match r {
                SyscallRecord::Dup2(v) => Some(v),
                _ => None,
            });
            if let Ok(new) = r {
                match self.descriptors.close(FileKind::Fd(new)) {
                    Ok(()) | Err(Errno::EBADF) => {}
                    Err(e) => ctl.fatal(divergence(
                        me,
                        format!("replayed dup2 could not close {new}: {e}"),
                    )),
                }
                self.reinstall(me, ctl, FileKind::Fd(new));
            }
            return r;
        }
        // Not open is fine: dup2 then just claims the number. Any other
        // failure means the old description could not be sheltered.
        if let Err(e) = self.descriptors.close(FileKind::Fd(target))
            && e != Errno::EBADF
        {
            warn!(fd, target, errno = e.0, "dup2 target not sheltered");
            let r = Err(e);
            self.record(me, ctl, SyscallRecord::Dup2(r));
            return r;
        }
        let r = self.backend.dup2(fd, target);
        if let Ok(new) = r {
            self.descriptors.opened(FileKind::Fd(new), new);
        }
        self.record(me, ctl, SyscallRecord::Dup2(r));
        r
    }

    pub fn read(&self, me: &ThreadRecord, ctl: &dyn EpochControl, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        ctl.safe_point(me);
        self.backend.read(fd, buf)
    }

    pub fn lseek(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        fd: i32,
        offset: i64,
        whence: i32,
    ) -> SysResult<i64> {
        ctl.safe_point(me);
        self.backend.lseek(fd, offset, whence)
    }

    pub fn write(&self, me: &ThreadRecord, ctl: &dyn EpochControl, fd: i32, buf: &[u8]) -> SysResult<usize> {
        self.irrevocable(me, ctl, |b| b.write(fd, buf))
    }

    pub fn unlink(&self, me: &ThreadRecord, ctl: &dyn EpochControl, path: &CStr) -> SysResult<()> {
        self.irrevocable(me, ctl, |b| b.unlink(path))
    }

    // ---- streams ------------------------------------------------------------

    pub fn fopen(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        path: &CStr,
        mode: &CStr,
    ) -> SysResult<usize> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "fopen", |r| match r {
                SyscallRecord::Fopen(v) => Some(v),
                _ => None,
            });
            if let Ok(f) = r {
                self.reinstall(me, ctl, FileKind::Stream(f));
            }
            return r;
        }
        let r = self.backend.fopen(path, mode).and_then(|f| {
            let fd = self.backend.fileno(f)?;
            self.descriptors.opened(FileKind::Stream(f), fd);
            Ok(f)
        });
        self.record(me, ctl, SyscallRecord::Fopen(r));
        r
    }

    /// Streams the gateway did not open are closed irrevocably.
    pub fn fclose(&self, me: &ThreadRecord, ctl: &dyn EpochControl, stream: usize) -> SysResult<()> {
        ctl.safe_point(me);
        let kind = FileKind::Stream(stream);
        if !self.replaying() && self.descriptors.program_fd(kind).is_none() {
            return self.irrevocable(me, ctl, |b| b.fclose(stream));
        }
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "fclose", |r| match r {
                SyscallRecord::Fclose(v) => Some(v),
                _ => None,
            });
            if r.is_ok() {
                if let Err(e) = self.descriptors.close(kind) {
                    ctl.fatal(divergence(me, format!("replayed fclose failed: {e}")));
                }
            }
            return r;
        }
        let r = self.descriptors.close(kind);
        self.record(me, ctl, SyscallRecord::Fclose(r));
        r
    }

    pub fn opendir(&self, me: &ThreadRecord, ctl: &dyn EpochControl, path: &CStr) -> SysResult<usize> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            let r = self.replayed(me, ctl, "opendir", |r| match r {
                SyscallRecord::Opendir(v) => Some(v),
                _ => None,
            });
            if let Ok(d) = r {
                self.reinstall(me, ctl, FileKind::Dir(d));
            }
            return r;
        }
        let r = self.backend.opendir(path).and_then(|d| {
            let fd = self.backend.dirfd(d)?;
            self.descriptors.opened(FileKind::Dir(d), fd);
            Ok(d)
        });
        self.record(me, ctl, SyscallRecord::Opendir(r));
        r
    }

    pub fn closedir(&self, me: &ThreadRecord, ctl: &dyn EpochControl, dir: usize) -> SysResult<()> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        let kind = FileKind::Dir(dir);
        if self.replaying() {
            let r = self.replayed(me, ctl, "closedir", |r| match r {
                SyscallRecord::Closedir(v) => Some(v),
                _ => None,
            });
            if r.is_ok() {
                if let Err(e) = self.descriptors.close(kind) {
                    ctl.fatal(divergence(me, format!("replayed closedir failed: {e}")));
                }
            }
            return r;
        }
        let r = self.descriptors.close(kind);
        self.record(me, ctl, SyscallRecord::Closedir(r));
        r
    }

    // ---- memory -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        addr: usize,
        len: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> SysResult<usize> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            // The first execution's mapping is still in place.
            return self.replayed(me, ctl, "mmap", |r| match r {
                SyscallRecord::Mmap(v) => Some(v),
                _ => None,
            });
        }
        let r = self.backend.mmap(addr, len, prot, flags, fd, offset);
        self.record(me, ctl, SyscallRecord::Mmap(r));
        r
    }

    /// Deferred to the next commit.
    pub fn munmap(&self, me: &ThreadRecord, ctl: &dyn EpochControl, addr: usize, len: usize) -> SysResult<()> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            return self.replayed(me, ctl, "munmap", |r| match r {
                SyscallRecord::Munmap(v) => Some(v),
                _ => None,
            });
        }
        let r = if addr % 4096 != 0 || len == 0 {
            Err(Errno::EINVAL)
        } else {
            self.unmaps.lock().push((addr, len));
            Ok(())
        };
        self.record(me, ctl, SyscallRecord::Munmap(r));
        r
    }

    // ---- clocks ---------------------------------------------------------------

    pub fn time(&self, me: &ThreadRecord, ctl: &dyn EpochControl) -> i64 {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        if self.replaying() {
            return self.replayed(me, ctl, "time", |r| match r {
                SyscallRecord::Time(t) => Some(t),
                _ => None,
            });
        }
        let t = self.backend.time();
        self.record(me, ctl, SyscallRecord::Time(t));
        t
    }

    /// The output buffer is committed so it survives a rollback.
    pub fn gettimeofday(
        &self,
        me: &ThreadRecord,
        ctl: &dyn EpochControl,
        tv: &mut libc::timeval,
    ) -> SysResult<()> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        let r = if self.replaying() {
            self.replayed(me, ctl, "gettimeofday", |r| match r {
                SyscallRecord::GetTimeOfDay(v) => Some(v),
                _ => None,
            })
        } else {
            let r = self.backend.gettimeofday();
            self.record(me, ctl, SyscallRecord::GetTimeOfDay(r));
            r
        };
        let (sec, usec) = r?;
        tv.tv_sec = sec;
        tv.tv_usec = usec;
        ctl.commit_output(
            std::ptr::from_mut(tv) as usize,
            std::mem::size_of::<libc::timeval>(),
        );
        Ok(())
    }

    /// Elapsed clock ticks; `buf` receives the process times.
    pub fn times(&self, me: &ThreadRecord, ctl: &dyn EpochControl, buf: &mut libc::tms) -> SysResult<i64> {
        ctl.safe_point(me);
        self.ensure_room(me, ctl);
        let r = if self.replaying() {
            self.replayed(me, ctl, "times", |r| match r {
                SyscallRecord::Times(v) => Some(v),
                _ => None,
            })
        } else {
            let r = self.backend.times();
            self.record(me, ctl, SyscallRecord::Times(r));
            r
        };
        let (ticks, [utime, stime, cutime, cstime]) = r?;
        buf.tms_utime = utime;
        buf.tms_stime = stime;
        buf.tms_cutime = cutime;
        buf.tms_cstime = cstime;
        ctl.commit_output(std::ptr::from_mut(buf) as usize, std::mem::size_of::<libc::tms>());
        Ok(ticks)
    }

    // ---- threads ----------------------------------------------------------------

    pub fn record_clone(&self, me: &ThreadRecord, ctl: &dyn EpochControl, child: u32) {
        self.ensure_room(me, ctl);
        self.record(me, ctl, SyscallRecord::Clone(child));
    }

    /// Registry index the replayed creation returned the first time.
    pub fn replay_clone(&self, me: &ThreadRecord, ctl: &dyn EpochControl) -> u32 {
        self.replayed(me, ctl, "clone", |r| match r {
            SyscallRecord::Clone(child) => Some(child),
            _ => None,
        })
    }

    // ---- epoch hooks ----------------------------------------------------------

    /// Perform deferred closes and unmaps; refresh positions and shadows.
    pub fn commit(&self) {
        self.descriptors.commit();
        for (addr, len) in self.unmaps.lock().drain(..) {
            if let Err(e) = self.backend.munmap(addr, len) {
                debug!(addr, len, errno = e.0, "deferred munmap failed");
            }
        }
    }

    pub fn prepare_rollback(&self) -> Result<()> {
        self.unmaps.lock().clear();
        self.descriptors.prepare_rollback().map_err(|e| GuardError::Os {
            call: "descriptor rollback",
            source: std::io::Error::from_raw_os_error(e.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        assert_eq!(classify("read"), CallClass::Passthrough);
        assert_eq!(classify("open"), CallClass::RecordReplay);
        assert_eq!(classify("gettimeofday"), CallClass::RecordReplay);
        assert_eq!(classify("close"), CallClass::Deferred);
        assert_eq!(classify("munmap"), CallClass::Deferred);
        assert_eq!(classify("write"), CallClass::ForceCommit);
        assert_eq!(classify("socket"), CallClass::ForceCommit);
        assert_eq!(classify("nanosleep"), CallClass::ForceCommit);
    }
}
