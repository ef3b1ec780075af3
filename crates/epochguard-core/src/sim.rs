//! In-process stand-ins for the machine-level collaborators.
//!
//! A real deployment resumes a checkpoint by rewriting the stack and
//! jumping, arms debug registers through the kernel, and issues real
//! system calls. The simulation replaces each with something a test can
//! drive from ordinary Rust:
//!
//! - [`SimTrampoline`] unwinds to [`run_scenario`], which runs the workload
//!   again from the top. A workload is therefore one epoch long: it starts
//!   right after a checkpoint and ends in [`EpochCoordinator::teardown`].
//! - [`SoftWatchUnit`] compares watched words at every heap call.
//! - [`FakeKernel`] hands out descriptor numbers like the kernel does and
//!   counts the calls that reached it.
//! - [`CollectingSink`] keeps reports and unwinds on terminate.

#![allow(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use epochguard_membrane::canary::{SENTINEL_WORD, load_word};
use epochguard_membrane::{
    CallSite, EngineConfig, FaultReport, FaultSink, GuardMetrics, RegisterImage, Result,
    StackBounds, StackTrampoline, WatchHardware, WatchTrap, global_metrics,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::epoch::{EngineDeps, EngineOptions, EpochCoordinator};
use crate::quiesce::CooperativeTransport;
use crate::syscall::shadow::ForeignShadow;
use crate::syscall::{Errno, SysResult, SyscallBackend};
use crate::thread::{self, ThreadRecord};

/// Workload passes before [`run_scenario`] gives up.
pub const MAX_RUNS: u32 = 8;

/// Unwind payload: the thread resumes at its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeAtCheckpoint {
    pub thread: u32,
}

/// Unwind payload: the engine terminated the process.
#[derive(Debug, Clone)]
pub struct Terminated(pub FaultReport);

/// Resumes a checkpoint by unwinding to the scenario loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimTrampoline;

impl StackTrampoline for SimTrampoline {
    fn capture(&self) -> RegisterImage {
        let here = 0u8;
        RegisterImage::synthetic(std::ptr::addr_of!(here) as usize, 0)
    }

    unsafe fn resume(&self, _dest: usize, _image: &[u8], _regs: &RegisterImage) -> ! {
        let thread = thread::current().map_or(u32::MAX, |t| t.index());
        panic::resume_unwind(Box::new(ResumeAtCheckpoint { thread }))
    }
}

/// Software watchpoints: every poll compares the watched words with the
/// last value seen. Changes back to a canary are the heap re-guarding the
/// word and do not trap.
#[derive(Default)]
pub struct SoftWatchUnit {
    watched: Mutex<Vec<(usize, u64)>>,
    trap: Mutex<Option<WatchTrap>>,
}

impl SoftWatchUnit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn watched(&self) -> Vec<usize> {
        self.watched.lock().iter().map(|&(addr, _)| addr).collect()
    }
}

impl WatchHardware for SoftWatchUnit {
    fn arm(&self, addrs: &[usize], _threads: &[libc::pid_t]) -> Result<()> {
        let mut watched = self.watched.lock();
        watched.clear();
        // SAFETY: the coordinator only watches words of mapped heap blocks.
        watched.extend(addrs.iter().map(|&a| (a, unsafe { load_word(a) })));
        *self.trap.lock() = None;
        Ok(())
    }

    fn disarm(&self) {
        self.watched.lock().clear();
    }

    fn poll(&self) {
        let mut watched = self.watched.lock();
        for (addr, last) in watched.iter_mut() {
            // SAFETY: as in `arm`.
            let live = unsafe { load_word(*addr) };
            if live == *last {
                continue;
            }
            *last = live;
            if live == SENTINEL_WORD {
                continue;
            }
            let mut trap = self.trap.lock();
            if trap.is_none() {
                GuardMetrics::inc(&global_metrics().watch_traps);
                *trap = Some(WatchTrap {
                    addr: *addr,
                    ip: 0,
                    site: Some(CallSite::capture()),
                });
            }
        }
    }

    fn take_trap(&self) -> Option<WatchTrap> {
        self.trap.lock().take()
    }
}

/// Keeps every report; terminate unwinds with [`Terminated`].
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<FaultReport>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<FaultReport> {
        self.reports.lock().clone()
    }
}

impl FaultSink for CollectingSink {
    fn report(&self, report: &FaultReport) {
        self.reports.lock().push(report.clone());
    }

    fn terminate(&self, report: &FaultReport) -> ! {
        self.report(report);
        panic::resume_unwind(Box::new(Terminated(report.clone())))
    }
}

struct FakeFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: Mutex<i64>,
}

#[derive(Default)]
struct KernelState {
    fds: BTreeMap<i32, Arc<FakeFile>>,
    paths: HashMap<String, Arc<Mutex<Vec<u8>>>>,
    streams: HashMap<usize, Box<[u8]>>,
    /// Directory stream buffer and read position.
    dirs: HashMap<usize, (Box<[u8]>, i64)>,
}

impl KernelState {
    fn lowest_free(&self, min: i32) -> i32 {
        let mut fd = min;
        while self.fds.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    fn file(&self, fd: i32) -> SysResult<Arc<FakeFile>> {
        self.fds.get(&fd).cloned().ok_or(Errno::EBADF)
    }
}

fn fd_field(buf: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_ne_bytes(raw)
}

/// Descriptors, files and C streams kept in memory.
///
/// Numbers 0 to 3 start out taken, so the first open returns 4.
pub struct FakeKernel {
    state: Mutex<KernelState>,
    opens: AtomicUsize,
    calls: AtomicUsize,
    unmaps: AtomicUsize,
    clock: AtomicI64,
    next_map: AtomicUsize,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    pub const RESERVED_FDS: i32 = 4;
    const MAX_FDS: i32 = 4096;

    #[must_use]
    pub fn new() -> Self {
        let mut state = KernelState::default();
        for fd in 0..Self::RESERVED_FDS {
            state.fds.insert(
                fd,
                Arc::new(FakeFile {
                    data: Arc::default(),
                    pos: Mutex::new(0),
                }),
            );
        }
        Self {
            state: Mutex::new(state),
            opens: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            clock: AtomicI64::new(1_700_000_000),
            next_map: AtomicUsize::new(0x7100_0000_0000),
        }
    }

    /// Opens (of files, streams and directories) that reached the kernel.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unmaps(&self) -> usize {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Every call that reached the kernel.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_open(&self, fd: i32) -> bool {
        self.state.lock().fds.contains_key(&fd)
    }

    #[must_use]
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().paths.get(path).map(|d| d.lock().clone())
    }

    fn called(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    fn install(state: &mut KernelState, file: Arc<FakeFile>, min: i32) -> SysResult<i32> {
        let fd = state.lowest_free(min);
        if fd >= Self::MAX_FDS {
            return Err(Errno::EMFILE);
        }
        state.fds.insert(fd, file);
        Ok(fd)
    }
}

impl SyscallBackend for FakeKernel {
    fn open(&self, path: &CStr, flags: i32, _mode: u32) -> SysResult<i32> {
        self.called();
        self.opens.fetch_add(1, Ordering::Relaxed);
        let path = path.to_string_lossy().into_owned();
        let mut state = self.state.lock();
        let data = match state.paths.get(&path) {
            Some(data) => Arc::clone(data),
            None if flags & libc::O_CREAT != 0 => {
                let data = Arc::new(Mutex::new(Vec::new()));
                state.paths.insert(path, Arc::clone(&data));
                data
            }
            None => return Err(Errno::ENOENT),
        };
        if flags & libc::O_TRUNC != 0 {
            data.lock().clear();
        }
        let file = Arc::new(FakeFile {
            data,
            pos: Mutex::new(0),
        });
        Self::install(&mut state, file, 0)
    }

    fn close(&self, fd: i32) -> SysResult<()> {
        self.called();
        self.state.lock().fds.remove(&fd).map(drop).ok_or(Errno::EBADF)
    }

    fn dup(&self, fd: i32) -> SysResult<i32> {
        self.dup_at_least(fd, 0)
    }

    fn dup_at_least(&self, fd: i32, min: i32) -> SysResult<i32> {
        self.called();
        let mut state = self.state.lock();
        let file = state.file(fd)?;
        Self::install(&mut state, file, min)
    }

    fn dup2(&self, fd: i32, target: i32) -> SysResult<i32> {
        self.called();
        let mut state = self.state.lock();
        let file = state.file(fd)?;
        state.fds.insert(target, file);
        Ok(target)
    }

    fn lseek(&self, fd: i32, offset: i64, whence: i32) -> SysResult<i64> {
        self.called();
        let file = self.state.lock().file(fd)?;
        let len = file.data.lock().len() as i64;
        let mut pos = file.pos.lock();
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => *pos,
            libc::SEEK_END => len,
            _ => return Err(Errno::EINVAL),
        };
        let next = base.checked_add(offset).filter(|&p| p >= 0).ok_or(Errno::EINVAL)?;
        *pos = next;
        Ok(next)
    }

    fn read(&self, fd: i32, buf: &mut [u8]) -> SysResult<usize> {
        self.called();
        let file = self.state.lock().file(fd)?;
        let data = file.data.lock();
        let mut pos = file.pos.lock();
        let start = (*pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as i64;
        Ok(n)
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SysResult<usize> {
        self.called();
        let file = self.state.lock().file(fd)?;
        let mut data = file.data.lock();
        let mut pos = file.pos.lock();
        let start = *pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        *pos += buf.len() as i64;
        Ok(buf.len())
    }

    fn unlink(&self, path: &CStr) -> SysResult<()> {
        self.called();
        let path = path.to_string_lossy();
        self.state.lock().paths.remove(path.as_ref()).map(drop).ok_or(Errno::ENOENT)
    }

    fn fopen(&self, path: &CStr, mode: &CStr) -> SysResult<usize> {
        let flags = match mode.to_bytes().first() {
            Some(b'w') => libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR,
            Some(b'a') => libc::O_CREAT | libc::O_RDWR,
            _ => libc::O_RDONLY,
        };
        let fd = self.open(path, flags, 0o644)?;
        let layout = ForeignShadow::STREAM;
        let mut buf = vec![0u8; layout.size].into_boxed_slice();
        buf[layout.fd_offset..layout.fd_offset + 4].copy_from_slice(&fd.to_ne_bytes());
        let addr = buf.as_mut_ptr() as usize;
        self.state.lock().streams.insert(addr, buf);
        Ok(addr)
    }

    fn fclose(&self, stream: usize) -> SysResult<()> {
        let buf = self.state.lock().streams.remove(&stream).ok_or(Errno::EBADF)?;
        self.close(fd_field(&buf, ForeignShadow::STREAM.fd_offset))
    }

    fn fflush(&self, stream: usize) -> SysResult<()> {
        self.called();
        if self.state.lock().streams.contains_key(&stream) {
            Ok(())
        } else {
            Err(Errno::EBADF)
        }
    }

    fn fileno(&self, stream: usize) -> SysResult<i32> {
        let state = self.state.lock();
        let buf = state.streams.get(&stream).ok_or(Errno::EBADF)?;
        Ok(fd_field(buf, ForeignShadow::STREAM.fd_offset))
    }

    fn opendir(&self, path: &CStr) -> SysResult<usize> {
        self.called();
        self.opens.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.to_string_lossy(), "fake opendir");
        let mut state = self.state.lock();
        let file = Arc::new(FakeFile {
            data: Arc::default(),
            pos: Mutex::new(0),
        });
        let fd = Self::install(&mut state, file, 0)?;
        let layout = ForeignShadow::DIRECTORY;
        let mut buf = vec![0u8; layout.size].into_boxed_slice();
        buf[layout.fd_offset..layout.fd_offset + 4].copy_from_slice(&fd.to_ne_bytes());
        let addr = buf.as_mut_ptr() as usize;
        state.dirs.insert(addr, (buf, 0));
        Ok(addr)
    }

    fn closedir(&self, dir: usize) -> SysResult<()> {
        let (buf, _) = self.state.lock().dirs.remove(&dir).ok_or(Errno::EBADF)?;
        self.close(fd_field(&buf, ForeignShadow::DIRECTORY.fd_offset))
    }

    fn dirfd(&self, dir: usize) -> SysResult<i32> {
        let state = self.state.lock();
        let (buf, _) = state.dirs.get(&dir).ok_or(Errno::EBADF)?;
        Ok(fd_field(buf, ForeignShadow::DIRECTORY.fd_offset))
    }

    fn telldir(&self, dir: usize) -> i64 {
        self.state.lock().dirs.get(&dir).map_or(-1, |&(_, pos)| pos)
    }

    fn seekdir(&self, dir: usize, pos: i64) {
        if let Some(entry) = self.state.lock().dirs.get_mut(&dir) {
            entry.1 = pos;
        }
    }

    fn mmap(
        &self,
        _addr: usize,
        len: usize,
        _prot: i32,
        _flags: i32,
        _fd: i32,
        _offset: i64,
    ) -> SysResult<usize> {
        self.called();
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let pages = len.div_ceil(4096) * 4096;
        Ok(self.next_map.fetch_add(pages, Ordering::Relaxed))
    }

    fn munmap(&self, _addr: usize, _len: usize) -> SysResult<()> {
        self.called();
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn time(&self) -> i64 {
        self.called();
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn gettimeofday(&self) -> SysResult<(i64, i64)> {
        Ok((self.time(), 250_000))
    }

    fn times(&self) -> SysResult<(i64, [i64; 4])> {
        Ok((self.time(), [1, 2, 0, 0]))
    }
}

/// An engine wired to the simulated collaborators.
pub struct SimEngine {
    pub engine: Arc<EpochCoordinator>,
    pub kernel: Arc<FakeKernel>,
    pub sink: Arc<CollectingSink>,
    pub watch: Arc<SoftWatchUnit>,
}

impl SimEngine {
    /// 64 MiB heap, no global segments, no stack roots.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_options(
            config,
            EngineOptions {
                heap_capacity: 64 * 1024 * 1024,
                scan_stacks: false,
                ..EngineOptions::default()
            },
        )
    }

    pub fn with_options(config: EngineConfig, options: EngineOptions) -> Result<Self> {
        let kernel = Arc::new(FakeKernel::new());
        let sink = Arc::new(CollectingSink::new());
        let watch = Arc::new(SoftWatchUnit::new());
        let deps = EngineDeps {
            trampoline: Arc::new(SimTrampoline),
            watch: Arc::clone(&watch) as Arc<dyn WatchHardware>,
            sink: Arc::clone(&sink) as Arc<dyn FaultSink>,
            backend: Arc::clone(&kernel) as Arc<dyn SyscallBackend>,
            transport: Arc::new(CooperativeTransport),
        };
        let engine = EpochCoordinator::new(config, deps, options)?;
        Ok(Self {
            engine,
            kernel,
            sink,
            watch,
        })
    }

    /// Register the calling thread and begin the first epoch.
    pub fn init(&self) -> Result<Arc<ThreadRecord>> {
        self.engine.init(StackBounds::current()?)
    }
}

/// How a scenario ended.
#[derive(Debug, Clone)]
pub enum ScenarioOutcome {
    Completed { runs: u32 },
    Terminated { report: FaultReport, runs: u32 },
}

impl ScenarioOutcome {
    #[must_use]
    pub fn runs(&self) -> u32 {
        match self {
            Self::Completed { runs } | Self::Terminated { runs, .. } => *runs,
        }
    }

    #[must_use]
    pub fn report(&self) -> Option<&FaultReport> {
        match self {
            Self::Completed { .. } => None,
            Self::Terminated { report, .. } => Some(report),
        }
    }
}

/// Run `workload` on the calling thread, starting it over each time the
/// engine resumes the checkpoint. Other panics propagate.
pub fn run_scenario(
    engine: &EpochCoordinator,
    me: &ThreadRecord,
    mut workload: impl FnMut(&EpochCoordinator, &ThreadRecord),
) -> ScenarioOutcome {
    let mut runs = 0;
    loop {
        runs += 1;
        let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| workload(engine, me))) else {
            return ScenarioOutcome::Completed { runs };
        };
        let payload = match payload.downcast::<Terminated>() {
            Ok(t) => {
                return ScenarioOutcome::Terminated {
                    report: t.0,
                    runs,
                };
            }
            Err(other) => other,
        };
        if !payload.is::<ResumeAtCheckpoint>() || runs >= MAX_RUNS {
            panic::resume_unwind(payload);
        }
        debug!(runs, epoch = engine.state().epoch(), "resuming at checkpoint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_reuses_the_lowest_number() {
        let k = FakeKernel::new();
        let a = k.open(c"/a", libc::O_CREAT | libc::O_RDWR, 0).unwrap();
        let b = k.open(c"/b", libc::O_CREAT | libc::O_RDWR, 0).unwrap();
        assert_eq!((a, b), (4, 5));
        k.close(a).unwrap();
        assert_eq!(k.open(c"/c", libc::O_CREAT, 0).unwrap(), 4);
        assert_eq!(k.dup_at_least(b, 1000).unwrap(), 1000);
        assert_eq!(k.open(c"/missing", 0, 0), Err(Errno::ENOENT));
        assert_eq!(k.opens(), 4);
    }

    #[test]
    fn dup_shares_the_offset() {
        let k = FakeKernel::new();
        let fd = k.open(c"/f", libc::O_CREAT | libc::O_RDWR, 0).unwrap();
        let twin = k.dup(fd).unwrap();
        k.write(fd, b"hello").unwrap();
        assert_eq!(k.lseek(twin, 0, libc::SEEK_CUR).unwrap(), 5);
        k.lseek(twin, 0, libc::SEEK_SET).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(k.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn streams_carry_their_descriptor() {
        let k = FakeKernel::new();
        let f = k.fopen(c"/log", c"w").unwrap();
        let fd = k.fileno(f).unwrap();
        assert!(k.is_open(fd));
        k.fclose(f).unwrap();
        assert!(!k.is_open(fd));
        let d = k.opendir(c"/").unwrap();
        assert_eq!(k.dirfd(d).unwrap(), fd);
        k.seekdir(d, 3);
        assert_eq!(k.telldir(d), 3);
        k.closedir(d).unwrap();
    }

    #[test]
    fn soft_watch_ignores_reguarding() {
        let mut word = Box::new(0u64);
        let addr = std::ptr::addr_of_mut!(*word) as usize;
        let unit = SoftWatchUnit::new();
        unit.arm(&[addr], &[]).unwrap();
        *word = SENTINEL_WORD;
        unit.poll();
        assert!(unit.take_trap().is_none());
        *word = 0x41;
        unit.poll();
        let trap = unit.take_trap().unwrap();
        assert_eq!(trap.addr, addr);
        assert!(unit.take_trap().is_none());
    }

    #[test]
    fn terminate_unwinds_with_the_report() {
        let sink = CollectingSink::new();
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            sink.terminate(&FaultReport::new(
                epochguard_membrane::FaultKind::Leak,
                3,
                "lost",
            ))
        }));
        let payload = caught.unwrap_err();
        let Terminated(report) = *payload.downcast::<Terminated>().unwrap();
        assert_eq!(report.epoch, 3);
        assert_eq!(sink.reports().len(), 1);
    }
}
