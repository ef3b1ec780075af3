//! Replay-time watchpoints.
//!
//! Up to [`MAX_WATCHPOINTS`] addresses implicated by the epoch-end scan are
//! armed before a replay pass. The value of each word is recorded at arming
//! time; at the end of the replay the slots whose live value differs are the
//! faulty ones. A hardware trap, when one fires, additionally pins down the
//! instruction pointer of the faulting write.
//!
//! [`PerfWatchUnit`] arms write breakpoints through `perf_event_open(2)`,
//! one event per (thread, address). Trap delivery is redirected to `SIGTRAP`
//! on the owning thread; the handler only stores the instruction pointer
//! and descriptor into preallocated atomics. The pointer is symbolized with
//! `dladdr(3)` afterwards, outside the handler.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::canary::{SENTINEL_WORD, ShortPad, WORD_SIZE, align_down, load_word};
use crate::error::{GuardError, Result};
use crate::metrics::{GuardMetrics, global_metrics};
use crate::tracker::{CallSite, FaultKinds};

/// Hardware debug registers available for data breakpoints.
pub const MAX_WATCHPOINTS: usize = 4;

/// One armed (or about to be armed) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSlot {
    /// Word-aligned address.
    pub addr: usize,
    pub object_start: usize,
    pub object_size: usize,
    pub kind: FaultKinds,
    /// Corrupted value seen by the scan that requested the watch.
    pub observed: u64,
    /// Value at arming time.
    pub armed_value: u64,
}

impl WatchSlot {
    /// Current value of the watched word.
    #[must_use]
    pub fn live_value(&self) -> u64 {
        // SAFETY: slots only name words inside mapped heap blocks.
        unsafe { load_word(self.addr) }
    }

    /// Address of the first byte in the word that no longer holds its
    /// guard pattern.
    #[must_use]
    pub fn fault_address(&self) -> usize {
        let live = self.live_value();
        if let Some(pad) = ShortPad::for_payload(self.object_start, self.object_size)
            && pad.word == self.addr
            && let Some(byte) = pad.first_broken_byte(live)
        {
            return self.addr + byte;
        }
        let expected = SENTINEL_WORD.to_ne_bytes();
        let byte = live
            .to_ne_bytes()
            .iter()
            .zip(expected)
            .position(|(&seen, want)| seen != want)
            .unwrap_or(0);
        self.addr + byte
    }
}

/// A trap reported by the watch facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTrap {
    pub addr: usize,
    pub ip: usize,
    pub site: Option<CallSite>,
}

/// The facility that physically monitors addresses.
pub trait WatchHardware: Send + Sync {
    /// Arm write watches on `addrs` for every thread in `threads`.
    fn arm(&self, addrs: &[usize], threads: &[libc::pid_t]) -> Result<()>;
    fn disarm(&self);
    /// Give software implementations a chance to notice a change.
    fn poll(&self) {}
    /// The first trap since arming, if any.
    fn take_trap(&self) -> Option<WatchTrap>;
}

#[derive(Default)]
pub struct WatchpointSet {
    slots: Mutex<Vec<WatchSlot>>,
    armed: AtomicU32,
}

impl WatchpointSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate. Returns false when the table is full or the word
    /// is already watched.
    pub fn add_watchpoint(
        &self,
        addr: usize,
        observed: u64,
        kind: FaultKinds,
        object_start: usize,
        object_size: usize,
    ) -> bool {
        let addr = align_down(addr, WORD_SIZE);
        let mut slots = self.slots.lock();
        if slots.iter().any(|s| s.addr == addr) {
            return false;
        }
        if slots.len() == MAX_WATCHPOINTS {
            warn!(addr, "watchpoint table full");
            return false;
        }
        slots.push(WatchSlot {
            addr,
            object_start,
            object_size,
            kind,
            observed,
            armed_value: 0,
        });
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    #[must_use]
    pub fn slots(&self) -> Vec<WatchSlot> {
        self.slots.lock().clone()
    }

    /// True when a replay pass is needed to localize a candidate.
    #[must_use]
    pub fn has_to_rollback(&self) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| !s.kind.difference(FaultKinds::WATCH_ONLY).is_empty())
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire) != 0
    }

    /// Record the current value of each slot and arm the hardware.
    ///
    /// Memory must already be restored to the checkpoint.
    pub fn install(&self, hw: &dyn WatchHardware, threads: &[libc::pid_t]) -> Result<()> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            // SAFETY: watched words lie in the heap or a global segment,
            // both mapped for the life of the process.
            slot.armed_value = unsafe { load_word(slot.addr) };
        }
        let addrs: Vec<usize> = slots.iter().map(|s| s.addr).collect();
        hw.arm(&addrs, threads)?;
        self.armed.store(1, Ordering::Release);
        debug!(count = addrs.len(), "watchpoints armed");
        Ok(())
    }

    /// Slots whose live value differs from the value at arming.
    ///
    /// A word that went back to holding a canary was re-guarded by the
    /// replay itself and is not a fault. Slots that match the corrupted
    /// value the scan saw come first.
    #[must_use]
    pub fn find_faulty_objects(&self) -> Vec<WatchSlot> {
        let slots = self.slots.lock();
        let mut faulty: Vec<WatchSlot> = slots
            .iter()
            .filter(|s| !s.kind.contains(FaultKinds::WATCH_ONLY))
            .filter(|s| {
                // SAFETY: see `install`.
                let live = unsafe { load_word(s.addr) };
                live != s.armed_value && live != SENTINEL_WORD
            })
            .copied()
            .collect();
        if faulty.len() > 1 {
            warn!(count = faulty.len(), "several watched words changed in one replay");
        }
        // SAFETY: see `install`.
        faulty.sort_by_key(|s| unsafe { load_word(s.addr) } != s.observed);
        faulty
    }

    /// The slot containing `addr`, if any.
    #[must_use]
    pub fn slot_for(&self, addr: usize) -> Option<WatchSlot> {
        let addr = align_down(addr, WORD_SIZE);
        self.slots.lock().iter().find(|s| s.addr == addr).copied()
    }

    /// Disarm the hardware and forget every slot.
    pub fn clear(&self, hw: &dyn WatchHardware) {
        if self.armed.swap(0, Ordering::AcqRel) != 0 {
            hw.disarm();
        }
        self.slots.lock().clear();
    }
}

// Trap state written by the signal handler.
static TRAP_FD: AtomicI32 = AtomicI32::new(-1);
static TRAP_IP: AtomicUsize = AtomicUsize::new(0);
static TRAP_COUNT: AtomicU32 = AtomicU32::new(0);

const PERF_TYPE_BREAKPOINT: u32 = 5;
const HW_BREAKPOINT_W: u32 = 2;
const HW_BREAKPOINT_LEN_8: u64 = 8;
const ATTR_DISABLED: u64 = 1;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 8;
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const F_SETSIG: libc::c_int = 10;
const F_SETOWN_EX: libc::c_int = 15;
const F_OWNER_TID: libc::c_int = 0;

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5` layout.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

const _: () = assert!(std::mem::size_of::<PerfEventAttr>() == 112);

#[repr(C)]
#[allow(dead_code)]
struct OwnerEx {
    kind: libc::c_int,
    pid: libc::pid_t,
}

/// `siginfo_t` as filled for a `SIGPOLL`-style delivery (`F_SETSIG`).
#[repr(C)]
#[allow(dead_code)]
struct PollSigInfo {
    signo: libc::c_int,
    errno: libc::c_int,
    code: libc::c_int,
    pad: libc::c_int,
    band: libc::c_long,
    fd: libc::c_int,
}

extern "C" fn on_watch_trap(_sig: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: the kernel passes valid siginfo and ucontext pointers to an
    // SA_SIGINFO handler; only the fd and rip words are read.
    unsafe {
        let fd = (*info.cast::<PollSigInfo>()).fd;
        let uc = context.cast::<libc::ucontext_t>();
        let ip = (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        if TRAP_COUNT.fetch_add(1, Ordering::AcqRel) == 0 {
            TRAP_FD.store(fd, Ordering::Release);
            TRAP_IP.store(ip, Ordering::Release);
        }
    }
}

/// One-frame call site for the faulting instruction `ip`: symbol plus
/// offset when the dynamic linker knows it, object file plus offset when it
/// only knows the mapping, the raw address otherwise.
#[must_use]
pub fn site_of(ip: usize) -> CallSite {
    // SAFETY: Dl_info is plain old data; all-zero is a valid value.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: `dladdr` only inspects the address and fills `info`.
    let found = ip != 0 && unsafe { libc::dladdr(ip as *const libc::c_void, &mut info) } != 0;
    let frame = if !found {
        format!("{ip:#x}")
    } else if !info.dli_sname.is_null() {
        // SAFETY: non-null names from dladdr are NUL-terminated and static.
        let name = unsafe { std::ffi::CStr::from_ptr(info.dli_sname) }.to_string_lossy();
        format!("{name}+{:#x}", ip.wrapping_sub(info.dli_saddr as usize))
    } else if !info.dli_fname.is_null() {
        // SAFETY: as above.
        let file = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }.to_string_lossy();
        format!("{file}+{:#x}", ip.wrapping_sub(info.dli_fbase as usize))
    } else {
        format!("{ip:#x}")
    };
    CallSite::from_frames(vec![frame])
}

/// Write breakpoints through the perf events interface.
pub struct PerfWatchUnit {
    /// (descriptor, watched address)
    events: Mutex<Vec<(libc::c_int, usize)>>,
}

impl PerfWatchUnit {
    /// Install the `SIGTRAP` handler. Call once, before any replay.
    pub fn new() -> Result<Self> {
        // SAFETY: plain sigaction installation with a handler that only
        // touches atomics.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_watch_trap as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGTRAP, &action, std::ptr::null_mut()) != 0 {
                return Err(GuardError::last_os("sigaction(SIGTRAP)"));
            }
        }
        Ok(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn open_event(addr: usize, tid: libc::pid_t) -> Result<libc::c_int> {
        let attr = PerfEventAttr {
            kind: PERF_TYPE_BREAKPOINT,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            sample_period: 1,
            flags: ATTR_DISABLED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
            wakeup_events: 1,
            bp_type: HW_BREAKPOINT_W,
            bp_addr: addr as u64,
            bp_len: HW_BREAKPOINT_LEN_8,
            ..PerfEventAttr::default()
        };
        // SAFETY: `attr` outlives the call; the remaining arguments are
        // plain integers.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                tid,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(GuardError::last_os("perf_event_open"));
        }
        let fd = fd as libc::c_int;
        let owner = OwnerEx {
            kind: F_OWNER_TID,
            pid: tid,
        };
        // SAFETY: `fd` is the event we just opened.
        let routed = unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) == 0
                && libc::fcntl(fd, F_SETSIG, libc::SIGTRAP) == 0
                && libc::fcntl(fd, F_SETOWN_EX, &owner as *const OwnerEx) == 0
                && libc::ioctl(fd, PERF_EVENT_IOC_ENABLE as _, 0) == 0
        };
        if !routed {
            let err = GuardError::last_os("perf event routing");
            // SAFETY: closing our own descriptor.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(fd)
    }
}

impl WatchHardware for PerfWatchUnit {
    fn arm(&self, addrs: &[usize], threads: &[libc::pid_t]) -> Result<()> {
        TRAP_COUNT.store(0, Ordering::Release);
        TRAP_FD.store(-1, Ordering::Release);
        let mut events = self.events.lock();
        for &addr in addrs {
            for &tid in threads {
                events.push((Self::open_event(addr, tid)?, addr));
            }
        }
        Ok(())
    }

    fn disarm(&self) {
        for (fd, _) in self.events.lock().drain(..) {
            // SAFETY: descriptors opened by `open_event`.
            unsafe {
                libc::ioctl(fd, PERF_EVENT_IOC_DISABLE as _, 0);
                libc::close(fd);
            }
        }
    }

    fn take_trap(&self) -> Option<WatchTrap> {
        if TRAP_COUNT.load(Ordering::Acquire) == 0 {
            return None;
        }
        let fd = TRAP_FD.load(Ordering::Acquire);
        let addr = self
            .events
            .lock()
            .iter()
            .find(|(event, _)| *event == fd)
            .map(|&(_, addr)| addr)?;
        GuardMetrics::inc(&global_metrics().watch_traps);
        let ip = TRAP_IP.load(Ordering::Acquire);
        Some(WatchTrap {
            addr,
            ip,
            site: Some(site_of(ip)),
        })
    }
}

impl Drop for PerfWatchUnit {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullUnit {
        armed: Mutex<Vec<usize>>,
    }

    impl WatchHardware for NullUnit {
        fn arm(&self, addrs: &[usize], _threads: &[libc::pid_t]) -> Result<()> {
            self.armed.lock().extend_from_slice(addrs);
            Ok(())
        }
        fn disarm(&self) {
            self.armed.lock().clear();
        }
        fn take_trap(&self) -> Option<WatchTrap> {
            None
        }
    }

    #[test]
    fn table_is_bounded_and_deduplicated() {
        let set = WatchpointSet::new();
        let words = [0u64; 8];
        let base = words.as_ptr() as usize;
        assert!(set.add_watchpoint(base, 1, FaultKinds::OVERFLOW, base, 8));
        assert!(!set.add_watchpoint(base + 3, 1, FaultKinds::OVERFLOW, base, 8));
        for i in 1..MAX_WATCHPOINTS {
            assert!(set.add_watchpoint(base + i * 8, 1, FaultKinds::OVERFLOW, base, 8));
        }
        assert!(!set.add_watchpoint(base + 56, 1, FaultKinds::OVERFLOW, base, 8));
        assert_eq!(set.len(), MAX_WATCHPOINTS);
    }

    #[test]
    fn changed_words_are_faulty() {
        let mut words = [SENTINEL_WORD, 0, 7];
        let ptr = words.as_mut_ptr();
        let base = ptr as usize;
        let set = WatchpointSet::new();
        let unit = NullUnit::default();
        set.add_watchpoint(base, 0x4141, FaultKinds::OVERFLOW, base, 8);
        set.add_watchpoint(base + 8, 0, FaultKinds::OVERFLOW, base, 16);
        set.add_watchpoint(base + 16, 0, FaultKinds::WATCH_ONLY, base, 24);
        assert!(set.has_to_rollback());
        set.install(&unit, &[0]).unwrap();
        assert!(set.is_armed());
        assert_eq!(unit.armed.lock().len(), 3);

        unsafe {
            ptr.write_volatile(0x4141);
            ptr.add(1).write_volatile(SENTINEL_WORD);
            ptr.add(2).write_volatile(9);
        }
        let faulty = set.find_faulty_objects();
        assert_eq!(faulty.len(), 1);
        assert_eq!(faulty[0].addr, base);
        assert_eq!(faulty[0].armed_value, SENTINEL_WORD);

        set.clear(&unit);
        assert!(set.is_empty());
        assert!(unit.armed.lock().is_empty());
    }

    #[test]
    fn watch_only_does_not_force_rollback() {
        let set = WatchpointSet::new();
        set.add_watchpoint(0x1000, 0, FaultKinds::WATCH_ONLY, 0x1000, 8);
        assert!(!set.has_to_rollback());
    }

    #[test]
    fn trap_site_names_the_faulting_instruction() {
        let ip = site_of as usize + 4;
        let site = site_of(ip);
        assert_eq!(site.frames().len(), 1);
        assert!(site.frames()[0].contains("+0x"), "{:?}", site.frames());
        assert_eq!(site_of(0).frames(), ["0x0"]);
    }

    #[test]
    fn perf_trap_carries_its_site() {
        let unit = PerfWatchUnit {
            events: Mutex::new(vec![(-7, 0x1000)]),
        };
        let ip = site_of as usize;
        TRAP_FD.store(-7, Ordering::Release);
        TRAP_IP.store(ip, Ordering::Release);
        TRAP_COUNT.store(1, Ordering::Release);
        let trap = unit.take_trap().unwrap();
        TRAP_COUNT.store(0, Ordering::Release);
        assert_eq!(trap.addr, 0x1000);
        assert_eq!(trap.ip, ip);
        assert_eq!(trap.site, Some(site_of(ip)));
        unit.events.lock().clear();
    }

    #[test]
    fn perf_attr_matches_kernel_abi() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
        assert_eq!(std::mem::offset_of!(PerfEventAttr, bp_addr), 56);
        assert_eq!(std::mem::offset_of!(PollSigInfo, fd), 24);
    }
}
