//! The epoch coordinator.
//!
//! Execution is cut into epochs. At an epoch begin every thread is parked,
//! the heap and the registered memory maps are backed up and each thread's
//! register state becomes its checkpoint. At an epoch end the threads are
//! parked again and the heap is scanned for broken canaries, disturbed
//! quarantine entries and unreachable objects. A clean scan commits; a dirty
//! one rolls every thread back to its checkpoint and, in localize mode,
//! replays the epoch with watchpoints armed on the corrupted words so the
//! faulting store can be pinpointed.
//!
//! Only one thread runs an epoch boundary at a time. It holds the
//! *boundary* for the whole sequence; other threads that reach a boundary
//! wait for it while staying responsive to quiesce requests.
//!
//! Every public entry point here is meant to be called from the thread the
//! `me` record belongs to.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use epochguard_membrane::memory_map::{discover_global_segments, read_proc_maps};
use epochguard_membrane::{
    AllocationTracker, EngineConfig, FaultKind, FaultKinds, FaultReport, FaultSink, FreeOutcome,
    GuardError, GuardMetrics, GuardedHeap, LeakCheckMode, LeakScanner, LeakedObject, MemoryMap,
    OverflowFinding, RawAllocator, Result, RootSet, StackBounds, StackTrampoline, UseAfterFree,
    WatchHardware, WatchSlot, WatchpointSet, global_metrics,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::quiesce::{Decision, QuiesceBarrier, QuiesceHook, QuiesceTransport};
use crate::signals;
use crate::state::{EpochPhase, EpochState};
use crate::sync::SyncCoordinator;
use crate::syscall::{EpochControl, SyscallBackend, SyscallGateway};
use crate::thread::{self, ThreadRecord, ThreadRegistry, ThreadStatus, Wakeable, wait_interruptible};

/// Use-after-free findings reported by the final quarantine drain, at most.
const FINAL_DRAIN_LIMIT: usize = 4;

/// Collaborators the coordinator drives but does not implement.
#[derive(Clone)]
pub struct EngineDeps {
    pub trampoline: Arc<dyn StackTrampoline>,
    pub watch: Arc<dyn WatchHardware>,
    pub sink: Arc<dyn FaultSink>,
    pub backend: Arc<dyn SyscallBackend>,
    pub transport: Arc<dyn QuiesceTransport>,
}

/// Process-level knobs that are not part of [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Address space reserved for the guarded heap.
    pub heap_capacity: usize,
    /// Back up the writable segments of loaded images as well. Only safe
    /// when the C runtime's own state lives outside them.
    pub global_segments: bool,
    /// Image paths whose segments are never backed up.
    pub global_exclude: Vec<String>,
    /// Treat thread stacks and saved registers as leak roots.
    pub scan_stacks: bool,
    /// Extra `[start, end)` leak roots.
    pub extra_roots: Vec<(usize, usize)>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            heap_capacity: 256 * 1024 * 1024,
            global_segments: false,
            global_exclude: vec!["libc".to_owned(), "ld-linux".to_owned()],
            scan_stacks: true,
            extra_roots: Vec::new(),
        }
    }
}

/// Something an epoch-end scan found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finding {
    Overflow(OverflowFinding),
    UseAfterFree(UseAfterFree),
    Leak(LeakedObject),
}

impl Finding {
    /// Report for a finding that no replay has localized.
    #[must_use]
    pub fn report(&self, epoch: u64) -> FaultReport {
        match *self {
            Self::Overflow(o) => {
                let r = FaultReport::new(FaultKind::Overflow, epoch, "heap overflow found by scan")
                    .with_address(o.fault_addr)
                    .with_observed(o.observed);
                match o.object {
                    Some(obj) => r.with_object(obj.payload, obj.size),
                    None => r,
                }
            }
            Self::UseAfterFree(u) => {
                FaultReport::new(FaultKind::UseAfterFree, epoch, "freed object written")
                    .with_address(u.word)
                    .with_object(u.object.payload, u.object.size)
                    .with_observed(u.observed)
            }
            Self::Leak(l) => FaultReport::new(FaultKind::Leak, epoch, "unreachable heap object")
                .with_object(l.start, l.size),
        }
    }
}

/// Result of intercepting a thread creation.
#[derive(Debug)]
pub enum Spawn {
    /// A new record; the caller starts an OS thread for it.
    Fresh(Arc<ThreadRecord>),
    /// Replay of a creation whose OS thread already exists.
    Replayed(Arc<ThreadRecord>),
}

impl Spawn {
    #[must_use]
    pub fn record(&self) -> &Arc<ThreadRecord> {
        match self {
            Self::Fresh(r) | Self::Replayed(r) => r,
        }
    }

    #[must_use]
    pub fn needs_os_thread(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// Exclusive right to run an epoch boundary. Reentrant for its holder.
#[derive(Default)]
struct Boundary {
    holder: Mutex<Option<u32>>,
    cv: Condvar,
}

impl Wakeable for Boundary {
    fn wake(&self) {
        let _holder = self.holder.lock();
        self.cv.notify_all();
    }
}

pub struct EpochCoordinator {
    config: EngineConfig,
    options: EngineOptions,
    deps: EngineDeps,
    state: Arc<EpochState>,
    heap: GuardedHeap,
    /// Index 0 covers the heap; the rest are global segments.
    maps: Mutex<Vec<MemoryMap>>,
    tracker: AllocationTracker,
    watchpoints: WatchpointSet,
    leaks: LeakScanner,
    registry: Arc<ThreadRegistry>,
    sync: SyncCoordinator,
    gateway: SyscallGateway,
    barrier: QuiesceBarrier,
    boundary: Arc<Boundary>,
    /// Other threads are stopped at the barrier.
    parked: AtomicBool,
    /// Corruption found between scans, at free or quarantine eviction.
    pending: Mutex<Vec<Finding>>,
    /// What the scan that triggered the current rollback found.
    failed_scan: Mutex<Vec<Finding>>,
}

impl std::fmt::Debug for EpochCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochCoordinator")
            .field("epoch", &self.state.epoch())
            .field("phase", &self.state.phase())
            .field("threads", &self.registry.live_count())
            .finish_non_exhaustive()
    }
}

impl EpochCoordinator {
    /// Reserve the heap and register the memory maps. No epoch runs until
    /// [`Self::init`].
    pub fn new(config: EngineConfig, deps: EngineDeps, options: EngineOptions) -> Result<Arc<Self>> {
        let heap = GuardedHeap::with_capacity(options.heap_capacity)?;
        let mut maps = vec![MemoryMap::new("heap", heap.begin(), heap.raw().capacity())?];
        if options.global_segments {
            let text = read_proc_maps()?;
            let exclude: Vec<&str> = options.global_exclude.iter().map(String::as_str).collect();
            for seg in discover_global_segments(&text, &exclude) {
                maps.push(MemoryMap::new(seg.path.clone(), seg.start, seg.len())?);
            }
        }
        let state = Arc::new(EpochState::new());
        let registry = Arc::new(ThreadRegistry::new(
            config.quarantine_entries,
            config.quarantine_bytes,
        ));
        info!(
            level = ?config.level,
            heap = options.heap_capacity,
            maps = maps.len(),
            leak_check = config.leak_check,
            "epoch coordinator ready"
        );
        Ok(Arc::new(Self {
            leaks: LeakScanner::new(config.leak_check),
            sync: SyncCoordinator::new(Arc::clone(&state), Arc::clone(&registry)),
            gateway: SyscallGateway::new(Arc::clone(&deps.backend), Arc::clone(&state)),
            config,
            options,
            deps,
            state,
            heap,
            maps: Mutex::new(maps),
            tracker: AllocationTracker::new(),
            watchpoints: WatchpointSet::new(),
            registry,
            barrier: QuiesceBarrier::new(),
            boundary: Arc::new(Boundary::default()),
            parked: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            failed_scan: Mutex::new(Vec::new()),
        }))
    }

    /// Register the calling thread as the first thread and begin epoch 1.
    pub fn init(&self, bounds: StackBounds) -> Result<Arc<ThreadRecord>> {
        let me = self.registry.allocate(bounds)?;
        me.attach_current();
        me.set_newly_spawned(false);
        me.set_status(ThreadStatus::Running);
        thread::set_current(Some(Arc::clone(&me)));
        if signals::is_installed() {
            signals::prepare_thread()?;
        }
        self.epoch_begin(&me);
        Ok(me)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &EpochState {
        &self.state
    }

    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    #[must_use]
    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    #[must_use]
    pub fn gateway(&self) -> &SyscallGateway {
        &self.gateway
    }

    #[must_use]
    pub fn heap(&self) -> &GuardedHeap {
        &self.heap
    }

    #[must_use]
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    #[must_use]
    pub fn watchpoints(&self) -> &WatchpointSet {
        &self.watchpoints
    }

    pub(crate) fn quiesce_barrier(&self) -> &QuiesceBarrier {
        &self.barrier
    }

    /// Run `f` with the quiesce signal held back, so the calling thread is
    /// never stopped while it holds an engine lock. Interposed entry points
    /// go through here.
    pub fn intercept<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let _deferred = signals::defer();
        f(self)
    }

    fn or_fatal<T>(&self, r: Result<T>) -> T {
        r.unwrap_or_else(|e| self.fatal(e))
    }

    // ---- the boundary ---------------------------------------------------

    fn acquire_boundary(&self, me: &ThreadRecord) {
        let waker: Arc<dyn Wakeable> = self.boundary.clone();
        me.set_blocked_on(Some(waker));
        let mut holder = wait_interruptible(me, self, &self.boundary.holder, &self.boundary.cv, |h| {
            h.is_some_and(|i| i != me.index())
        });
        *holder = Some(me.index());
        drop(holder);
        me.set_blocked_on(None);
    }

    fn release_boundary(&self) {
        *self.boundary.holder.lock() = None;
        self.boundary.cv.notify_all();
    }

    fn save_context(&self, me: &ThreadRecord) {
        let regs = self.deps.trampoline.capture();
        let saved = me.context().save(regs);
        self.or_fatal(saved);
    }

    // ---- epoch begin ----------------------------------------------------

    /// Take a new checkpoint and release the parked threads.
    pub fn epoch_begin(&self, me: &ThreadRecord) {
        self.acquire_boundary(me);
        let begun = self.begin_locked(me);
        self.or_fatal(begun);
        if self.parked.swap(false, Ordering::AcqRel) {
            self.barrier.release(Decision::Commit);
        }
        self.release_boundary();
        self.save_context(me);
    }

    fn begin_locked(&self, me: &ThreadRecord) -> Result<()> {
        self.sync.epoch_begin();
        let reaped = self.registry.reap_joined();
        let threads = self.registry.alive();
        for t in &threads {
            t.clear_logs();
            t.quarantine().backup();
            t.set_newly_spawned(false);
            if t.status() == ThreadStatus::Rollback {
                t.set_status(ThreadStatus::Running);
            }
        }
        self.heap.checkpoint_metadata();
        let used = self.heap.used_end();
        for (i, map) in self.maps.lock().iter_mut().enumerate() {
            map.backup((i == 0).then_some(used));
        }
        self.watchpoints.clear(&*self.deps.watch);
        self.tracker.clear();
        self.pending.lock().clear();
        self.failed_scan.lock().clear();
        self.state.set_replaying(false);
        let epoch = self.state.advance_epoch();
        self.state.transition(EpochPhase::Begin, EpochPhase::Normal)?;
        GuardMetrics::inc(&global_metrics().epochs);
        debug!(
            epoch,
            thread = me.index(),
            threads = threads.len(),
            reaped,
            heap_used = used - self.heap.begin(),
            "epoch begun"
        );
        Ok(())
    }

    // ---- epoch end ------------------------------------------------------

    /// Stop every other thread and check the epoch. Returns after a commit
    /// with the boundary still held and the others parked; the caller
    /// follows with [`Self::epoch_begin`]. A dirty epoch never returns.
    pub fn epoch_end(&self, me: &ThreadRecord, is_exit: bool) {
        self.acquire_boundary(me);
        let replay_end = match self.state.phase() {
            EpochPhase::Normal => false,
            EpochPhase::Rollback => true,
            other => self.fatal(GuardError::PhaseTransition {
                from: other.as_str(),
                to: EpochPhase::Quiescing.as_str(),
            }),
        };
        let from = if replay_end {
            EpochPhase::Rollback
        } else {
            EpochPhase::Normal
        };
        self.or_fatal(self.state.transition(from, EpochPhase::Quiescing));
        self.quiesce_others(me);
        self.or_fatal(self.state.transition(EpochPhase::Quiescing, EpochPhase::Checking));

        if replay_end {
            self.finish_replay(me);
        }
        if !self.config.level.checks_enabled() {
            self.commit();
            return;
        }
        let findings = self.scan(me, is_exit);
        if findings.is_empty() {
            self.commit();
            return;
        }
        warn!(
            epoch = self.state.epoch(),
            findings = findings.len(),
            first = ?findings[0],
            "epoch failed its checks"
        );
        self.failed_scan.lock().clone_from(&findings);
        if self.config.level.replays() {
            self.rollback(me);
        }
        self.rollback_and_halt(&findings);
    }

    fn quiesce_others(&self, me: &ThreadRecord) {
        self.barrier.open_round();
        let mut expected = 0usize;
        for t in self.registry.alive() {
            // Unattached threads have not run program code yet.
            if t.index() == me.index() || t.tid() == 0 || t.status().is_finished() {
                continue;
            }
            t.request_quiesce();
            // Fresh threads may not have a signal stack yet.
            if !t.is_newly_spawned() {
                let sent = self.deps.transport.request(&t);
                self.or_fatal(sent);
            }
            t.interrupt();
            expected += 1;
        }
        self.barrier.wait_for_stops(expected);
        self.parked.store(true, Ordering::Release);
    }

    fn commit(&self) {
        self.gateway.commit();
        GuardMetrics::inc(&global_metrics().commits);
        self.or_fatal(self.state.transition(EpochPhase::Checking, EpochPhase::Begin));
        debug!(epoch = self.state.epoch(), "epoch committed");
    }

    fn scan(&self, me: &ThreadRecord, is_exit: bool) -> Vec<Finding> {
        let mut findings = std::mem::take(&mut *self.pending.lock());
        findings.extend(self.heap.check_heap_overflow().into_iter().map(Finding::Overflow));
        for t in self.registry.alive() {
            findings.extend(t.quarantine().scan().into_iter().map(Finding::UseAfterFree));
        }
        // Leaks are only swept for on an epoch with no corruption.
        if self.leaks.enabled() && findings.is_empty() {
            let mode = if is_exit {
                LeakCheckMode::Fast
            } else {
                LeakCheckMode::Slow
            };
            let roots = self.roots(me, mode);
            let leaked = self.leaks.scan(&self.heap, &roots, mode);
            findings.extend(leaked.into_iter().map(Finding::Leak));
        }
        for f in &findings {
            self.implicate(f);
        }
        findings
    }

    /// Track the object behind `finding` and watch its corrupted word.
    fn implicate(&self, finding: &Finding) {
        match *finding {
            Finding::Overflow(o) => {
                let (start, size) = o.object.map_or((0, 0), |obj| (obj.payload, obj.size));
                if size > 0 {
                    self.tracker.insert(start, size, FaultKinds::OVERFLOW);
                }
                self.watchpoints
                    .add_watchpoint(o.word, o.observed, FaultKinds::OVERFLOW, start, size);
            }
            Finding::UseAfterFree(u) => {
                let (start, size) = (u.object.payload, u.object.size);
                self.tracker.insert(start, size, FaultKinds::USE_AFTER_FREE);
                self.watchpoints
                    .add_watchpoint(u.word, u.observed, FaultKinds::USE_AFTER_FREE, start, size);
            }
            Finding::Leak(l) => self.tracker.insert(l.start, l.size, FaultKinds::LEAK),
        }
    }

    fn roots(&self, me: &ThreadRecord, mode: LeakCheckMode) -> RootSet {
        let mut roots = RootSet::new();
        for map in self.maps.lock().iter().skip(1) {
            roots.add_range(map.start(), map.end());
        }
        for &(start, end) in &self.options.extra_roots {
            roots.add_range(start, end);
        }
        if !self.options.scan_stacks {
            return roots;
        }
        let here = 0usize;
        let sp = std::ptr::addr_of!(here) as usize;
        roots.add_range(sp, me.context().bounds().high);
        if mode == LeakCheckMode::Slow {
            for t in self.registry.alive() {
                if t.index() == me.index() || t.tid() == 0 || t.status().is_finished() {
                    continue;
                }
                let bounds = t.context().bounds();
                if bounds.contains(t.stop_sp()) {
                    roots.add_range(t.stop_sp(), bounds.high);
                }
                roots.add_words(t.stop_registers());
            }
        }
        roots
    }

    // ---- rollback -------------------------------------------------------

    fn restore_memory(&self) {
        let dirty = self.heap.used_end();
        for (i, map) in self.maps.lock().iter().enumerate() {
            map.recover_memory((i == 0).then_some(dirty));
        }
        self.heap.restore_metadata();
    }

    /// Restore the checkpoint and re-execute the epoch with watchpoints
    /// armed. Control continues at `me`'s checkpoint.
    fn rollback(&self, me: &ThreadRecord) -> ! {
        let attempt = self.state.note_rollback();
        if attempt > self.config.max_rollbacks {
            let report = self.unlocalized_report(&format!(
                "corruption not localized after {} rollbacks",
                self.config.max_rollbacks
            ));
            self.deps.sink.terminate(&report);
        }
        GuardMetrics::inc(&global_metrics().rollbacks);

        self.restore_memory();
        let threads = self.registry.alive();
        for t in &threads {
            t.quarantine().restore();
        }
        let files = self.gateway.prepare_rollback();
        self.or_fatal(files);
        self.sync.prepare_rollback();
        for t in &threads {
            if t.index() == me.index() || t.status().is_finished() {
                continue;
            }
            // Creations are replayed; children wait for theirs again.
            let next = if t.is_newly_spawned() {
                ThreadStatus::Starting
            } else {
                ThreadStatus::Rollback
            };
            t.set_status(next);
        }

        self.state.set_replaying(true);
        self.or_fatal(self.state.transition(EpochPhase::Checking, EpochPhase::Rollback));
        if self.watchpoints.is_armed() {
            self.deps.watch.disarm();
        }
        let tids: Vec<libc::pid_t> = threads.iter().map(|t| t.tid()).filter(|&t| t != 0).collect();
        if let Err(e) = self.watchpoints.install(&*self.deps.watch, &tids) {
            warn!(error = %e, "watchpoints unavailable; replay cannot pinpoint the fault");
        }
        info!(
            epoch = self.state.epoch(),
            attempt,
            watched = self.watchpoints.len(),
            "rolling back"
        );
        if self.parked.swap(false, Ordering::AcqRel) {
            self.barrier.release(Decision::Rollback);
        }
        self.release_boundary();
        match me.rollback_context(&*self.deps.trampoline) {
            Ok(never) => match never {},
            Err(e) => self.fatal(e),
        }
    }

    /// Detect mode: restore memory and report what the scan saw.
    pub fn rollback_and_halt(&self, findings: &[Finding]) -> ! {
        GuardMetrics::inc(&global_metrics().rollbacks);
        self.restore_memory();
        let epoch = self.state.epoch();
        let reports: Vec<FaultReport> = findings.iter().map(|f| f.report(epoch)).collect();
        self.deliver(reports)
    }

    /// End of a replay pass: turn what the watchpoints saw into reports.
    fn finish_replay(&self, me: &ThreadRecord) -> ! {
        let epoch = self.state.epoch();
        self.deps.watch.poll();
        let trap = self.deps.watch.take_trap();
        let mut reports: Vec<FaultReport> = self
            .watchpoints
            .find_faulty_objects()
            .iter()
            .map(|slot| {
                let mut r = self.localized_report(slot, epoch);
                if let Some(trap) = trap.as_ref().filter(|t| t.addr == slot.addr) {
                    r = r.with_trap_ip(trap.ip);
                    if let Some(site) = trap.site.as_ref().filter(|s| self.tracker.first_report_of(s)) {
                        r = r.with_call_site(site);
                    }
                }
                r.with_thread(me.index())
            })
            .collect();
        for obj in self.tracker.with_kind(FaultKinds::LEAK) {
            reports.push(
                FaultReport::new(FaultKind::Leak, epoch, "heap object never freed")
                    .localized(obj.alloc_site.is_some())
                    .with_object(obj.start, obj.size)
                    .with_alloc_site(obj.alloc_site.as_ref()),
            );
        }
        if reports.is_empty() {
            if self.state.rollbacks() < self.config.max_rollbacks {
                info!(epoch, "replay did not reproduce the fault; trying again");
                self.rollback(me);
            }
            reports.push(self.unlocalized_report("replay did not reproduce the corruption"));
        }
        self.deliver(reports)
    }

    fn localized_report(&self, slot: &WatchSlot, epoch: u64) -> FaultReport {
        let (kind, what) = if slot.kind.contains(FaultKinds::USE_AFTER_FREE) {
            (FaultKind::UseAfterFree, "write to freed object")
        } else {
            (FaultKind::Overflow, "write past the end of an object")
        };
        let mut r = FaultReport::new(kind, epoch, what)
            .localized(true)
            .with_address(slot.fault_address())
            .with_observed(slot.live_value());
        if slot.object_size > 0 {
            r = r.with_object(slot.object_start, slot.object_size);
        }
        if let Some(obj) = self.tracker.get(slot.object_start) {
            r = r
                .with_alloc_site(obj.alloc_site.as_ref())
                .with_free_site(obj.free_site.as_ref());
        }
        r
    }

    fn unlocalized_report(&self, msg: &str) -> FaultReport {
        let epoch = self.state.epoch();
        let Some(slot) = self.watchpoints.slots().first().copied() else {
            // Nothing was watched: fall back to what the scan itself saw.
            let first = self.failed_scan.lock().first().copied();
            let mut r = match first {
                Some(finding) => finding.report(epoch),
                None => FaultReport::new(FaultKind::Internal, epoch, msg),
            };
            r.message = msg.to_string();
            return r;
        };
        let kind = if slot.kind.contains(FaultKinds::USE_AFTER_FREE) {
            FaultKind::UseAfterFree
        } else {
            FaultKind::Overflow
        };
        let r = FaultReport::new(kind, epoch, msg)
            .with_address(slot.addr)
            .with_observed(slot.observed);
        if slot.object_size > 0 {
            r.with_object(slot.object_start, slot.object_size)
        } else {
            r
        }
    }

    /// Report everything but the first, then terminate with the first.
    fn deliver(&self, reports: Vec<FaultReport>) -> ! {
        let mut reports = reports.into_iter();
        let Some(first) = reports.next() else {
            self.fatal(GuardError::PhaseTransition {
                from: EpochPhase::Checking.as_str(),
                to: "report",
            });
        };
        for r in reports {
            self.deps.sink.report(&r);
        }
        self.deps.sink.terminate(&first)
    }

    // ---- program exit ---------------------------------------------------

    /// Final epoch end at program exit, followed by a drain of every
    /// quarantine.
    pub fn teardown(&self, me: &ThreadRecord) {
        self.epoch_end(me, true);
        let mut found = Vec::new();
        for t in self.registry.alive() {
            let limit = FINAL_DRAIN_LIMIT.saturating_sub(found.len());
            let (released, uafs) = t.quarantine().drain_checked(limit);
            for obj in &released {
                self.heap.release(obj);
            }
            found.extend(uafs);
        }
        if !found.is_empty() {
            let epoch = self.state.epoch();
            self.deliver(
                found
                    .iter()
                    .map(|u| Finding::UseAfterFree(*u).report(epoch))
                    .collect(),
            );
        }
        self.epoch_begin(me);
        let m = global_metrics();
        info!(
            epochs = m.epochs.load(Ordering::Relaxed),
            commits = m.commits.load(Ordering::Relaxed),
            rollbacks = m.rollbacks.load(Ordering::Relaxed),
            "engine torn down"
        );
    }

    // ---- heap -----------------------------------------------------------

    fn heap_entry(&self, me: &ThreadRecord) {
        self.safe_point(me);
        if self.state.is_replaying() {
            self.deps.watch.poll();
        }
    }

    pub fn malloc(&self, me: &ThreadRecord, size: usize) -> Option<usize> {
        self.intercept(|e| {
            e.heap_entry(me);
            let p = e.heap.malloc(size)?;
            if e.state.is_replaying() {
                e.tracker.on_allocation(p);
            }
            Some(p)
        })
    }

    pub fn calloc(&self, me: &ThreadRecord, n: usize, size: usize) -> Option<usize> {
        self.intercept(|e| {
            e.heap_entry(me);
            let p = e.heap.calloc(n, size)?;
            if e.state.is_replaying() {
                e.tracker.on_allocation(p);
            }
            Some(p)
        })
    }

    pub fn memalign(&self, me: &ThreadRecord, boundary: usize, size: usize) -> Option<usize> {
        self.intercept(|e| {
            e.heap_entry(me);
            let p = e.heap.memalign(boundary, size)?;
            if e.state.is_replaying() {
                e.tracker.on_allocation(e.heap.resolve_payload(p));
            }
            Some(p)
        })
    }

    /// `Err` carries the errno `posix_memalign` returns.
    pub fn posix_memalign(&self, me: &ThreadRecord, boundary: usize, size: usize) -> std::result::Result<usize, i32> {
        if !boundary.is_power_of_two() || boundary % std::mem::size_of::<usize>() != 0 {
            return Err(libc::EINVAL);
        }
        self.memalign(me, boundary, size).ok_or(libc::ENOMEM)
    }

    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> usize {
        self.heap.usable_size(ptr).unwrap_or(0)
    }

    /// Free `ptr`. The block waits in the thread's quarantine; corruption
    /// found on the way ends the epoch at once.
    pub fn free(&self, me: &ThreadRecord, ptr: usize) {
        let corrupted = self.intercept(|e| {
            e.heap_entry(me);
            if ptr == 0 {
                return false;
            }
            if e.state.is_replaying() {
                e.tracker.on_free(e.heap.resolve_payload(ptr));
            }
            match e.heap.free(ptr) {
                FreeOutcome::Freed(obj) => {
                    // SAFETY: `obj` was just freed by this heap and has not
                    // been released.
                    let outcome = unsafe { me.quarantine().push(obj) };
                    for old in &outcome.released {
                        e.heap.release(old);
                    }
                    if let Some(big) = outcome.rejected {
                        e.heap.release(&big);
                    }
                    match outcome.corrupted {
                        Some(uaf) => {
                            e.pending.lock().push(Finding::UseAfterFree(uaf));
                            true
                        }
                        None => false,
                    }
                }
                // The epoch-end scan sees the broken canary again.
                FreeOutcome::Overflow(_) => true,
                FreeOutcome::Invalid(bad) => {
                    debug!(?bad, "invalid free ignored");
                    false
                }
            }
        });
        if corrupted {
            self.epoch_end(me, false);
            self.epoch_begin(me);
        }
    }

    /// `realloc` semantics: null allocates, size 0 frees.
    pub fn realloc(&self, me: &ThreadRecord, ptr: usize, size: usize) -> Option<usize> {
        if ptr == 0 {
            return self.malloc(me, size);
        }
        if size == 0 {
            self.free(me, ptr);
            return None;
        }
        let resized = self.intercept(|e| {
            e.heap_entry(me);
            e.heap.try_resize_in_place(ptr, size)
        });
        if resized {
            return Some(ptr);
        }
        let old = self.heap.usable_size(ptr)?;
        let new = self.malloc(me, size)?;
        // SAFETY: both are live payloads of at least `old.min(size)` bytes
        // and distinct blocks.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, new as *mut u8, old.min(size));
        }
        self.free(me, ptr);
        Some(new)
    }

    // ---- threads --------------------------------------------------------

    /// Intercepted thread creation, called by the creating thread.
    pub fn thread_spawned(&self, me: &ThreadRecord) -> Spawn {
        let _deferred = signals::defer();
        self.safe_point(me);
        self.sync.spawn_lock(me, self);
        self.sync.order_spawn(me, self);
        let spawn = if self.state.is_replaying() {
            let index = self.gateway.replay_clone(me, self);
            let Some(child) = self.registry.get(index) else {
                self.sync.spawn_unlock(me);
                self.fatal(GuardError::ReplayDivergence {
                    thread: me.index(),
                    detail: format!("replayed creation names unknown thread {index}"),
                });
            };
            child.set_status(ThreadStatus::Running);
            Spawn::Replayed(child)
        } else {
            let child = match self.registry.allocate(StackBounds::new(0, 0)) {
                Ok(child) => child,
                Err(e) => {
                    self.sync.spawn_unlock(me);
                    self.fatal(e);
                }
            };
            self.gateway.record_clone(me, self, child.index());
            child.set_status(ThreadStatus::Running);
            Spawn::Fresh(child)
        };
        self.sync.spawn_unlock(me);
        debug!(parent = me.index(), child = spawn.record().index(), "thread spawned");
        spawn
    }

    /// First thing a new thread runs. Its checkpoint is its entry point.
    pub fn thread_started(&self, record: &Arc<ThreadRecord>, bounds: StackBounds) {
        record.attach_current();
        record.set_stack(bounds);
        thread::set_current(Some(Arc::clone(record)));
        if signals::is_installed() {
            let prepared = signals::prepare_thread();
            self.or_fatal(prepared);
        }
        self.save_context(record);
        // Wait out a boundary that is already running.
        self.acquire_boundary(record);
        self.release_boundary();
        record.wait_status(record, self, |s| s != ThreadStatus::Starting);
    }

    /// The thread's start routine returned.
    pub fn thread_exit(&self, me: &ThreadRecord) {
        me.set_status(ThreadStatus::Exiting);
        self.epoch_end(me, false);
        me.set_status(ThreadStatus::WaitForJoining);
        self.epoch_begin(me);
        thread::set_current(None);
        signals::release_thread();
    }

    /// Returns 0 or an errno value.
    pub fn thread_join(&self, me: &ThreadRecord, target: &Arc<ThreadRecord>) -> i32 {
        self.safe_point(me);
        if target.index() == me.index() {
            return libc::EDEADLK;
        }
        me.set_status(ThreadStatus::Joining);
        let waker: Arc<dyn Wakeable> = target.clone();
        me.set_blocked_on(Some(waker));
        let status = target.wait_status(me, self, |s| s.is_finished() && s != ThreadStatus::Exiting);
        me.set_blocked_on(None);
        me.set_status(ThreadStatus::Running);
        match status {
            ThreadStatus::WaitForJoining => {
                target.mark_joined();
                target.set_status(ThreadStatus::WaitForReaping);
                0
            }
            // A replayed join of a thread the first pass already joined.
            _ if self.state.is_replaying() => 0,
            _ => libc::EINVAL,
        }
    }
}

impl QuiesceHook for EpochCoordinator {
    fn safe_point(&self, me: &ThreadRecord) {
        if !me.take_quiesce_request() {
            return;
        }
        let here = 0usize;
        let regs = self.deps.trampoline.capture();
        me.note_stop(std::ptr::addr_of!(here) as usize, Some(regs));
        match self.barrier.arrive() {
            Decision::Commit => self.save_context(me),
            Decision::Rollback => match me.rollback_context(&*self.deps.trampoline) {
                Ok(never) => match never {},
                Err(e) => self.fatal(e),
            },
        }
    }

    fn fatal(&self, err: GuardError) -> ! {
        error!(error = %err, epoch = self.state.epoch(), "engine invariant broken");
        self.deps
            .sink
            .terminate(&FaultReport::internal(self.state.epoch(), &err))
    }
}

impl EpochControl for EpochCoordinator {
    fn end_epoch(&self, me: &ThreadRecord) {
        self.epoch_end(me, false);
    }

    fn begin_epoch(&self, me: &ThreadRecord) {
        self.epoch_begin(me);
    }

    fn commit_output(&self, addr: usize, len: usize) {
        for map in self.maps.lock().iter_mut() {
            map.commit(addr, len);
        }
    }
}
