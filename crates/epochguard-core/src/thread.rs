//! Thread records and the registry that pools them.
//!
//! A record carries everything the engine keeps per thread: its logs, its
//! checkpoint, its quarantine ring and the semaphore used for replay
//! hand-off. Indices are small integers handed out from a free list and
//! reused after the thread is reaped.

use std::cell::RefCell;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use epochguard_membrane::{
    ContextSnapshot, GuardError, Quarantine, RegisterImage, Result, StackBounds, StackTrampoline,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::event_log::{RecordLog, SYNC_LOG_CAPACITY, SYSCALL_LOG_CAPACITY, SyncEvent};
use crate::quiesce::QuiesceHook;
use crate::syscall::SyscallRecord;

pub const MAX_THREADS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// Created; waits until its creator has recorded the creation.
    Starting,
    Running,
    /// Blocked in a join.
    Joining,
    /// Returned from its start routine.
    Exiting,
    CondWaiting,
    /// Told to resume at its checkpoint.
    Rollback,
    /// Exited, nobody joined it yet.
    WaitForJoining,
    /// Joined; the record is freed at the next epoch begin.
    WaitForReaping,
}

impl ThreadStatus {
    /// Threads that no longer run program code and are not quiesced.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Exiting | Self::WaitForJoining | Self::WaitForReaping)
    }
}

/// Something a blocked thread waits on that the coordinator can poke.
pub trait Wakeable: Send + Sync {
    /// Wake every waiter so it rechecks its quiesce flag.
    fn wake(&self);
}

/// Counting semaphore for replay hand-off.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }

    /// Take one unit, leaving for a safe point whenever `me` is asked to
    /// quiesce.
    pub fn wait(&self, me: &ThreadRecord, hook: &dyn QuiesceHook) {
        let mut count = wait_interruptible(me, hook, &self.count, &self.cv, |c| *c == 0);
        *count -= 1;
    }

    pub fn reset(&self) {
        *self.count.lock() = 0;
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }
}

impl Wakeable for Semaphore {
    fn wake(&self) {
        let _count = self.count.lock();
        self.cv.notify_all();
    }
}

/// Wait on `cv` while `blocked` holds. Whenever `me` has a pending quiesce
/// request the lock is dropped and `hook.safe_point` runs; the wait then
/// resumes with the predicate rechecked.
pub(crate) fn wait_interruptible<'a, T>(
    me: &ThreadRecord,
    hook: &dyn QuiesceHook,
    lock: &'a Mutex<T>,
    cv: &Condvar,
    mut blocked: impl FnMut(&mut T) -> bool,
) -> MutexGuard<'a, T> {
    let mut guard = lock.lock();
    while blocked(&mut guard) {
        if me.quiesce_pending() {
            MutexGuard::unlocked(&mut guard, || hook.safe_point(me));
            continue;
        }
        cv.wait(&mut guard);
    }
    guard
}

/// A thread's synchronization log and the events whose turn arrived early.
pub(crate) struct ThreadSyncLog {
    pub(crate) log: RecordLog<SyncEvent>,
    /// Slots signalled before this thread reached them.
    pub(crate) pending: Vec<u32>,
}

pub struct ThreadRecord {
    index: u32,
    tid: AtomicI32,
    pthread: AtomicU64,
    status: Mutex<ThreadStatus>,
    status_cv: Condvar,
    newly_spawned: AtomicBool,
    joined: AtomicBool,
    quiesce_requested: AtomicBool,
    /// Stack pointer and registers where the thread last stopped.
    stop_sp: AtomicUsize,
    stop_regs: Mutex<Option<RegisterImage>>,
    pub(crate) sema: Semaphore,
    pub(crate) sync: Mutex<ThreadSyncLog>,
    pub(crate) syscalls: Mutex<RecordLog<SyscallRecord>>,
    quarantine: Mutex<Quarantine>,
    context: Mutex<ContextSnapshot>,
    blocked_on: Mutex<Option<Arc<dyn Wakeable>>>,
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("index", &self.index)
            .field("tid", &self.tid())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ThreadRecord {
    fn new(index: u32, bounds: StackBounds, quarantine: Quarantine) -> Self {
        Self {
            index,
            tid: AtomicI32::new(0),
            pthread: AtomicU64::new(0),
            status: Mutex::new(ThreadStatus::Starting),
            status_cv: Condvar::new(),
            newly_spawned: AtomicBool::new(true),
            joined: AtomicBool::new(false),
            quiesce_requested: AtomicBool::new(false),
            stop_sp: AtomicUsize::new(0),
            stop_regs: Mutex::new(None),
            sema: Semaphore::new(),
            sync: Mutex::new(ThreadSyncLog {
                log: RecordLog::new(SYNC_LOG_CAPACITY),
                pending: Vec::new(),
            }),
            syscalls: Mutex::new(RecordLog::new(SYSCALL_LOG_CAPACITY)),
            quarantine: Mutex::new(quarantine),
            context: Mutex::new(ContextSnapshot::new(index, bounds)),
            blocked_on: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn tid(&self) -> libc::pid_t {
        self.tid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pthread(&self) -> libc::pthread_t {
        self.pthread.load(Ordering::Acquire) as libc::pthread_t
    }

    /// Bind the record to the calling OS thread.
    pub fn attach_current(&self) {
        self.tid.store(current_tid(), Ordering::Release);
        self.pthread.store(current_pthread() as u64, Ordering::Release);
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ThreadStatus) {
        *self.status.lock() = status;
        self.status_cv.notify_all();
    }

    /// Block until `done` accepts the status.
    pub fn wait_for_status(&self, mut done: impl FnMut(ThreadStatus) -> bool) -> ThreadStatus {
        let mut status = self.status.lock();
        while !done(*status) {
            self.status_cv.wait(&mut status);
        }
        *status
    }

    #[must_use]
    pub fn is_newly_spawned(&self) -> bool {
        self.newly_spawned.load(Ordering::Acquire)
    }

    pub(crate) fn set_newly_spawned(&self, on: bool) {
        self.newly_spawned.store(on, Ordering::Release);
    }

    #[must_use]
    pub fn has_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    pub(crate) fn mark_joined(&self) {
        self.joined.store(true, Ordering::Release);
    }

    pub fn request_quiesce(&self) {
        self.quiesce_requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn quiesce_pending(&self) -> bool {
        self.quiesce_requested.load(Ordering::Acquire)
    }

    /// Claim a pending quiesce request. Exactly one caller wins per request.
    pub fn take_quiesce_request(&self) -> bool {
        self.quiesce_requested.swap(false, Ordering::AcqRel)
    }

    /// Wake the thread out of whatever engine wait it is in.
    pub fn interrupt(&self) {
        self.sema.wake();
        if let Some(waker) = self.blocked_on.lock().clone() {
            waker.wake();
        }
    }

    pub(crate) fn set_blocked_on(&self, waker: Option<Arc<dyn Wakeable>>) {
        *self.blocked_on.lock() = waker;
    }

    /// Remember where the thread stopped so a leak scan can read its live
    /// stack. Safe to call from a signal handler.
    pub(crate) fn note_stop(&self, sp: usize, regs: Option<RegisterImage>) {
        self.stop_sp.store(sp, Ordering::Release);
        if let Some(mut slot) = self.stop_regs.try_lock() {
            *slot = regs;
        }
    }

    /// Stack pointer at the last stop, 0 if the thread never stopped.
    #[must_use]
    pub fn stop_sp(&self) -> usize {
        self.stop_sp.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stop_registers(&self) -> Vec<usize> {
        self.stop_regs
            .lock()
            .as_ref()
            .map(RegisterImage::general_registers)
            .unwrap_or_default()
    }

    pub fn quarantine(&self) -> MutexGuard<'_, Quarantine> {
        self.quarantine.lock()
    }

    pub fn context(&self) -> MutexGuard<'_, ContextSnapshot> {
        self.context.lock()
    }

    /// Non-blocking access for the quiesce signal handler.
    pub fn try_context(&self) -> Option<MutexGuard<'_, ContextSnapshot>> {
        self.context.try_lock()
    }

    /// Replace the checkpoint buffer once the thread knows its own stack.
    pub fn set_stack(&self, bounds: StackBounds) {
        *self.context.lock() = ContextSnapshot::new(self.index, bounds);
    }

    /// Resume at the saved checkpoint. Only returns on error.
    #[allow(unsafe_code)]
    pub fn rollback_context(&self, trampoline: &dyn StackTrampoline) -> Result<Infallible> {
        let guard = self.context.lock();
        let snapshot: *const ContextSnapshot = &*guard;
        // A successful resume never returns here to drop the guard.
        std::mem::forget(guard);
        // SAFETY: the guard was forgotten above, so this thread holds the
        // lock. Only the owning thread (and its own signal handler, which
        // cannot run rollback concurrently with itself) touches the
        // snapshot, and the record outlives the call.
        unsafe {
            self.context.force_unlock();
            (*snapshot).rollback(trampoline)
        }
    }

    /// Wait until `done` accepts this thread's status, staying responsive
    /// to quiesce requests sent to `me`.
    pub(crate) fn wait_status(
        &self,
        me: &ThreadRecord,
        hook: &dyn QuiesceHook,
        mut done: impl FnMut(ThreadStatus) -> bool,
    ) -> ThreadStatus {
        let status = wait_interruptible(me, hook, &self.status, &self.status_cv, |s| !done(*s));
        *status
    }

    /// Drop every logged event; the epoch that produced them committed.
    pub fn clear_logs(&self) {
        let mut sync = self.sync.lock();
        sync.log.clear();
        sync.pending.clear();
        drop(sync);
        self.syscalls.lock().clear();
        self.sema.reset();
    }

    /// Rewind both logs for a replay pass.
    pub fn rewind_logs(&self) {
        let mut sync = self.sync.lock();
        sync.log.rewind();
        sync.pending.clear();
        drop(sync);
        self.syscalls.lock().rewind();
        self.sema.reset();
    }

    #[must_use]
    pub fn sync_events(&self) -> usize {
        self.sync.lock().log.len()
    }

    #[must_use]
    pub fn syscall_records(&self) -> usize {
        self.syscalls.lock().len()
    }
}

impl Wakeable for ThreadRecord {
    fn wake(&self) {
        let _status = self.status.lock();
        self.status_cv.notify_all();
    }
}

#[allow(unsafe_code)]
fn current_tid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() }
}

#[allow(unsafe_code)]
fn current_pthread() -> libc::pthread_t {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() }
}

struct RegistryInner {
    slots: Vec<Option<Arc<ThreadRecord>>>,
    free: Vec<u32>,
}

pub struct ThreadRegistry {
    inner: Mutex<RegistryInner>,
    quarantine_slots: usize,
    quarantine_bytes: usize,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(quarantine_slots: usize, quarantine_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                slots: Vec::with_capacity(MAX_THREADS),
                free: Vec::new(),
            }),
            quarantine_slots,
            quarantine_bytes,
        }
    }

    /// Take a record from the pool.
    pub fn allocate(&self, bounds: StackBounds) -> Result<Arc<ThreadRecord>> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None if inner.slots.len() < MAX_THREADS => {
                inner.slots.push(None);
                (inner.slots.len() - 1) as u32
            }
            None => return Err(GuardError::ThreadPoolExhausted { limit: MAX_THREADS }),
        };
        let record = Arc::new(ThreadRecord::new(
            index,
            bounds,
            Quarantine::new(self.quarantine_slots, self.quarantine_bytes),
        ));
        inner.slots[index as usize] = Some(Arc::clone(&record));
        debug!(thread = index, "thread record allocated");
        Ok(record)
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<Arc<ThreadRecord>> {
        self.inner.lock().slots.get(index as usize).cloned().flatten()
    }

    /// Every record not yet returned to the pool, by index.
    #[must_use]
    pub fn alive(&self) -> Vec<Arc<ThreadRecord>> {
        self.inner.lock().slots.iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }

    /// Return joined threads to the pool. Called at epoch begin, when no
    /// replay can reference them any more.
    pub fn reap_joined(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut reaped = Vec::new();
        for slot in inner.slots.iter_mut() {
            let done = slot
                .as_ref()
                .is_some_and(|t| t.has_joined() && t.status() == ThreadStatus::WaitForReaping);
            if done {
                if let Some(t) = slot.take() {
                    reaped.push(t.index());
                }
            }
        }
        let count = reaped.len();
        inner.free.extend(reaped);
        if count > 0 {
            debug!(count, "threads reaped");
        }
        count
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// Bind (or unbind) the calling thread's record.
pub fn set_current(record: Option<Arc<ThreadRecord>>) {
    CURRENT.with(|c| *c.borrow_mut() = record);
}

/// The calling thread's record, if it registered.
#[must_use]
pub fn current() -> Option<Arc<ThreadRecord>> {
    CURRENT
        .try_with(|c| c.try_borrow().ok().and_then(|r| r.clone()))
        .ok()
        .flatten()
}
