//! Shadow synchronization objects and their deterministic replay.
//!
//! Each program mutex, condition variable and barrier is identified by its
//! address and mapped, on first use, to a private shadow plus an
//! [`EventList`]. In normal execution the shadow does the real blocking and
//! every acquisition appends one event to the acting thread's log and one
//! handle to the object's list, in acquisition order.
//!
//! In replay nothing is acquired. A thread whose next event is on an object
//! waits on its own semaphore until the previous holder in that object's
//! list passes the turn on. A turn passed before the thread got there is
//! parked in the thread's pending set and consumed when it arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use epochguard_membrane::{GuardError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::event_log::{EventHandle, EventList, SyncEvent};
use crate::quiesce::QuiesceHook;
use crate::state::EpochState;
use crate::thread::{ThreadRecord, ThreadRegistry, ThreadStatus, Wakeable, wait_interruptible};

/// Id of the list that orders thread creation.
pub const SPAWN_LIST: u32 = 0;

#[derive(Default)]
pub struct ShadowMutex {
    owner: Mutex<Option<u32>>,
    cv: Condvar,
}

impl ShadowMutex {
    fn lock(&self, me: &ThreadRecord, hook: &dyn QuiesceHook) -> i32 {
        if *self.owner.lock() == Some(me.index()) {
            return libc::EDEADLK;
        }
        let mut owner = wait_interruptible(me, hook, &self.owner, &self.cv, |o| o.is_some());
        *owner = Some(me.index());
        0
    }

    fn try_lock(&self, me: &ThreadRecord) -> i32 {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return libc::EBUSY;
        }
        *owner = Some(me.index());
        0
    }

    fn unlock(&self, me: &ThreadRecord) -> i32 {
        let mut owner = self.owner.lock();
        if *owner != Some(me.index()) {
            return libc::EPERM;
        }
        *owner = None;
        self.cv.notify_one();
        0
    }
}

impl Wakeable for ShadowMutex {
    fn wake(&self) {
        let _owner = self.owner.lock();
        self.cv.notify_all();
    }
}

#[derive(Default)]
pub struct ShadowCond {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl ShadowCond {
    /// Release `mutex`, wait for a signal, reacquire.
    fn wait(&self, me: &ThreadRecord, hook: &dyn QuiesceHook, mutex: &ShadowMutex) -> i32 {
        let mut seq = self.seq.lock();
        let start = *seq;
        let rc = mutex.unlock(me);
        if rc != 0 {
            return rc;
        }
        while *seq == start {
            if me.quiesce_pending() {
                MutexGuard::unlocked(&mut seq, || hook.safe_point(me));
                continue;
            }
            self.cv.wait(&mut seq);
        }
        drop(seq);
        mutex.lock(me, hook)
    }

    fn signal(&self, all: bool) {
        *self.seq.lock() += 1;
        if all {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
    }
}

impl Wakeable for ShadowCond {
    fn wake(&self) {
        let _seq = self.seq.lock();
        self.cv.notify_all();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BarrierState {
    count: u32,
    arrived: u32,
    generation: u64,
}

/// Two-phase barrier: arrival bumps `arrived`, the last arrival opens a new
/// generation and everyone waiting on the old one departs.
#[derive(Default)]
pub struct ShadowBarrier {
    state: Mutex<BarrierState>,
    saved: Mutex<BarrierState>,
    cv: Condvar,
}

impl ShadowBarrier {
    fn new(count: u32) -> Self {
        let state = BarrierState {
            count,
            ..BarrierState::default()
        };
        Self {
            state: Mutex::new(state),
            saved: Mutex::new(state),
            cv: Condvar::new(),
        }
    }

    fn wait(&self, me: &ThreadRecord, hook: &dyn QuiesceHook) -> i32 {
        let mut s = self.state.lock();
        s.arrived += 1;
        if s.arrived >= s.count {
            s.arrived = 0;
            s.generation += 1;
            self.cv.notify_all();
            return libc::PTHREAD_BARRIER_SERIAL_THREAD;
        }
        let generation = s.generation;
        drop(s);
        let _departed = wait_interruptible(me, hook, &self.state, &self.cv, |s| {
            s.generation == generation
        });
        0
    }

    fn backup(&self) {
        *self.saved.lock() = *self.state.lock();
    }

    fn restore(&self) {
        *self.state.lock() = *self.saved.lock();
    }
}

impl Wakeable for ShadowBarrier {
    fn wake(&self) {
        let _s = self.state.lock();
        self.cv.notify_all();
    }
}

#[derive(Clone)]
pub enum Shadow {
    Mutex(Arc<ShadowMutex>),
    Cond(Arc<ShadowCond>),
    Barrier(Arc<ShadowBarrier>),
}

impl Shadow {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Mutex(_) => "mutex",
            Self::Cond(_) => "cond",
            Self::Barrier(_) => "barrier",
        }
    }
}

pub struct SyncEntry {
    id: u32,
    shadow: Shadow,
    events: Mutex<EventList>,
}

impl SyncEntry {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn recorded(&self) -> usize {
        self.events.lock().len()
    }
}

#[derive(Default)]
struct Objects {
    by_addr: HashMap<usize, Arc<SyncEntry>>,
    by_id: HashMap<u32, Arc<SyncEntry>>,
}

pub struct SyncCoordinator {
    state: Arc<EpochState>,
    registry: Arc<ThreadRegistry>,
    objects: Mutex<Objects>,
    spawns: Arc<SyncEntry>,
    next_id: AtomicU32,
    /// Destroyed objects, forgotten at the next epoch begin.
    doomed: Mutex<Vec<usize>>,
}

fn divergence(me: &ThreadRecord, detail: String) -> GuardError {
    GuardError::ReplayDivergence {
        thread: me.index(),
        detail,
    }
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(state: Arc<EpochState>, registry: Arc<ThreadRegistry>) -> Self {
        let spawns = Arc::new(SyncEntry {
            id: SPAWN_LIST,
            shadow: Shadow::Mutex(Arc::new(ShadowMutex::default())),
            events: Mutex::new(EventList::new()),
        });
        let mut objects = Objects::default();
        objects.by_id.insert(SPAWN_LIST, Arc::clone(&spawns));
        Self {
            state,
            registry,
            objects: Mutex::new(objects),
            spawns,
            next_id: AtomicU32::new(SPAWN_LIST + 1),
            doomed: Mutex::new(Vec::new()),
        }
    }

    /// Entry for `addr` whose shadow `pick` accepts. An entry of another
    /// kind at the same address is replaced: the memory was reused for a
    /// different object.
    fn entry<T>(
        &self,
        addr: usize,
        pick: impl Fn(&Shadow) -> Option<T>,
        make: impl FnOnce() -> (Shadow, T),
    ) -> (Arc<SyncEntry>, T) {
        let mut objects = self.objects.lock();
        if let Some(e) = objects.by_addr.get(&addr)
            && let Some(shadow) = pick(&e.shadow)
        {
            return (Arc::clone(e), shadow);
        }
        let (shadow, picked) = make();
        let entry = Arc::new(SyncEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shadow,
            events: Mutex::new(EventList::new()),
        });
        trace!(addr, id = entry.id, kind = entry.shadow.kind(), "shadow created");
        if let Some(old) = objects.by_addr.insert(addr, Arc::clone(&entry)) {
            debug!(addr, old = old.shadow.kind(), new = entry.shadow.kind(), "shadow replaced");
        }
        objects.by_id.insert(entry.id, Arc::clone(&entry));
        (entry, picked)
    }

    fn mutex_entry(&self, addr: usize) -> (Arc<SyncEntry>, Arc<ShadowMutex>) {
        self.entry(
            addr,
            |s| match s {
                Shadow::Mutex(m) => Some(Arc::clone(m)),
                _ => None,
            },
            || {
                let m = Arc::new(ShadowMutex::default());
                (Shadow::Mutex(Arc::clone(&m)), m)
            },
        )
    }

    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<Arc<SyncEntry>> {
        self.objects.lock().by_addr.get(&addr).cloned()
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().by_addr.len()
    }

    fn replaying(&self) -> bool {
        self.state.is_replaying()
    }

    // ---- logging ------------------------------------------------------

    fn record(&self, me: &ThreadRecord, entry: &SyncEntry, ret: i32) -> Result<()> {
        let slot = me.sync.lock().log.push(SyncEvent {
            list: entry.id,
            ret,
        })?;
        entry.events.lock().record(EventHandle {
            thread: me.index(),
            slot: slot as u32,
        });
        Ok(())
    }

    /// Give the owner of `ev` its turn, or park it if the owner is not
    /// there yet.
    fn signal_next(&self, ev: EventHandle) {
        let Some(target) = self.registry.get(ev.thread) else {
            return;
        };
        let mut sync = target.sync.lock();
        if sync.log.cursor() == ev.slot as usize {
            drop(sync);
            target.sema.post();
        } else {
            sync.pending.push(ev.slot);
        }
    }

    /// Recorded result of `me`'s next event, which must be on `entry`.
    fn peek(&self, me: &ThreadRecord, entry: &SyncEntry) -> Result<i32> {
        let mut sync = me.sync.lock();
        let cursor = sync.log.cursor();
        let ev = *sync.log.peek().ok_or_else(|| {
            divergence(me, format!("no logged event left for list {}", entry.id))
        })?;
        if ev.list != entry.id {
            return Err(divergence(
                me,
                format!("next event is on list {}, not {}", ev.list, entry.id),
            ));
        }
        if let Some(at) = sync.pending.iter().position(|&s| s as usize == cursor) {
            sync.pending.swap_remove(at);
            drop(sync);
            me.sema.post();
        }
        Ok(ev.ret)
    }

    fn advance_thread(&self, me: &ThreadRecord) {
        me.sync.lock().log.advance();
    }

    fn pass_turn(&self, entry: &SyncEntry) {
        let next = entry.events.lock().advance();
        if let Some(next) = next {
            self.signal_next(next);
        }
    }

    /// Wait for the turn on `entry`, consume the event and hand the turn
    /// straight on.
    fn replay_passing(
        &self,
        me: &ThreadRecord,
        entry: &SyncEntry,
        hook: &dyn QuiesceHook,
    ) -> Result<i32> {
        let ret = self.peek(me, entry)?;
        me.sema.wait(me, hook);
        self.advance_thread(me);
        self.pass_turn(entry);
        Ok(ret)
    }

    fn or_fatal<T>(hook: &dyn QuiesceHook, r: Result<T>) -> T {
        r.unwrap_or_else(|e| hook.fatal(e))
    }

    // ---- mutexes ------------------------------------------------------

    pub fn mutex_init(&self, addr: usize) -> i32 {
        self.mutex_entry(addr);
        0
    }

    pub fn mutex_lock(&self, me: &ThreadRecord, addr: usize, hook: &dyn QuiesceHook) -> i32 {
        hook.safe_point(me);
        let (entry, shadow) = self.mutex_entry(addr);
        if self.replaying() {
            let r = self.peek(me, &entry).map(|ret| {
                me.sema.wait(me, hook);
                self.advance_thread(me);
                if ret != 0 {
                    self.pass_turn(&entry);
                }
                ret
            });
            return Self::or_fatal(hook, r);
        }
        me.set_blocked_on(Some(shadow.clone() as Arc<dyn Wakeable>));
        let ret = shadow.lock(me, hook);
        me.set_blocked_on(None);
        Self::or_fatal(hook, self.record(me, &entry, ret));
        ret
    }

    pub fn mutex_trylock(&self, me: &ThreadRecord, addr: usize, hook: &dyn QuiesceHook) -> i32 {
        hook.safe_point(me);
        let (entry, shadow) = self.mutex_entry(addr);
        if self.replaying() {
            let r = self.peek(me, &entry).map(|ret| {
                me.sema.wait(me, hook);
                self.advance_thread(me);
                if ret != 0 {
                    self.pass_turn(&entry);
                }
                ret
            });
            return Self::or_fatal(hook, r);
        }
        let ret = shadow.try_lock(me);
        Self::or_fatal(hook, self.record(me, &entry, ret));
        ret
    }

    pub fn mutex_unlock(&self, me: &ThreadRecord, addr: usize, hook: &dyn QuiesceHook) -> i32 {
        let (entry, shadow) = self.mutex_entry(addr);
        if self.replaying() {
            self.pass_turn(&entry);
            return 0;
        }
        let ret = shadow.unlock(me);
        hook.safe_point(me);
        ret
    }

    /// Forget the object at the next epoch begin.
    pub fn destroy(&self, addr: usize) -> i32 {
        self.doomed.lock().push(addr);
        0
    }

    // ---- condition variables ------------------------------------------

    pub fn cond_init(&self, addr: usize) -> i32 {
        self.cond_shadow(addr);
        0
    }

    fn cond_shadow(&self, addr: usize) -> Arc<ShadowCond> {
        let (_, shadow) = self.entry(
            addr,
            |s| match s {
                Shadow::Cond(c) => Some(Arc::clone(c)),
                _ => None,
            },
            || {
                let c = Arc::new(ShadowCond::default());
                (Shadow::Cond(Arc::clone(&c)), c)
            },
        );
        shadow
    }

    /// The reacquisition of `mutex` is what gets logged, on the mutex's list.
    pub fn cond_wait(
        &self,
        me: &ThreadRecord,
        cond: usize,
        mutex: usize,
        hook: &dyn QuiesceHook,
    ) -> i32 {
        let (entry, shadow_mutex) = self.mutex_entry(mutex);
        if self.replaying() {
            let r = self.peek(me, &entry).map(|ret| {
                if ret == 0 {
                    self.pass_turn(&entry);
                }
                me.sema.wait(me, hook);
                self.advance_thread(me);
                if ret != 0 {
                    self.pass_turn(&entry);
                }
                ret
            });
            return Self::or_fatal(hook, r);
        }
        let shadow = self.cond_shadow(cond);
        me.set_status(ThreadStatus::CondWaiting);
        me.set_blocked_on(Some(shadow.clone() as Arc<dyn Wakeable>));
        let ret = shadow.wait(me, hook, &shadow_mutex);
        me.set_blocked_on(None);
        me.set_status(ThreadStatus::Running);
        Self::or_fatal(hook, self.record(me, &entry, ret));
        ret
    }

    pub fn cond_signal(&self, cond: usize) -> i32 {
        if !self.replaying() {
            self.cond_shadow(cond).signal(false);
        }
        0
    }

    pub fn cond_broadcast(&self, cond: usize) -> i32 {
        if !self.replaying() {
            self.cond_shadow(cond).signal(true);
        }
        0
    }

    // ---- barriers -----------------------------------------------------

    pub fn barrier_init(&self, addr: usize, count: u32) -> i32 {
        if count == 0 {
            return libc::EINVAL;
        }
        // Re-initialization during replay keeps the logged entry.
        self.entry(
            addr,
            |s| matches!(s, Shadow::Barrier(_)).then_some(()),
            || (Shadow::Barrier(Arc::new(ShadowBarrier::new(count))), ()),
        );
        0
    }

    pub fn barrier_wait(&self, me: &ThreadRecord, addr: usize, hook: &dyn QuiesceHook) -> i32 {
        hook.safe_point(me);
        let Some(entry) = self.lookup(addr) else {
            return libc::EINVAL;
        };
        let Shadow::Barrier(shadow) = entry.shadow.clone() else {
            return libc::EINVAL;
        };
        me.set_blocked_on(Some(shadow.clone() as Arc<dyn Wakeable>));
        let ret = if self.replaying() {
            let r = self.replay_passing(me, &entry, hook).map(|ret| {
                shadow.wait(me, hook);
                ret
            });
            Self::or_fatal(hook, r)
        } else {
            let ret = shadow.wait(me, hook);
            Self::or_fatal(hook, self.record(me, &entry, ret));
            ret
        };
        me.set_blocked_on(None);
        ret
    }

    // ---- thread creation ------------------------------------------------

    /// Serialize thread creation so replay creates threads in the same
    /// order.
    pub fn order_spawn(&self, me: &ThreadRecord, hook: &dyn QuiesceHook) {
        let r = if self.replaying() {
            self.replay_passing(me, &self.spawns, hook).map(|_| ())
        } else {
            self.record(me, &self.spawns, 0)
        };
        Self::or_fatal(hook, r);
    }

    /// Hold the creation order lock around the real thread creation.
    pub fn spawn_lock(&self, me: &ThreadRecord, hook: &dyn QuiesceHook) {
        if let Shadow::Mutex(m) = &self.spawns.shadow {
            m.lock(me, hook);
        }
    }

    pub fn spawn_unlock(&self, me: &ThreadRecord) {
        if let Shadow::Mutex(m) = &self.spawns.shadow {
            m.unlock(me);
        }
    }

    // ---- epoch hooks ----------------------------------------------------

    /// Drop destroyed objects and every list; remember barrier states.
    pub fn epoch_begin(&self) {
        let mut objects = self.objects.lock();
        for addr in self.doomed.lock().drain(..) {
            if let Some(e) = objects.by_addr.remove(&addr) {
                objects.by_id.remove(&e.id);
            }
        }
        for entry in objects.by_id.values() {
            entry.events.lock().clear();
            if let Shadow::Barrier(b) = &entry.shadow {
                b.backup();
            }
        }
    }

    /// Rewind every log and hand each object's first turn out.
    ///
    /// Every thread must be stopped.
    pub fn prepare_rollback(&self) {
        let threads = self.registry.alive();
        for t in &threads {
            t.rewind_logs();
        }
        let entries: Vec<Arc<SyncEntry>> = self.objects.lock().by_id.values().cloned().collect();
        let mut first_turns = 0usize;
        for entry in entries {
            if let Shadow::Barrier(b) = &entry.shadow {
                b.restore();
            }
            let first = entry.events.lock().prepare_rollback();
            if let Some(first) = first {
                self.signal_next(first);
                first_turns += 1;
            }
        }
        debug!(threads = threads.len(), first_turns, "sync replay prepared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EpochPhase;
    use epochguard_membrane::StackBounds;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Hook;
    impl QuiesceHook for Hook {
        fn safe_point(&self, me: &ThreadRecord) {
            me.take_quiesce_request();
        }
        fn fatal(&self, err: GuardError) -> ! {
            panic!("{err}")
        }
    }

    fn setup() -> (Arc<EpochState>, Arc<ThreadRegistry>, SyncCoordinator) {
        let state = Arc::new(EpochState::new());
        state.transition(EpochPhase::Begin, EpochPhase::Normal).unwrap();
        let registry = Arc::new(ThreadRegistry::new(4, 4096));
        let sync = SyncCoordinator::new(Arc::clone(&state), Arc::clone(&registry));
        (state, registry, sync)
    }

    fn thread(registry: &ThreadRegistry) -> Arc<ThreadRecord> {
        registry.allocate(StackBounds::new(0x1000, 0x2000)).unwrap()
    }

    #[test]
    fn address_reused_as_a_mutex_gets_one_shared_shadow() {
        let (_, registry, sync) = setup();
        let a = thread(&registry);
        let b = thread(&registry);
        assert_eq!(sync.cond_init(0x300), 0);
        let cond_id = sync.lookup(0x300).unwrap().id();

        assert_eq!(sync.mutex_lock(&a, 0x300, &Hook), 0);
        let entry = sync.lookup(0x300).unwrap();
        assert_ne!(entry.id(), cond_id);
        assert!(matches!(entry.shadow, Shadow::Mutex(_)));
        // Both threads see the same lock.
        assert_eq!(sync.mutex_trylock(&b, 0x300, &Hook), libc::EBUSY);
        assert_eq!(sync.mutex_unlock(&a, 0x300, &Hook), 0);
        assert_eq!(sync.mutex_trylock(&b, 0x300, &Hook), 0);
        assert_eq!(sync.lookup(0x300).unwrap().id(), entry.id());
    }

    #[test]
    fn trylock_records_busy_and_unlock_checks_owner() {
        let (_, registry, sync) = setup();
        let a = thread(&registry);
        let b = thread(&registry);
        assert_eq!(sync.mutex_lock(&a, 0x100, &Hook), 0);
        assert_eq!(sync.mutex_trylock(&b, 0x100, &Hook), libc::EBUSY);
        assert_eq!(sync.mutex_unlock(&b, 0x100, &Hook), libc::EPERM);
        assert_eq!(sync.mutex_unlock(&a, 0x100, &Hook), 0);
        assert_eq!(sync.lookup(0x100).unwrap().recorded(), 2);
        assert_eq!(a.sync_events(), 1);
        assert_eq!(b.sync_events(), 1);
    }

    #[test]
    fn relocking_an_owned_mutex_reports_deadlock() {
        let (_, registry, sync) = setup();
        let a = thread(&registry);
        assert_eq!(sync.mutex_lock(&a, 0x100, &Hook), 0);
        assert_eq!(sync.mutex_lock(&a, 0x100, &Hook), libc::EDEADLK);
    }

    #[test]
    fn replay_returns_recorded_results() {
        let (state, registry, sync) = setup();
        let a = thread(&registry);
        let b = thread(&registry);
        sync.mutex_lock(&a, 0x100, &Hook);
        assert_eq!(sync.mutex_trylock(&b, 0x100, &Hook), libc::EBUSY);
        sync.mutex_unlock(&a, 0x100, &Hook);

        state.set_replaying(true);
        sync.prepare_rollback();
        // Same single-threaded order as recorded.
        assert_eq!(sync.mutex_lock(&a, 0x100, &Hook), 0);
        let b2 = Arc::clone(&b);
        let sync = Arc::new(sync);
        let s2 = Arc::clone(&sync);
        let waiter = std::thread::spawn(move || s2.mutex_trylock(&b2, 0x100, &Hook));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished(), "B must wait for A's unlock");
        sync.mutex_unlock(&a, 0x100, &Hook);
        assert_eq!(waiter.join().unwrap(), libc::EBUSY);
    }

    #[test]
    #[should_panic(expected = "replay diverged")]
    fn event_on_another_object_is_a_divergence() {
        let (state, registry, sync) = setup();
        let a = thread(&registry);
        sync.mutex_lock(&a, 0x100, &Hook);
        sync.mutex_unlock(&a, 0x100, &Hook);
        state.set_replaying(true);
        sync.prepare_rollback();
        sync.mutex_lock(&a, 0x200, &Hook);
    }

    #[test]
    fn barrier_serial_thread_and_replayed_results() {
        let (state, registry, sync) = setup();
        let sync = Arc::new(sync);
        assert_eq!(sync.barrier_init(0x300, 0), libc::EINVAL);
        assert_eq!(sync.barrier_init(0x300, 2), 0);
        let threads: Vec<_> = (0..2).map(|_| thread(&registry)).collect();
        let run = |sync: &Arc<SyncCoordinator>| {
            let handles: Vec<_> = threads
                .iter()
                .map(|t| {
                    let t = Arc::clone(t);
                    let s = Arc::clone(sync);
                    std::thread::spawn(move || (t.index(), s.barrier_wait(&t, 0x300, &Hook)))
                })
                .collect();
            let mut out: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            out.sort_unstable();
            out
        };
        let first = run(&sync);
        assert_eq!(
            first.iter().filter(|(_, r)| *r == libc::PTHREAD_BARRIER_SERIAL_THREAD).count(),
            1
        );
        state.set_replaying(true);
        sync.prepare_rollback();
        assert_eq!(run(&sync), first);
    }

    #[test]
    fn destroy_is_deferred_to_epoch_begin() {
        let (_, registry, sync) = setup();
        let a = thread(&registry);
        sync.mutex_lock(&a, 0x100, &Hook);
        sync.mutex_unlock(&a, 0x100, &Hook);
        assert_eq!(sync.destroy(0x100), 0);
        assert!(sync.lookup(0x100).is_some());
        sync.epoch_begin();
        assert!(sync.lookup(0x100).is_none());
    }

    #[test]
    fn cond_wait_is_logged_on_the_mutex() {
        let (_, registry, sync) = setup();
        let sync = Arc::new(sync);
        let waiter = thread(&registry);
        let signaller = thread(&registry);
        let woke = Arc::new(AtomicUsize::new(0));

        sync.mutex_lock(&waiter, 0x100, &Hook);
        let (s, w, flag) = (Arc::clone(&sync), Arc::clone(&waiter), Arc::clone(&woke));
        let h = std::thread::spawn(move || {
            let rc = s.cond_wait(&w, 0x500, 0x100, &Hook);
            flag.store(1, Ordering::SeqCst);
            s.mutex_unlock(&w, 0x100, &Hook);
            rc
        });
        // Once the waiter released the mutex the signaller can take it.
        assert_eq!(sync.mutex_lock(&signaller, 0x100, &Hook), 0);
        sync.cond_signal(0x500);
        sync.mutex_unlock(&signaller, 0x100, &Hook);
        assert_eq!(h.join().unwrap(), 0);
        assert_eq!(woke.load(Ordering::SeqCst), 1);
        // lock, signaller's lock, reacquire after the wait.
        assert_eq!(sync.lookup(0x100).unwrap().recorded(), 3);
        assert_eq!(waiter.status(), ThreadStatus::Running);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(6))]

        #[test]
        fn replay_preserves_the_recorded_lock_order(
            recorded in proptest::collection::vec(0u64..3, 6),
            replayed in proptest::collection::vec(0u64..3, 6),
        ) {
            let (state, registry, sync) = setup();
            let sync = Arc::new(sync);
            let threads: Vec<_> = (0..3).map(|_| thread(&registry)).collect();
            let run = |delays: &[u64]| {
                let order = Arc::new(Mutex::new(Vec::new()));
                let handles: Vec<_> = threads
                    .iter()
                    .zip(delays.chunks(2))
                    .map(|(t, d)| {
                        let (t, s, o, d) = (Arc::clone(t), Arc::clone(&sync), Arc::clone(&order), d.to_vec());
                        std::thread::spawn(move || {
                            for pause in d {
                                std::thread::sleep(Duration::from_millis(pause));
                                s.mutex_lock(&t, 0x700, &Hook);
                                o.lock().push(t.index());
                                s.mutex_unlock(&t, 0x700, &Hook);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                let out = order.lock().clone();
                out
            };
            let first = run(&recorded);
            state.set_replaying(true);
            sync.prepare_rollback();
            proptest::prop_assert_eq!(run(&replayed), first);
        }
    }
}
