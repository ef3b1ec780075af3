//! The quiesce signal.
//!
//! `SIGUSR2` is reserved for quiesce requests. The handler has two outcomes
//! and nothing else: after a commit it records the interrupted register
//! state as the thread's new checkpoint; after a rollback it rewrites the
//! kernel context so that returning from the handler resumes at the old
//! one. It runs on a per-thread alternate stack, so the thread's own stack
//! can be overwritten, and it neither allocates nor logs. If either outcome
//! cannot be carried out the process aborts: the thread would otherwise run
//! on against memory that no longer matches its registers.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

use epochguard_membrane::report::abort_with_message;
use epochguard_membrane::{ContextSnapshot, GuardError, RegisterImage, Result};

use crate::epoch::EpochCoordinator;
use crate::quiesce::Decision;
use crate::thread;

pub const QUIESCE_SIGNAL: libc::c_int = libc::SIGUSR2;

const ALT_STACK_SIZE: usize = 64 * 1024;

static ENGINE: AtomicPtr<EpochCoordinator> = AtomicPtr::new(std::ptr::null_mut());

thread_local! {
    static ALT_STACK: Cell<usize> = const { Cell::new(0) };
}

/// Route the quiesce signal to `engine`. The engine is kept alive until
/// [`uninstall`].
pub fn install(engine: &Arc<EpochCoordinator>) -> Result<()> {
    let raw = Arc::into_raw(Arc::clone(engine)).cast_mut();
    let old = ENGINE.swap(raw, Ordering::AcqRel);
    if !old.is_null() {
        // SAFETY: `old` came from `Arc::into_raw` in an earlier install.
        drop(unsafe { Arc::from_raw(old) });
    }
    // SAFETY: plain sigaction with a zeroed struct; the handler has the
    // SA_SIGINFO signature.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_quiesce as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(QUIESCE_SIGNAL, &action, std::ptr::null_mut()) != 0 {
            return Err(GuardError::last_os("sigaction"));
        }
    }
    Ok(())
}

/// Ignore the signal again and drop the engine reference.
pub fn uninstall() {
    // SAFETY: restoring a disposition has no memory effects.
    unsafe { libc::signal(QUIESCE_SIGNAL, libc::SIG_IGN) };
    let old = ENGINE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        // SAFETY: `old` came from `Arc::into_raw` in `install`.
        drop(unsafe { Arc::from_raw(old) });
    }
}

#[must_use]
pub fn is_installed() -> bool {
    !ENGINE.load(Ordering::Acquire).is_null()
}

/// Give the calling thread an alternate signal stack.
pub fn prepare_thread() -> Result<()> {
    if ALT_STACK.with(Cell::get) != 0 {
        return Ok(());
    }
    // SAFETY: anonymous private mapping; the result is checked.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(GuardError::last_os("mmap"));
    }
    let stack = libc::stack_t {
        ss_sp: base,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: `stack` describes the mapping created above.
    if unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) } != 0 {
        let err = GuardError::last_os("sigaltstack");
        // SAFETY: unmapping our own fresh mapping.
        unsafe { libc::munmap(base, ALT_STACK_SIZE) };
        return Err(err);
    }
    ALT_STACK.with(|s| s.set(base as usize));
    Ok(())
}

/// Drop the calling thread's alternate stack before it exits.
pub fn release_thread() {
    let base = ALT_STACK.with(|s| s.replace(0));
    if base == 0 {
        return;
    }
    let disable = libc::stack_t {
        ss_sp: std::ptr::null_mut(),
        ss_flags: libc::SS_DISABLE,
        ss_size: 0,
    };
    // SAFETY: the stack is not in use outside a handler, and this runs on
    // the thread's normal stack.
    unsafe {
        libc::sigaltstack(&disable, std::ptr::null_mut());
        libc::munmap(base as *mut libc::c_void, ALT_STACK_SIZE);
    }
}

/// Keeps the quiesce signal blocked on this thread while alive, so a stop
/// never lands while engine locks are held.
pub struct Deferral {
    old: libc::sigset_t,
}

/// Block the quiesce signal until the returned guard drops. `None` when no
/// handler is installed.
#[must_use]
pub fn defer() -> Option<Deferral> {
    if !is_installed() {
        return None;
    }
    // SAFETY: both sets are plain out-parameters on this stack.
    unsafe {
        let mut block: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, QUIESCE_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut old) != 0 {
            return None;
        }
        Some(Deferral { old })
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        // SAFETY: restores the mask saved by `defer`; a request that
        // arrived meanwhile is delivered here.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut()) };
    }
}

extern "C" fn on_quiesce(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let engine = ENGINE.load(Ordering::Acquire);
    if engine.is_null() {
        return;
    }
    // SAFETY: the pointer holds a strong count until `uninstall`.
    let engine = unsafe { &*engine };
    let Some(me) = thread::current() else {
        return;
    };
    // Threads created in this epoch leave the request for their next safe
    // point.
    if me.is_newly_spawned() || !me.take_quiesce_request() {
        return;
    }
    // SAFETY: `ctx` is this handler's context argument.
    let regs = unsafe { RegisterImage::from_signal(ctx) };
    me.note_stop(regs.stack_pointer(), Some(regs.clone()));
    let decision = engine.quiesce_barrier().arrive();
    let mut context = me.try_context();
    // SAFETY: `ctx` is this handler's context argument and SA_ONSTACK puts
    // the handler on the alternate stack of the thread owning `context`.
    let applied = unsafe { apply_decision(decision, context.as_deref_mut(), me.index(), regs, ctx) };
    if applied.is_err() {
        abort_with_message(match decision {
            Decision::Commit => "quiesce handler could not save the checkpoint",
            Decision::Rollback => "quiesce handler could not restore the checkpoint",
        });
    }
}

/// Carry out `decision` for the thread whose checkpoint is `context`.
/// `None` means the checkpoint was locked when the signal landed.
///
/// # Safety
/// For [`Decision::Rollback`], `kctx` must be the context argument of a
/// signal handler running on the alternate stack of the owning thread.
unsafe fn apply_decision(
    decision: Decision,
    context: Option<&mut ContextSnapshot>,
    thread: u32,
    regs: RegisterImage,
    kctx: *mut libc::c_void,
) -> Result<()> {
    let context = context.ok_or(GuardError::MissingContext { thread })?;
    match decision {
        Decision::Commit => context.save(regs),
        // SAFETY: forwarded from the caller.
        Decision::Rollback => unsafe { context.rollback_in_handler(kctx) },
    }
}
