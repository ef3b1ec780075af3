//! Per-thread checkpoint of the stack and registers.
//!
//! [`ContextSnapshot::save`] copies the used part of the live stack (from the
//! saved stack pointer, minus the red zone, up to the stack base) into a
//! buffer reserved for the whole stack when the thread registers. Restoring
//! is delegated to a [`StackTrampoline`], which must overwrite the stack
//! without running on it. The signal-context variant instead rewrites the
//! kernel-delivered `ucontext_t`, so returning from the handler resumes at
//! the checkpoint.

#![allow(unsafe_code)]

use std::convert::Infallible;

use crate::canary::{WORD_SIZE, align_down};
use crate::error::{GuardError, Result};

/// Bytes below the stack pointer the ABI lets leaf functions use.
pub const RED_ZONE: usize = 128;

/// `[low, high)` of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

impl StackBounds {
    #[must_use]
    pub const fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Bounds of the calling thread's stack.
    pub fn current() -> Result<Self> {
        // SAFETY: standard pthread attribute query on the calling thread;
        // `attr` is destroyed on every path after a successful init.
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                return Err(GuardError::last_os("pthread_getattr_np"));
            }
            let mut addr: *mut libc::c_void = std::ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(GuardError::last_os("pthread_attr_getstack"));
            }
            Ok(Self::new(addr as usize, addr as usize + size))
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.high - self.low
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// Saved machine registers, in the kernel's signal-frame layout.
#[derive(Clone)]
pub struct RegisterImage {
    uc: libc::ucontext_t,
}

// SAFETY: the pointers inside a saved ucontext (uc_link, fpregs, ss_sp) are
// never dereferenced through this type; it is moved between threads only as
// an inert register dump.
unsafe impl Send for RegisterImage {}
// SAFETY: see `Send`; shared access is read-only.
unsafe impl Sync for RegisterImage {}

impl std::fmt::Debug for RegisterImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterImage")
            .field("sp", &format_args!("{:#x}", self.stack_pointer()))
            .field("ip", &format_args!("{:#x}", self.instruction_pointer()))
            .finish()
    }
}

impl RegisterImage {
    /// Copy the context the kernel delivered to a `SA_SIGINFO` handler.
    /// Does not allocate.
    ///
    /// # Safety
    /// `ctx` must be the third argument of a signal handler invocation.
    #[must_use]
    pub unsafe fn from_signal(ctx: *const libc::c_void) -> Self {
        // SAFETY: forwarded from the caller.
        let uc = unsafe { std::ptr::read(ctx.cast::<libc::ucontext_t>()) };
        Self { uc }
    }

    /// An image holding only a stack and instruction pointer.
    #[must_use]
    pub fn synthetic(sp: usize, ip: usize) -> Self {
        // SAFETY: ucontext_t is plain old data; all-zero is a valid value.
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = sp as i64;
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = ip as i64;
        Self { uc }
    }

    #[must_use]
    pub fn stack_pointer(&self) -> usize {
        self.uc.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
    }

    #[must_use]
    pub fn instruction_pointer(&self) -> usize {
        self.uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    /// General-purpose registers, for conservative root scans.
    #[must_use]
    pub fn general_registers(&self) -> Vec<usize> {
        self.uc.uc_mcontext.gregs.iter().map(|&r| r as usize).collect()
    }

    #[must_use]
    pub fn as_ucontext(&self) -> &libc::ucontext_t {
        &self.uc
    }
}

/// Relocates execution to a saved context.
pub trait StackTrampoline: Send + Sync {
    /// Registers of the caller, as of this call.
    fn capture(&self) -> RegisterImage;

    /// Copy `image` onto the live stack at `dest` and resume at `regs`.
    ///
    /// # Safety
    /// `dest..dest + image.len()` must be the calling thread's own stack and
    /// `regs` must have been captured on it.
    unsafe fn resume(&self, dest: usize, image: &[u8], regs: &RegisterImage) -> !;
}

pub struct ContextSnapshot {
    thread: u32,
    bounds: StackBounds,
    stack: Vec<u8>,
    saved_low: usize,
    regs: Option<RegisterImage>,
}

impl ContextSnapshot {
    /// Reserve a backup buffer for the whole of `bounds`.
    #[must_use]
    pub fn new(thread: u32, bounds: StackBounds) -> Self {
        Self {
            thread,
            bounds,
            stack: Vec::with_capacity(bounds.len()),
            saved_low: bounds.high,
            regs: None,
        }
    }

    #[must_use]
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.regs.is_some()
    }

    #[must_use]
    pub fn registers(&self) -> Option<&RegisterImage> {
        self.regs.as_ref()
    }

    /// The saved part of the stack.
    #[must_use]
    pub fn saved_range(&self) -> (usize, usize) {
        (self.saved_low, self.saved_low + self.stack.len())
    }

    /// Save the live stack from `regs`' stack pointer up to the stack base.
    pub fn save(&mut self, regs: RegisterImage) -> Result<()> {
        let sp = regs.stack_pointer();
        if !self.bounds.contains(sp) {
            return Err(GuardError::StackTooLarge {
                len: self.bounds.high.saturating_sub(sp),
                capacity: self.stack.capacity(),
            });
        }
        let low = align_down(sp.saturating_sub(RED_ZONE), WORD_SIZE).max(self.bounds.low);
        let len = self.bounds.high - low;
        if len > self.stack.capacity() {
            return Err(GuardError::StackTooLarge {
                len,
                capacity: self.stack.capacity(),
            });
        }
        self.stack.clear();
        // SAFETY: [low, high) is the mapped, used part of this thread's
        // stack and the buffer has room for `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(low as *const u8, self.stack.as_mut_ptr(), len);
            self.stack.set_len(len);
        }
        self.saved_low = low;
        self.regs = Some(regs);
        Ok(())
    }

    /// Resume at the checkpoint through `trampoline`.
    pub fn rollback(&self, trampoline: &dyn StackTrampoline) -> Result<Infallible> {
        let regs = self
            .regs
            .as_ref()
            .ok_or(GuardError::MissingContext { thread: self.thread })?;
        // SAFETY: the snapshot was taken on this thread's stack.
        unsafe { trampoline.resume(self.saved_low, &self.stack, regs) }
    }

    /// Rewrite a kernel signal context so returning from the handler
    /// resumes at the checkpoint.
    ///
    /// # Safety
    /// `kctx` must be the context argument of a handler running on an
    /// alternate signal stack of the thread that took this snapshot.
    pub unsafe fn rollback_in_handler(&self, kctx: *mut libc::c_void) -> Result<()> {
        let regs = self
            .regs
            .as_ref()
            .ok_or(GuardError::MissingContext { thread: self.thread })?;
        // SAFETY: the handler runs on the alternate stack, so the thread's
        // own stack is not in use and can be overwritten.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.stack.as_ptr(),
                self.saved_low as *mut u8,
                self.stack.len(),
            );
            let uc = kctx.cast::<libc::ucontext_t>();
            (*uc).uc_mcontext.gregs = regs.uc.uc_mcontext.gregs;
        }
        Ok(())
    }
}
