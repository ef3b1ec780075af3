//! Bringing every thread but the committer to a stop.
//!
//! The committer raises each thread's quiesce flag and asks the transport
//! to deliver the request. A thread acknowledges by arriving at the
//! [`QuiesceBarrier`] and stays there until the committer publishes a
//! [`Decision`]. Arrival happens either in the `SIGUSR2` handler
//! ([`SignalTransport`]) or at the next engine safe point
//! ([`CooperativeTransport`]).

#![allow(unsafe_code)]

use epochguard_membrane::{GuardError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::thread::ThreadRecord;

/// What stopped threads do once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Save a fresh checkpoint and keep running.
    Commit,
    /// Resume at the saved checkpoint.
    Rollback,
}

/// Engine entry points a waiting thread calls back into.
pub trait QuiesceHook: Send + Sync {
    /// Join a pending quiesce, if one was requested for `me`.
    fn safe_point(&self, me: &ThreadRecord);
    /// Report a broken engine invariant and stop.
    fn fatal(&self, err: GuardError) -> !;
}

/// Delivers a quiesce request to one thread.
pub trait QuiesceTransport: Send + Sync {
    fn request(&self, thread: &ThreadRecord) -> Result<()>;
}

/// `pthread_kill(SIGUSR2)`; the handler arrives at the barrier.
pub struct SignalTransport;

impl QuiesceTransport for SignalTransport {
    fn request(&self, thread: &ThreadRecord) -> Result<()> {
        // SAFETY: the handle belongs to a registered, not yet reaped thread.
        let rc = unsafe { libc::pthread_kill(thread.pthread(), libc::SIGUSR2) };
        if rc != 0 {
            return Err(GuardError::Os {
                call: "pthread_kill",
                source: std::io::Error::from_raw_os_error(rc),
            });
        }
        Ok(())
    }
}

/// Threads notice the flag at their next safe point.
pub struct CooperativeTransport;

impl QuiesceTransport for CooperativeTransport {
    fn request(&self, thread: &ThreadRecord) -> Result<()> {
        thread.interrupt();
        Ok(())
    }
}

#[derive(Debug)]
struct BarrierState {
    waiters: usize,
    /// Threads the committer waits for; `usize::MAX` until counted.
    expected: usize,
    decision: Option<Decision>,
    round: u64,
}

pub struct QuiesceBarrier {
    state: Mutex<BarrierState>,
    committer: Condvar,
    waiters: Condvar,
}

impl Default for QuiesceBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl QuiesceBarrier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                waiters: 0,
                expected: usize::MAX,
                decision: None,
                round: 0,
            }),
            committer: Condvar::new(),
            waiters: Condvar::new(),
        }
    }

    /// Open a new round. Called by the committer before any request goes out.
    pub fn open_round(&self) {
        let mut s = self.state.lock();
        s.round += 1;
        s.decision = None;
        s.expected = usize::MAX;
    }

    /// Block until `expected` threads have arrived.
    pub fn wait_for_stops(&self, expected: usize) {
        let mut s = self.state.lock();
        s.expected = expected;
        while s.waiters < s.expected {
            self.committer.wait(&mut s);
        }
        debug!(stopped = expected, round = s.round, "all threads quiesced");
    }

    /// Arrive and wait for the committer's decision.
    pub fn arrive(&self) -> Decision {
        let mut s = self.state.lock();
        let round = s.round;
        s.waiters += 1;
        if s.waiters >= s.expected {
            self.committer.notify_one();
        }
        let decision = loop {
            match s.decision {
                Some(d) if s.round == round => break d,
                _ => self.waiters.wait(&mut s),
            }
        };
        s.waiters -= 1;
        if s.waiters == 0 {
            self.committer.notify_one();
        }
        decision
    }

    /// Publish `decision` and wait until every stopped thread has left.
    pub fn release(&self, decision: Decision) {
        let mut s = self.state.lock();
        s.decision = Some(decision);
        self.waiters.notify_all();
        while s.waiters > 0 {
            self.committer.wait(&mut s);
        }
        s.expected = usize::MAX;
    }

    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn committer_sees_every_arrival_and_everyone_sees_the_decision() {
        let barrier = Arc::new(QuiesceBarrier::new());
        barrier.open_round();
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let b = Arc::clone(&barrier);
                std::thread::spawn(move || b.arrive())
            })
            .collect();
        barrier.wait_for_stops(3);
        assert_eq!(barrier.waiting(), 3);
        barrier.release(Decision::Rollback);
        for w in workers {
            assert_eq!(w.join().unwrap(), Decision::Rollback);
        }
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    fn empty_round_does_not_block() {
        let barrier = QuiesceBarrier::new();
        barrier.open_round();
        barrier.wait_for_stops(0);
        barrier.release(Decision::Commit);
    }

    #[test]
    fn stale_decision_does_not_leak_into_the_next_round() {
        let barrier = Arc::new(QuiesceBarrier::new());
        barrier.open_round();
        barrier.wait_for_stops(0);
        barrier.release(Decision::Rollback);

        barrier.open_round();
        let b = Arc::clone(&barrier);
        let worker = std::thread::spawn(move || b.arrive());
        barrier.wait_for_stops(1);
        barrier.release(Decision::Commit);
        assert_eq!(worker.join().unwrap(), Decision::Commit);
    }
}
