//! Process-wide epoch state.
//!
//! The phase is a single atomic byte so signal handlers and blocked waiters
//! can read it without locks. Transitions go through [`EpochState::transition`],
//! which rejects any edge not in the lifecycle:
//!
//! ```text
//! Begin -> Normal -> Quiescing -> Checking -> Begin        (commit)
//!                                         \-> Rollback     (replay)
//! Rollback -> Quiescing                                    (replay end)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use epochguard_membrane::{GuardError, Result};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EpochPhase {
    /// Threads run and record.
    Normal = 0,
    /// The committer is stopping every other thread.
    Quiescing = 1,
    /// Everyone is stopped; the heap is being scanned.
    Checking = 2,
    /// Memory was restored; threads are replaying the epoch.
    Rollback = 3,
    /// Committed; waiting for the next checkpoint.
    Begin = 4,
}

impl EpochPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Quiescing => "quiescing",
            Self::Checking => "checking",
            Self::Rollback => "rollback",
            Self::Begin => "begin",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Quiescing,
            2 => Self::Checking,
            3 => Self::Rollback,
            _ => Self::Begin,
        }
    }

    const fn may_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Begin, Self::Normal)
                | (Self::Normal, Self::Quiescing)
                | (Self::Rollback, Self::Quiescing)
                | (Self::Quiescing, Self::Checking)
                | (Self::Checking, Self::Begin)
                | (Self::Checking, Self::Rollback)
        )
    }
}

pub struct EpochState {
    phase: AtomicU8,
    epoch: AtomicU64,
    rollbacks: AtomicU32,
    replaying: AtomicBool,
}

impl Default for EpochState {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(EpochPhase::Begin as u8),
            epoch: AtomicU64::new(0),
            rollbacks: AtomicU32::new(0),
            replaying: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn phase(&self) -> EpochPhase {
        EpochPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing if the current phase is not `from`
    /// or the edge is not part of the lifecycle.
    pub fn transition(&self, from: EpochPhase, to: EpochPhase) -> Result<()> {
        if !from.may_become(to) {
            return Err(GuardError::PhaseTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| GuardError::PhaseTransition {
                from: EpochPhase::from_u8(actual).as_str(),
                to: to.as_str(),
            })?;
        trace!(from = from.as_str(), to = to.as_str(), "epoch phase");
        Ok(())
    }

    /// Number of the epoch in progress. Replays keep the number of the
    /// epoch they re-execute.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn advance_epoch(&self) -> u64 {
        self.rollbacks.store(0, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::Acquire)
    }

    pub(crate) fn note_rollback(&self) -> u32 {
        self.rollbacks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True from a rollback until the next checkpoint.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::Acquire)
    }

    pub(crate) fn set_replaying(&self, on: bool) {
        self.replaying.store(on, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_commit_cycle() {
        let s = EpochState::new();
        assert_eq!(s.phase(), EpochPhase::Begin);
        s.transition(EpochPhase::Begin, EpochPhase::Normal).unwrap();
        s.transition(EpochPhase::Normal, EpochPhase::Quiescing).unwrap();
        s.transition(EpochPhase::Quiescing, EpochPhase::Checking).unwrap();
        s.transition(EpochPhase::Checking, EpochPhase::Begin).unwrap();
        assert_eq!(s.phase(), EpochPhase::Begin);
    }

    #[test]
    fn replay_cycle_reenters_quiescing() {
        let s = EpochState::new();
        s.transition(EpochPhase::Begin, EpochPhase::Normal).unwrap();
        s.transition(EpochPhase::Normal, EpochPhase::Quiescing).unwrap();
        s.transition(EpochPhase::Quiescing, EpochPhase::Checking).unwrap();
        s.transition(EpochPhase::Checking, EpochPhase::Rollback).unwrap();
        s.transition(EpochPhase::Rollback, EpochPhase::Quiescing).unwrap();
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let s = EpochState::new();
        assert!(matches!(
            s.transition(EpochPhase::Begin, EpochPhase::Checking),
            Err(GuardError::PhaseTransition { from: "begin", to: "checking" })
        ));
        // Legal edge, wrong current phase.
        assert!(matches!(
            s.transition(EpochPhase::Normal, EpochPhase::Quiescing),
            Err(GuardError::PhaseTransition { from: "begin", .. })
        ));
        assert_eq!(s.phase(), EpochPhase::Begin);
    }

    #[test]
    fn advancing_the_epoch_resets_rollbacks() {
        let s = EpochState::new();
        assert_eq!(s.note_rollback(), 1);
        assert_eq!(s.advance_epoch(), 1);
        assert_eq!(s.rollbacks(), 0);
        assert_eq!(s.epoch(), 1);
    }
}
