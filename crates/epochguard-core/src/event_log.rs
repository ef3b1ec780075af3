//! Ordered logs replayed after a rollback.
//!
//! A [`RecordLog`] is an append-only list with a read cursor: normal
//! execution appends, a rollback rewinds the cursor, and replay consumes in
//! order. Each synchronization object keeps an [`EventList`] of handles into
//! the per-thread logs, which fixes the global order in which threads
//! acquired it.

use epochguard_membrane::{GuardError, Result};

/// Records a thread may log before its epoch must end.
pub const SYSCALL_LOG_CAPACITY: usize = 0x10_0000;
/// Synchronization events a thread may log per epoch.
pub const SYNC_LOG_CAPACITY: usize = 0x100_0000;

/// Append-only log with a replay cursor. Storage grows on demand up to
/// `capacity`.
#[derive(Debug, Clone)]
pub struct RecordLog<T> {
    items: Vec<T>,
    cursor: usize,
    capacity: usize,
}

impl<T> RecordLog<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
            capacity,
        }
    }

    /// Append and return the slot index.
    pub fn push(&mut self, item: T) -> Result<usize> {
        if self.items.len() >= self.capacity {
            return Err(GuardError::EventLogExhausted {
                capacity: self.capacity,
            });
        }
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    /// Next record to replay.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.items.get(self.cursor)
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Consume the record under the cursor.
    pub fn advance(&mut self) -> Option<&T> {
        let item = self.items.get(self.cursor)?;
        self.cursor += 1;
        Some(item)
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = 0;
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&T> {
        self.items.get(slot)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// True once every record has been replayed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.cursor >= self.items.len()
    }
}

/// One synchronization event in a thread's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEvent {
    /// Id of the [`EventList`] the event was appended to.
    pub list: u32,
    /// Return value the program observed.
    pub ret: i32,
}

/// Address of a [`SyncEvent`]: `(thread index, slot in its log)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    pub thread: u32,
    pub slot: u32,
}

/// Per-object acquisition order.
#[derive(Debug, Default, Clone)]
pub struct EventList {
    events: Vec<EventHandle>,
    cursor: usize,
}

impl EventList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, handle: EventHandle) {
        self.events.push(handle);
    }

    /// Rewind for replay and return the first event, whose owner may go.
    pub fn prepare_rollback(&mut self) -> Option<EventHandle> {
        self.cursor = 0;
        self.events.first().copied()
    }

    /// Event whose owner currently holds the turn.
    #[must_use]
    pub fn current(&self) -> Option<EventHandle> {
        self.events.get(self.cursor).copied()
    }

    /// Pass the turn on and return the new holder.
    pub fn advance(&mut self) -> Option<EventHandle> {
        if self.cursor < self.events.len() {
            self.cursor += 1;
        }
        self.current()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.cursor = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_replays_in_append_order() {
        let mut log = RecordLog::new(4);
        log.push(10).unwrap();
        log.push(20).unwrap();
        assert_eq!(log.advance(), Some(&10));
        log.rewind();
        assert_eq!(log.advance(), Some(&10));
        assert_eq!(log.advance(), Some(&20));
        assert!(log.is_drained());
        assert_eq!(log.advance(), None);
    }

    #[test]
    fn full_log_is_an_internal_error() {
        let mut log = RecordLog::new(1);
        log.push(()).unwrap();
        assert!(matches!(
            log.push(()),
            Err(GuardError::EventLogExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn event_list_hands_the_turn_along() {
        let mut list = EventList::new();
        let a = EventHandle { thread: 0, slot: 0 };
        let b = EventHandle { thread: 1, slot: 0 };
        list.record(a);
        list.record(b);
        assert_eq!(list.prepare_rollback(), Some(a));
        assert_eq!(list.advance(), Some(b));
        assert_eq!(list.advance(), None);
        assert_eq!(list.advance(), None);
        assert_eq!(list.prepare_rollback(), Some(a));
    }
}
