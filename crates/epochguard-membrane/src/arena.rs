//! Raw size-class allocator underneath the guarded heap.
//!
//! The guarded heap only needs the [`RawAllocator`] contract: hand out a
//! block of at least the requested size, take it back, report its size.
//! [`PowerOfTwoHeap`] is the shipped implementation: one reserved mapping,
//! a bump pointer, power-of-two classes with per-class free lists, and an
//! ordered side table of live block sizes. Its metadata is checkpointed with
//! the heap so a rollback also rewinds allocator state.
//!
//! Headers inside blocks are program-writable, so anything that has to
//! enumerate blocks goes through the side table, never through the headers.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::memory_map::MappedRegion;
use crate::object_header::MAX_BLOCK_SIZE;

/// Smallest block handed out.
pub const MIN_BLOCK_SIZE: usize = 32;

const NUM_CLASSES: usize = (MAX_BLOCK_SIZE.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros() + 1) as usize;

/// Contract of the allocator collaborator. Addresses are block starts.
pub trait RawAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Option<usize>;
    fn release(&self, block: usize);
    fn block_size(&self, block: usize) -> Option<usize>;
    /// Live block containing `addr`, as `(start, size)`.
    fn block_containing(&self, addr: usize) -> Option<(usize, usize)>;
    /// First byte of the managed region.
    fn begin(&self) -> usize;
    /// One past the last byte ever handed out.
    fn used_end(&self) -> usize;
    /// Size of the reserved region.
    fn capacity(&self) -> usize;
    /// Every live block as `(start, size)`, in address order.
    fn live_blocks(&self) -> Vec<(usize, usize)>;
    fn checkpoint(&self);
    fn restore(&self);
}

#[derive(Clone, Default)]
struct HeapState {
    bump: usize,
    free_lists: Vec<Vec<usize>>,
    /// Block start -> size class of every block handed out and not released.
    live: BTreeMap<usize, u8>,
}

pub struct PowerOfTwoHeap {
    region: MappedRegion,
    state: Mutex<HeapState>,
    saved: Mutex<HeapState>,
}

fn class_of(size: usize) -> Option<usize> {
    let block = size.max(MIN_BLOCK_SIZE).checked_next_power_of_two()?;
    if block > MAX_BLOCK_SIZE {
        return None;
    }
    Some((block.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize)
}

const fn class_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

impl PowerOfTwoHeap {
    /// Reserve `capacity` bytes of address space for the heap.
    pub fn new(capacity: usize) -> Result<Self> {
        let region = MappedRegion::reserve(capacity)?;
        let state = HeapState {
            bump: region.addr(),
            free_lists: vec![Vec::new(); NUM_CLASSES],
            live: BTreeMap::new(),
        };
        Ok(Self {
            saved: Mutex::new(state.clone()),
            state: Mutex::new(state),
            region,
        })
    }
}

impl RawAllocator for PowerOfTwoHeap {
    fn allocate(&self, size: usize) -> Option<usize> {
        let class = class_of(size)?;
        let mut state = self.state.lock();
        let block = match state.free_lists[class].pop() {
            Some(block) => block,
            None => {
                let block = state.bump;
                let next = block.checked_add(class_size(class))?;
                if next > self.region.addr() + self.region.len() {
                    return None;
                }
                state.bump = next;
                block
            }
        };
        state.live.insert(block, class as u8);
        Some(block)
    }

    fn release(&self, block: usize) {
        let mut state = self.state.lock();
        if let Some(class) = state.live.remove(&block) {
            state.free_lists[class as usize].push(block);
        }
    }

    fn block_size(&self, block: usize) -> Option<usize> {
        self.state
            .lock()
            .live
            .get(&block)
            .map(|&c| class_size(c as usize))
    }

    fn block_containing(&self, addr: usize) -> Option<(usize, usize)> {
        let state = self.state.lock();
        let (&start, &class) = state.live.range(..=addr).next_back()?;
        let size = class_size(class as usize);
        (addr < start + size).then_some((start, size))
    }

    fn begin(&self) -> usize {
        self.region.addr()
    }

    fn used_end(&self) -> usize {
        self.state.lock().bump
    }

    fn capacity(&self) -> usize {
        self.region.len()
    }

    fn live_blocks(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .live
            .iter()
            .map(|(&start, &class)| (start, class_size(class as usize)))
            .collect()
    }

    fn checkpoint(&self) {
        let state = self.state.lock();
        self.saved.lock().clone_from(&state);
    }

    fn restore(&self) {
        let snapshot = self.saved.lock().clone();
        *self.state.lock() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_round_up() {
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(32), Some(0));
        assert_eq!(class_of(33), Some(1));
        assert_eq!(class_size(class_of(1000).unwrap()), 1024);
        assert_eq!(class_of(MAX_BLOCK_SIZE + 1), None);
    }

    #[test]
    fn blocks_are_contiguous_and_reused() {
        let heap = PowerOfTwoHeap::new(1 << 20).unwrap();
        let a = heap.allocate(40).unwrap();
        let b = heap.allocate(40).unwrap();
        assert_eq!(a, heap.begin());
        assert_eq!(b, a + 64);
        assert_eq!(heap.block_size(a), Some(64));
        heap.release(a);
        assert_eq!(heap.block_size(a), None);
        assert_eq!(heap.allocate(50), Some(a));
        assert_eq!(heap.used_end(), b + 64);
    }

    #[test]
    fn interior_lookup() {
        let heap = PowerOfTwoHeap::new(1 << 20).unwrap();
        let a = heap.allocate(100).unwrap();
        assert_eq!(heap.block_containing(a + 77), Some((a, 128)));
        assert_eq!(heap.block_containing(a + 128), None);
    }

    #[test]
    fn exhaustion_returns_none() {
        let heap = PowerOfTwoHeap::new(4096).unwrap();
        assert!(heap.allocate(4096).is_some());
        assert!(heap.allocate(32).is_none());
    }

    #[test]
    fn checkpoint_rewinds_metadata() {
        let heap = PowerOfTwoHeap::new(1 << 20).unwrap();
        let a = heap.allocate(16).unwrap();
        heap.checkpoint();
        let b = heap.allocate(16).unwrap();
        heap.release(a);
        heap.restore();
        assert_eq!(heap.block_size(a), Some(32));
        assert_eq!(heap.block_size(b), None);
        assert_eq!(heap.allocate(16), Some(b));
        assert_eq!(heap.live_blocks(), vec![(a, 32), (b, 32)]);
    }
}
