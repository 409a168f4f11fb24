//! Contiguous-arena bulk heap.
//!
//! One region from the system allocator, carved first-fit into
//! quantum-aligned pieces. Free extents are coalesced on release.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::ptr::NonNull;

use super::bulk::{BulkHeap, HeapEntry};
use crate::error::HeapError;
use crate::shadow::QUANTUM;
use crate::sync::mutex::Mutex;
use crate::sync::spinlock::RawSpinLock;
use crate::util::layout::{align_up, checked_align_up};

/// Alignment of the arena region itself.
const ARENA_ALIGN: usize = 4096;

struct ArenaState {
    /// start -> length of free extents
    free: BTreeMap<usize, usize>,
    /// start -> length of live storage
    live: BTreeMap<usize, usize>,
    live_bytes: usize,
}

/// Bulk heap over a single fixed-size arena.
pub struct ArenaHeap {
    base: NonNull<u8>,
    layout: Layout,
    walk_lock: RawSpinLock,
    state: Mutex<ArenaState>,
}

impl ArenaHeap {
    /// Map an arena of `capacity` bytes (rounded up to the quantum).
    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        let capacity = align_up(capacity.max(QUANTUM), QUANTUM);
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .map_err(|_| HeapError::OutOfMemory(capacity))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(HeapError::OutOfMemory(capacity))?;

        let mut free = BTreeMap::new();
        free.insert(base.as_ptr() as usize, capacity);

        log::debug!("arena heap mapped {} bytes at {:p}", capacity, base);

        Ok(Self {
            base,
            layout,
            walk_lock: RawSpinLock::new(),
            state: Mutex::new(ArenaState {
                free,
                live: BTreeMap::new(),
                live_bytes: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes currently handed out.
    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    /// Number of live storage pieces.
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of free extents (1 when fully coalesced and empty).
    pub fn free_extents(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl BulkHeap for ArenaHeap {
    fn reserve(&self, size: usize) -> Option<NonNull<u8>> {
        let size = checked_align_up(size.max(QUANTUM), QUANTUM)?;
        let _walk = self.walk_lock.guard();
        let mut state = self.state.lock();

        let (start, len) = state
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len))?;
        state.free.remove(&start);
        if len > size {
            state.free.insert(start + size, len - size);
        }
        state.live.insert(start, size);
        state.live_bytes += size;

        NonNull::new(start as *mut u8)
    }

    fn release(&self, storage: usize) -> bool {
        let _walk = self.walk_lock.guard();
        let mut state = self.state.lock();

        let size = match state.live.remove(&storage) {
            Some(size) => size,
            None => return false,
        };
        state.live_bytes -= size;

        let mut start = storage;
        let mut len = size;
        if let Some(next_len) = state.free.remove(&(start + len)) {
            len += next_len;
        }
        let prev = state
            .free
            .range(..start)
            .next_back()
            .map(|(&prev, &prev_len)| (prev, prev_len));
        if let Some((prev, prev_len)) = prev {
            if prev + prev_len == start {
                state.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        state.free.insert(start, len);
        true
    }

    fn query_size(&self, storage: usize) -> Option<usize> {
        self.state.lock().live.get(&storage).copied()
    }

    fn validate(&self, storage: usize) -> bool {
        self.state.lock().live.contains_key(&storage)
    }

    fn walk(&self, cursor: Option<usize>) -> Option<HeapEntry> {
        let state = self.state.lock();
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        state
            .live
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(&storage, &size)| HeapEntry { storage, size })
    }

    fn lock(&self) -> bool {
        self.walk_lock.lock();
        true
    }

    fn unlock(&self) -> bool {
        self.walk_lock.unlock()
    }

    fn region(&self) -> (usize, usize) {
        let start = self.base.as_ptr() as usize;
        (start, start + self.layout.size())
    }
}

impl Drop for ArenaHeap {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this layout in `new`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

// SAFETY: the arena pointer is only dereferenced by owners of storage
// handed out under `state`, which is itself synchronized.
unsafe impl Send for ArenaHeap {}
unsafe impl Sync for ArenaHeap {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::bulk::HeapWalkGuard;

    #[test]
    fn test_reserve_is_quantum_aligned_and_in_region() {
        let heap = ArenaHeap::new(4096).unwrap();
        let (start, end) = heap.region();
        for size in [1, 7, 8, 13, 100] {
            let p = heap.reserve(size).unwrap().as_ptr() as usize;
            assert_eq!(p % QUANTUM, 0);
            assert!(p >= start && p + size <= end);
            assert!(heap.query_size(p).unwrap() >= size);
        }
    }

    #[test]
    fn test_release_coalesces() {
        let heap = ArenaHeap::new(1024).unwrap();
        let a = heap.reserve(64).unwrap().as_ptr() as usize;
        let b = heap.reserve(64).unwrap().as_ptr() as usize;
        let c = heap.reserve(64).unwrap().as_ptr() as usize;
        assert!(heap.release(a));
        assert!(heap.release(c));
        assert!(heap.release(b));
        assert_eq!(heap.free_extents(), 1);
        assert_eq!(heap.live_bytes(), 0);
        assert!(!heap.release(b));
    }

    #[test]
    fn test_exhaustion_fails() {
        let heap = ArenaHeap::new(128).unwrap();
        assert!(heap.reserve(128).is_some());
        assert!(heap.reserve(8).is_none());
    }

    #[test]
    fn test_walk_in_address_order() {
        let heap = ArenaHeap::new(1024).unwrap();
        let a = heap.reserve(16).unwrap().as_ptr() as usize;
        let b = heap.reserve(32).unwrap().as_ptr() as usize;
        let guard = HeapWalkGuard::acquire(&heap).unwrap();
        let entries: Vec<_> = guard.entries().collect();
        assert_eq!(
            entries,
            vec![
                HeapEntry { storage: a, size: 16 },
                HeapEntry { storage: b, size: 32 }
            ]
        );
        assert_eq!(guard.entry_containing(b + 31).map(|e| e.storage), Some(b));
        assert_eq!(guard.entry_containing(b + 32), None);
    }

    #[test]
    fn test_walk_guard_releases_lock() {
        let heap = ArenaHeap::new(256).unwrap();
        {
            let _guard = HeapWalkGuard::acquire(&heap).unwrap();
            assert!(heap.walk_lock.is_locked());
        }
        assert!(!heap.walk_lock.is_locked());
        assert!(heap.reserve(8).is_some());
    }
}
