//! Size-bounded FIFO of freed blocks.
//!
//! Freed blocks stay here, poisoned, until the running total exceeds the
//! configured maximum; the oldest are then evicted. Entries live in a
//! slot arena and link to each other by index, so the queue never touches
//! block memory. Each block's trailer records the slot it occupies.

use crate::sync::mutex::Mutex;

/// Index of a quarantine slot, as recorded in a block's trailer.
pub type QuarantineHandle = u32;

/// A quarantined block, identified by its storage and user pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantinedBlock {
    pub storage: usize,
    pub user: usize,
    /// Total storage size, charged against the quarantine maximum.
    pub size: usize,
}

/// A block removed from the quarantine along with the slot it held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    pub handle: QuarantineHandle,
    pub block: QuarantinedBlock,
}

struct Slot {
    block: Option<QuarantinedBlock>,
    next: Option<QuarantineHandle>,
}

struct QuarantineInner {
    slots: Vec<Slot>,
    free_slots: Vec<QuarantineHandle>,
    head: Option<QuarantineHandle>,
    tail: Option<QuarantineHandle>,
    len: usize,
    total: usize,
    max: usize,
}

impl QuarantineInner {
    fn push(&mut self, block: QuarantinedBlock) -> QuarantineHandle {
        let slot = Slot { block: Some(block), next: None };
        let handle = match self.free_slots.pop() {
            Some(handle) => {
                self.slots[handle as usize] = slot;
                handle
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as QuarantineHandle
            }
        };
        match self.tail {
            Some(tail) => self.slots[tail as usize].next = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
        self.total += block.size;
        handle
    }

    fn pop(&mut self) -> Option<Evicted> {
        let handle = self.head?;
        let slot = &mut self.slots[handle as usize];
        let block = slot.block.take()?;
        self.head = slot.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.free_slots.push(handle);
        self.len -= 1;
        self.total -= block.size;
        Some(Evicted { handle, block })
    }

    fn trim(&mut self) -> Vec<Evicted> {
        let mut evicted = Vec::new();
        while self.total > self.max {
            match self.pop() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }
}

/// The quarantine queue.
pub struct Quarantine {
    inner: Mutex<QuarantineInner>,
}

impl Quarantine {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(QuarantineInner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                head: None,
                tail: None,
                len: 0,
                total: 0,
                max: max_size,
            }),
        }
    }

    /// Append `block`, then evict from the front until within budget.
    ///
    /// `link` runs under the queue lock with the slot handle, before any
    /// eviction, so the block's trailer is updated atomically with its
    /// insertion. A block larger than the maximum is evicted immediately.
    pub fn enqueue<F>(&self, block: QuarantinedBlock, link: F) -> Vec<Evicted>
    where
        F: FnOnce(QuarantineHandle),
    {
        let mut inner = self.inner.lock();
        let handle = inner.push(block);
        link(handle);
        inner.trim()
    }

    /// Change the maximum. Blocks over the new budget are returned for
    /// release, oldest first.
    pub fn set_max_size(&self, max_size: usize) -> Vec<Evicted> {
        let mut inner = self.inner.lock();
        inner.max = max_size;
        inner.trim()
    }

    /// Remove every block, oldest first.
    pub fn drain(&self) -> Vec<Evicted> {
        let mut inner = self.inner.lock();
        let mut evicted = Vec::with_capacity(inner.len);
        while let Some(entry) = inner.pop() {
            evicted.push(entry);
        }
        evicted
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max
    }

    /// Bytes currently held.
    pub fn size(&self) -> usize {
        self.inner.lock().total
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks in eviction order.
    pub fn blocks(&self) -> Vec<QuarantinedBlock> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.len);
        let mut cursor = inner.head;
        while let Some(handle) = cursor {
            let slot = &inner.slots[handle as usize];
            if let Some(block) = slot.block {
                out.push(block);
            }
            cursor = slot.next;
        }
        out
    }
}

impl std::fmt::Debug for Quarantine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Quarantine")
            .field("len", &inner.len)
            .field("size", &inner.total)
            .field("max_size", &inner.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: usize, size: usize) -> QuarantinedBlock {
        QuarantinedBlock {
            storage: id * 0x1000,
            user: id * 0x1000 + 32,
            size,
        }
    }

    #[test]
    fn test_fifo_eviction() {
        let q = Quarantine::new(100);
        assert!(q.enqueue(block(1, 40), |_| {}).is_empty());
        assert!(q.enqueue(block(2, 40), |_| {}).is_empty());
        let evicted = q.enqueue(block(3, 40), |_| {});
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].block, block(1, 40));
        assert_eq!(q.size(), 80);
        assert_eq!(q.blocks(), vec![block(2, 40), block(3, 40)]);
    }

    #[test]
    fn test_link_sees_handle_of_evicted_slot() {
        let q = Quarantine::new(64);
        let mut first = None;
        q.enqueue(block(1, 64), |h| first = Some(h));
        let evicted = q.enqueue(block(2, 8), |_| {});
        assert_eq!(evicted[0].handle, first.unwrap());
    }

    #[test]
    fn test_oversized_block_evicted_immediately() {
        let q = Quarantine::new(16);
        let evicted = q.enqueue(block(1, 32), |_| {});
        assert_eq!(evicted.len(), 1);
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_set_max_size_zero_empties() {
        let q = Quarantine::new(1000);
        for i in 0..5 {
            q.enqueue(block(i, 10), |_| {});
        }
        let evicted = q.set_max_size(0);
        assert_eq!(evicted.len(), 5);
        assert_eq!(evicted[0].block, block(0, 10));
        assert!(q.is_empty());
        assert_eq!(q.max_size(), 0);
    }

    #[test]
    fn test_slots_are_reused() {
        let q = Quarantine::new(10);
        let mut handles = Vec::new();
        for i in 0..4 {
            q.enqueue(block(i, 10), |h| handles.push(h));
        }
        // Each push evicts the previous block, freeing its slot.
        assert!(handles.iter().all(|&h| h < 2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_drain() {
        let q = Quarantine::new(1000);
        q.enqueue(block(1, 10), |_| {});
        q.enqueue(block(2, 10), |_| {});
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.blocks().is_empty());
    }
}
