//! The bulk heap collaborator.
//!
//! The bulk heap supplies raw storage. The shadow heap assumes nothing
//! about it beyond the size it was asked for and the quantum alignment of
//! what it returns.

use std::ptr::NonNull;

/// One live piece of storage, as enumerated by [`BulkHeap::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry {
    pub storage: usize,
    pub size: usize,
}

impl HeapEntry {
    pub fn end(&self) -> usize {
        self.storage + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.storage && addr < self.end()
    }
}

/// Allocate/free/query/validate/enumerate primitive backing the shadow heap.
pub trait BulkHeap: Send + Sync {
    /// Reserve at least `size` bytes of quantum-aligned storage.
    fn reserve(&self, size: usize) -> Option<NonNull<u8>>;

    /// Return storage obtained from `reserve`. False if not recognised.
    fn release(&self, storage: usize) -> bool;

    /// Size of live storage starting at `storage`.
    fn query_size(&self, storage: usize) -> Option<usize>;

    /// Whether `storage` is the start of live storage.
    fn validate(&self, storage: usize) -> bool;

    /// The live entry after `cursor` in address order, or the first one.
    fn walk(&self, cursor: Option<usize>) -> Option<HeapEntry>;

    /// Block reserve/release for the duration of a walk.
    fn lock(&self) -> bool;

    fn unlock(&self) -> bool;

    /// `[start, end)` of the memory storage is carved from.
    fn region(&self) -> (usize, usize);
}

/// Holds the bulk heap's walk lock; released on drop, on every exit path.
pub struct HeapWalkGuard<'a, H: BulkHeap + ?Sized> {
    heap: &'a H,
}

impl<'a, H: BulkHeap + ?Sized> HeapWalkGuard<'a, H> {
    /// Take the walk lock, or `None` if the heap refused it.
    pub fn acquire(heap: &'a H) -> Option<Self> {
        if heap.lock() {
            Some(Self { heap })
        } else {
            None
        }
    }

    /// Iterate live entries in address order.
    pub fn entries(&self) -> HeapWalk<'_, H> {
        HeapWalk {
            heap: self.heap,
            cursor: None,
            done: false,
        }
    }

    /// Size of the live entry starting at `storage`.
    pub fn entry_size(&self, storage: usize) -> Option<usize> {
        self.heap.query_size(storage)
    }

    /// Find the live entry containing `addr`.
    pub fn entry_containing(&self, addr: usize) -> Option<HeapEntry> {
        self.entries()
            .take_while(|entry| entry.storage <= addr)
            .find(|entry| entry.contains(addr))
    }
}

impl<H: BulkHeap + ?Sized> Drop for HeapWalkGuard<'_, H> {
    fn drop(&mut self) {
        if !self.heap.unlock() {
            log::warn!("bulk heap walk lock was not held at release");
        }
    }
}

/// Iterator over live bulk heap entries.
pub struct HeapWalk<'a, H: BulkHeap + ?Sized> {
    heap: &'a H,
    cursor: Option<usize>,
    done: bool,
}

impl<H: BulkHeap + ?Sized> Iterator for HeapWalk<'_, H> {
    type Item = HeapEntry;

    fn next(&mut self) -> Option<HeapEntry> {
        if self.done {
            return None;
        }
        match self.heap.walk(self.cursor) {
            Some(entry) => {
                self.cursor = Some(entry.storage);
                Some(entry)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
