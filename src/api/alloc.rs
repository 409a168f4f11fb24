//! The main heap type.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::arena::ArenaHeap;
use crate::allocators::bulk::BulkHeap;
use crate::api::config::HeapConfig;
use crate::api::stats::HeapStats;
use crate::block::BlockInfo;
use crate::core::Engine;
use crate::debug::stack_cache::{StackCache, StackCaptureCache};
use crate::diagnostics::corruption::CorruptRange;
use crate::diagnostics::report::{AccessMode, BadAccessReport};
use crate::error::HeapError;
use crate::shadow::ShadowMemory;

/// How [`ShadowHeap::resize`] may satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Allocate a new block, copy, free the old one.
    #[default]
    Move,
    /// Only grow or shrink where the block stands. Always fails: the
    /// redzone geometry may have to change.
    InPlaceOnly,
}

/// The redzone-checked heap.
///
/// This is the primary entry point for all allocation operations.
/// It is cheap to clone (internally uses `Arc`) and thread-safe.
///
/// # Example
///
/// ```rust,no_run
/// use shadowheap::{ShadowHeap, HeapConfig, AccessMode};
///
/// let heap = ShadowHeap::new(HeapConfig::default()).unwrap();
///
/// let p = heap.allocate(100).unwrap();
/// let report = heap.check_access(p.as_ptr() as usize + 100, 1, AccessMode::Read);
/// assert!(report.is_some());
/// heap.free(p.as_ptr()).unwrap();
/// ```
#[derive(Clone)]
pub struct ShadowHeap {
    inner: Arc<Engine>,
}

impl ShadowHeap {
    /// Create a heap over a fresh arena with the given configuration.
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        let arena = ArenaHeap::new(config.arena_size)?;
        Self::with_collaborators(config, Box::new(arena), Arc::new(StackCaptureCache::new()))
    }

    /// Create a heap with default configuration.
    pub fn with_defaults() -> Result<Self, HeapError> {
        Self::new(HeapConfig::default())
    }

    /// Create a heap over caller-supplied storage and stack cache.
    ///
    /// `arena_size` in `config` is ignored; shadow memory covers the bulk
    /// heap's region.
    pub fn with_collaborators(
        config: HeapConfig,
        heap: Box<dyn BulkHeap>,
        stacks: Arc<dyn StackCache>,
    ) -> Result<Self, HeapError> {
        Ok(Self {
            inner: Arc::new(Engine::new(config, heap, stacks)?),
        })
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes at the default alignment.
    ///
    /// Exactly `[0, size)` from the returned pointer is accessible.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.inner.allocate(size, None)
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, HeapError> {
        self.inner.allocate(size, Some(alignment))
    }

    /// Resize a block.
    ///
    /// A null `ptr` allocates. Otherwise a new block is allocated, the
    /// common prefix copied and the old block freed.
    /// [`ResizeMode::InPlaceOnly`] always fails.
    pub fn resize(&self, ptr: *mut u8, new_size: usize, mode: ResizeMode) -> Result<NonNull<u8>, HeapError> {
        if mode == ResizeMode::InPlaceOnly {
            return Err(HeapError::InPlaceResizeUnsupported);
        }
        self.inner.reallocate(ptr as usize, new_size)
    }

    /// Free a block. Null is a no-op.
    ///
    /// The block is poisoned and held in quarantine. Freeing it again is
    /// reported as a double free and fails.
    pub fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.inner.free(ptr as usize)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Requested size of a live block, or `None` for anything else.
    pub fn get_size(&self, ptr: *const u8) -> Option<usize> {
        self.inner.get_size(ptr as usize)
    }

    /// Metadata of a live or quarantined block.
    pub fn block_info(&self, ptr: *const u8) -> Option<BlockInfo> {
        let block = self.inner.resolve_intact(ptr as usize)?;
        // SAFETY: resolve_intact validated the block geometry.
        unsafe { block.info() }
    }

    /// Check an access of `size` bytes at `addr`.
    ///
    /// Returns `None` when every byte is accessible. Otherwise the first
    /// inaccessible byte is classified and the report emitted and returned.
    pub fn check_access(&self, addr: usize, size: usize, mode: AccessMode) -> Option<BadAccessReport> {
        self.inner.check_access(addr, size, mode)
    }

    /// Verify every block header. An empty result means the heap is intact.
    pub fn check_heap(&self) -> Vec<CorruptRange> {
        self.inner.check_heap()
    }

    /// Verify the headers of blocks whose storage starts in `[start, end)`.
    ///
    /// A `start` inside a block skips that block.
    pub fn check_range(&self, start: usize, end: usize) -> Vec<CorruptRange> {
        self.inner.check_range(start, end)
    }

    /// The shadow table.
    pub fn shadow(&self) -> &ShadowMemory {
        &self.inner.shadow
    }

    /// Get current statistics.
    pub fn stats(&self) -> HeapStats {
        self.inner.stats()
    }

    // =========================================================================
    // Runtime configuration
    // =========================================================================

    /// Change the quarantine maximum; blocks over it are released before
    /// this returns.
    pub fn set_quarantine_max_size(&self, max_size: usize) {
        self.inner.set_quarantine_max_size(max_size);
    }

    pub fn quarantine_max_size(&self) -> usize {
        self.inner.quarantine.max_size()
    }

    /// Alignment used by [`ShadowHeap::allocate`] from now on.
    pub fn set_default_alignment(&self, alignment: usize) -> Result<(), HeapError> {
        self.inner.set_default_alignment(alignment)
    }

    pub fn default_alignment(&self) -> usize {
        self.inner.default_alignment()
    }

    /// Extra right-redzone bytes for allocations made from now on.
    pub fn set_trailer_padding(&self, padding: usize) {
        self.inner.set_trailer_padding(padding);
    }

    pub fn trailer_padding(&self) -> usize {
        self.inner.trailer_padding()
    }
}

impl std::fmt::Debug for ShadowHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowHeap")
            .field("shadow", &self.inner.shadow)
            .field("quarantine", &self.inner.quarantine)
            .finish()
    }
}
