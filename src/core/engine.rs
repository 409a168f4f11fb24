//! Shared engine state.
//!
//! Everything the facade does happens here: block construction, the free
//! path into the quarantine, and eviction back to the bulk heap. Reports
//! are assembled by `diagnostics::classify` and `diagnostics::corruption`,
//! which extend `Engine` with their own impl blocks.
//!
//! Lock order: a block stripe may be taken while holding the bulk heap's
//! walk lock, never the other way round. The quarantine lock may be taken
//! while holding a stripe; stripes are never taken while holding it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::allocators::bulk::BulkHeap;
use crate::allocators::quarantine::{Evicted, Quarantine, QuarantinedBlock};
use crate::api::config::HeapConfig;
use crate::api::stats::HeapStats;
use crate::block::header::{write_word, BlockHeader, BlockTrailer};
use crate::block::{BlockGeometry, BlockPlan, BlockRef, BlockState, BLOCK_MAGIC, HEADER_SIZE};
use crate::core::tls::current_thread_id;
use crate::debug::backtrace::capture_frames;
use crate::debug::stack_cache::{StackCache, StackId};
use crate::diagnostics::emit::{emit_report, emit_with_context, ReportSink};
use crate::diagnostics::kind::SH901;
use crate::diagnostics::report::BadAccessReport;
use crate::error::HeapError;
use crate::shadow::{ShadowMarker, ShadowMemory, QUANTUM};
use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::util::layout::{is_aligned, log2};

/// Number of block-lock stripes.
const LOCK_STRIPES: usize = 64;

/// Innermost frames belonging to the heap itself.
const CAPTURE_SKIP: usize = 3;

#[derive(Default)]
pub(crate) struct EngineStats {
    allocations: AtomicCounter,
    frees: AtomicCounter,
    evictions: AtomicCounter,
    pub(crate) reports: AtomicCounter,
    live_blocks: AtomicGauge,
    live_bytes: AtomicGauge,
}

/// How a free attempt left the block.
enum FreeOutcome {
    Quarantined {
        user_size: usize,
        evicted: Vec<Evicted>,
    },
    DoubleFree(BlockRef),
    Corrupt,
}

/// State shared by every clone of a `ShadowHeap`.
pub(crate) struct Engine {
    pub(crate) shadow: ShadowMemory,
    pub(crate) heap: Box<dyn BulkHeap>,
    pub(crate) stacks: Arc<dyn StackCache>,
    pub(crate) quarantine: Quarantine,
    stripes: Box<[Mutex<()>]>,
    default_alignment: AtomicUsize,
    trailer_padding: AtomicUsize,
    stack_depth: usize,
    capture_stacks: bool,
    sinks: Vec<Arc<dyn ReportSink>>,
    epoch: Instant,
    pub(crate) stats: EngineStats,
}

impl Engine {
    pub fn new(
        config: HeapConfig,
        heap: Box<dyn BulkHeap>,
        stacks: Arc<dyn StackCache>,
    ) -> Result<Self, HeapError> {
        check_alignment(config.default_alignment)?;
        let (start, end) = heap.region();
        let stripes = (0..LOCK_STRIPES)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!(
            "shadow heap over [{:#x}, {:#x}), quarantine {} bytes",
            start,
            end,
            config.quarantine_max_size
        );

        Ok(Self {
            shadow: ShadowMemory::new(start, end - start),
            heap,
            stacks,
            quarantine: Quarantine::new(config.quarantine_max_size),
            stripes,
            default_alignment: AtomicUsize::new(config.default_alignment),
            trailer_padding: AtomicUsize::new(config.trailer_padding),
            stack_depth: config.stack_depth,
            capture_stacks: config.capture_stacks,
            sinks: config.sinks,
            epoch: Instant::now(),
            stats: EngineStats::default(),
        })
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn default_alignment(&self) -> usize {
        self.default_alignment.load(Ordering::Relaxed)
    }

    pub fn set_default_alignment(&self, alignment: usize) -> Result<(), HeapError> {
        check_alignment(alignment)?;
        self.default_alignment.store(alignment, Ordering::Relaxed);
        Ok(())
    }

    pub fn trailer_padding(&self) -> usize {
        self.trailer_padding.load(Ordering::Relaxed)
    }

    pub fn set_trailer_padding(&self, padding: usize) {
        self.trailer_padding.store(padding, Ordering::Relaxed);
    }

    /// Change the quarantine maximum, evicting down to it before returning.
    pub fn set_quarantine_max_size(&self, max_size: usize) {
        let evicted = self.quarantine.set_max_size(max_size);
        log::debug!(
            "quarantine max set to {} bytes, evicting {} blocks",
            max_size,
            evicted.len()
        );
        self.process_evicted(evicted);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The lock stripe guarding multi-quantum shadow writes for `storage`.
    pub(crate) fn stripe(&self, storage: usize) -> MutexGuard<'_, ()> {
        let idx = (storage / QUANTUM) % self.stripes.len();
        self.stripes[idx].lock()
    }

    /// Microseconds since the engine was created.
    pub(crate) fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn save_stack(&self) -> Option<StackId> {
        if !self.capture_stacks {
            return None;
        }
        let frames = capture_frames(CAPTURE_SKIP, self.stack_depth);
        if frames.is_empty() {
            return None;
        }
        Some(self.stacks.save(&frames))
    }

    fn release_stack(&self, id: Option<StackId>) {
        if let Some(id) = id {
            self.stacks.release(id);
        }
    }

    /// Send a report to the configured sinks.
    pub(crate) fn emit(&self, report: &BadAccessReport) {
        self.stats.reports.increment();
        emit_report(report, &self.sinks);
    }

    /// Report an engine invariant violation.
    pub(crate) fn internal_error(&self, context: &str) {
        debug_assert!(false, "{}", context);
        emit_with_context(&SH901, context);
    }

    /// Resolve a user pointer to a block whose header checks out.
    ///
    /// `None` when the pointer is outside the heap, does not sit behind a
    /// header, or the header is corrupt.
    pub(crate) fn resolve_intact(&self, user: usize) -> Option<BlockRef> {
        let (start, end) = self.heap.region();
        if !is_aligned(user, QUANTUM) || user < start + HEADER_SIZE || user >= end {
            return None;
        }
        // SAFETY: the header lies inside the heap region.
        let block = unsafe { BlockRef::from_user(user)? };
        if !block.header().is_intact() || block.header().left_size as usize > user - start {
            return None;
        }
        let geometry = block.geometry();
        if geometry.end() > end || geometry.trailer() > geometry.end() {
            return None;
        }
        Some(block)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes at `alignment` (or the default).
    pub fn allocate(&self, size: usize, alignment: Option<usize>) -> Result<NonNull<u8>, HeapError> {
        let alignment = alignment.unwrap_or_else(|| self.default_alignment());
        let plan = BlockPlan::new(size, alignment, self.trailer_padding())?;

        let storage = self
            .heap
            .reserve(plan.total_size)
            .ok_or(HeapError::OutOfMemory(plan.total_size))?
            .as_ptr() as usize;

        let alloc_stack = self.save_stack();
        let geometry = plan.place(storage);
        if let Err(err) = self.build_block(&plan, &geometry, alloc_stack) {
            self.release_stack(alloc_stack);
            if !self.heap.release(storage) {
                self.internal_error("bulk heap rejected storage it just reserved");
            }
            return Err(err);
        }

        self.stats.allocations.increment();
        self.stats.live_blocks.add(1);
        self.stats.live_bytes.add(size);
        log::trace!(
            "allocate {} bytes at {:#x} (storage {:#x}, {} bytes)",
            size,
            geometry.user,
            storage,
            geometry.total_size
        );

        // user is at least storage + HEADER_SIZE, so never null.
        NonNull::new(geometry.user as *mut u8).ok_or(HeapError::OutOfMemory(plan.total_size))
    }

    /// Poison the redzones, unpoison the payload and write the metadata.
    fn build_block(
        &self,
        plan: &BlockPlan,
        geometry: &BlockGeometry,
        alloc_stack: Option<StackId>,
    ) -> Result<(), HeapError> {
        let storage = geometry.storage;
        let trailer = geometry.trailer();

        let _lock = self.stripe(storage);
        self.shadow.poison(storage, trailer - storage, ShadowMarker::LeftRedzone)?;
        self.shadow.unpoison(geometry.user, geometry.user_size)?;
        self.shadow.poison(trailer, geometry.end() - trailer, ShadowMarker::RightRedzone)?;

        let mut block = BlockRef::new(
            geometry.header(),
            BlockHeader {
                magic: BLOCK_MAGIC,
                checksum: 0,
                state: BlockState::Allocated as u8,
                align_log: log2(plan.alignment),
                user_size: geometry.user_size as u64,
                left_size: geometry.left_size() as u32,
                right_size: geometry.right_size() as u32,
                alloc_stack: alloc_stack.map_or(0, StackId::raw),
                free_stack: 0,
            },
        );
        // SAFETY: the whole geometry lies in storage we just reserved.
        unsafe {
            if geometry.has_padding_word() {
                write_word(storage, geometry.header() - storage);
            }
            block.commit();
            block.write_trailer(&BlockTrailer::new(current_thread_id()));
        }
        Ok(())
    }

    /// Allocate-copy-free. Never resizes in place.
    pub fn reallocate(&self, user: usize, new_size: usize) -> Result<NonNull<u8>, HeapError> {
        if user == 0 {
            return self.allocate(new_size, None);
        }
        let block = match self.resolve_intact(user) {
            Some(block) if block.state() == Some(BlockState::Allocated) => block,
            // Route through free so the bad pointer is reported.
            _ => {
                self.free(user)?;
                return Err(HeapError::InvalidPointer(user));
            }
        };

        let alignment = 1usize << block.header().align_log;
        let old_size = block.geometry().user_size;
        let new = self.allocate(new_size, Some(alignment))?;
        // SAFETY: both payloads are accessible for at least the copied length
        // and belong to distinct blocks.
        unsafe {
            std::ptr::copy_nonoverlapping(user as *const u8, new.as_ptr(), old_size.min(new_size));
        }
        self.free(user)?;
        Ok(new)
    }

    // =========================================================================
    // Free
    // =========================================================================

    /// Move a block into the quarantine.
    pub fn free(&self, user: usize) -> Result<(), HeapError> {
        if user == 0 {
            return Ok(());
        }
        let block = match self.resolve_intact(user) {
            Some(block) => block,
            None => return Err(self.report_bad_free(user)),
        };

        let free_stack = self.save_stack();
        match self.quarantine_block(block, free_stack) {
            FreeOutcome::Quarantined { user_size, evicted } => {
                self.stats.frees.increment();
                self.stats.live_blocks.sub(1);
                self.stats.live_bytes.sub(user_size);
                log::trace!("free {:#x} ({} bytes) into quarantine", user, user_size);
                self.process_evicted(evicted);
                Ok(())
            }
            FreeOutcome::DoubleFree(block) => {
                self.release_stack(free_stack);
                let report = self.double_free_report(&block);
                self.emit(&report);
                Err(HeapError::DoubleFree(Box::new(report)))
            }
            FreeOutcome::Corrupt => {
                self.release_stack(free_stack);
                Err(self.report_bad_free(user))
            }
        }
    }

    /// The state transition itself, under the block's stripe.
    fn quarantine_block(&self, mut block: BlockRef, free_stack: Option<StackId>) -> FreeOutcome {
        let geometry = block.geometry();
        let _lock = self.stripe(geometry.storage);

        // SAFETY: resolve_intact checked the header lies in the heap.
        unsafe { block.reload() };
        if !block.header().is_intact() {
            return FreeOutcome::Corrupt;
        }
        match block.state() {
            Some(BlockState::Allocated) => {}
            Some(BlockState::Quarantined) => return FreeOutcome::DoubleFree(block),
            _ => return FreeOutcome::Corrupt,
        }

        if !self.shadow.is_range_accessible(geometry.user, geometry.user_size) {
            self.internal_error(&format!(
                "payload of allocated block {:#x} is not accessible at free",
                geometry.user
            ));
        }

        let header = block.header_mut();
        header.state = BlockState::Quarantined as u8;
        header.free_stack = free_stack.map_or(0, StackId::raw);
        // SAFETY: header and trailer lie inside the block's storage.
        unsafe {
            block.commit();
            let mut trailer = block.trailer();
            trailer.free_tid = current_thread_id();
            trailer.free_ticks = self.now_micros();
            block.write_trailer(&trailer);
        }

        if let Err(err) = self.shadow.mark_as_freed(geometry.storage, geometry.total_size) {
            self.internal_error(&format!("cannot poison freed block: {}", err));
        }

        let entry = QuarantinedBlock {
            storage: geometry.storage,
            user: geometry.user,
            size: geometry.total_size,
        };
        let evicted = self.quarantine.enqueue(entry, |handle| {
            // SAFETY: the trailer lies inside the block's storage.
            unsafe {
                let mut trailer = block.trailer();
                trailer.quarantine_slot = handle;
                block.write_trailer(&trailer);
            }
        });

        FreeOutcome::Quarantined {
            user_size: geometry.user_size,
            evicted,
        }
    }

    /// Release blocks evicted from the quarantine back to the bulk heap.
    ///
    /// Called with no stripe and no quarantine lock held.
    pub(crate) fn process_evicted(&self, evicted: Vec<Evicted>) {
        for Evicted { handle, block: entry } in evicted {
            let mut stacks = (None, None);
            {
                let _lock = self.stripe(entry.storage);
                match self.resolve_intact(entry.user) {
                    Some(mut block) if block.state() == Some(BlockState::Quarantined) => {
                        // SAFETY: resolve_intact validated the geometry.
                        let slot = unsafe { block.trailer() }.quarantine_slot;
                        if slot != handle {
                            self.internal_error(&format!(
                                "block {:#x} evicted from quarantine slot {} but records slot {}",
                                entry.user, handle, slot
                            ));
                        }
                        stacks = (
                            StackId::from_raw(block.header().alloc_stack),
                            StackId::from_raw(block.header().free_stack),
                        );
                        let header = block.header_mut();
                        header.state = BlockState::Freed as u8;
                        header.magic = !BLOCK_MAGIC;
                        // SAFETY: as above.
                        unsafe { block.commit() };
                    }
                    _ => {
                        log::warn!(
                            "quarantined block {:#x} lost its header before eviction",
                            entry.user
                        );
                    }
                }
                if let Err(err) = self.shadow.unpoison(entry.storage, entry.size) {
                    self.internal_error(&format!("cannot unpoison evicted block: {}", err));
                }
            }

            self.release_stack(stacks.0);
            self.release_stack(stacks.1);
            if !self.heap.release(entry.storage) {
                self.internal_error(&format!(
                    "bulk heap rejected evicted storage {:#x}",
                    entry.storage
                ));
            }
            self.stats.evictions.increment();
            log::trace!("evict {:#x} ({} bytes)", entry.user, entry.size);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Requested size of an allocated block.
    pub fn get_size(&self, user: usize) -> Option<usize> {
        let block = self.resolve_intact(user)?;
        (block.state() == Some(BlockState::Allocated)).then(|| block.geometry().user_size)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocation_count: self.stats.allocations.get(),
            free_count: self.stats.frees.get(),
            eviction_count: self.stats.evictions.get(),
            report_count: self.stats.reports.get(),
            live_blocks: self.stats.live_blocks.get(),
            live_bytes: self.stats.live_bytes.get(),
            peak_live_bytes: self.stats.live_bytes.peak(),
            quarantine_blocks: self.quarantine.len(),
            quarantine_bytes: self.quarantine.size(),
            quarantine_max_size: self.quarantine.max_size(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let drained = self.quarantine.drain();
        self.process_evicted(drained);
    }
}

fn check_alignment(alignment: usize) -> Result<(), HeapError> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(HeapError::BadAlignment(alignment));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::arena::ArenaHeap;
    use crate::debug::stack_cache::StackCaptureCache;
    use crate::diagnostics::emit::CollectingSink;
    use crate::util::size::kb;

    fn engine(quarantine: usize) -> (Engine, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let config = HeapConfig::minimal()
            .with_arena_size(kb(256))
            .with_quarantine_max_size(quarantine)
            .with_sink(sink.clone());
        let heap = ArenaHeap::new(config.arena_size).unwrap();
        let engine = Engine::new(config, Box::new(heap), Arc::new(StackCaptureCache::new())).unwrap();
        (engine, sink)
    }

    #[test]
    fn test_allocate_marks_shadow() {
        let (engine, _) = engine(kb(4));
        let p = engine.allocate(13, None).unwrap().as_ptr() as usize;
        assert!(engine.shadow.is_range_accessible(p, 13));
        assert!(!engine.shadow.is_accessible(p + 13));
        assert!(!engine.shadow.is_accessible(p - 1));
        assert_eq!(engine.get_size(p), Some(13));
    }

    #[test]
    fn test_free_quarantines() {
        let (engine, sink) = engine(kb(4));
        let p = engine.allocate(40, None).unwrap().as_ptr() as usize;
        engine.free(p).unwrap();
        assert!(!engine.shadow.is_accessible(p));
        assert!(engine.shadow.shadow_byte(p).is_freed());
        assert_eq!(engine.get_size(p), None);
        assert_eq!(engine.quarantine.len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_eviction_invalidates_header() {
        let (engine, _) = engine(kb(4));
        let p = engine.allocate(40, None).unwrap().as_ptr() as usize;
        engine.free(p).unwrap();
        engine.set_quarantine_max_size(0);
        assert!(engine.quarantine.is_empty());
        assert!(engine.resolve_intact(p).is_none());
        assert!(engine.shadow.is_accessible(p));
        assert_eq!(engine.stats().eviction_count, 1);
    }

    #[test]
    fn test_aligned_allocation() {
        let (engine, _) = engine(kb(4));
        for align in [16, 64, 256] {
            let p = engine.allocate(24, Some(align)).unwrap().as_ptr() as usize;
            assert_eq!(p % align, 0);
            assert_eq!(engine.get_size(p), Some(24));
            engine.free(p).unwrap();
        }
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let (engine, _) = engine(kb(4));
        assert!(matches!(engine.allocate(8, Some(3)), Err(HeapError::BadAlignment(3))));
        assert!(engine.set_default_alignment(0).is_err());
    }

    #[test]
    fn test_out_of_memory() {
        let (engine, _) = engine(kb(4));
        assert!(matches!(
            engine.allocate(kb(512), None),
            Err(HeapError::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_trailer_padding_widens_right_redzone() {
        let (engine, _) = engine(kb(4));
        engine.set_trailer_padding(64);
        let p = engine.allocate(8, None).unwrap().as_ptr() as usize;
        let block = engine.resolve_intact(p).unwrap();
        assert!(block.geometry().right_size() >= 64 + crate::block::TRAILER_SIZE);
    }
}
