//! Bad-access classification.
//!
//! Turns a faulting address into a [`BadAccessReport`]. The owning block is
//! found by walking the bulk heap under its walk lock; shadow markers are
//! the fallback when the walk cannot place the address.
//!
//! A quarantined owner always classifies as use-after-free. If its storage
//! had been reused and freed again by an unrelated allocation while still
//! enqueued, that classification is wrong; this imprecision is accepted.

use std::time::Duration;

use super::report::{AccessMode, BadAccessKind, BadAccessReport};
use crate::allocators::bulk::{BulkHeap, HeapWalkGuard};
use crate::block::{BlockRef, BlockState};
use crate::core::Engine;
use crate::debug::stack_cache::StackId;
use crate::diagnostics::corruption::CorruptRange;
use crate::error::HeapError;

/// Classify an access at `addr` against a block's state and user range.
pub(crate) fn classify(addr: usize, state: BlockState, user: usize, user_size: usize) -> BadAccessKind {
    if state == BlockState::Quarantined {
        BadAccessKind::UseAfterFree
    } else if addr < user {
        BadAccessKind::Underflow
    } else if addr >= user + user_size {
        BadAccessKind::Overflow
    } else {
        BadAccessKind::Unknown
    }
}

/// "N bytes {before|after|inside} an M-byte region [start,end)".
pub(crate) fn describe_location(addr: usize, user: usize, user_size: usize) -> String {
    let end = user + user_size;
    let (distance, direction) = if addr < user {
        (user - addr, "before")
    } else if addr >= end {
        (addr - end, "after")
    } else {
        (addr - user, "inside")
    };
    format!(
        "{} bytes {} a {}-byte region [{:#x},{:#x})",
        distance, direction, user_size, user, end
    )
}

impl Engine {
    /// Classify a bad access and assemble its report. Does not emit.
    pub(crate) fn classify_access(&self, addr: usize, mode: AccessMode, size: usize) -> BadAccessReport {
        let heap: &dyn BulkHeap = self.heap.as_ref();
        let guard = HeapWalkGuard::acquire(heap);
        if guard.is_none() {
            log::warn!("bulk heap refused its walk lock; classifying from shadow only");
        }

        let owner = guard
            .as_ref()
            .and_then(|guard| self.find_owning_block(guard, addr))
            .or_else(|| self.owner_from_shadow(addr));

        if let Some(block) = owner {
            let geometry = block.geometry();
            let state = block.state().unwrap_or(BlockState::Allocated);
            let kind = classify(addr, state, geometry.user, geometry.user_size);
            return self.build_report(addr, kind, mode, size, Some(&block), true, Vec::new());
        }

        let ranges = match &guard {
            Some(guard) => self.scan_locked(guard, self.shadow.base(), self.shadow.end()),
            None => Vec::new(),
        };
        drop(guard);

        let kind = if ranges.iter().any(|range| range.contains(addr)) {
            BadAccessKind::CorruptBlock
        } else {
            BadAccessKind::Wild
        };
        self.build_report(addr, kind, mode, size, None, false, ranges)
    }

    /// The live or quarantined block whose storage contains `addr`.
    pub(crate) fn find_owning_block(
        &self,
        guard: &HeapWalkGuard<'_, dyn BulkHeap>,
        addr: usize,
    ) -> Option<BlockRef> {
        let entry = guard.entry_containing(addr)?;
        let _lock = self.stripe(entry.storage);
        // SAFETY: the entry is live storage of the bulk heap.
        let block = unsafe { BlockRef::from_storage(entry.storage, entry.size)? };
        let geometry = block.geometry();
        if !block.header().is_intact() || geometry.storage != entry.storage || geometry.end() > entry.end() {
            return None;
        }
        Some(block)
    }

    /// Owner located purely from shadow markers.
    fn owner_from_shadow(&self, addr: usize) -> Option<BlockRef> {
        let start = self.shadow.find_block_boundary(addr)?;
        let len = self.shadow.get_allocation_size(addr)?;
        let _lock = self.stripe(start);
        // SAFETY: the shadow table only covers the heap region.
        let block = unsafe { BlockRef::from_storage(start, len)? };
        if !block.header().is_intact() || block.geometry().storage != start {
            return None;
        }
        Some(block)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        addr: usize,
        kind: BadAccessKind,
        mode: AccessMode,
        size: usize,
        block: Option<&BlockRef>,
        with_location: bool,
        corrupt_ranges: Vec<CorruptRange>,
    ) -> BadAccessReport {
        // SAFETY: callers only pass blocks validated against the heap.
        let info = block.and_then(|block| unsafe { block.info() });
        let frames = |id: Option<StackId>| id.and_then(|id| self.stacks.frames_of(id)).unwrap_or_default();

        let time_since_free = info
            .as_ref()
            .and_then(|info| info.freed_at_micros)
            .map(|freed| Duration::from_micros(self.now_micros().saturating_sub(freed)))
            .unwrap_or(Duration::ZERO);
        let location = if with_location {
            info.as_ref()
                .map(|info| describe_location(addr, info.user, info.user_size))
        } else {
            None
        };

        BadAccessReport {
            address: addr,
            kind,
            access_mode: mode,
            access_size: size,
            alloc_frames: frames(info.as_ref().and_then(|info| info.alloc_stack)),
            free_frames: frames(info.as_ref().and_then(|info| info.free_stack)),
            block: info,
            location,
            time_since_free,
            shadow_dump: self.shadow.dump_around(addr),
            corrupt_ranges,
        }
    }

    /// Report for a free of an already quarantined block.
    pub(crate) fn double_free_report(&self, block: &BlockRef) -> BadAccessReport {
        self.build_report(
            block.user(),
            BadAccessKind::DoubleFree,
            AccessMode::Unknown,
            0,
            Some(block),
            false,
            Vec::new(),
        )
    }

    /// Report a free of a pointer that does not resolve to a block.
    pub(crate) fn report_bad_free(&self, user: usize) -> HeapError {
        let (start, end) = self.heap.region();
        let mut report = if user >= start && user < end {
            self.classify_access(user, AccessMode::Unknown, 0)
        } else {
            self.build_report(user, BadAccessKind::InvalidFree, AccessMode::Unknown, 0, None, false, Vec::new())
        };

        if report.kind == BadAccessKind::CorruptBlock {
            self.emit(&report);
            return HeapError::CorruptBlock(user);
        }
        report.kind = BadAccessKind::InvalidFree;
        self.emit(&report);
        HeapError::InvalidPointer(user)
    }

    /// Check `[addr, addr + size)` against shadow memory, reporting the
    /// first inaccessible byte.
    pub(crate) fn check_access(&self, addr: usize, size: usize, mode: AccessMode) -> Option<BadAccessReport> {
        let bad = self.shadow.first_inaccessible(addr, size.max(1))?;
        let report = self.classify_access(bad, mode, size);
        self.emit(&report);
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let user = 0x1000;
        assert_eq!(classify(0x0fff, BlockState::Allocated, user, 100), BadAccessKind::Underflow);
        assert_eq!(classify(0x1064, BlockState::Allocated, user, 100), BadAccessKind::Overflow);
        assert_eq!(classify(0x1063, BlockState::Allocated, user, 100), BadAccessKind::Unknown);
        assert_eq!(classify(0x1000, BlockState::Quarantined, user, 100), BadAccessKind::UseAfterFree);
        assert_eq!(classify(0x0ff0, BlockState::Quarantined, user, 100), BadAccessKind::UseAfterFree);
    }

    #[test]
    fn test_describe_location() {
        assert_eq!(
            describe_location(0x0fff, 0x1000, 100),
            "1 bytes before a 100-byte region [0x1000,0x1064)"
        );
        assert_eq!(
            describe_location(0x1064, 0x1000, 100),
            "0 bytes after a 100-byte region [0x1000,0x1064)"
        );
        assert_eq!(
            describe_location(0x1010, 0x1000, 100),
            "16 bytes inside a 100-byte region [0x1000,0x1064)"
        );
    }
}
