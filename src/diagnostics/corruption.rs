//! Heap corruption checking.
//!
//! Blocks are found from shadow markers alone, then their headers are
//! checked. Adjacent corrupt blocks are grouped into one [`CorruptRange`].
//!
//! Neighbouring quarantined blocks form a single freed run in shadow
//! memory; the run is split using each block's header. A block in the run
//! whose header does not validate is bounded by its bulk-heap storage.

use std::fmt;

use crate::allocators::bulk::{BulkHeap, HeapWalkGuard};
use crate::block::{BlockRef, BlockState};
use crate::core::Engine;
use crate::shadow::{ShadowBlock, ShadowMemory, QUANTUM};

/// A contiguous span of corrupt blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CorruptRange {
    pub address: usize,
    pub length: usize,
    pub block_count: usize,
}

impl CorruptRange {
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr < self.end()
    }
}

impl fmt::Display for CorruptRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "corrupt heap range [{:#x},{:#x}) ({} bytes, {} block{})",
            self.address,
            self.end(),
            self.length,
            self.block_count,
            if self.block_count == 1 { "" } else { "s" }
        )
    }
}

/// Result of checking one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The block checks out and ends at `end`.
    Valid { end: usize },
    /// `[start, end)` is corrupt.
    Corrupt { end: usize },
}

/// Coalesces corrupt blocks into ranges as the scan visits them in order.
#[derive(Default)]
struct RangeBuilder {
    ranges: Vec<CorruptRange>,
    open: Option<CorruptRange>,
}

impl RangeBuilder {
    fn corrupt(&mut self, start: usize, end: usize) {
        if let Some(open) = self.open.as_mut() {
            if open.end() == start {
                open.length = end - open.address;
                open.block_count += 1;
                return;
            }
        }
        self.close();
        self.open = Some(CorruptRange {
            address: start,
            length: end - start,
            block_count: 1,
        });
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            self.ranges.push(open);
        }
    }

    fn finish(mut self) -> Vec<CorruptRange> {
        self.close();
        self.ranges
    }
}

/// Check one shadow-located block against its header.
///
/// # Safety
///
/// `block.start..block.end` must be readable.
pub(crate) unsafe fn inspect_block(block: ShadowBlock) -> Verdict {
    let corrupt = Verdict::Corrupt { end: block.end };
    let resolved = match BlockRef::from_storage(block.start, block.end - block.start) {
        Some(resolved) if resolved.header().is_intact() => resolved,
        _ => return corrupt,
    };
    let geometry = resolved.geometry();
    if geometry.storage != block.start {
        return corrupt;
    }

    match (block.freed, resolved.state()) {
        (false, Some(BlockState::Allocated)) if geometry.end() == block.end => {
            Verdict::Valid { end: block.end }
        }
        (true, Some(BlockState::Quarantined)) if geometry.end() <= block.end => {
            Verdict::Valid { end: geometry.end() }
        }
        _ => corrupt,
    }
}

/// Walk `[start, end)` of `shadow`, judging each block with `inspect`.
pub(crate) fn scan_blocks<F>(shadow: &ShadowMemory, start: usize, end: usize, mut inspect: F) -> Vec<CorruptRange>
where
    F: FnMut(ShadowBlock) -> Verdict,
{
    let mut builder = RangeBuilder::default();
    let mut cursor = start;
    let mut last_end = start;

    while let Some(block) = shadow.next_block(cursor, end) {
        if block.start != last_end {
            builder.close();
        }
        let next = match inspect(block) {
            Verdict::Valid { end } => {
                builder.close();
                end
            }
            Verdict::Corrupt { end } => {
                builder.corrupt(block.start, end);
                end
            }
        };
        // Always make progress, even past a degenerate block.
        cursor = next.max(block.start + 1);
        last_end = next;
    }
    builder.finish()
}

impl Engine {
    /// Scan blocks starting in `[start, end)`. The caller holds the bulk
    /// heap's walk lock.
    pub(crate) fn scan_locked(
        &self,
        guard: &HeapWalkGuard<'_, dyn BulkHeap>,
        start: usize,
        end: usize,
    ) -> Vec<CorruptRange> {
        // A start inside a block would misread its redzone as a block start.
        let start = match guard.entry_containing(start) {
            Some(entry) if entry.storage != start => entry.end(),
            _ => start,
        };
        scan_blocks(&self.shadow, start, end, |block| {
            let _lock = self.stripe(block.start);
            let fresh = match self.shadow.next_block(block.start, block.start + QUANTUM) {
                Some(fresh) if fresh.start == block.start => fresh,
                // Released or rebuilt since the markers were read.
                _ => return Verdict::Valid { end: block.end },
            };
            // SAFETY: the shadow table only covers the heap region.
            match unsafe { inspect_block(fresh) } {
                Verdict::Corrupt { end } if fresh.freed => Verdict::Corrupt {
                    end: freed_block_end(guard, fresh.start, end),
                },
                verdict => verdict,
            }
        })
    }

    /// Verify every block header starting in `[start, end)`.
    pub(crate) fn check_range(&self, start: usize, end: usize) -> Vec<CorruptRange> {
        let heap: &dyn BulkHeap = self.heap.as_ref();
        let ranges = match HeapWalkGuard::acquire(heap) {
            Some(guard) => self.scan_locked(&guard, start, end),
            None => {
                log::warn!("bulk heap refused its walk lock; heap check skipped");
                Vec::new()
            }
        };
        for range in &ranges {
            log::warn!("{}", range);
        }
        ranges
    }

    /// Verify every block header in the heap.
    pub(crate) fn check_heap(&self) -> Vec<CorruptRange> {
        self.check_range(self.shadow.base(), self.shadow.end())
    }
}

/// End of a corrupt block inside a freed run.
///
/// The broken header cannot give the block's extent, but the bulk heap
/// still holds its storage; the run is only condemned to `run_end` when
/// the bulk heap does not know the address either.
fn freed_block_end(guard: &HeapWalkGuard<'_, dyn BulkHeap>, start: usize, run_end: usize) -> usize {
    match guard.entry_size(start) {
        Some(size) if size > 0 => (start + size).min(run_end),
        _ => run_end,
    }
}
