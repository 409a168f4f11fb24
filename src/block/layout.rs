//! Block geometry.
//!
//! ```text
//! storage                header   user                 trailer          end
//!   | [pad word] ...pad... | hdr  | payload ... | tail | trl | padding  |
//!   |<-------- left redzone ----->|<- user_size ->|<--- right redzone --->|
//! ```
//!
//! Storage from the bulk heap is quantum-aligned. Alignments above the
//! quantum are met by reserving `alignment - QUANTUM` bytes of slack; when
//! that pushes the header away from the storage start, the first word of
//! storage records the header's offset.

use super::header::{BlockHeader, HEADER_SIZE, TRAILER_SIZE};
use crate::error::HeapError;
use crate::shadow::QUANTUM;
use crate::util::layout::{align_up, checked_align_up};

/// Storage requirements for one allocation, before storage is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub user_size: usize,
    pub alignment: usize,
    pub total_size: usize,
}

impl BlockPlan {
    /// Compute the storage needed for `user_size` bytes at `alignment`.
    pub fn new(user_size: usize, alignment: usize, trailer_padding: usize) -> Result<Self, HeapError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(HeapError::BadAlignment(alignment));
        }
        let alignment = alignment.max(QUANTUM);
        let overflow = || HeapError::SizeOverflow {
            requested: user_size,
        };

        let left = align_up(HEADER_SIZE.max(alignment), QUANTUM);
        let slack = alignment - QUANTUM;
        let body = checked_align_up(user_size, QUANTUM).ok_or_else(overflow)?;
        let padding = checked_align_up(trailer_padding, QUANTUM).ok_or_else(overflow)?;

        let total_size = left
            .checked_add(slack)
            .and_then(|n| n.checked_add(body))
            .and_then(|n| n.checked_add(TRAILER_SIZE))
            .and_then(|n| n.checked_add(padding))
            .ok_or_else(overflow)?;

        // left_size and right_size are stored as u32 in the header.
        if total_size - user_size > u32::MAX as usize {
            return Err(overflow());
        }

        Ok(Self {
            user_size,
            alignment,
            total_size,
        })
    }

    /// Place the block in quantum-aligned storage at `storage`.
    pub fn place(&self, storage: usize) -> BlockGeometry {
        debug_assert_eq!(storage % QUANTUM, 0);
        let user = align_up(storage + HEADER_SIZE, self.alignment);
        let geometry = BlockGeometry {
            storage,
            total_size: self.total_size,
            user,
            user_size: self.user_size,
        };
        debug_assert!(geometry.trailer() + TRAILER_SIZE <= geometry.end());
        geometry
    }
}

/// Addresses of a placed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub storage: usize,
    pub total_size: usize,
    pub user: usize,
    pub user_size: usize,
}

impl BlockGeometry {
    pub(crate) fn from_header(header_addr: usize, header: &BlockHeader) -> Self {
        let user = header_addr + HEADER_SIZE;
        let storage = user - header.left_size as usize;
        Self {
            storage,
            total_size: header.left_size as usize + header.user_size as usize + header.right_size as usize,
            user,
            user_size: header.user_size as usize,
        }
    }

    #[inline]
    pub fn header(&self) -> usize {
        self.user - HEADER_SIZE
    }

    #[inline]
    pub fn user_end(&self) -> usize {
        self.user + self.user_size
    }

    /// First quantum boundary at or after the payload end.
    #[inline]
    pub fn trailer(&self) -> usize {
        align_up(self.user_end(), QUANTUM)
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.storage + self.total_size
    }

    pub fn left_size(&self) -> usize {
        self.user - self.storage
    }

    pub fn right_size(&self) -> usize {
        self.end() - self.user_end()
    }

    /// The header does not sit at the storage start.
    pub fn has_padding_word(&self) -> bool {
        self.header() != self.storage
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.storage && addr < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alignment_geometry() {
        let plan = BlockPlan::new(100, 8, 0).unwrap();
        // 32 header + 104 body + 24 trailer
        assert_eq!(plan.total_size, 160);

        let g = plan.place(0x1000);
        assert_eq!(g.user, 0x1000 + HEADER_SIZE);
        assert_eq!(g.header(), 0x1000);
        assert!(!g.has_padding_word());
        assert_eq!(g.trailer(), g.user + 104);
        assert_eq!(g.left_size() + g.user_size + g.right_size(), g.total_size);
    }

    #[test]
    fn test_large_alignment_places_padding_word() {
        let plan = BlockPlan::new(10, 64, 0).unwrap();
        for storage in (0x2000..0x2040).step_by(QUANTUM) {
            let g = plan.place(storage);
            assert_eq!(g.user % 64, 0);
            assert!(g.user - storage >= HEADER_SIZE);
            assert!(g.trailer() + TRAILER_SIZE <= g.end());
            if g.has_padding_word() {
                assert!(g.header() - storage >= std::mem::size_of::<usize>());
            }
        }
    }

    #[test]
    fn test_trailer_padding_and_zero_size() {
        let plan = BlockPlan::new(0, 8, 5).unwrap();
        assert_eq!(plan.total_size, HEADER_SIZE + TRAILER_SIZE + 8);
        let g = plan.place(0x3000);
        assert_eq!(g.user_end(), g.user);
        assert_eq!(g.trailer(), g.user);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(matches!(BlockPlan::new(8, 3, 0), Err(HeapError::BadAlignment(3))));
        assert!(matches!(BlockPlan::new(8, 0, 0), Err(HeapError::BadAlignment(0))));
        assert!(matches!(
            BlockPlan::new(usize::MAX - 4, 8, 0),
            Err(HeapError::SizeOverflow { .. })
        ));
        assert!(matches!(
            BlockPlan::new(8, 8, usize::MAX),
            Err(HeapError::SizeOverflow { .. })
        ));
    }

    #[test]
    fn test_small_alignment_is_raised_to_quantum() {
        let plan = BlockPlan::new(1, 1, 0).unwrap();
        assert_eq!(plan.alignment, QUANTUM);
    }
}
