//! Block header and trailer records embedded in heap storage.
//!
//! Both records are read and written with unaligned accesses at fixed
//! offsets from the block's addresses; neither is ever handed out as a
//! reference into storage.

use std::mem::size_of;
use std::ptr;

/// Signature of a live (allocated or quarantined) block header.
pub const BLOCK_MAGIC: u32 = 0xB10C_5AFE;

/// Size of the header immediately preceding the user pointer.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Size of the trailer placed after the user payload.
pub const TRAILER_SIZE: usize = size_of::<BlockTrailer>();

/// Trailer value for "not linked into the quarantine".
pub(crate) const NO_QUARANTINE_SLOT: u32 = u32::MAX;

/// Lifecycle state of a block.
///
/// `Allocated -> Quarantined -> Freed`; no transition skips a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BlockState {
    Allocated = 1,
    Quarantined = 2,
    Freed = 3,
}

impl BlockState {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(BlockState::Allocated),
            2 => Some(BlockState::Quarantined),
            3 => Some(BlockState::Freed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockState::Allocated => write!(f, "allocated"),
            BlockState::Quarantined => write!(f, "quarantined"),
            BlockState::Freed => write!(f, "freed"),
        }
    }
}

/// Metadata placed at `user - HEADER_SIZE`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub magic: u32,
    pub checksum: u16,
    pub state: u8,
    pub align_log: u8,
    pub user_size: u64,
    /// Bytes from storage start to the user pointer.
    pub left_size: u32,
    /// Bytes from the end of the user payload to the end of storage.
    pub right_size: u32,
    /// Raw `StackId` of the allocation stack, 0 if none.
    pub alloc_stack: u32,
    /// Raw `StackId` of the free stack, 0 until freed.
    pub free_stack: u32,
}

/// Metadata placed at the first quantum boundary after the user payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockTrailer {
    pub alloc_tid: u32,
    pub free_tid: u32,
    /// Microseconds since the engine epoch at free time.
    pub free_ticks: u64,
    /// Quarantine handle while quarantined.
    pub quarantine_slot: u32,
    pub reserved: u32,
}

impl BlockHeader {
    #[inline]
    pub fn has_magic(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }

    pub fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state)
    }

    /// Integrity value over every field except `checksum`.
    pub fn compute_checksum(&self) -> u16 {
        let words = [
            self.magic as u64 | (self.state as u64) << 32 | (self.align_log as u64) << 40,
            self.user_size,
            self.left_size as u64 | (self.right_size as u64) << 32,
            self.alloc_stack as u64 | (self.free_stack as u64) << 32,
        ];
        let mut h: u64 = 0x9E37_79B9_7F4A_7C15;
        for word in words {
            h ^= word;
            h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
            h ^= h >> 31;
        }
        (h ^ (h >> 16) ^ (h >> 32) ^ (h >> 48)) as u16
    }

    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Signature, checksum and state all check out.
    pub fn is_intact(&self) -> bool {
        self.has_magic() && self.state().is_some() && self.checksum == self.compute_checksum()
    }
}

impl BlockTrailer {
    pub fn new(alloc_tid: u32) -> Self {
        Self {
            alloc_tid,
            free_tid: 0,
            free_ticks: 0,
            quarantine_slot: NO_QUARANTINE_SLOT,
            reserved: 0,
        }
    }
}

/// # Safety
///
/// `addr..addr + HEADER_SIZE` must be readable.
#[inline]
pub(crate) unsafe fn read_header(addr: usize) -> BlockHeader {
    ptr::read_unaligned(addr as *const BlockHeader)
}

/// # Safety
///
/// `addr..addr + HEADER_SIZE` must be writable.
#[inline]
pub(crate) unsafe fn write_header(addr: usize, header: &BlockHeader) {
    ptr::write_unaligned(addr as *mut BlockHeader, *header);
}

/// # Safety
///
/// `addr..addr + TRAILER_SIZE` must be readable.
#[inline]
pub(crate) unsafe fn read_trailer(addr: usize) -> BlockTrailer {
    ptr::read_unaligned(addr as *const BlockTrailer)
}

/// # Safety
///
/// `addr..addr + TRAILER_SIZE` must be writable.
#[inline]
pub(crate) unsafe fn write_trailer(addr: usize, trailer: &BlockTrailer) {
    ptr::write_unaligned(addr as *mut BlockTrailer, *trailer);
}

/// # Safety
///
/// `addr..addr + size_of::<usize>()` must be readable.
#[inline]
pub(crate) unsafe fn read_word(addr: usize) -> usize {
    ptr::read_unaligned(addr as *const usize)
}

/// # Safety
///
/// `addr..addr + size_of::<usize>()` must be writable.
#[inline]
pub(crate) unsafe fn write_word(addr: usize, value: usize) {
    ptr::write_unaligned(addr as *mut usize, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        let mut h = BlockHeader {
            magic: BLOCK_MAGIC,
            checksum: 0,
            state: BlockState::Allocated as u8,
            align_log: 3,
            user_size: 100,
            left_size: 32,
            right_size: 28,
            alloc_stack: 7,
            free_stack: 0,
        };
        h.seal();
        h
    }

    #[test]
    fn test_record_sizes_are_quantum_multiples() {
        assert_eq!(HEADER_SIZE, 32);
        assert_eq!(TRAILER_SIZE, 24);
    }

    #[test]
    fn test_sealed_header_is_intact() {
        assert!(header().is_intact());
    }

    #[test]
    fn test_any_field_change_breaks_checksum() {
        let mut h = header();
        h.user_size += 1;
        assert!(!h.is_intact());

        let mut h = header();
        h.state = BlockState::Quarantined as u8;
        assert!(!h.is_intact());
        h.seal();
        assert!(h.is_intact());

        let mut h = header();
        h.checksum ^= 1;
        assert!(!h.is_intact());
    }

    #[test]
    fn test_inverted_magic_never_validates() {
        let mut h = header();
        h.magic = !BLOCK_MAGIC;
        h.seal();
        assert!(!h.has_magic());
        assert!(!h.is_intact());
    }

    #[test]
    fn test_unaligned_roundtrip_through_bytes() {
        let mut buf = [0u8; HEADER_SIZE + 3];
        let addr = buf.as_mut_ptr() as usize + 3;
        let h = header();
        unsafe {
            write_header(addr, &h);
            assert_eq!(read_header(addr), h);
        }
    }
}
