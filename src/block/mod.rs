//! Redzone-wrapped heap blocks.
//!
//! A block is `[left redzone | header][payload][trailer | right redzone]`
//! inside one piece of bulk-heap storage. The header and trailer live in
//! the poisoned zones; every access to them goes through [`BlockRef`],
//! which only exists after the signature has been checked.

pub mod header;
pub mod layout;

pub use header::{BlockState, BLOCK_MAGIC, HEADER_SIZE, TRAILER_SIZE};
pub use layout::{BlockGeometry, BlockPlan};

use header::{read_header, read_trailer, read_word, write_header, write_trailer, BlockHeader, BlockTrailer};

use crate::debug::stack_cache::StackId;
use crate::shadow::QUANTUM;

/// Snapshot of a block's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockInfo {
    /// Start of the bulk-heap storage.
    pub storage: usize,
    /// Total storage size including redzones.
    pub storage_size: usize,
    /// The pointer handed to the client.
    pub user: usize,
    /// Requested size.
    pub user_size: usize,
    pub alignment: usize,
    pub state: BlockState,
    pub alloc_stack: Option<StackId>,
    pub free_stack: Option<StackId>,
    pub alloc_thread: u32,
    pub free_thread: Option<u32>,
    /// Microseconds since the heap was created, at free time.
    pub freed_at_micros: Option<u64>,
}

impl BlockInfo {
    pub fn user_end(&self) -> usize {
        self.user + self.user_size
    }
}

/// A validated view of one block's header.
///
/// Holds a copy of the header; [`BlockRef::commit`] writes it back.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockRef {
    header_addr: usize,
    header: BlockHeader,
}

impl BlockRef {
    /// Resolve a user pointer. Fails closed when the signature is wrong.
    ///
    /// # Safety
    ///
    /// `user - HEADER_SIZE..user` must be readable.
    pub unsafe fn from_user(user: usize) -> Option<Self> {
        let header_addr = user.checked_sub(HEADER_SIZE)?;
        let header = read_header(header_addr);
        if !header.has_magic() {
            return None;
        }
        Some(Self {
            header_addr,
            header,
        })
    }

    /// Resolve the start of bulk-heap storage `len` bytes long.
    ///
    /// The header is either at `storage` or at the offset recorded in the
    /// first word of `storage`.
    ///
    /// # Safety
    ///
    /// `storage..storage + len` must be readable.
    pub unsafe fn from_storage(storage: usize, len: usize) -> Option<Self> {
        if len < HEADER_SIZE {
            return None;
        }
        let header = read_header(storage);
        if header.has_magic() && header.left_size as usize == HEADER_SIZE {
            return Some(Self {
                header_addr: storage,
                header,
            });
        }

        let offset = read_word(storage);
        if offset == 0 || offset % QUANTUM != 0 || offset.checked_add(HEADER_SIZE)? > len {
            return None;
        }
        let header_addr = storage + offset;
        let header = read_header(header_addr);
        if header.has_magic() && header.left_size as usize == offset + HEADER_SIZE {
            Some(Self {
                header_addr,
                header,
            })
        } else {
            None
        }
    }

    /// Build a reference for a header about to be written.
    pub fn new(header_addr: usize, header: BlockHeader) -> Self {
        Self {
            header_addr,
            header,
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    pub fn state(&self) -> Option<BlockState> {
        self.header.state()
    }

    pub fn geometry(&self) -> BlockGeometry {
        BlockGeometry::from_header(self.header_addr, &self.header)
    }

    pub fn user(&self) -> usize {
        self.header_addr + HEADER_SIZE
    }

    /// Re-read the header from storage.
    ///
    /// # Safety
    ///
    /// The header bytes must still be readable.
    pub unsafe fn reload(&mut self) {
        self.header = read_header(self.header_addr);
    }

    /// Seal the header's checksum and write it to storage.
    ///
    /// # Safety
    ///
    /// The header bytes must be writable.
    pub unsafe fn commit(&mut self) {
        self.header.seal();
        write_header(self.header_addr, &self.header);
    }

    /// # Safety
    ///
    /// The block's trailer bytes must be readable.
    pub unsafe fn trailer(&self) -> BlockTrailer {
        read_trailer(self.geometry().trailer())
    }

    /// # Safety
    ///
    /// The block's trailer bytes must be writable.
    pub unsafe fn write_trailer(&self, trailer: &BlockTrailer) {
        write_trailer(self.geometry().trailer(), trailer);
    }

    /// # Safety
    ///
    /// The block's trailer bytes must be readable.
    pub unsafe fn info(&self) -> Option<BlockInfo> {
        let state = self.state()?;
        let geometry = self.geometry();
        let trailer = self.trailer();
        let freed = state != BlockState::Allocated;
        Some(BlockInfo {
            storage: geometry.storage,
            storage_size: geometry.total_size,
            user: geometry.user,
            user_size: geometry.user_size,
            alignment: 1usize << self.header.align_log,
            state,
            alloc_stack: StackId::from_raw(self.header.alloc_stack),
            free_stack: StackId::from_raw(self.header.free_stack),
            alloc_thread: trailer.alloc_tid,
            free_thread: freed.then_some(trailer.free_tid),
            freed_at_micros: freed.then_some(trailer.free_ticks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::header::{write_word, NO_QUARANTINE_SLOT};
    use super::*;
    use crate::util::layout::log2;

    fn build(buf: &mut [u64], user_size: usize, alignment: usize) -> (BlockGeometry, BlockRef) {
        let storage = buf.as_mut_ptr() as usize;
        let plan = BlockPlan::new(user_size, alignment, 0).unwrap();
        assert!(plan.total_size <= buf.len() * 8);
        let g = plan.place(storage);
        let mut block = BlockRef::new(
            g.header(),
            BlockHeader {
                magic: BLOCK_MAGIC,
                checksum: 0,
                state: BlockState::Allocated as u8,
                align_log: log2(plan.alignment),
                user_size: user_size as u64,
                left_size: g.left_size() as u32,
                right_size: g.right_size() as u32,
                alloc_stack: 0,
                free_stack: 0,
            },
        );
        unsafe {
            if g.has_padding_word() {
                write_word(storage, g.header() - storage);
            }
            block.commit();
            block.write_trailer(&BlockTrailer::new(3));
        }
        (g, block)
    }

    #[test]
    fn test_resolve_from_user_and_storage() {
        let mut buf = vec![0u64; 64];
        let (g, _) = build(&mut buf, 40, 8);
        unsafe {
            let by_user = BlockRef::from_user(g.user).unwrap();
            assert_eq!(by_user.geometry(), g);
            let by_storage = BlockRef::from_storage(g.storage, g.total_size).unwrap();
            assert_eq!(by_storage.geometry(), g);
            assert!(by_storage.header().is_intact());
        }
    }

    #[test]
    fn test_resolve_through_padding_word() {
        let mut buf = vec![0u64; 64];
        let (g, _) = build(&mut buf, 24, 128);
        assert_eq!(g.user % 128, 0);
        unsafe {
            let by_storage = BlockRef::from_storage(g.storage, g.total_size).unwrap();
            assert_eq!(by_storage.user(), g.user);
        }
    }

    #[test]
    fn test_signature_mismatch_fails_closed() {
        let mut buf = vec![0u64; 64];
        let (g, mut block) = build(&mut buf, 16, 8);
        block.header_mut().magic = !BLOCK_MAGIC;
        unsafe {
            block.commit();
            assert!(BlockRef::from_user(g.user).is_none());
            assert!(BlockRef::from_storage(g.storage, g.total_size).is_none());
        }
    }

    #[test]
    fn test_info_reflects_trailer() {
        let mut buf = vec![0u64; 64];
        let (g, block) = build(&mut buf, 16, 8);
        let info = unsafe { block.info().unwrap() };
        assert_eq!(info.user, g.user);
        assert_eq!(info.alloc_thread, 3);
        assert_eq!(info.free_thread, None);
        assert_eq!(info.alloc_stack, None);
        let trailer = unsafe { block.trailer() };
        assert_eq!(trailer.quarantine_slot, NO_QUARANTINE_SLOT);
    }
}
