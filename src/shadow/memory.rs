//! The shadow table.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};

use super::marker::{ShadowByte, ShadowMarker, QUANTUM, QUANTUM_SHIFT};
use crate::error::ShadowError;
use crate::util::layout::{align_down, align_up, is_aligned};

/// Shadow bytes printed per row by [`ShadowMemory::dump_around`].
const DUMP_ROW: usize = 16;

/// Rows printed on each side of the faulting row.
const DUMP_CONTEXT_ROWS: usize = 2;

/// A block located purely from shadow markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowBlock {
    /// First byte of the left redzone (the storage start).
    pub start: usize,
    /// One past the last byte of the right redzone, or of the freed run.
    pub end: usize,
    /// The block's quanta carry the freed marker.
    pub freed: bool,
}

/// Flat table of one marker per quantum over `[base, base + len)`.
///
/// Each marker is an `AtomicU8`, so a single-quantum write is never torn.
/// Multi-quantum writes are not atomic as a whole; callers serialize them
/// per block.
pub struct ShadowMemory {
    base: usize,
    len: usize,
    bytes: Box<[AtomicU8]>,
}

impl ShadowMemory {
    /// Create a table covering `[base, base + len)`, fully addressable.
    ///
    /// The range is widened outward to quantum boundaries.
    pub fn new(base: usize, len: usize) -> Self {
        let start = align_down(base, QUANTUM);
        let len = align_up(base + len - start, QUANTUM);
        let bytes = (0..len >> QUANTUM_SHIFT)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            base: start,
            len,
            bytes,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last covered address.
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[inline]
    fn index(&self, addr: usize) -> Option<usize> {
        if self.covers(addr) {
            Some((addr - self.base) >> QUANTUM_SHIFT)
        } else {
            None
        }
    }

    #[inline]
    fn load(&self, idx: usize) -> ShadowByte {
        ShadowByte(self.bytes[idx].load(Ordering::Relaxed))
    }

    #[inline]
    fn store(&self, idx: usize, value: ShadowByte) {
        self.bytes[idx].store(value.0, Ordering::Relaxed);
    }

    #[inline]
    fn addr_of(&self, idx: usize) -> usize {
        self.base + (idx << QUANTUM_SHIFT)
    }

    /// Marker covering `addr`; `InvalidAddress` outside coverage.
    #[inline]
    pub fn shadow_byte(&self, addr: usize) -> ShadowByte {
        match self.index(addr) {
            Some(idx) => self.load(idx),
            None => ShadowMarker::InvalidAddress.as_byte(),
        }
    }

    /// Validate a range and return its first index and quantum count.
    fn range(&self, addr: usize, size: usize, end_aligned: bool) -> Result<(usize, usize), ShadowError> {
        if !is_aligned(addr, QUANTUM) {
            return Err(ShadowError::Misaligned { addr });
        }
        let end = addr
            .checked_add(size)
            .ok_or(ShadowError::OutOfRange { addr, size })?;
        if end_aligned && !is_aligned(end, QUANTUM) {
            return Err(ShadowError::Misaligned { addr: end });
        }
        if addr < self.base || end > self.end() {
            return Err(ShadowError::OutOfRange { addr, size });
        }
        let first = (addr - self.base) >> QUANTUM_SHIFT;
        let count = align_up(size, QUANTUM) >> QUANTUM_SHIFT;
        Ok((first, count))
    }

    /// Write `marker` over every quantum of `[addr, addr + size)`.
    ///
    /// Both ends must be quantum-aligned.
    pub fn poison(&self, addr: usize, size: usize, marker: ShadowMarker) -> Result<(), ShadowError> {
        let (first, count) = self.range(addr, size, true)?;
        for idx in first..first + count {
            self.store(idx, marker.as_byte());
        }
        Ok(())
    }

    /// Make `[addr, addr + size)` accessible.
    ///
    /// `addr` must be quantum-aligned; a trailing partial quantum gets a
    /// "first N bytes valid" marker.
    pub fn unpoison(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        let (first, count) = self.range(addr, size, false)?;
        let full = size >> QUANTUM_SHIFT;
        for idx in first..first + full {
            self.store(idx, ShadowByte::ADDRESSABLE);
        }
        let tail = size & (QUANTUM - 1);
        if tail != 0 {
            debug_assert_eq!(count, full + 1);
            self.store(first + full, ShadowByte::partial(tail));
        }
        Ok(())
    }

    /// Poison `[addr, addr + size)` with the freed marker.
    pub fn mark_as_freed(&self, addr: usize, size: usize) -> Result<(), ShadowError> {
        self.poison(addr, size, ShadowMarker::Freed)
    }

    /// Whether the single byte at `addr` may be accessed.
    #[inline]
    pub fn is_accessible(&self, addr: usize) -> bool {
        self.shadow_byte(addr).allows(addr & (QUANTUM - 1))
    }

    /// First inaccessible byte of `[addr, addr + size)`, if any.
    pub fn first_inaccessible(&self, addr: usize, size: usize) -> Option<usize> {
        let end = match addr.checked_add(size) {
            Some(end) => end,
            None => return Some(addr),
        };
        let mut cursor = addr;
        while cursor < end {
            let quantum_start = align_down(cursor, QUANTUM);
            let quantum_end = (quantum_start + QUANTUM).min(end);
            let byte = self.shadow_byte(cursor);
            if !byte.is_addressable() {
                match byte.partial_len() {
                    Some(valid) if cursor - quantum_start < valid => {
                        let valid_end = quantum_start + valid;
                        if valid_end < quantum_end {
                            return Some(valid_end);
                        }
                    }
                    _ => return Some(cursor),
                }
            }
            cursor = quantum_end;
        }
        None
    }

    pub fn is_range_accessible(&self, addr: usize, size: usize) -> bool {
        self.first_inaccessible(addr, size).is_none()
    }

    /// Find the start of the block covering `addr` from markers alone.
    ///
    /// Walks left across the right redzone and body (whichever `addr` starts
    /// in) to the block's left redzone, then to the first quantum of that
    /// redzone. Returns `None` for freed or unmarked memory, or when the
    /// scan runs off the covered range.
    pub fn find_block_boundary(&self, addr: usize) -> Option<usize> {
        let mut idx = self.index(addr)?;
        if self.load(idx).is_right_redzone() {
            while self.load(idx).is_right_redzone() {
                idx = idx.checked_sub(1)?;
            }
        }
        if self.load(idx).is_body() {
            while self.load(idx).is_body() {
                idx = idx.checked_sub(1)?;
            }
        }
        if !self.load(idx).is_left_redzone() {
            return None;
        }
        while idx > 0 && self.load(idx - 1).is_left_redzone() {
            idx -= 1;
        }
        Some(self.addr_of(idx))
    }

    /// Index one past the right redzone of the block starting at `start`.
    fn block_end_index(&self, start: usize) -> Option<usize> {
        let n = self.bytes.len();
        let mut idx = start;
        while idx < n && self.load(idx).is_left_redzone() {
            idx += 1;
        }
        while idx < n && self.load(idx).is_body() {
            idx += 1;
        }
        if idx >= n || !self.load(idx).is_right_redzone() {
            return None;
        }
        while idx < n && self.load(idx).is_right_redzone() {
            idx += 1;
        }
        Some(idx)
    }

    /// Storage size of the live block covering `addr`, from markers alone.
    ///
    /// Nested blocks are not supported: a block is exactly one
    /// left-redzone / body / right-redzone sequence.
    pub fn get_allocation_size(&self, addr: usize) -> Option<usize> {
        let start = self.find_block_boundary(addr)?;
        let start_idx = self.index(start)?;
        let end_idx = self.block_end_index(start_idx)?;
        Some((end_idx - start_idx) << QUANTUM_SHIFT)
    }

    /// Next block (live or freed run) whose first quantum is in `[from, limit)`.
    pub fn next_block(&self, from: usize, limit: usize) -> Option<ShadowBlock> {
        let mut idx = self.index(align_down(from.max(self.base), QUANTUM))?;
        let limit_idx = (limit.min(self.end()).saturating_sub(self.base)) >> QUANTUM_SHIFT;
        while idx < limit_idx {
            let byte = self.load(idx);
            if byte.is_left_redzone() {
                if let Some(end_idx) = self.block_end_index(idx) {
                    return Some(ShadowBlock {
                        start: self.addr_of(idx),
                        end: self.addr_of(end_idx),
                        freed: false,
                    });
                }
            } else if byte.is_freed() {
                let mut end_idx = idx;
                while end_idx < self.bytes.len() && self.load(end_idx).is_freed() {
                    end_idx += 1;
                }
                return Some(ShadowBlock {
                    start: self.addr_of(idx),
                    end: self.addr_of(end_idx),
                    freed: true,
                });
            }
            idx += 1;
        }
        None
    }

    /// Length in bytes of a zero-terminated array of `elem_size`-byte
    /// elements starting at `addr`, terminator included.
    ///
    /// Markers are consulted before each element is read, so the walk never
    /// touches an inaccessible byte. On hitting one, returns its offset from
    /// `addr` as the error.
    ///
    /// # Safety
    ///
    /// Every byte this table marks accessible must be readable memory.
    pub unsafe fn terminated_len(&self, addr: usize, elem_size: usize) -> Result<usize, usize> {
        debug_assert!(elem_size > 0);
        let mut offset = 0usize;
        loop {
            let elem = addr + offset;
            if let Some(bad) = self.first_inaccessible(elem, elem_size) {
                return Err(bad - addr);
            }
            // SAFETY: every byte of the element is marked accessible.
            let bytes = std::slice::from_raw_parts(elem as *const u8, elem_size);
            if bytes.iter().all(|&b| b == 0) {
                return Ok(offset + elem_size);
            }
            offset += elem_size;
        }
    }

    /// Render the marker rows around `addr`.
    pub fn dump_around(&self, addr: usize) -> String {
        let mut out = String::new();
        let idx = match self.index(addr) {
            Some(idx) => idx,
            None => {
                let _ = writeln!(
                    out,
                    "{:#x} is outside shadow memory [{:#x}, {:#x})",
                    addr,
                    self.base,
                    self.end()
                );
                return out;
            }
        };

        let rows = (self.bytes.len() + DUMP_ROW - 1) / DUMP_ROW;
        let row = idx / DUMP_ROW;
        let first = row.saturating_sub(DUMP_CONTEXT_ROWS);
        let last = (row + DUMP_CONTEXT_ROWS).min(rows - 1);

        let _ = writeln!(out, "Shadow bytes around the buggy address:");
        for r in first..=last {
            let prefix = if r == row { "=>" } else { "  " };
            let _ = write!(out, "{}{:#014x}:", prefix, self.addr_of(r * DUMP_ROW));
            let row_end = ((r + 1) * DUMP_ROW).min(self.bytes.len());
            for i in r * DUMP_ROW..row_end {
                let b = self.load(i).0;
                if i == idx {
                    let _ = write!(out, "[{:02x}]", b);
                } else {
                    let _ = write!(out, " {:02x} ", b);
                }
            }
            out.push('\n');
        }
        out
    }
}

impl std::fmt::Debug for ShadowMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowMemory")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_000;

    fn shadow() -> ShadowMemory {
        ShadowMemory::new(BASE, 4096)
    }

    /// Lay out a block the way the heap does: left redzone, body, right redzone.
    fn lay_block(s: &ShadowMemory, start: usize, left: usize, body: usize, total: usize) {
        let body_end = align_up(start + left + body, QUANTUM);
        s.poison(start, body_end - start, ShadowMarker::LeftRedzone).unwrap();
        s.unpoison(start + left, body).unwrap();
        s.poison(body_end, start + total - body_end, ShadowMarker::RightRedzone)
            .unwrap();
    }

    #[test]
    fn test_fresh_table_is_accessible() {
        let s = shadow();
        assert!(s.is_accessible(BASE));
        assert!(s.is_accessible(BASE + 4095));
        assert!(!s.is_accessible(BASE - 1));
        assert!(!s.is_accessible(BASE + 4096));
    }

    #[test]
    fn test_poison_requires_alignment() {
        let s = shadow();
        assert_eq!(
            s.poison(BASE + 1, 8, ShadowMarker::UserRedzone),
            Err(ShadowError::Misaligned { addr: BASE + 1 })
        );
        assert_eq!(
            s.poison(BASE, 9, ShadowMarker::UserRedzone),
            Err(ShadowError::Misaligned { addr: BASE + 9 })
        );
        assert!(matches!(
            s.poison(BASE + 4088, 16, ShadowMarker::UserRedzone),
            Err(ShadowError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_poison_and_unpoison_partial() {
        let s = shadow();
        s.poison(BASE, 64, ShadowMarker::UserRedzone).unwrap();
        assert!(!s.is_accessible(BASE + 10));

        s.unpoison(BASE, 13).unwrap();
        for i in 0..13 {
            assert!(s.is_accessible(BASE + i), "byte {} should be accessible", i);
        }
        assert!(!s.is_accessible(BASE + 13));
        assert!(!s.is_accessible(BASE + 15));
        assert!(!s.is_accessible(BASE + 16));
        assert_eq!(s.shadow_byte(BASE + 8), ShadowByte::partial(5));
    }

    #[test]
    fn test_mark_as_freed() {
        let s = shadow();
        s.mark_as_freed(BASE + 32, 32).unwrap();
        assert!(s.shadow_byte(BASE + 40).is_freed());
        assert!(!s.is_accessible(BASE + 63));
        assert!(s.is_accessible(BASE + 64));
    }

    #[test]
    fn test_first_inaccessible() {
        let s = shadow();
        s.poison(BASE, 32, ShadowMarker::LeftRedzone).unwrap();
        s.unpoison(BASE, 20).unwrap();
        assert_eq!(s.first_inaccessible(BASE, 20), None);
        assert_eq!(s.first_inaccessible(BASE, 21), Some(BASE + 20));
        assert_eq!(s.first_inaccessible(BASE + 18, 8), Some(BASE + 20));
        assert_eq!(s.first_inaccessible(BASE + 24, 1), Some(BASE + 24));
        assert_eq!(s.first_inaccessible(BASE, 0), None);
    }

    #[test]
    fn test_find_block_boundary_from_each_zone() {
        let s = shadow();
        let start = BASE + 64;
        lay_block(&s, start, 32, 20, 96);

        assert_eq!(s.find_block_boundary(start), Some(start));
        assert_eq!(s.find_block_boundary(start + 24), Some(start));
        assert_eq!(s.find_block_boundary(start + 32), Some(start));
        assert_eq!(s.find_block_boundary(start + 51), Some(start));
        assert_eq!(s.find_block_boundary(start + 95), Some(start));
        assert_eq!(s.get_allocation_size(start + 40), Some(96));
    }

    #[test]
    fn test_adjacent_blocks_do_not_merge() {
        let s = shadow();
        let a = BASE;
        let b = BASE + 96;
        lay_block(&s, a, 32, 16, 96);
        lay_block(&s, b, 32, 0, 64);

        assert_eq!(s.find_block_boundary(b + 8), Some(b));
        assert_eq!(s.find_block_boundary(a + 90), Some(a));
        assert_eq!(s.get_allocation_size(b + 40), Some(64));
        assert_eq!(s.get_allocation_size(a), Some(96));
    }

    #[test]
    fn test_boundary_not_found() {
        let s = shadow();
        assert_eq!(s.find_block_boundary(BASE + 100), None);
        s.mark_as_freed(BASE, 64).unwrap();
        assert_eq!(s.find_block_boundary(BASE + 8), None);
        assert_eq!(s.find_block_boundary(BASE - 8), None);
    }

    #[test]
    fn test_next_block_iterates_live_and_freed() {
        let s = shadow();
        lay_block(&s, BASE, 32, 8, 64);
        s.mark_as_freed(BASE + 128, 64).unwrap();

        let first = s.next_block(BASE, s.end()).unwrap();
        assert_eq!(
            first,
            ShadowBlock {
                start: BASE,
                end: BASE + 64,
                freed: false
            }
        );
        let second = s.next_block(first.end, s.end()).unwrap();
        assert_eq!(
            second,
            ShadowBlock {
                start: BASE + 128,
                end: BASE + 192,
                freed: true
            }
        );
        assert_eq!(s.next_block(second.end, s.end()), None);
    }

    #[test]
    fn test_terminated_len() {
        let mut buf = vec![0u64; 8];
        let bytes = buf.as_mut_ptr() as *mut u8;
        let addr = bytes as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), bytes, 6);
        }
        let s = ShadowMemory::new(addr, 64);
        assert_eq!(unsafe { s.terminated_len(addr, 1) }, Ok(6));

        // No terminator inside the accessible prefix.
        unsafe {
            std::ptr::write_bytes(bytes, b'x', 64);
        }
        s.poison(addr, 64, ShadowMarker::RightRedzone).unwrap();
        s.unpoison(addr, 10).unwrap();
        assert_eq!(unsafe { s.terminated_len(addr, 1) }, Err(10));
        assert_eq!(unsafe { s.terminated_len(addr, 4) }, Err(10));
    }

    #[test]
    fn test_dump_marks_faulting_byte() {
        let s = shadow();
        s.poison(BASE + 64, 8, ShadowMarker::RightRedzone).unwrap();
        let dump = s.dump_around(BASE + 64);
        assert!(dump.contains("[fb]"));
        assert!(dump.contains("=>"));
        assert!(s.dump_around(0).contains("outside shadow memory"));
    }
}
