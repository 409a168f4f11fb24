//! Error types.

use thiserror::Error;

use crate::diagnostics::report::BadAccessReport;

/// Errors from shadow memory range operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShadowError {
    /// The address (or end address) is not a multiple of the quantum.
    #[error("address {addr:#x} is not aligned to the shadow quantum")]
    Misaligned { addr: usize },

    /// The range is not covered by the shadow table.
    #[error("range [{addr:#x}, +{size}) is outside shadow coverage")]
    OutOfRange { addr: usize, size: usize },
}

/// Errors returned by the heap facade.
#[derive(Debug, Error)]
pub enum HeapError {
    /// Block geometry overflowed `usize` (or the header's size fields).
    #[error("allocation of {requested} bytes overflows the block layout")]
    SizeOverflow { requested: usize },

    /// Alignment is zero or not a power of two.
    #[error("alignment {0} is not a power of two")]
    BadAlignment(usize),

    /// The bulk heap could not supply storage.
    #[error("bulk heap could not reserve {0} bytes")]
    OutOfMemory(usize),

    /// The pointer does not resolve to a block header.
    #[error("pointer {0:#x} does not belong to this heap")]
    InvalidPointer(usize),

    /// The block was already freed and sits in the quarantine.
    #[error("double free of {:#x}", .0.address)]
    DoubleFree(Box<BadAccessReport>),

    /// The block's header failed its integrity check.
    #[error("block at {0:#x} is corrupt")]
    CorruptBlock(usize),

    /// In-place resizing is never attempted.
    #[error("in-place resize is not supported")]
    InPlaceResizeUnsupported,

    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

impl HeapError {
    /// The report attached to this error, if the failure produced one.
    pub fn report(&self) -> Option<&BadAccessReport> {
        match self {
            HeapError::DoubleFree(report) => Some(report),
            _ => None,
        }
    }
}
