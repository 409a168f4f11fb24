//! Shadow byte values.

use std::fmt;

/// Number of application bytes covered by one shadow byte.
pub const QUANTUM: usize = 8;

/// `log2(QUANTUM)`.
pub const QUANTUM_SHIFT: usize = 3;

/// Non-accessible markers that can be written over a quantum-aligned range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ShadowMarker {
    InvalidAddress = 0xF2,
    UserRedzone = 0xF8,
    LeftRedzone = 0xFA,
    RightRedzone = 0xFB,
    Freed = 0xFD,
    Internal = 0xFE,
}

impl ShadowMarker {
    pub const fn as_byte(self) -> ShadowByte {
        ShadowByte(self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            ShadowMarker::InvalidAddress => "invalid address",
            ShadowMarker::UserRedzone => "user redzone",
            ShadowMarker::LeftRedzone => "heap left redzone",
            ShadowMarker::RightRedzone => "heap right redzone",
            ShadowMarker::Freed => "freed heap region",
            ShadowMarker::Internal => "allocator internal",
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0xF2 => ShadowMarker::InvalidAddress,
            0xF8 => ShadowMarker::UserRedzone,
            0xFA => ShadowMarker::LeftRedzone,
            0xFB => ShadowMarker::RightRedzone,
            0xFD => ShadowMarker::Freed,
            0xFE => ShadowMarker::Internal,
            _ => return None,
        })
    }
}

/// A raw shadow byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowByte(pub u8);

impl ShadowByte {
    pub const ADDRESSABLE: ShadowByte = ShadowByte(0);

    /// Marker for a quantum whose first `valid` bytes are addressable.
    ///
    /// `valid` must be nonzero; a full quantum collapses to `ADDRESSABLE`.
    pub const fn partial(valid: usize) -> ShadowByte {
        if valid >= QUANTUM {
            ShadowByte::ADDRESSABLE
        } else {
            ShadowByte(valid as u8)
        }
    }

    #[inline]
    pub const fn is_addressable(self) -> bool {
        self.0 == 0
    }

    /// Number of leading valid bytes if this is a partial marker.
    #[inline]
    pub const fn partial_len(self) -> Option<usize> {
        if self.0 > 0 && (self.0 as usize) < QUANTUM {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// Whether the byte at `offset` (0..QUANTUM) within the quantum is accessible.
    #[inline]
    pub const fn allows(self, offset: usize) -> bool {
        self.0 == 0 || (self.0 as usize) < QUANTUM && offset < self.0 as usize
    }

    /// Fully or partially addressable: part of a live block body.
    #[inline]
    pub const fn is_body(self) -> bool {
        (self.0 as usize) < QUANTUM
    }

    pub fn marker(self) -> Option<ShadowMarker> {
        ShadowMarker::from_raw(self.0)
    }

    #[inline]
    pub fn is_left_redzone(self) -> bool {
        self.0 == ShadowMarker::LeftRedzone as u8
    }

    #[inline]
    pub fn is_right_redzone(self) -> bool {
        self.0 == ShadowMarker::RightRedzone as u8
    }

    #[inline]
    pub fn is_freed(self) -> bool {
        self.0 == ShadowMarker::Freed as u8
    }

    pub fn describe(self) -> &'static str {
        if self.is_addressable() {
            "addressable"
        } else if self.partial_len().is_some() {
            "partially addressable"
        } else {
            self.marker().map(ShadowMarker::name).unwrap_or("unknown marker")
        }
    }
}

impl From<ShadowMarker> for ShadowByte {
    fn from(marker: ShadowMarker) -> Self {
        marker.as_byte()
    }
}

impl fmt::Debug for ShadowByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}
