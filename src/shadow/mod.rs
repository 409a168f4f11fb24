//! Shadow memory: one accessibility marker per quantum of heap address space.
//!
//! ## Markers
//!
//! | Value       | Meaning                                   |
//! |-------------|-------------------------------------------|
//! | `0x00`      | all 8 bytes addressable                   |
//! | `0x01-0x07` | first N bytes addressable                 |
//! | `0xF2`      | invalid address (outside coverage)        |
//! | `0xF8`      | user-defined redzone                      |
//! | `0xFA`      | heap left redzone (header zone)           |
//! | `0xFB`      | heap right redzone (trailer zone)         |
//! | `0xFD`      | freed (quarantined) block                 |
//! | `0xFE`      | allocator-internal memory                 |

pub mod marker;
pub mod memory;

pub use marker::{ShadowByte, ShadowMarker, QUANTUM, QUANTUM_SHIFT};
pub use memory::{ShadowBlock, ShadowMemory};
