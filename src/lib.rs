//! # shadowheap
//!
//! Redzone-wrapped heap with shadow memory for catching out-of-bounds
//! accesses and use-after-free.
//!
//! ## Features
//!
//! - Every block is wrapped in poisoned left/right redzones
//! - Byte-granular shadow memory (one marker per 8-byte quantum)
//! - Size-bounded quarantine delaying reuse of freed blocks
//! - Bad-access classification: use-after-free, underflow, overflow,
//!   double free, wild access, heap corruption
//! - Whole-heap corruption checking with coalesced corrupt ranges
//! - Allocation/free stack capture (`debug` feature)
//! - Serializable reports (`serde` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shadowheap::{AccessMode, BadAccessKind, HeapConfig, ShadowHeap};
//!
//! let heap = ShadowHeap::new(HeapConfig::default()).unwrap();
//!
//! let p = heap.allocate(100).unwrap();
//! let addr = p.as_ptr() as usize;
//! assert!(heap.check_access(addr, 100, AccessMode::Read).is_none());
//!
//! let report = heap.check_access(addr + 100, 1, AccessMode::Write).unwrap();
//! assert_eq!(report.kind, BadAccessKind::Overflow);
//!
//! heap.free(p.as_ptr()).unwrap();
//! ```

pub mod allocators;
pub mod api;
pub mod block;
pub mod debug;
pub mod diagnostics;
pub mod error;
pub mod shadow;

mod core;
#[allow(dead_code)]
mod sync;
#[allow(dead_code)]
mod util;

// Re-export public API at crate root for convenience
pub use api::alloc::{ResizeMode, ShadowHeap};
pub use api::config::HeapConfig;
pub use api::stats::HeapStats;
pub use error::{HeapError, ShadowError};

// Collaborators
pub use allocators::{ArenaHeap, BulkHeap, HeapEntry, HeapWalkGuard};
pub use debug::stack_cache::{StackCache, StackCaptureCache, StackId};

// Blocks and shadow memory
pub use block::{BlockInfo, BlockState, HEADER_SIZE, TRAILER_SIZE};
pub use shadow::{ShadowByte, ShadowMarker, ShadowMemory, QUANTUM};

// Diagnostics - reports and codes
pub use diagnostics::{AccessMode, BadAccessKind, BadAccessReport, CorruptRange};
pub use diagnostics::{CollectingSink, ReportSink, suppress_diagnostics};
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{StrictMode, set_strict_mode, StrictModeGuard};
pub use diagnostics::{SH001, SH002, SH003, SH004, SH005, SH006, SH007, SH008, SH901};

pub use crate::core::current_thread_id;
