//! Bad-access diagnostics.
//!
//! This module provides:
//! - **Reports**: the structured [`BadAccessReport`] for every detected
//!   memory-safety violation
//! - **Classification**: locating the owning block of a faulting address
//! - **Corruption checking**: header validation across the whole heap
//! - **Strict mode**: Optional panic-on-report for CI
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | SH001 | heap-use-after-free            |
//! | SH002 | heap-buffer-underflow          |
//! | SH003 | heap-buffer-overflow           |
//! | SH004 | double free                    |
//! | SH005 | free of an unallocated address |
//! | SH006 | wild access                    |
//! | SH007 | heap corruption                |
//! | SH008 | unknown bad access             |
//! | SH9xx | Internal errors                |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shadowheap::diagnostics::{CollectingSink, suppress_diagnostics};
//!
//! let sink = Arc::new(CollectingSink::new());
//! let heap = ShadowHeap::new(HeapConfig::default().with_sink(sink.clone()))?;
//! ```

// Core diagnostic types
pub mod kind;
pub mod emit;
pub mod report;
pub mod strict;

// Analysis
pub(crate) mod classify;
pub mod corruption;

// Re-export core types
pub use kind::{Diagnostic, DiagnosticKind};
pub use emit::{emit_with_context, suppress_diagnostics, CollectingSink, ReportSink};
pub use report::{AccessMode, BadAccessKind, BadAccessReport};
pub use corruption::CorruptRange;
pub use strict::{StrictMode, set_strict_mode, strict_mode, StrictModeGuard, init_from_env};

// Re-export predefined diagnostics
pub use kind::{SH001, SH002, SH003, SH004, SH005, SH006, SH007, SH008, SH901};
