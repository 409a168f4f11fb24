//! Diagnostic kinds and core types.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagnosticKind {
    /// A memory-safety violation or a broken engine invariant.
    Error,
    /// Something suspicious that did not corrupt the heap.
    Warning,
    /// Additional context about another diagnostic.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `SH0xx` - Bad accesses and bad frees in the monitored program
/// - `SH9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "SH001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (SH0xx - Bad accesses)
// =============================================================================

/// SH001: Access to a freed block still held in quarantine.
pub const SH001: Diagnostic = Diagnostic::error(
    "SH001",
    "heap-use-after-free"
).with_note("the block was freed and is being held in quarantine")
 .with_help("the free stack below shows where the memory was released");

/// SH002: Access before the start of a live block.
pub const SH002: Diagnostic = Diagnostic::error(
    "SH002",
    "heap-buffer-underflow"
).with_note("the address lies in the block's left redzone")
 .with_help("check index arithmetic for negative offsets");

/// SH003: Access past the end of a live block.
pub const SH003: Diagnostic = Diagnostic::error(
    "SH003",
    "heap-buffer-overflow"
).with_note("the address lies at or past the end of the requested size")
 .with_help("check loop bounds and length calculations");

/// SH004: Free of a block that is already freed.
pub const SH004: Diagnostic = Diagnostic::error(
    "SH004",
    "attempting double-free"
).with_note("the block is already in quarantine");

/// SH005: Free of a pointer that was never returned by this heap.
pub const SH005: Diagnostic = Diagnostic::error(
    "SH005",
    "attempting free on address which was not allocated"
).with_help("only pass pointers returned by allocate or resize, unmodified");

/// SH006: Access that cannot be tied to any block.
pub const SH006: Diagnostic = Diagnostic::error(
    "SH006",
    "wild memory access"
).with_note("no block owns this address");

/// SH007: Block metadata has been overwritten.
pub const SH007: Diagnostic = Diagnostic::error(
    "SH007",
    "heap corruption"
).with_note("a block header no longer validates")
 .with_help("a write before the start of a nearby block is the usual cause");

/// SH008: A bad access that could not be classified.
pub const SH008: Diagnostic = Diagnostic::error(
    "SH008",
    "unknown bad access"
).with_note("the address is inside the bounds of a live block");

// =============================================================================
// Predefined diagnostics (SH9xx - Internal)
// =============================================================================

/// SH901: Internal invariant violation.
pub const SH901: Diagnostic = Diagnostic::error(
    "SH901",
    "internal heap invariant violated"
).with_note("this indicates a bug in shadowheap");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        let all = [SH001, SH002, SH003, SH004, SH005, SH006, SH007, SH008, SH901];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code, b.code);
            }
        }
    }

    #[test]
    fn test_builder() {
        assert_eq!(SH001.kind.prefix(), "error");
        assert!(SH001.note.is_some());
        assert!(SH004.help.is_none());
    }
}
