//! The Bad-Access report model.

use std::fmt;
use std::time::Duration;

use super::corruption::CorruptRange;
use super::kind::{Diagnostic, SH001, SH002, SH003, SH004, SH005, SH006, SH007, SH008};
use crate::block::BlockInfo;
use crate::debug::backtrace::format_frames;

/// Classified kind of a bad access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BadAccessKind {
    UseAfterFree,
    Underflow,
    Overflow,
    DoubleFree,
    InvalidFree,
    Wild,
    CorruptBlock,
    /// Inside the bounds of a live block; nothing to report.
    Unknown,
}

impl BadAccessKind {
    /// The diagnostic emitted for this kind.
    pub fn diagnostic(self) -> &'static Diagnostic {
        match self {
            BadAccessKind::UseAfterFree => &SH001,
            BadAccessKind::Underflow => &SH002,
            BadAccessKind::Overflow => &SH003,
            BadAccessKind::DoubleFree => &SH004,
            BadAccessKind::InvalidFree => &SH005,
            BadAccessKind::Wild => &SH006,
            BadAccessKind::CorruptBlock => &SH007,
            BadAccessKind::Unknown => &SH008,
        }
    }

    pub fn name(self) -> &'static str {
        self.diagnostic().message
    }
}

impl fmt::Display for BadAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of the faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessMode {
    Read,
    Write,
    /// Not a load or store: frees and heap checks.
    Unknown,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("READ"),
            AccessMode::Write => f.write_str("WRITE"),
            AccessMode::Unknown => f.write_str("ACCESS"),
        }
    }
}

/// Everything known about one bad access.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BadAccessReport {
    /// The faulting address.
    pub address: usize,
    pub kind: BadAccessKind,
    pub access_mode: AccessMode,
    pub access_size: usize,
    /// The owning block, when one was found.
    pub block: Option<BlockInfo>,
    pub alloc_frames: Vec<usize>,
    pub free_frames: Vec<usize>,
    /// "N bytes {before|after|inside} an M-byte region [start,end)".
    /// Absent for double frees and unowned addresses.
    pub location: Option<String>,
    /// Zero while the block is still allocated.
    pub time_since_free: Duration,
    pub shadow_dump: String,
    pub corrupt_ranges: Vec<CorruptRange>,
}

impl BadAccessReport {
    pub fn diagnostic(&self) -> &'static Diagnostic {
        self.kind.diagnostic()
    }

    /// One-line summary used for log output.
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} on address {:#x}",
            self.diagnostic().code,
            self.kind,
            self.address
        )
    }
}

impl fmt::Display for BadAccessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let diag = self.diagnostic();
        writeln!(
            f,
            "[shadowheap][{}] {}: {} on address {:#x}",
            diag.code,
            diag.kind.prefix(),
            self.kind,
            self.address
        )?;
        if self.access_mode != AccessMode::Unknown {
            writeln!(
                f,
                "{} of size {} at {:#x}",
                self.access_mode, self.access_size, self.address
            )?;
        }
        if let Some(location) = &self.location {
            writeln!(f, "{:#x} is located {}", self.address, location)?;
        }

        if let Some(block) = &self.block {
            if let Some(tid) = block.free_thread {
                writeln!(
                    f,
                    "freed by thread T{} {:?} ago here:",
                    tid, self.time_since_free
                )?;
                f.write_str(&format_frames(&self.free_frames))?;
            }
            let prefix = if block.free_thread.is_some() {
                "previously allocated"
            } else {
                "allocated"
            };
            writeln!(f, "{} by thread T{} here:", prefix, block.alloc_thread)?;
            f.write_str(&format_frames(&self.alloc_frames))?;
        }

        for range in &self.corrupt_ranges {
            writeln!(f, "{}", range)?;
        }
        if let Some(note) = diag.note {
            writeln!(f, "  note: {}", note)?;
        }
        if let Some(help) = diag.help {
            writeln!(f, "  help: {}", help)?;
        }
        f.write_str(&self.shadow_dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: BadAccessKind) -> BadAccessReport {
        BadAccessReport {
            address: 0x1000,
            kind,
            access_mode: AccessMode::Read,
            access_size: 1,
            block: None,
            alloc_frames: Vec::new(),
            free_frames: Vec::new(),
            location: Some("1 bytes before a 4-byte region [0x1001,0x1005)".into()),
            time_since_free: Duration::ZERO,
            shadow_dump: String::new(),
            corrupt_ranges: Vec::new(),
        }
    }

    #[test]
    fn test_kind_maps_to_code() {
        assert_eq!(BadAccessKind::UseAfterFree.diagnostic().code, "SH001");
        assert_eq!(BadAccessKind::DoubleFree.diagnostic().code, "SH004");
        assert_eq!(BadAccessKind::Unknown.diagnostic().code, "SH008");
        assert_eq!(BadAccessKind::Overflow.name(), "heap-buffer-overflow");
    }

    #[test]
    fn test_display() {
        let text = report(BadAccessKind::Underflow).to_string();
        assert!(text.contains("[SH002]"));
        assert!(text.contains("READ of size 1 at 0x1000"));
        assert!(text.contains("1 bytes before a 4-byte region"));
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            report(BadAccessKind::Wild).summary(),
            "[SH006] wild memory access on address 0x1000"
        );
    }
}
