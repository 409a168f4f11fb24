//! Heap statistics.

use crate::util::size::format_bytes;

/// Snapshot of heap activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapStats {
    /// Total number of allocations performed.
    pub allocation_count: u64,

    /// Total number of successful frees.
    pub free_count: u64,

    /// Blocks evicted from quarantine and released.
    pub eviction_count: u64,

    /// Bad-access reports emitted.
    pub report_count: u64,

    /// Blocks currently allocated.
    pub live_blocks: usize,

    /// User bytes currently allocated.
    pub live_bytes: usize,

    /// Peak user bytes allocated (high water mark).
    pub peak_live_bytes: usize,

    /// Blocks held in quarantine.
    pub quarantine_blocks: usize,

    /// Storage bytes held in quarantine.
    pub quarantine_bytes: usize,

    /// Current quarantine maximum.
    pub quarantine_max_size: usize,
}

impl HeapStats {
    /// Calculate quarantine fill ratio.
    pub fn quarantine_fill(&self) -> f64 {
        if self.quarantine_max_size == 0 {
            return 0.0;
        }
        self.quarantine_bytes as f64 / self.quarantine_max_size as f64
    }
}

impl std::fmt::Display for HeapStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Shadow Heap Statistics:")?;
        writeln!(f, "  Allocations:     {}", self.allocation_count)?;
        writeln!(f, "  Frees:           {}", self.free_count)?;
        writeln!(f, "  Evictions:       {}", self.eviction_count)?;
        writeln!(f, "  Reports:         {}", self.report_count)?;
        writeln!(f, "  Live:            {} blocks, {}", self.live_blocks, format_bytes(self.live_bytes))?;
        writeln!(f, "  Peak live:       {}", format_bytes(self.peak_live_bytes))?;
        writeln!(
            f,
            "  Quarantine:      {} blocks, {} / {}",
            self.quarantine_blocks,
            format_bytes(self.quarantine_bytes),
            format_bytes(self.quarantine_max_size)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarantine_fill() {
        let stats = HeapStats {
            quarantine_bytes: 256,
            quarantine_max_size: 1024,
            ..HeapStats::default()
        };
        assert!((stats.quarantine_fill() - 0.25).abs() < f64::EPSILON);
        assert_eq!(HeapStats::default().quarantine_fill(), 0.0);
    }

    #[test]
    fn test_display() {
        let text = HeapStats::default().to_string();
        assert!(text.contains("Allocations:"));
        assert!(text.contains("Quarantine:"));
    }
}
