//! Heap configuration.

use std::sync::Arc;

use crate::diagnostics::emit::ReportSink;
use crate::util::size::{mb, parse_size};

/// Configuration for the shadow heap.
#[derive(Clone)]
pub struct HeapConfig {
    /// Size of the arena backing the default bulk heap (default: 64 MB)
    pub arena_size: usize,

    /// Bytes of freed blocks held before eviction (default: 10 MB)
    pub quarantine_max_size: usize,

    /// Alignment used when none is requested (default: 8)
    pub default_alignment: usize,

    /// Extra right-redzone bytes after the trailer (default: 0)
    pub trailer_padding: usize,

    /// Maximum frames recorded per stack (default: 62)
    pub stack_depth: usize,

    /// Record allocation and free stacks
    pub capture_stacks: bool,

    /// Where reports go; empty means stderr
    pub sinks: Vec<Arc<dyn ReportSink>>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_size: mb(64),
            quarantine_max_size: mb(10),
            default_alignment: 8,
            trailer_padding: 0,
            stack_depth: 62,
            capture_stacks: cfg!(feature = "debug"),
            sinks: Vec::new(),
        }
    }
}

impl HeapConfig {
    /// Create a small config for tests and constrained environments.
    pub fn minimal() -> Self {
        Self {
            arena_size: mb(1),
            quarantine_max_size: mb(1) / 4,
            capture_stacks: false,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `SHADOWHEAP_*` environment variables.
    ///
    /// Reads `SHADOWHEAP_ARENA_SIZE`, `SHADOWHEAP_QUARANTINE_SIZE`,
    /// `SHADOWHEAP_TRAILER_PADDING` and `SHADOWHEAP_ALIGNMENT`. Values that
    /// do not parse are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(val) = env_usize("SHADOWHEAP_ARENA_SIZE") {
            config.arena_size = val;
        }
        if let Some(val) = env_usize("SHADOWHEAP_QUARANTINE_SIZE") {
            config.quarantine_max_size = val;
        }
        if let Some(val) = env_usize("SHADOWHEAP_TRAILER_PADDING") {
            config.trailer_padding = val;
        }
        if let Some(val) = env_usize("SHADOWHEAP_ALIGNMENT") {
            config.default_alignment = val;
        }
        config
    }

    /// Builder pattern: set arena size.
    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Builder pattern: set quarantine maximum.
    pub fn with_quarantine_max_size(mut self, size: usize) -> Self {
        self.quarantine_max_size = size;
        self
    }

    /// Builder pattern: set default alignment.
    pub fn with_default_alignment(mut self, alignment: usize) -> Self {
        self.default_alignment = alignment;
        self
    }

    /// Builder pattern: set trailer padding.
    pub fn with_trailer_padding(mut self, padding: usize) -> Self {
        self.trailer_padding = padding;
        self
    }

    /// Builder pattern: set stack depth.
    pub fn with_stack_depth(mut self, depth: usize) -> Self {
        self.stack_depth = depth;
        self
    }

    /// Builder pattern: enable stack capture.
    pub fn with_stack_capture(mut self, enable: bool) -> Self {
        self.capture_stacks = enable;
        self
    }

    /// Builder pattern: add a report sink.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for HeapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapConfig")
            .field("arena_size", &self.arena_size)
            .field("quarantine_max_size", &self.quarantine_max_size)
            .field("default_alignment", &self.default_alignment)
            .field("trailer_padding", &self.trailer_padding)
            .field("stack_depth", &self.stack_depth)
            .field("capture_stacks", &self.capture_stacks)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

fn env_usize(key: &str) -> Option<usize> {
    let val = std::env::var(key).ok()?;
    match parse_size(&val) {
        Some(n) => Some(n),
        None => {
            log::warn!("ignoring {}={:?}: not a byte count", key, val);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HeapConfig::default();
        assert_eq!(config.arena_size, mb(64));
        assert_eq!(config.quarantine_max_size, mb(10));
        assert_eq!(config.default_alignment, 8);
        assert_eq!(config.trailer_padding, 0);
        assert_eq!(config.stack_depth, 62);
    }

    #[test]
    fn test_builder() {
        let config = HeapConfig::minimal()
            .with_quarantine_max_size(0)
            .with_trailer_padding(16)
            .with_default_alignment(32);
        assert_eq!(config.quarantine_max_size, 0);
        assert_eq!(config.trailer_padding, 16);
        assert_eq!(config.default_alignment, 32);
        assert!(!config.capture_stacks);
    }
}
