//! Strict mode handling for diagnostics.
//!
//! Allows configuration of how reports are treated:
//! - Warn: Just emit the report
//! - PanicOnError: Emit and then panic (useful for CI)

use std::sync::atomic::{AtomicU8, Ordering};

/// Strict mode behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StrictMode {
    /// Just warn, don't panic.
    Warn = 0,
    /// Panic after emitting an error report.
    PanicOnError = 1,
}

impl From<u8> for StrictMode {
    fn from(val: u8) -> Self {
        match val {
            1 => StrictMode::PanicOnError,
            _ => StrictMode::Warn,
        }
    }
}

impl StrictMode {
    /// Parse a `SHADOWHEAP_STRICT` value. Unknown values mean `Warn`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "1" | "error" | "true" | "panic" => StrictMode::PanicOnError,
            _ => StrictMode::Warn,
        }
    }
}

/// Global strict mode setting.
static STRICT_MODE: AtomicU8 = AtomicU8::new(0);

/// Set the strict mode.
pub fn set_strict_mode(mode: StrictMode) {
    STRICT_MODE.store(mode as u8, Ordering::Relaxed);
}

/// Get the current strict mode.
pub fn strict_mode() -> StrictMode {
    StrictMode::from(STRICT_MODE.load(Ordering::Relaxed))
}

/// Check if an error report should panic.
pub fn should_panic() -> bool {
    strict_mode() == StrictMode::PanicOnError
}

/// RAII guard for temporarily setting strict mode.
pub struct StrictModeGuard {
    previous: StrictMode,
}

impl StrictModeGuard {
    /// Create a new guard that sets strict mode.
    pub fn new(mode: StrictMode) -> Self {
        let previous = strict_mode();
        set_strict_mode(mode);
        Self { previous }
    }

    /// Create a guard that enables panic-on-error.
    pub fn panic_on_error() -> Self {
        Self::new(StrictMode::PanicOnError)
    }
}

impl Drop for StrictModeGuard {
    fn drop(&mut self) {
        set_strict_mode(self.previous);
    }
}

/// Initialize strict mode from the `SHADOWHEAP_STRICT` environment variable.
pub fn init_from_env() {
    if let Ok(val) = std::env::var("SHADOWHEAP_STRICT") {
        set_strict_mode(StrictMode::parse(&val));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(StrictMode::parse("1"), StrictMode::PanicOnError);
        assert_eq!(StrictMode::parse(" Error "), StrictMode::PanicOnError);
        assert_eq!(StrictMode::parse("0"), StrictMode::Warn);
        assert_eq!(StrictMode::parse("bogus"), StrictMode::Warn);
    }

    #[test]
    fn test_from_u8() {
        assert_eq!(StrictMode::from(1), StrictMode::PanicOnError);
        assert_eq!(StrictMode::from(7), StrictMode::Warn);
    }

    // Other tests in this binary emit error reports, so the global mode is
    // never switched to panicking here.
    #[test]
    fn test_guard_restores_previous() {
        let before = strict_mode();
        {
            let _guard = StrictModeGuard::new(StrictMode::Warn);
            assert_eq!(strict_mode(), StrictMode::Warn);
        }
        assert_eq!(strict_mode(), before);
    }
}
