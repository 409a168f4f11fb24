//! Atomic helpers for statistics and counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A monotonically increasing event counter.
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A gauge that goes up and down and remembers its high-water mark.
pub struct AtomicGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl AtomicGauge {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Add to the gauge, returning the new value.
    pub fn add(&self, value: usize) -> usize {
        let now = self.current.fetch_add(value, Ordering::Relaxed) + value;
        self.update_peak(now);
        now
    }

    /// Subtract from the gauge (saturating), returning the new value.
    pub fn sub(&self, value: usize) -> usize {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(value);
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(c) => current = c,
            }
        }
    }

    pub fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn update_peak(&self, value: usize) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while value > peak {
            match self
                .peak
                .compare_exchange_weak(peak, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_peak() {
        let g = AtomicGauge::new();
        g.add(100);
        g.add(50);
        g.sub(120);
        assert_eq!(g.get(), 30);
        assert_eq!(g.peak(), 150);
        g.sub(1000);
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_counter() {
        let c = AtomicCounter::default();
        c.increment();
        c.add(4);
        assert_eq!(c.get(), 5);
    }
}
