//! Synchronization primitives.
//!
//! Thin wrappers over std or parking_lot mutexes, a raw spin lock for the
//! bulk heap's walk lock, and relaxed atomic counters for statistics.

pub(crate) mod atomics;
pub(crate) mod mutex;
pub(crate) mod spinlock;
