//! Thread-local state.

use std::sync::atomic::{AtomicU32, Ordering};

/// Ids are handed out from 1; 0 means "unknown thread".
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small, stable id of the calling thread, recorded in block trailers.
///
/// Returns 0 while the thread's locals are being torn down.
pub fn current_thread_id() -> u32 {
    THREAD_ID.try_with(|id| *id).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_within_thread() {
        assert_eq!(current_thread_id(), current_thread_id());
        assert_ne!(current_thread_id(), 0);
    }

    #[test]
    fn test_distinct_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
