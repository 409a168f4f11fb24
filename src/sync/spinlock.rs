//! Raw ticket lock with explicit lock/unlock.
//!
//! The bulk heap contract exposes `lock()`/`unlock()` as separate calls, so
//! this lock carries no data and no guard of its own; scoped acquisition is
//! provided one level up by `HeapWalkGuard`.
//!
//! Waiters are served in arrival order, so a thread re-locking in a loop
//! (a heap scanner) queues behind threads already waiting.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Spins before a waiter starts yielding its time slice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// FIFO spin lock.
pub struct RawSpinLock {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock, waiting for every earlier ticket first.
    pub fn lock(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut spins = 0u32;
        while self.now_serving.load(Ordering::Acquire) != ticket {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Take the lock only if nobody holds it or waits for it.
    pub fn try_lock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Acquire);
        self.next_ticket
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock. Returns false if it was not held.
    pub fn unlock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Relaxed);
        if self.next_ticket.load(Ordering::Relaxed) == serving {
            return false;
        }
        self.now_serving.store(serving.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    /// Acquire the lock for the lifetime of the returned guard.
    pub fn guard(&self) -> SpinGuard<'_> {
        self.lock();
        SpinGuard { lock: self }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a RawSpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
