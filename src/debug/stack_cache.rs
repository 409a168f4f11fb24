//! Interned, reference-counted call stacks.
//!
//! The heap only ever talks to a [`StackCache`] through `save`, `release`
//! and `frames_of`; eviction policy belongs to the cache.

use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::sync::mutex::Mutex;

/// Handle to an interned stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackId(NonZeroU32);

impl StackId {
    /// Decode a raw header value; 0 means "no stack".
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(StackId)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack#{}", self.0)
    }
}

/// The stack capture cache contract.
pub trait StackCache: Send + Sync {
    /// Intern `frames`, taking one reference.
    fn save(&self, frames: &[usize]) -> StackId;

    /// Drop one reference taken by `save`.
    fn release(&self, id: StackId);

    /// Frames of a live stack.
    fn frames_of(&self, id: StackId) -> Option<Vec<usize>>;
}

struct CachedStack {
    frames: Vec<usize>,
    refs: usize,
}

#[derive(Default)]
struct CacheInner {
    by_frames: HashMap<Vec<usize>, StackId>,
    stacks: HashMap<StackId, CachedStack>,
    next_id: u32,
}

/// Process-wide stack cache: identical stacks share one entry, which is
/// dropped when its last reference is released.
#[derive(Default)]
pub struct StackCaptureCache {
    inner: Mutex<CacheInner>,
}

impl StackCaptureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct live stacks.
    pub fn len(&self) -> usize {
        self.inner.lock().stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count of `id` (0 if evicted).
    pub fn ref_count(&self, id: StackId) -> usize {
        self.inner.lock().stacks.get(&id).map_or(0, |s| s.refs)
    }
}

impl StackCache for StackCaptureCache {
    fn save(&self, frames: &[usize]) -> StackId {
        let mut inner = self.inner.lock();
        let existing = inner.by_frames.get(frames).copied();
        if let Some(id) = existing {
            if let Some(stack) = inner.stacks.get_mut(&id) {
                stack.refs += 1;
            }
            return id;
        }

        // Skip ids still in use after the counter wraps.
        let id = loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            if let Some(id) = StackId::from_raw(inner.next_id) {
                if !inner.stacks.contains_key(&id) {
                    break id;
                }
            }
        };
        inner.by_frames.insert(frames.to_vec(), id);
        inner.stacks.insert(
            id,
            CachedStack {
                frames: frames.to_vec(),
                refs: 1,
            },
        );
        id
    }

    fn release(&self, id: StackId) {
        let mut inner = self.inner.lock();
        let evict = match inner.stacks.get_mut(&id) {
            Some(stack) => {
                stack.refs -= 1;
                stack.refs == 0
            }
            None => {
                log::warn!("release of unknown {}", id);
                false
            }
        };
        if evict {
            if let Some(stack) = inner.stacks.remove(&id) {
                inner.by_frames.remove(&stack.frames);
            }
        }
    }

    fn frames_of(&self, id: StackId) -> Option<Vec<usize>> {
        self.inner.lock().stacks.get(&id).map(|s| s.frames.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_stacks_are_interned() {
        let cache = StackCaptureCache::new();
        let a = cache.save(&[1, 2, 3]);
        let b = cache.save(&[1, 2, 3]);
        let c = cache.save(&[4, 5]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.ref_count(a), 2);
        assert_eq!(cache.frames_of(c), Some(vec![4, 5]));
    }

    #[test]
    fn test_release_evicts_at_zero() {
        let cache = StackCaptureCache::new();
        let a = cache.save(&[7]);
        cache.save(&[7]);
        cache.release(a);
        assert_eq!(cache.ref_count(a), 1);
        cache.release(a);
        assert_eq!(cache.ref_count(a), 0);
        assert!(cache.frames_of(a).is_none());
        assert!(cache.is_empty());

        // Re-saving after eviction yields a live entry again.
        let again = cache.save(&[7]);
        assert_eq!(cache.ref_count(again), 1);
    }

    #[test]
    fn test_empty_stack_is_a_valid_entry() {
        let cache = StackCaptureCache::new();
        let id = cache.save(&[]);
        assert_eq!(cache.frames_of(id), Some(vec![]));
    }
}
