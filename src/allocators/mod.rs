//! Storage backends.
//!
//! The bulk heap collaborator, its arena implementation, and the
//! quarantine of freed blocks.

pub mod arena;
pub mod bulk;
pub mod quarantine;

pub use arena::ArenaHeap;
pub use bulk::{BulkHeap, HeapEntry, HeapWalkGuard};
pub use quarantine::{Evicted, Quarantine, QuarantineHandle, QuarantinedBlock};
