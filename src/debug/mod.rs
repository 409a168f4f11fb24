//! Call stack capture and the stack capture cache.

pub mod backtrace;
pub mod stack_cache;
