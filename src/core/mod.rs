//! Core engine state.

pub(crate) mod engine;
pub(crate) mod tls;

pub(crate) use engine::Engine;
pub use tls::current_thread_id;
