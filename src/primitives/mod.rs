//! Low-level primitives for building the index engine.
//!
//! Includes byte utilities, named component locks and the page store collaborator.

/// Byte-level utilities and encoding/decoding.
///
/// Bounds-checked accessors for page buffers plus varints for key codecs.
pub mod bytes;

/// Named reader/writer locks shared through a page store.
pub mod concurrency;

/// Paging subsystem: page stores, atomic operations and read views.
pub mod pager;
