//! Multi-value B+ tree index engine.
//!
//! Keys are kept in sorted buckets over a page store; each key maps to a set of record
//! ids that lives inline in its leaf entry until it grows past a threshold and spills
//! into an overflow container. All writes go through an atomic operation, all reads
//! through a [`PageRead`](primitives::pager::PageRead) view.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::pager::{run_atomic, AtomicOperation, MemPager, PageRead, PagerOptions};
pub use storage::key::{Key, KeyType};
pub use storage::mvbtree::{
    EntryCursor, KeyDefinition, KeyStream, MultiValueTree, TreeOptions, VerifyReport,
};
pub use types::{IndexError, Result, Rid};
