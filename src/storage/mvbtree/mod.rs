#![forbid(unsafe_code)]

//! Multi-value B+ tree: ordered keys mapped to sets of record ids.
//!
//! A tree spans three files of one page store: the bucket file (entry point on page 0,
//! root bucket on page 1), an optional null-key bucket, and an overflow container for
//! record ids that do not fit inline in their leaf entry.

/// Bucket page format and allocator.
pub mod bucket;
mod cursor;
mod entry_point;
mod null_bucket;
mod options;
mod stats;
mod tree;
mod verify;

pub use cursor::{EntryCursor, KeyStream};
pub use entry_point::{EntryPoint, MIdCounter};
pub use null_bucket::NullBucket;
pub use options::{KeyDefinition, TreeOptions};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use tree::MultiValueTree;
pub use verify::VerifyReport;

/// Most record ids a leaf entry or the null bucket keeps inline.
pub const EMBEDDED_ITEMS_THRESHOLD: usize = 64;
/// Overflow ids reserved per durable entry point write.
pub const M_ID_BATCH_SIZE: u64 = 131_072;

/// File suffix of the bucket file.
pub const TREE_FILE_EXTENSION: &str = ".cbt";
/// File suffix of the null-key bucket.
pub const NULL_BUCKET_FILE_EXTENSION: &str = ".nbt";
/// File suffix of the overflow container.
pub const OVERFLOW_FILE_EXTENSION: &str = ".mbt";
