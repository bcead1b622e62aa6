#![forbid(unsafe_code)]
//! Identifiers, record ids and the crate-wide error type.

use std::fmt;

pub mod checksum;

pub use checksum::page_crc32;

/// Index of a page inside one file managed by a [`crate::primitives::pager::PageStore`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Handle of a named file registered with a page store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Log sequence number assigned to a committed atomic operation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Record identifier: the payload stored for every key of the index.
///
/// Ordering is `(cluster_id, cluster_position)`, which is also the order the
/// overflow container keeps duplicate values in.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rid {
    /// Cluster the record lives in.
    pub cluster_id: i16,
    /// Logical position of the record inside its cluster.
    pub cluster_position: i64,
}

impl Rid {
    /// Encoded width of a record id inside a page.
    pub const ENCODED_LEN: usize = 10;

    /// Creates a new record id.
    pub const fn new(cluster_id: i16, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the index engine and its page store.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-page bytes violate a structural invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A named file or tree does not exist.
    #[error("not found")]
    NotFound,
    /// Serialized key exceeds the configured maximum; nothing was modified.
    #[error("key of tree `{tree}` is {size} bytes, maximum allowed is {max}")]
    KeyTooLarge {
        /// Tree that rejected the key.
        tree: String,
        /// Serialized (and possibly encrypted) key size.
        size: usize,
        /// Configured maximum key size.
        max: usize,
    },
    /// Root-to-leaf descent exceeded the configured depth; the tree must be rebuilt.
    #[error("tree `{tree}` is corrupted: search path exceeded {depth} levels")]
    MaxDepthExceeded {
        /// Tree whose structure is broken.
        tree: String,
        /// Depth limit that was reached.
        depth: usize,
    },
    /// Attempt to delete a tree that still holds entries.
    #[error("tree `{tree}` still holds {size} entries and cannot be deleted")]
    NotEmpty {
        /// Tree that was asked to be deleted.
        tree: String,
        /// Number of `(key, rid)` pairs still stored.
        size: u64,
    },
    /// Page store failure wrapped with tree and operation context.
    #[error("tree `{tree}` failed during {op}: {source}")]
    Storage {
        /// Tree that issued the operation.
        tree: String,
        /// Operation being executed.
        op: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<IndexError>,
    },
    /// Key serializer rejected its input.
    #[error("serialization: {0}")]
    Serialization(String),
    /// Key encryption hook failed.
    #[error("encryption: {0}")]
    Encryption(String),
}

impl IndexError {
    /// Wraps `self` with the tree name and operation that observed it.
    ///
    /// Capacity, corruption-depth and non-empty errors are already tree specific and are
    /// returned untouched, as are errors that were wrapped before.
    pub fn in_tree(self, tree: &str, op: &'static str) -> Self {
        match self {
            IndexError::KeyTooLarge { .. }
            | IndexError::MaxDepthExceeded { .. }
            | IndexError::NotEmpty { .. }
            | IndexError::Storage { .. } => self,
            other => IndexError::Storage {
                tree: tree.to_owned(),
                op,
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, looking through [`IndexError::Storage`] wrappers.
    pub fn root_cause(&self) -> &IndexError {
        match self {
            IndexError::Storage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_orders_by_cluster_then_position() {
        let mut rids = vec![Rid::new(2, 1), Rid::new(1, 9), Rid::new(1, -3)];
        rids.sort();
        assert_eq!(rids, vec![Rid::new(1, -3), Rid::new(1, 9), Rid::new(2, 1)]);
        assert_eq!(Rid::new(12, 7).to_string(), "#12:7");
    }

    #[test]
    fn in_tree_wraps_collaborator_failures_once() {
        let err = IndexError::Corruption("bad page").in_tree("idx", "put");
        let again = err.in_tree("idx", "remove");
        match &again {
            IndexError::Storage { tree, op, .. } => {
                assert_eq!(tree, "idx");
                assert_eq!(*op, "put");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(again.root_cause(), IndexError::Corruption("bad page")));
    }

    #[test]
    fn in_tree_keeps_capacity_errors() {
        let err = IndexError::KeyTooLarge {
            tree: "idx".into(),
            size: 10,
            max: 5,
        }
        .in_tree("idx", "put");
        assert!(matches!(err, IndexError::KeyTooLarge { size: 10, .. }));
    }
}
