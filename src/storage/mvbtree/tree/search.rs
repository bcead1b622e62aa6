use super::{MultiValueTree, ROOT_PAGE};
use crate::primitives::pager::PageRead;
use crate::storage::key::Key;
use crate::storage::mvbtree::bucket::Bucket;
use crate::types::{IndexError, PageId, Result};

/// Position inside a bucket: `Ok(idx)` on an exact match, `Err(insertion_point)` otherwise.
pub(in crate::storage::mvbtree) type Slot = std::result::Result<usize, usize>;

/// Child a non-leaf bucket routes `slot` to.
pub(super) fn route<B: AsRef<[u8]>>(bucket: &Bucket<B>, slot: Slot) -> Result<PageId> {
    match slot {
        Ok(idx) => bucket.right(idx),
        Err(idx) if idx < bucket.size()? => bucket.left(idx),
        Err(_) => {
            let size = bucket.size()?;
            if size == 0 {
                return Err(IndexError::Corruption("non-leaf bucket has no entries"));
            }
            bucket.right(size - 1)
        }
    }
}

/// Which end of a leaf to start from when walking the leaf chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(in crate::storage::mvbtree) enum Edge {
    Leftmost,
    Rightmost,
}

impl MultiValueTree {
    pub(in crate::storage::mvbtree) fn decode(&self, stored: &[u8]) -> Result<Key> {
        self.codec.decode(stored)
    }

    pub(in crate::storage::mvbtree) fn depth_exceeded(&self) -> IndexError {
        IndexError::MaxDepthExceeded {
            tree: self.name.clone(),
            depth: self.options.max_path_length,
        }
    }

    /// Descends from the root to the leaf responsible for `key`.
    pub(in crate::storage::mvbtree) fn find_bucket<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        key: &Key,
    ) -> Result<(PageId, Slot)> {
        self.stats.inc_searches();
        let mut page = ROOT_PAGE;
        for depth in 0..self.options.max_path_length {
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            let slot = bucket.find(key, |bytes| self.decode(bytes))?;
            if bucket.is_leaf()? {
                tracing::trace!(
                    target: "mvbtree::search",
                    page = page.0,
                    depth,
                    found = slot.is_ok(),
                    "leaf reached"
                );
                return Ok((page, slot));
            }
            page = route(&bucket, slot)?;
        }
        Err(self.depth_exceeded())
    }

    /// Finds the leaf entry holding `key`, following sibling leaves whose boundary key
    /// matches when the search lands on a bucket edge.
    pub(in crate::storage::mvbtree) fn locate_entry<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        key: &Key,
    ) -> Result<Option<(PageId, usize)>> {
        let (page, slot) = self.find_bucket(tx, key)?;
        let insertion = match slot {
            Ok(idx) => return Ok(Some((page, idx))),
            Err(idx) => idx,
        };
        let (size, left, right) = {
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            (bucket.size()?, bucket.left_sibling()?, bucket.right_sibling()?)
        };
        if insertion == 0 {
            self.walk_siblings(tx, key, left, Edge::Rightmost)
        } else if insertion == size {
            self.walk_siblings(tx, key, right, Edge::Leftmost)
        } else {
            Ok(None)
        }
    }

    /// Checks the `edge` key of each leaf starting at `next`, skipping empty leaves and
    /// stopping at the first non-matching key.
    fn walk_siblings<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        key: &Key,
        mut next: Option<PageId>,
        edge: Edge,
    ) -> Result<Option<(PageId, usize)>> {
        let limit = self.walk_limit(tx)?;
        let mut hops = 0u64;
        while let Some(page) = next {
            hops += 1;
            if hops > limit {
                return Err(IndexError::Corruption("leaf sibling chain loops"));
            }
            self.stats.inc_sibling_walks();
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            let size = bucket.size()?;
            if size == 0 {
                next = match edge {
                    Edge::Leftmost => bucket.right_sibling()?,
                    Edge::Rightmost => bucket.left_sibling()?,
                };
                continue;
            }
            let idx = match edge {
                Edge::Leftmost => 0,
                Edge::Rightmost => size - 1,
            };
            if self.decode(bucket.key_bytes(idx)?)? != *key {
                return Ok(None);
            }
            tracing::debug!(
                target: "mvbtree::search",
                page = page.0,
                hops,
                "boundary key found on sibling"
            );
            return Ok(Some((page, idx)));
        }
        Ok(None)
    }

    /// Upper bound on leaves a sibling walk may visit.
    pub(in crate::storage::mvbtree) fn walk_limit<R: PageRead + ?Sized>(
        &self,
        tx: &R,
    ) -> Result<u64> {
        tx.pages_in(self.file)
    }

    /// Leaf at one end of the tree.
    pub(in crate::storage::mvbtree) fn edge_leaf<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        edge: Edge,
    ) -> Result<PageId> {
        let mut page = ROOT_PAGE;
        for _ in 0..self.options.max_path_length {
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            if bucket.is_leaf()? {
                return Ok(page);
            }
            let size = bucket.size()?;
            if size == 0 {
                return Err(IndexError::Corruption("non-leaf bucket has no entries"));
            }
            page = match edge {
                Edge::Leftmost => bucket.left(0)?,
                Edge::Rightmost => bucket.right(size - 1)?,
            };
        }
        Err(self.depth_exceeded())
    }

    /// First (or last) key of the tree, skipping leaves left empty by removals.
    fn edge_key<R: PageRead + ?Sized>(&self, tx: &R, edge: Edge) -> Result<Option<Key>> {
        let limit = self.walk_limit(tx)?;
        let mut next = Some(self.edge_leaf(tx, edge)?);
        let mut hops = 0u64;
        while let Some(page) = next {
            hops += 1;
            if hops > limit {
                return Err(IndexError::Corruption("leaf sibling chain loops"));
            }
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            let size = bucket.size()?;
            if size > 0 {
                let idx = match edge {
                    Edge::Leftmost => 0,
                    Edge::Rightmost => size - 1,
                };
                return self.decode(bucket.key_bytes(idx)?).map(Some);
            }
            next = match edge {
                Edge::Leftmost => bucket.right_sibling()?,
                Edge::Rightmost => bucket.left_sibling()?,
            };
        }
        Ok(None)
    }

    /// Smallest non-null key, or `None` for a tree without keyed entries.
    pub fn first_key<R: PageRead + ?Sized>(&self, tx: &R) -> Result<Option<Key>> {
        self.check_store(tx).map_err(|e| e.in_tree(&self.name, "first_key"))?;
        let _lock = tx.shared_lock(&self.lock_name);
        self.edge_key(tx, Edge::Leftmost)
            .map_err(|e| e.in_tree(&self.name, "first_key"))
    }

    /// Largest non-null key, or `None` for a tree without keyed entries.
    pub fn last_key<R: PageRead + ?Sized>(&self, tx: &R) -> Result<Option<Key>> {
        self.check_store(tx).map_err(|e| e.in_tree(&self.name, "last_key"))?;
        let _lock = tx.shared_lock(&self.lock_name);
        self.edge_key(tx, Edge::Rightmost)
            .map_err(|e| e.in_tree(&self.name, "last_key"))
    }
}
