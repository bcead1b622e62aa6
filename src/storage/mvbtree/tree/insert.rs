use super::search::{route, Slot};
use super::{MultiValueTree, ENTRY_POINT_PAGE, NULL_BUCKET_PAGE, ROOT_PAGE};
use crate::primitives::pager::{AtomicOperation, PageRead};
use crate::storage::key::Key;
use crate::storage::mvbtree::bucket::{Bucket, BucketEntry};
use crate::storage::mvbtree::entry_point::EntryPoint;
use crate::storage::mvbtree::null_bucket::NullBucket;
use crate::storage::mvbtree::EMBEDDED_ITEMS_THRESHOLD;
use crate::storage::overflow::OverflowKey;
use crate::types::{IndexError, PageId, Result, Rid};

/// Splits one `put` may trigger before the tree is declared corrupt.
const MAX_SPLIT_RETRIES: usize = 64;

enum Attempt {
    Done(bool),
    Split(PageId),
}

impl MultiValueTree {
    /// Associates `rid` with `key`; `None` addresses the null key.
    ///
    /// Returns `false` when the pair was already present. Keys must carry exactly
    /// `key_size` components and no sentinels; oversized keys fail with
    /// [`IndexError::KeyTooLarge`] before any page is touched.
    pub fn put(&self, op: &mut AtomicOperation<'_>, key: Option<&Key>, rid: Rid) -> Result<bool> {
        self.check_store(op).map_err(|e| e.in_tree(&self.name, "put"))?;
        op.acquire_exclusive_lock(&self.lock_name);
        let added = match key {
            Some(key) => self.put_key(op, key, rid),
            None => self.put_null(op, rid),
        }
        .map_err(|e| e.in_tree(&self.name, "put"))?;
        if added {
            self.adjust_tree_size(op, 1)
                .map_err(|e| e.in_tree(&self.name, "put"))?;
        }
        Ok(added)
    }

    fn put_key(&self, op: &mut AtomicOperation<'_>, key: &Key, rid: Rid) -> Result<bool> {
        let key = self.codec.preprocess(key)?;
        if key.has_sentinel() {
            return Err(IndexError::Invalid("sentinel keys cannot be stored"));
        }
        if self.key_size > 1
            && (!matches!(key, Key::Composite(_)) || key.components() != self.key_size)
        {
            return Err(IndexError::Invalid(
                "composite key does not match the index key size",
            ));
        }
        let stored = self.codec.encode(&key)?;
        if stored.len() > self.options.max_key_size {
            return Err(IndexError::KeyTooLarge {
                tree: self.name.clone(),
                size: stored.len(),
                max: self.options.max_key_size,
            });
        }
        let mut m_id = None;
        for _ in 0..MAX_SPLIT_RETRIES {
            let (page, slot) = self.find_bucket(op, &key)?;
            let attempt = match slot {
                Ok(idx) => self.add_to_entry(op, page, idx, rid)?,
                Err(idx) => {
                    let id = match m_id {
                        Some(id) => id,
                        None => {
                            let id = self.next_m_id(op)?;
                            m_id = Some(id);
                            id
                        }
                    };
                    let mut image = op.page_mut(self.file, page)?;
                    let mut bucket = Bucket::new(image.data_mut());
                    if bucket.create_main_leaf_entry(idx, &stored, &[rid], id, 1)? {
                        tracing::trace!(
                            target: "mvbtree::search",
                            page = page.0,
                            idx,
                            m_id = id,
                            "leaf entry created"
                        );
                        Attempt::Done(true)
                    } else {
                        Attempt::Split(page)
                    }
                }
            };
            match attempt {
                Attempt::Done(added) => return Ok(added),
                Attempt::Split(page) => self.split_bucket(op, page)?,
            }
        }
        Err(IndexError::Corruption("bucket split did not make room"))
    }

    fn add_to_entry(
        &self,
        op: &mut AtomicOperation<'_>,
        page: PageId,
        idx: usize,
        rid: Rid,
    ) -> Result<Attempt> {
        let (header, embedded) = {
            let image = op.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            (bucket.leaf_header(idx)?, bucket.values(idx)?)
        };
        if embedded.contains(&rid) {
            return Ok(Attempt::Done(false));
        }
        if header.total > u32::from(header.embedded)
            && self.overflow.contains(op, &OverflowKey::new(header.m_id, rid))?
        {
            return Ok(Attempt::Done(false));
        }
        if (header.embedded as usize) < EMBEDDED_ITEMS_THRESHOLD {
            let mut image = op.page_mut(self.file, page)?;
            let appended = Bucket::new(image.data_mut()).append_new_leaf_entry(idx, rid)?;
            return Ok(if appended {
                Attempt::Done(true)
            } else {
                Attempt::Split(page)
            });
        }
        if !self.add_overflow_value(op, header.m_id, rid)? {
            return Ok(Attempt::Done(false));
        }
        let mut image = op.page_mut(self.file, page)?;
        Bucket::new(image.data_mut()).increment_entries_count(idx)?;
        Ok(Attempt::Done(true))
    }

    fn put_null(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<bool> {
        let Some(null_file) = self.null_file else {
            return Err(IndexError::Invalid("null keys are not supported by this index"));
        };
        let (m_id, total, embedded, present) = {
            let image = op.read_page(null_file, NULL_BUCKET_PAGE)?;
            let bucket = NullBucket::new(image.data());
            (
                bucket.m_id()?,
                bucket.total()?,
                bucket.embedded()?,
                bucket.contains(rid)?,
            )
        };
        if present {
            return Ok(false);
        }
        if total as usize > embedded
            && self.overflow.contains(op, &OverflowKey::new(m_id, rid))?
        {
            return Ok(false);
        }
        {
            let mut image = op.page_mut(null_file, NULL_BUCKET_PAGE)?;
            if NullBucket::new(image.data_mut()).add_value(rid)? {
                return Ok(true);
            }
        }
        if !self.add_overflow_value(op, m_id, rid)? {
            return Ok(false);
        }
        let mut image = op.page_mut(null_file, NULL_BUCKET_PAGE)?;
        NullBucket::new(image.data_mut()).increment_total()?;
        Ok(true)
    }

    /// Hands out the next bucket page, reusing pages left behind by [`Self::clear`].
    fn allocate_bucket(&self, op: &mut AtomicOperation<'_>, leaf: bool) -> Result<PageId> {
        let pages_size = {
            let image = op.read_page(self.file, ENTRY_POINT_PAGE)?;
            EntryPoint::new(image.data()).pages_size()?
        };
        let page = PageId(pages_size + 1);
        if page.0 >= op.pages_in(self.file)? {
            let allocated = op.allocate_page(self.file)?;
            if allocated != page {
                return Err(IndexError::Corruption(
                    "bucket file length disagrees with entry point",
                ));
            }
        }
        {
            let mut image = op.page_mut(self.file, ENTRY_POINT_PAGE)?;
            EntryPoint::new(image.data_mut()).set_pages_size(page.0)?;
        }
        let mut image = op.page_mut(self.file, page)?;
        Bucket::new(image.data_mut()).init(leaf)?;
        Ok(page)
    }

    /// Splits `page` in two and publishes the separator in its parent.
    pub(super) fn split_bucket(&self, op: &mut AtomicOperation<'_>, page: PageId) -> Result<()> {
        let (leaf, size, separator) = {
            let image = op.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            let size = bucket.size()?;
            if size < 2 {
                return Err(IndexError::Corruption("bucket too small to split"));
            }
            (bucket.is_leaf()?, size, bucket.key_bytes(size / 2)?.to_vec())
        };
        if page == ROOT_PAGE {
            return self.split_root(op, leaf, size);
        }
        let mid = size / 2;
        let (moved, old_right) = {
            let image = op.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            let from = if leaf { mid } else { mid + 1 };
            (bucket.entries(from, size)?, bucket.right_sibling()?)
        };
        let right = self.allocate_bucket(op, leaf)?;
        {
            let mut image = op.page_mut(self.file, right)?;
            let mut bucket = Bucket::new(image.data_mut());
            if leaf {
                bucket.set_left_sibling(Some(page))?;
                bucket.set_right_sibling(old_right)?;
            }
            bucket.add_all(&moved)?;
        }
        {
            let mut image = op.page_mut(self.file, page)?;
            let mut bucket = Bucket::new(image.data_mut());
            bucket.shrink(mid)?;
            if leaf {
                bucket.set_right_sibling(Some(right))?;
            }
        }
        if leaf {
            if let Some(old_right) = old_right {
                let mut image = op.page_mut(self.file, old_right)?;
                Bucket::new(image.data_mut()).set_left_sibling(Some(right))?;
            }
            self.stats.inc_leaf_splits();
        } else {
            self.stats.inc_non_leaf_splits();
        }
        tracing::debug!(
            target: "mvbtree::split",
            tree = %self.name,
            page = page.0,
            right = right.0,
            leaf,
            kept = mid,
            moved = moved.len(),
            "bucket split"
        );
        self.insert_separator(op, &separator, page, right)
    }

    /// Moves both halves of the root into new pages and rewrites the root as a single
    /// separator, adding one level.
    fn split_root(&self, op: &mut AtomicOperation<'_>, leaf: bool, size: usize) -> Result<()> {
        let mid = size / 2;
        let (lower, upper, separator) = {
            let image = op.read_page(self.file, ROOT_PAGE)?;
            let bucket = Bucket::new(image.data());
            let upper_from = if leaf { mid } else { mid + 1 };
            (
                bucket.entries(0, mid)?,
                bucket.entries(upper_from, size)?,
                bucket.key_bytes(mid)?.to_vec(),
            )
        };
        let left = self.allocate_bucket(op, leaf)?;
        let right = self.allocate_bucket(op, leaf)?;
        self.fill_half(op, left, &lower, leaf.then_some((None, Some(right))))?;
        self.fill_half(op, right, &upper, leaf.then_some((Some(left), None)))?;
        {
            let mut image = op.page_mut(self.file, ROOT_PAGE)?;
            let mut root = Bucket::new(image.data_mut());
            root.init(false)?;
            if !root.add_non_leaf_entry(0, &separator, left, right, false)? {
                return Err(IndexError::Corruption("separator does not fit an empty root"));
            }
        }
        self.stats.inc_root_splits();
        tracing::debug!(
            target: "mvbtree::split",
            tree = %self.name,
            left = left.0,
            right = right.0,
            leaf,
            "root split"
        );
        Ok(())
    }

    fn fill_half(
        &self,
        op: &mut AtomicOperation<'_>,
        page: PageId,
        entries: &[BucketEntry],
        siblings: Option<(Option<PageId>, Option<PageId>)>,
    ) -> Result<()> {
        let mut image = op.page_mut(self.file, page)?;
        let mut bucket = Bucket::new(image.data_mut());
        if let Some((left, right)) = siblings {
            bucket.set_left_sibling(left)?;
            bucket.set_right_sibling(right)?;
        }
        bucket.add_all(entries)
    }

    /// Inserts separator `stored` between children `left` and `right` of the bucket that
    /// currently routes the separator to `left`, splitting that bucket first when full.
    fn insert_separator(
        &self,
        op: &mut AtomicOperation<'_>,
        stored: &[u8],
        left: PageId,
        right: PageId,
    ) -> Result<()> {
        let key = self.decode(stored)?;
        for _ in 0..MAX_SPLIT_RETRIES {
            let (parent, idx) = self.find_parent(op, &key, left)?;
            let added = {
                let mut image = op.page_mut(self.file, parent)?;
                Bucket::new(image.data_mut()).add_non_leaf_entry(idx, stored, left, right, true)?
            };
            if added {
                return Ok(());
            }
            self.split_bucket(op, parent)?;
        }
        Err(IndexError::Corruption("parent split did not make room"))
    }

    /// Non-leaf bucket whose route for `key` is `child`, with the insertion index of `key`.
    fn find_parent<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        key: &Key,
        child: PageId,
    ) -> Result<(PageId, usize)> {
        let mut page = ROOT_PAGE;
        for _ in 0..self.options.max_path_length {
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            if bucket.is_leaf()? {
                return Err(IndexError::Corruption("split bucket has no parent"));
            }
            let slot: Slot = bucket.find(key, |bytes| self.decode(bytes))?;
            let next = route(&bucket, slot)?;
            if next == child {
                let idx = match slot {
                    Ok(idx) => idx + 1,
                    Err(idx) => idx,
                };
                return Ok((page, idx));
            }
            page = next;
        }
        Err(self.depth_exceeded())
    }
}
