use super::{MultiValueTree, NULL_BUCKET_PAGE};
use crate::primitives::pager::{AtomicOperation, PageRead};
use crate::storage::key::Key;
use crate::storage::mvbtree::bucket::Bucket;
use crate::storage::mvbtree::null_bucket::NullBucket;
use crate::types::{PageId, Result, Rid};

impl MultiValueTree {
    /// Dissociates `rid` from `key`; `None` addresses the null key.
    ///
    /// Returns `false` when the pair was not stored. A key whose last record id goes away
    /// is dropped from its leaf; buckets are never merged.
    pub fn remove(
        &self,
        op: &mut AtomicOperation<'_>,
        key: Option<&Key>,
        rid: Rid,
    ) -> Result<bool> {
        self.check_store(op).map_err(|e| e.in_tree(&self.name, "remove"))?;
        op.acquire_exclusive_lock(&self.lock_name);
        let removed = match key {
            Some(key) => self.remove_key(op, key, rid),
            None => self.remove_null(op, rid),
        }
        .map_err(|e| e.in_tree(&self.name, "remove"))?;
        if removed {
            self.adjust_tree_size(op, -1)
                .map_err(|e| e.in_tree(&self.name, "remove"))?;
        }
        Ok(removed)
    }

    fn remove_key(&self, op: &mut AtomicOperation<'_>, key: &Key, rid: Rid) -> Result<bool> {
        let key = self.codec.preprocess(key)?;
        if key.has_sentinel() {
            return Ok(false);
        }
        let Some((page, idx)) = self.locate_entry(op, &key)? else {
            return Ok(false);
        };
        if !self.remove_from_entry(op, page, idx, rid)? {
            return Ok(false);
        }
        let total = {
            let image = op.read_page(self.file, page)?;
            Bucket::new(image.data()).entries_count(idx)?
        };
        if total == 0 {
            let mut image = op.page_mut(self.file, page)?;
            Bucket::new(image.data_mut()).remove_entry(idx)?;
            self.stats.inc_entry_removals();
            tracing::debug!(
                target: "mvbtree::remove",
                tree = %self.name,
                page = page.0,
                idx,
                "leaf entry dropped"
            );
        }
        Ok(true)
    }

    fn remove_from_entry(
        &self,
        op: &mut AtomicOperation<'_>,
        page: PageId,
        idx: usize,
        rid: Rid,
    ) -> Result<bool> {
        let header = {
            let mut image = op.page_mut(self.file, page)?;
            let mut bucket = Bucket::new(image.data_mut());
            if bucket.remove_leaf_entry_value(idx, rid)? {
                return Ok(true);
            }
            bucket.leaf_header(idx)?
        };
        if header.total <= u32::from(header.embedded)
            || !self.remove_overflow_value(op, header.m_id, rid)?
        {
            return Ok(false);
        }
        let mut image = op.page_mut(self.file, page)?;
        Bucket::new(image.data_mut()).decrement_entries_count(idx)?;
        tracing::trace!(
            target: "mvbtree::remove",
            m_id = header.m_id,
            rid = %rid,
            "overflow value removed"
        );
        Ok(true)
    }

    fn remove_null(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<bool> {
        let Some(null_file) = self.null_file else {
            return Ok(false);
        };
        let (m_id, total, embedded) = {
            let mut image = op.page_mut(null_file, NULL_BUCKET_PAGE)?;
            let mut bucket = NullBucket::new(image.data_mut());
            if bucket.remove_value(rid)? {
                return Ok(true);
            }
            (bucket.m_id()?, bucket.total()?, bucket.embedded()?)
        };
        if total as usize <= embedded || !self.remove_overflow_value(op, m_id, rid)? {
            return Ok(false);
        }
        let mut image = op.page_mut(null_file, NULL_BUCKET_PAGE)?;
        NullBucket::new(image.data_mut()).decrement_total()?;
        Ok(true)
    }
}
