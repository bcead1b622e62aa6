use std::sync::Arc;

use smallvec::SmallVec;

use super::bucket::Bucket;
use super::entry_point::{EntryPoint, MIdCounter};
use super::null_bucket::NullBucket;
use super::options::{KeyDefinition, TreeOptions};
use super::stats::{TreeStats, TreeStatsSnapshot};
use super::{NULL_BUCKET_FILE_EXTENSION, OVERFLOW_FILE_EXTENSION, TREE_FILE_EXTENSION};
use crate::primitives::pager::{AtomicOperation, PageRead};
use crate::storage::key::{Key, KeyCodec};
use crate::storage::overflow::{OverflowContainer, OverflowKey, Validation};
use crate::types::{FileId, IndexError, PageId, Result, Rid};

mod insert;
mod remove;
pub(super) mod search;

/// Page holding tree-wide counters.
pub const ENTRY_POINT_PAGE: PageId = PageId(0);
/// Root bucket page; root splits rewrite it in place.
pub const ROOT_PAGE: PageId = PageId(1);
const NULL_BUCKET_PAGE: PageId = PageId(0);

/// Multi-value B+ tree handle.
///
/// The handle does not own a page store. Every operation receives the read view or
/// atomic operation to run in, which must come from the store the tree was created in.
/// Writers take the tree's exclusive lock through the operation and keep it until the
/// operation ends; readers hold the shared lock for one search or cursor batch.
#[derive(Debug)]
pub struct MultiValueTree {
    pub(super) name: String,
    pub(super) lock_name: String,
    store_id: u64,
    pub(super) file: FileId,
    pub(super) null_file: Option<FileId>,
    pub(super) overflow: OverflowContainer,
    pub(super) codec: KeyCodec,
    pub(super) key_size: usize,
    pub(super) options: TreeOptions,
    m_ids: MIdCounter,
    pub(super) stats: Arc<TreeStats>,
}

fn ignore_existing(existing: Option<u8>) -> Result<Validation> {
    Ok(match existing {
        Some(_) => Validation::Ignore,
        None => Validation::Put,
    })
}

impl MultiValueTree {
    /// Creates the tree's files inside `op`: entry point, empty root leaf, overflow
    /// container and, when enabled, the null bucket.
    pub fn create(
        op: &mut AtomicOperation<'_>,
        name: &str,
        definition: KeyDefinition,
        options: TreeOptions,
    ) -> Result<Self> {
        Self::create_inner(op, name, definition, options).map_err(|e| e.in_tree(name, "create"))
    }

    fn create_inner(
        op: &mut AtomicOperation<'_>,
        name: &str,
        definition: KeyDefinition,
        options: TreeOptions,
    ) -> Result<Self> {
        options.validate(op.store().page_size())?;
        if definition.key_size == 0 {
            return Err(IndexError::Invalid("key_size must be positive"));
        }
        let lock_name = format!("{name}{TREE_FILE_EXTENSION}");
        op.acquire_exclusive_lock(&lock_name);
        let file = op.create_file(&lock_name)?;
        let entry_point = op.allocate_page(file)?;
        let root = op.allocate_page(file)?;
        if entry_point != ENTRY_POINT_PAGE || root != ROOT_PAGE {
            return Err(IndexError::Corruption("fresh tree file is not empty"));
        }
        EntryPoint::new(op.page_mut(file, ENTRY_POINT_PAGE)?.data_mut()).init()?;
        Bucket::new(op.page_mut(file, ROOT_PAGE)?.data_mut()).init(true)?;
        let overflow =
            OverflowContainer::create(op, &format!("{name}{OVERFLOW_FILE_EXTENSION}"))?;
        let m_ids = MIdCounter::resume(0);
        let null_file = if definition.null_key_supported {
            let null_file = op.create_file(&format!("{name}{NULL_BUCKET_FILE_EXTENSION}"))?;
            op.allocate_page(null_file)?;
            let m_id = {
                let mut page = op.page_mut(file, ENTRY_POINT_PAGE)?;
                m_ids.next_id(&mut EntryPoint::new(page.data_mut()))?
            };
            NullBucket::new(op.page_mut(null_file, NULL_BUCKET_PAGE)?.data_mut()).init(m_id)?;
            Some(null_file)
        } else {
            None
        };
        tracing::info!(
            target: "mvbtree::lifecycle",
            tree = name,
            key_size = definition.key_size,
            null_keys = definition.null_key_supported,
            "tree created"
        );
        Ok(Self {
            name: name.to_owned(),
            lock_name,
            store_id: op.store().id(),
            file,
            null_file,
            overflow,
            codec: definition.codec(),
            key_size: definition.key_size,
            options,
            m_ids,
            stats: Arc::new(TreeStats::default()),
        })
    }

    /// Reopens a tree created earlier with the same definition.
    pub fn load<R: PageRead + ?Sized>(
        tx: &R,
        name: &str,
        definition: KeyDefinition,
        options: TreeOptions,
    ) -> Result<Self> {
        Self::load_inner(tx, name, definition, options).map_err(|e| e.in_tree(name, "load"))
    }

    fn load_inner<R: PageRead + ?Sized>(
        tx: &R,
        name: &str,
        definition: KeyDefinition,
        options: TreeOptions,
    ) -> Result<Self> {
        let store = tx.store();
        options.validate(store.page_size())?;
        let lock_name = format!("{name}{TREE_FILE_EXTENSION}");
        let file = store.file_id(&lock_name).ok_or(IndexError::NotFound)?;
        let null_file = if definition.null_key_supported {
            let null_name = format!("{name}{NULL_BUCKET_FILE_EXTENSION}");
            Some(store.file_id(&null_name).ok_or(IndexError::NotFound)?)
        } else {
            None
        };
        let overflow = OverflowContainer::open(tx, &format!("{name}{OVERFLOW_FILE_EXTENSION}"))?;
        let limit = {
            let _lock = tx.shared_lock(&lock_name);
            let page = tx.read_page(file, ENTRY_POINT_PAGE)?;
            EntryPoint::new(page.data()).m_id_limit()?
        };
        tracing::info!(target: "mvbtree::lifecycle", tree = name, m_id_limit = limit, "tree loaded");
        Ok(Self {
            name: name.to_owned(),
            lock_name,
            store_id: store.id(),
            file,
            null_file,
            overflow,
            codec: definition.codec(),
            key_size: definition.key_size,
            options,
            m_ids: MIdCounter::resume(limit),
            stats: Arc::new(TreeStats::default()),
        })
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the handle was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Number of components of a full key.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Whether `None` keys are accepted.
    pub fn null_key_supported(&self) -> bool {
        self.null_file.is_some()
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<TreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> TreeStatsSnapshot {
        self.stats.snapshot()
    }

    pub(super) fn check_store<R: PageRead + ?Sized>(&self, tx: &R) -> Result<()> {
        if tx.store().id() != self.store_id {
            return Err(IndexError::Invalid(
                "operation belongs to a different page store",
            ));
        }
        Ok(())
    }

    /// Number of `(key, rid)` pairs stored, null key included.
    pub fn size<R: PageRead + ?Sized>(&self, tx: &R) -> Result<u64> {
        self.check_store(tx).map_err(|e| e.in_tree(&self.name, "size"))?;
        let _lock = tx.shared_lock(&self.lock_name);
        self.tree_size(tx).map_err(|e| e.in_tree(&self.name, "size"))
    }

    pub(super) fn tree_size<R: PageRead + ?Sized>(&self, tx: &R) -> Result<u64> {
        let page = tx.read_page(self.file, ENTRY_POINT_PAGE)?;
        EntryPoint::new(page.data()).tree_size()
    }

    pub(super) fn adjust_tree_size(&self, op: &mut AtomicOperation<'_>, delta: i64) -> Result<()> {
        let mut page = op.page_mut(self.file, ENTRY_POINT_PAGE)?;
        let mut entry_point = EntryPoint::new(page.data_mut());
        let size = entry_point
            .tree_size()?
            .checked_add_signed(delta)
            .ok_or(IndexError::Corruption("tree size underflow"))?;
        entry_point.set_tree_size(size)
    }

    pub(super) fn next_m_id(&self, op: &mut AtomicOperation<'_>) -> Result<u64> {
        let mut page = op.page_mut(self.file, ENTRY_POINT_PAGE)?;
        self.m_ids.next_id(&mut EntryPoint::new(page.data_mut()))
    }

    /// Embedded record ids of leaf entry `idx` on `page`, followed by its overflow rows.
    pub(super) fn entry_values<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        page: PageId,
        idx: usize,
    ) -> Result<SmallVec<[Rid; 8]>> {
        let (mut values, header) = {
            let image = tx.read_page(self.file, page)?;
            let bucket = Bucket::new(image.data());
            (bucket.values(idx)?, bucket.leaf_header(idx)?)
        };
        if header.total > u32::from(header.embedded) {
            self.overflow.for_each_value(tx, header.m_id, |rid| {
                values.push(rid);
                true
            })?;
        }
        if values.len() != header.total as usize {
            return Err(IndexError::Corruption(
                "leaf entry total does not match stored values",
            ));
        }
        Ok(values)
    }

    /// Record ids stored under `key`; `None` addresses the null key.
    ///
    /// Keys that are absent, or a `None` key on a tree without null support, yield an
    /// empty result.
    pub fn get<R: PageRead + ?Sized>(&self, tx: &R, key: Option<&Key>) -> Result<Vec<Rid>> {
        self.check_store(tx).map_err(|e| e.in_tree(&self.name, "get"))?;
        let _lock = tx.shared_lock(&self.lock_name);
        match key {
            None => self.get_null(tx),
            Some(key) => self.get_key(tx, key),
        }
        .map_err(|e| e.in_tree(&self.name, "get"))
    }

    fn get_key<R: PageRead + ?Sized>(&self, tx: &R, key: &Key) -> Result<Vec<Rid>> {
        let key = self.codec.preprocess(key)?;
        if key.has_sentinel() {
            return Ok(Vec::new());
        }
        match self.locate_entry(tx, &key)? {
            Some((page, idx)) => Ok(self.entry_values(tx, page, idx)?.into_vec()),
            None => Ok(Vec::new()),
        }
    }

    fn get_null<R: PageRead + ?Sized>(&self, tx: &R) -> Result<Vec<Rid>> {
        let Some(null_file) = self.null_file else {
            return Ok(Vec::new());
        };
        let (mut values, m_id, total) = {
            let image = tx.read_page(null_file, NULL_BUCKET_PAGE)?;
            let bucket = NullBucket::new(image.data());
            (bucket.values()?.into_vec(), bucket.m_id()?, bucket.total()?)
        };
        if total as usize > values.len() {
            self.overflow.for_each_value(tx, m_id, |rid| {
                values.push(rid);
                true
            })?;
        }
        Ok(values)
    }

    /// Empties the tree in place. Bucket and overflow pages are kept and reused by later
    /// splits; overflow ids keep counting from where they were.
    pub fn clear(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        self.check_store(op).map_err(|e| e.in_tree(&self.name, "clear"))?;
        op.acquire_exclusive_lock(&self.lock_name);
        self.clear_inner(op).map_err(|e| e.in_tree(&self.name, "clear"))
    }

    fn clear_inner(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        {
            let mut page = op.page_mut(self.file, ENTRY_POINT_PAGE)?;
            let mut entry_point = EntryPoint::new(page.data_mut());
            entry_point.set_tree_size(0)?;
            entry_point.set_pages_size(1)?;
        }
        Bucket::new(op.page_mut(self.file, ROOT_PAGE)?.data_mut()).init(true)?;
        if let Some(null_file) = self.null_file {
            let mut page = op.page_mut(null_file, NULL_BUCKET_PAGE)?;
            let mut bucket = NullBucket::new(page.data_mut());
            let m_id = bucket.m_id()?;
            bucket.init(m_id)?;
        }
        self.overflow.clear(op)?;
        tracing::info!(target: "mvbtree::lifecycle", tree = %self.name, "tree cleared");
        Ok(())
    }

    /// Releases the handle. Pages stay in the store and can be reopened with [`Self::load`].
    pub fn close(self) {
        self.stats.emit_tracing(&self.name);
        tracing::info!(target: "mvbtree::lifecycle", tree = %self.name, "tree closed");
    }

    /// Drops every file of the tree when the operation commits.
    ///
    /// Fails with [`IndexError::NotEmpty`] and changes nothing while the tree still holds
    /// entries.
    pub fn delete(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        self.check_store(op).map_err(|e| e.in_tree(&self.name, "delete"))?;
        op.acquire_exclusive_lock(&self.lock_name);
        self.delete_inner(op).map_err(|e| e.in_tree(&self.name, "delete"))
    }

    fn delete_inner(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        let size = self.tree_size(op)?;
        if size > 0 {
            return Err(IndexError::NotEmpty {
                tree: self.name.clone(),
                size,
            });
        }
        op.delete_file(self.file)?;
        if let Some(null_file) = self.null_file {
            op.delete_file(null_file)?;
        }
        self.overflow.clone().delete(op)?;
        tracing::info!(target: "mvbtree::lifecycle", tree = %self.name, "tree deleted");
        Ok(())
    }

    pub(super) fn add_overflow_value(
        &self,
        op: &mut AtomicOperation<'_>,
        m_id: u64,
        rid: Rid,
    ) -> Result<bool> {
        let added = self
            .overflow
            .validated_put(op, OverflowKey::new(m_id, rid), ignore_existing)?;
        if added {
            self.stats.inc_overflow_inserts();
        }
        Ok(added)
    }

    pub(super) fn remove_overflow_value(
        &self,
        op: &mut AtomicOperation<'_>,
        m_id: u64,
        rid: Rid,
    ) -> Result<bool> {
        let removed = self.overflow.remove(op, &OverflowKey::new(m_id, rid))?;
        if removed {
            self.stats.inc_overflow_removes();
        }
        Ok(removed)
    }
}
