#![forbid(unsafe_code)]
//! Overflow container: an ordered set of `(m_id, rid)` rows stored in its own file.
//!
//! Leaf entries of a multi-value tree keep at most a fixed number of record ids inline;
//! the rest are spilled here, keyed by the entry's overflow id. The container is a plain
//! B+ tree over fixed-width records with a one-byte marker per row. Nodes are never
//! merged; empty leaves stay linked and are skipped by scans.
//!
//! ```text
//! page 0   size u64 | pages_size u64
//! page n   kind u8 | reserved u8 | count u16 | reserved u32 | right u64 | left u64
//!          leaf:     count × (m_id u64, cluster i16, position i64, marker u8)
//!          internal: first_child u64, count × (m_id u64, cluster i16, position i64, child u64)
//! ```

use std::collections::BTreeMap;

use crate::primitives::bytes::{
    read_i16, read_i64, read_u16, read_u64, read_u8, write_i16, write_i64, write_u16,
    write_u64, write_u8,
};
use crate::primitives::pager::{AtomicOperation, PageRead};
use crate::types::{FileId, IndexError, PageId, Result, Rid};

const META_PAGE: PageId = PageId(0);
const ROOT_PAGE: PageId = PageId(1);
const META_SIZE_OFFSET: usize = 0;
const META_PAGES_OFFSET: usize = 8;

const KIND_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 2;
const RIGHT_OFFSET: usize = 8;
const LEFT_OFFSET: usize = 16;
const NODE_HEADER_LEN: usize = 24;
const FIRST_CHILD_OFFSET: usize = NODE_HEADER_LEN;
const INTERNAL_RECORDS_OFFSET: usize = NODE_HEADER_LEN + 8;

const LEAF_KIND: u8 = 1;
const INTERNAL_KIND: u8 = 2;

const KEY_LEN: usize = 18;
const LEAF_RECORD_LEN: usize = KEY_LEN + 1;
const INTERNAL_RECORD_LEN: usize = KEY_LEN + 8;
const MAX_DEPTH: usize = 64;

/// Marker stored with every row.
pub const ROW_MARKER: u8 = 1;

/// Row key: owning overflow id, then record id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverflowKey {
    /// Overflow id of the owning leaf entry or null bucket.
    pub m_id: u64,
    /// Spilled record id.
    pub rid: Rid,
}

impl OverflowKey {
    /// Builds a row key.
    pub const fn new(m_id: u64, rid: Rid) -> Self {
        Self { m_id, rid }
    }

    /// Smallest key carrying `m_id`.
    pub const fn lowest(m_id: u64) -> Self {
        Self::new(m_id, Rid::new(i16::MIN, i64::MIN))
    }

    fn read(buf: &[u8], off: usize) -> Result<Self> {
        Ok(Self::new(
            read_u64(buf, off)?,
            Rid::new(read_i16(buf, off + 8)?, read_i64(buf, off + 10)?),
        ))
    }

    fn write(&self, buf: &mut [u8], off: usize) -> Result<()> {
        write_u64(buf, off, self.m_id)?;
        write_i16(buf, off + 8, self.rid.cluster_id)?;
        write_i64(buf, off + 10, self.rid.cluster_position)
    }
}

/// Answer of a validator consulted before a put.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Validation {
    /// Store the row.
    Put,
    /// Leave the container untouched.
    Ignore,
}

enum Node {
    Leaf {
        records: Vec<(OverflowKey, u8)>,
        left: u64,
        right: u64,
    },
    Internal {
        first: PageId,
        records: Vec<(OverflowKey, PageId)>,
    },
}

impl Node {
    fn empty_leaf() -> Self {
        Self::leaf(Vec::new(), 0, 0)
    }

    fn leaf(records: Vec<(OverflowKey, u8)>, left: u64, right: u64) -> Self {
        Node::Leaf {
            records,
            left,
            right,
        }
    }

    fn internal(first: PageId, records: Vec<(OverflowKey, PageId)>) -> Self {
        Node::Internal { first, records }
    }

    fn root(lo: PageId, separator: OverflowKey, hi: PageId) -> Self {
        Self::internal(lo, vec![(separator, hi)])
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let count = read_u16(buf, COUNT_OFFSET)? as usize;
        match read_u8(buf, KIND_OFFSET)? {
            LEAF_KIND => {
                let mut records = Vec::with_capacity(count);
                for i in 0..count {
                    let at = NODE_HEADER_LEN + i * LEAF_RECORD_LEN;
                    records.push((OverflowKey::read(buf, at)?, read_u8(buf, at + KEY_LEN)?));
                }
                Ok(Node::Leaf {
                    records,
                    left: read_u64(buf, LEFT_OFFSET)?,
                    right: read_u64(buf, RIGHT_OFFSET)?,
                })
            }
            INTERNAL_KIND => {
                let mut records = Vec::with_capacity(count);
                for i in 0..count {
                    let at = INTERNAL_RECORDS_OFFSET + i * INTERNAL_RECORD_LEN;
                    records.push((
                        OverflowKey::read(buf, at)?,
                        PageId(read_u64(buf, at + KEY_LEN)?),
                    ));
                }
                Ok(Node::Internal {
                    first: PageId(read_u64(buf, FIRST_CHILD_OFFSET)?),
                    records,
                })
            }
            _ => Err(IndexError::Corruption("unknown overflow node kind")),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        match self {
            Node::Leaf {
                records,
                left,
                right,
            } => {
                write_u8(buf, KIND_OFFSET, LEAF_KIND)?;
                write_u16(buf, COUNT_OFFSET, records.len() as u16)?;
                write_u64(buf, LEFT_OFFSET, *left)?;
                write_u64(buf, RIGHT_OFFSET, *right)?;
                for (i, (key, marker)) in records.iter().enumerate() {
                    let at = NODE_HEADER_LEN + i * LEAF_RECORD_LEN;
                    key.write(buf, at)?;
                    write_u8(buf, at + KEY_LEN, *marker)?;
                }
            }
            Node::Internal { first, records } => {
                write_u8(buf, KIND_OFFSET, INTERNAL_KIND)?;
                write_u16(buf, COUNT_OFFSET, records.len() as u16)?;
                write_u64(buf, FIRST_CHILD_OFFSET, first.0)?;
                for (i, (key, child)) in records.iter().enumerate() {
                    let at = INTERNAL_RECORDS_OFFSET + i * INTERNAL_RECORD_LEN;
                    key.write(buf, at)?;
                    write_u64(buf, at + KEY_LEN, child.0)?;
                }
            }
        }
        Ok(())
    }
}

fn child_for(
    first: PageId,
    records: &[(OverflowKey, PageId)],
    key: &OverflowKey,
) -> (usize, PageId) {
    let idx = records.partition_point(|(sep, _)| sep <= key);
    let child = if idx == 0 { first } else { records[idx - 1].1 };
    (idx, child)
}

enum Inserted {
    Done,
    Split(OverflowKey, PageId),
}

/// Handle of one overflow container file.
#[derive(Debug, Clone)]
pub struct OverflowContainer {
    name: String,
    file: FileId,
    leaf_capacity: usize,
    internal_capacity: usize,
}

impl OverflowContainer {
    fn with_file(name: &str, file: FileId, page_size: usize) -> Self {
        Self {
            name: name.to_owned(),
            file,
            leaf_capacity: (page_size - NODE_HEADER_LEN) / LEAF_RECORD_LEN,
            internal_capacity: (page_size - INTERNAL_RECORDS_OFFSET) / INTERNAL_RECORD_LEN,
        }
    }

    /// Creates the container file with an empty root leaf.
    pub fn create(op: &mut AtomicOperation<'_>, name: &str) -> Result<Self> {
        op.acquire_exclusive_lock(name);
        let file = op.create_file(name)?;
        let meta = op.allocate_page(file)?;
        let root = op.allocate_page(file)?;
        if meta != META_PAGE || root != ROOT_PAGE {
            return Err(IndexError::Corruption("fresh overflow file is not empty"));
        }
        let container = Self::with_file(name, file, op.store().page_size());
        container.write_meta(op, 0, 1)?;
        Node::empty_leaf().encode(op.page_mut(file, ROOT_PAGE)?.data_mut())?;
        tracing::debug!(target: "mvbtree::overflow", name, "overflow container created");
        Ok(container)
    }

    /// Opens an existing container file.
    pub fn open<R: PageRead + ?Sized>(tx: &R, name: &str) -> Result<Self> {
        let file = tx.store().file_id(name).ok_or(IndexError::NotFound)?;
        Ok(Self::with_file(name, file, tx.store().page_size()))
    }

    /// File name, also used as the container's lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File backing the container.
    pub fn file(&self) -> FileId {
        self.file
    }

    fn read_meta<R: PageRead + ?Sized>(&self, tx: &R) -> Result<(u64, u64)> {
        let page = tx.read_page(self.file, META_PAGE)?;
        Ok((
            read_u64(page.data(), META_SIZE_OFFSET)?,
            read_u64(page.data(), META_PAGES_OFFSET)?,
        ))
    }

    fn write_meta(&self, op: &mut AtomicOperation<'_>, size: u64, pages: u64) -> Result<()> {
        let mut page = op.page_mut(self.file, META_PAGE)?;
        write_u64(page.data_mut(), META_SIZE_OFFSET, size)?;
        write_u64(page.data_mut(), META_PAGES_OFFSET, pages)
    }

    fn load<R: PageRead + ?Sized>(&self, tx: &R, page: PageId) -> Result<Node> {
        Node::decode(tx.read_page(self.file, page)?.data())
    }

    fn store(&self, op: &mut AtomicOperation<'_>, page: PageId, node: &Node) -> Result<()> {
        node.encode(op.page_mut(self.file, page)?.data_mut())
    }

    fn allocate_node(&self, op: &mut AtomicOperation<'_>) -> Result<PageId> {
        let (size, pages) = self.read_meta(op)?;
        let page = PageId(pages + 1);
        if page.0 >= op.pages_in(self.file)? {
            let fresh = op.allocate_page(self.file)?;
            if fresh != page {
                return Err(IndexError::Corruption("overflow page count out of sync"));
            }
        }
        self.write_meta(op, size, page.0)?;
        Ok(page)
    }

    /// Number of rows stored.
    pub fn size<R: PageRead + ?Sized>(&self, tx: &R) -> Result<u64> {
        let _lock = tx.shared_lock(&self.name);
        Ok(self.read_meta(tx)?.0)
    }

    fn find_leaf<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        key: &OverflowKey,
    ) -> Result<(PageId, Node)> {
        let mut page = ROOT_PAGE;
        for _ in 0..MAX_DEPTH {
            match self.load(tx, page)? {
                Node::Internal { first, records } => page = child_for(first, &records, key).1,
                leaf => return Ok((page, leaf)),
            }
        }
        Err(IndexError::Corruption("overflow container deeper than allowed"))
    }

    fn lookup<R: PageRead + ?Sized>(&self, tx: &R, key: &OverflowKey) -> Result<Option<u8>> {
        let (_, node) = self.find_leaf(tx, key)?;
        let Node::Leaf { records, .. } = node else {
            return Err(IndexError::Corruption("overflow descent ended on internal node"));
        };
        Ok(records
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| records[idx].1))
    }

    /// Returns true when the row exists.
    pub fn contains<R: PageRead + ?Sized>(&self, tx: &R, key: &OverflowKey) -> Result<bool> {
        let _lock = tx.shared_lock(&self.name);
        Ok(self.lookup(tx, key)?.is_some())
    }

    /// Calls `f` for each row with `m_id`, in record id order, while it returns true.
    pub fn for_each_value<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        m_id: u64,
        mut f: impl FnMut(Rid) -> bool,
    ) -> Result<()> {
        let _lock = tx.shared_lock(&self.name);
        let start = OverflowKey::lowest(m_id);
        let (_, mut node) = self.find_leaf(tx, &start)?;
        let mut hops = 0u64;
        loop {
            let Node::Leaf { records, right, .. } = node else {
                return Err(IndexError::Corruption("overflow sibling is not a leaf"));
            };
            let from = records.partition_point(|(k, _)| *k < start);
            for (key, _) in &records[from..] {
                if key.m_id != m_id {
                    return Ok(());
                }
                if !f(key.rid) {
                    return Ok(());
                }
            }
            if right == 0 {
                return Ok(());
            }
            hops += 1;
            if hops > self.read_meta(tx)?.1 {
                return Err(IndexError::Corruption("overflow sibling chain loops"));
            }
            node = self.load(tx, PageId(right))?;
        }
    }

    /// All record ids stored under `m_id`, in order.
    pub fn values<R: PageRead + ?Sized>(&self, tx: &R, m_id: u64) -> Result<Vec<Rid>> {
        let mut out = Vec::new();
        self.for_each_value(tx, m_id, |rid| {
            out.push(rid);
            true
        })?;
        Ok(out)
    }

    /// Row counts grouped by overflow id.
    pub fn counts_by_m_id<R: PageRead + ?Sized>(&self, tx: &R) -> Result<BTreeMap<u64, u64>> {
        let _lock = tx.shared_lock(&self.name);
        let mut counts = BTreeMap::new();
        let (_, mut node) = self.find_leaf(tx, &OverflowKey::lowest(0))?;
        let limit = self.read_meta(tx)?.1;
        for _ in 0..=limit {
            let Node::Leaf { records, right, .. } = node else {
                return Err(IndexError::Corruption("overflow sibling is not a leaf"));
            };
            for (key, _) in records {
                *counts.entry(key.m_id).or_insert(0) += 1;
            }
            if right == 0 {
                return Ok(counts);
            }
            node = self.load(tx, PageId(right))?;
        }
        Err(IndexError::Corruption("overflow sibling chain loops"))
    }

    /// Stores `key` unless `validator`, shown the existing marker, answers
    /// [`Validation::Ignore`]. Returns true when a new row was added.
    pub fn validated_put(
        &self,
        op: &mut AtomicOperation<'_>,
        key: OverflowKey,
        validator: impl FnOnce(Option<u8>) -> Result<Validation>,
    ) -> Result<bool> {
        op.acquire_exclusive_lock(&self.name);
        let existing = self.lookup(op, &key)?;
        if validator(existing)? == Validation::Ignore {
            return Ok(false);
        }
        if existing.is_some() {
            return Ok(false);
        }
        self.insert(op, ROOT_PAGE, key, 0)?;
        let (size, pages) = self.read_meta(op)?;
        self.write_meta(op, size + 1, pages)?;
        tracing::trace!(
            target: "mvbtree::overflow",
            m_id = key.m_id,
            rid = %key.rid,
            "row added"
        );
        Ok(true)
    }

    fn insert(
        &self,
        op: &mut AtomicOperation<'_>,
        page: PageId,
        key: OverflowKey,
        depth: usize,
    ) -> Result<Inserted> {
        if depth >= MAX_DEPTH {
            return Err(IndexError::Corruption("overflow container deeper than allowed"));
        }
        match self.load(op, page)? {
            Node::Leaf {
                mut records,
                left,
                right,
            } => {
                let idx = records.partition_point(|(k, _)| *k < key);
                records.insert(idx, (key, ROW_MARKER));
                if records.len() <= self.leaf_capacity {
                    self.store(op, page, &Node::leaf(records, left, right))?;
                    return Ok(Inserted::Done);
                }
                let upper = records.split_off(records.len() / 2);
                let separator = upper[0].0;
                if page == ROOT_PAGE {
                    let lo = self.allocate_node(op)?;
                    let hi = self.allocate_node(op)?;
                    self.store(op, lo, &Node::leaf(records, 0, hi.0))?;
                    self.store(op, hi, &Node::leaf(upper, lo.0, 0))?;
                    self.store(op, ROOT_PAGE, &Node::root(lo, separator, hi))?;
                    return Ok(Inserted::Done);
                }
                let fresh = self.allocate_node(op)?;
                self.store(op, fresh, &Node::leaf(upper, page.0, right))?;
                self.store(op, page, &Node::leaf(records, left, fresh.0))?;
                if right != 0 {
                    let next = PageId(right);
                    if let Node::Leaf {
                        records,
                        right: after,
                        ..
                    } = self.load(op, next)?
                    {
                        self.store(op, next, &Node::leaf(records, fresh.0, after))?;
                    }
                }
                Ok(Inserted::Split(separator, fresh))
            }
            Node::Internal { first, mut records } => {
                let (idx, child) = child_for(first, &records, &key);
                let Inserted::Split(separator, fresh) = self.insert(op, child, key, depth + 1)?
                else {
                    return Ok(Inserted::Done);
                };
                records.insert(idx, (separator, fresh));
                if records.len() <= self.internal_capacity {
                    self.store(op, page, &Node::Internal { first, records })?;
                    return Ok(Inserted::Done);
                }
                let mid = records.len() / 2;
                let mut upper = records.split_off(mid);
                let (promoted, upper_first) = upper.remove(0);
                if page == ROOT_PAGE {
                    let lo = self.allocate_node(op)?;
                    let hi = self.allocate_node(op)?;
                    self.store(op, lo, &Node::Internal { first, records })?;
                    self.store(op, hi, &Node::internal(upper_first, upper))?;
                    self.store(op, ROOT_PAGE, &Node::root(lo, promoted, hi))?;
                    return Ok(Inserted::Done);
                }
                let fresh = self.allocate_node(op)?;
                self.store(op, fresh, &Node::internal(upper_first, upper))?;
                self.store(op, page, &Node::Internal { first, records })?;
                Ok(Inserted::Split(promoted, fresh))
            }
        }
    }

    /// Deletes a row. Returns true when it existed.
    pub fn remove(&self, op: &mut AtomicOperation<'_>, key: &OverflowKey) -> Result<bool> {
        op.acquire_exclusive_lock(&self.name);
        let (page, node) = self.find_leaf(op, key)?;
        let Node::Leaf {
            mut records,
            left,
            right,
        } = node
        else {
            return Err(IndexError::Corruption("overflow descent ended on internal node"));
        };
        let Ok(idx) = records.binary_search_by(|(k, _)| k.cmp(key)) else {
            return Ok(false);
        };
        records.remove(idx);
        self.store(op, page, &Node::leaf(records, left, right))?;
        let (size, pages) = self.read_meta(op)?;
        if size == 0 {
            return Err(IndexError::Corruption("overflow size underflow"));
        }
        self.write_meta(op, size - 1, pages)?;
        tracing::trace!(
            target: "mvbtree::overflow",
            m_id = key.m_id,
            rid = %key.rid,
            "row removed"
        );
        Ok(true)
    }

    /// Empties the container; node pages are kept for reuse.
    pub fn clear(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        op.acquire_exclusive_lock(&self.name);
        self.write_meta(op, 0, 1)?;
        self.store(op, ROOT_PAGE, &Node::empty_leaf())
    }

    /// Drops the container file at commit.
    pub fn delete(self, op: &mut AtomicOperation<'_>) -> Result<()> {
        op.acquire_exclusive_lock(&self.name);
        op.delete_file(self.file)?;
        tracing::debug!(
            target: "mvbtree::overflow",
            name = %self.name,
            "overflow container deleted"
        );
        Ok(())
    }
}
