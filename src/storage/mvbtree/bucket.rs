//! Bucket page layout: a position table growing up from the header and variable-length
//! entries growing down from the page end.
//!
//! ```text
//! 0   kind u8 | reserved [u8; 3]
//! 4   free_pointer u32
//! 8   size u32
//! 12  left_sibling u64
//! 20  right_sibling u64
//! 28  position table (size × u32)
//! ```
//!
//! Leaf entries own a singly linked chain of item blocks holding the embedded record
//! ids beyond the head. Every payload move goes through [`Bucket::compact`], which patches
//! the position table and every chain link that pointed below the freed region.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::primitives::bytes::{
    read_bytes, read_i16, read_i64, read_u32, read_u64, read_u8, write_bytes, write_i16,
    write_i64, write_u32, write_u64, write_u8,
};
use crate::storage::key::Key;
use crate::types::{IndexError, PageId, Result, Rid};

use super::EMBEDDED_ITEMS_THRESHOLD;

const KIND_OFFSET: usize = 0;
const FREE_POINTER_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;
const LEFT_SIBLING_OFFSET: usize = 12;
const RIGHT_SIBLING_OFFSET: usize = 20;
/// Byte offset of the position table.
pub const POSITIONS_OFFSET: usize = 28;
/// Width of one position-table slot.
pub const SLOT_LEN: usize = 4;

const LEAF_KIND: u8 = 1;
const NON_LEAF_KIND: u8 = 2;

const ENTRY_NEXT_ITEM: usize = 0;
const ENTRY_EMBEDDED: usize = 4;
const ENTRY_TOTAL: usize = 5;
const ENTRY_M_ID: usize = 9;
const ENTRY_HEAD: usize = 17;
const ENTRY_KEY_LEN: usize = 27;
/// Fixed part of a leaf entry preceding its key bytes.
pub const LEAF_ENTRY_HEADER_LEN: usize = 31;

const ITEM_NEXT: usize = 0;
const ITEM_COUNT: usize = 4;
/// Fixed part of an item block preceding its record ids.
pub const ITEM_HEADER_LEN: usize = 5;

const NON_LEAF_LEFT: usize = 0;
const NON_LEAF_RIGHT: usize = 8;
const NON_LEAF_KEY_LEN: usize = 16;
/// Fixed part of a non-leaf entry preceding its key bytes.
pub const NON_LEAF_ENTRY_HEADER_LEN: usize = 20;

/// Bytes reserved for a leaf entry holding `embedded` ids in a single block.
pub fn leaf_entry_footprint(key_len: usize, embedded: usize) -> usize {
    let block = if embedded > 1 {
        ITEM_HEADER_LEN + (embedded - 1) * Rid::ENCODED_LEN
    } else {
        0
    };
    SLOT_LEN + LEAF_ENTRY_HEADER_LEN + key_len + block
}

/// Bytes reserved for a non-leaf entry.
pub fn non_leaf_entry_footprint(key_len: usize) -> usize {
    SLOT_LEN + NON_LEAF_ENTRY_HEADER_LEN + key_len
}

/// Fixed-size fields of a leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafHeader {
    /// Offset of the first item block, 0 when the head is the only embedded id.
    pub next_item: u32,
    /// Number of record ids stored inside the bucket.
    pub embedded: u8,
    /// Embedded plus overflow record ids.
    pub total: u32,
    /// Overflow id keying this entry's rows in the overflow container.
    pub m_id: u64,
}

/// Owned copy of a leaf entry, used to move entries between buckets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Stored key bytes.
    pub key: Vec<u8>,
    /// Overflow id.
    pub m_id: u64,
    /// Embedded plus overflow record ids.
    pub total: u32,
    /// Embedded record ids, head first.
    pub values: Vec<Rid>,
}

/// Owned copy of a non-leaf entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonLeafEntry {
    /// Stored separator key bytes.
    pub key: Vec<u8>,
    /// Child holding keys below the separator.
    pub left: PageId,
    /// Child holding keys at or above the separator.
    pub right: PageId,
}

/// Either kind of owned entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BucketEntry {
    /// Entry of a leaf bucket.
    Leaf(LeafEntry),
    /// Entry of a non-leaf bucket.
    NonLeaf(NonLeafEntry),
}

impl BucketEntry {
    /// Stored key bytes of the entry.
    pub fn key(&self) -> &[u8] {
        match self {
            BucketEntry::Leaf(entry) => &entry.key,
            BucketEntry::NonLeaf(entry) => &entry.key,
        }
    }
}

fn page_link(raw: u64) -> Option<PageId> {
    (raw != 0).then_some(PageId(raw))
}

fn read_rid(buf: &[u8], off: usize) -> Result<Rid> {
    Ok(Rid::new(read_i16(buf, off)?, read_i64(buf, off + 2)?))
}

fn write_rid(buf: &mut [u8], off: usize, rid: Rid) -> Result<()> {
    write_i16(buf, off, rid.cluster_id)?;
    write_i64(buf, off + 2, rid.cluster_position)
}

/// Typed view over a bucket page buffer.
pub struct Bucket<B> {
    data: B,
}

impl<B: AsRef<[u8]>> Bucket<B> {
    /// Wraps a page buffer.
    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn buf(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Page size in bytes.
    pub fn page_len(&self) -> usize {
        self.buf().len()
    }

    /// Returns true for leaf buckets.
    pub fn is_leaf(&self) -> Result<bool> {
        match read_u8(self.buf(), KIND_OFFSET)? {
            LEAF_KIND => Ok(true),
            NON_LEAF_KIND => Ok(false),
            _ => Err(IndexError::Corruption("unknown bucket kind")),
        }
    }

    /// Number of entries.
    pub fn size(&self) -> Result<usize> {
        Ok(read_u32(self.buf(), SIZE_OFFSET)? as usize)
    }

    /// Returns true when the bucket holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Lowest payload byte in use.
    pub fn free_pointer(&self) -> Result<usize> {
        Ok(read_u32(self.buf(), FREE_POINTER_OFFSET)? as usize)
    }

    /// Unused bytes between the position table and the payload.
    pub fn free_space(&self) -> Result<usize> {
        let table_end = POSITIONS_OFFSET + self.size()? * SLOT_LEN;
        let fp = self.free_pointer()?;
        if fp < table_end || fp > self.page_len() {
            return Err(IndexError::Corruption(
                "bucket free pointer overlaps position table",
            ));
        }
        Ok(fp - table_end)
    }

    /// Previous leaf in key order.
    pub fn left_sibling(&self) -> Result<Option<PageId>> {
        Ok(page_link(read_u64(self.buf(), LEFT_SIBLING_OFFSET)?))
    }

    /// Next leaf in key order.
    pub fn right_sibling(&self) -> Result<Option<PageId>> {
        Ok(page_link(read_u64(self.buf(), RIGHT_SIBLING_OFFSET)?))
    }

    /// Payload offset of entry `idx`.
    pub fn entry_offset(&self, idx: usize) -> Result<usize> {
        if idx >= self.size()? {
            return Err(IndexError::Corruption("bucket entry index out of range"));
        }
        let off = read_u32(self.buf(), POSITIONS_OFFSET + idx * SLOT_LEN)? as usize;
        if off < self.free_pointer()? || off >= self.page_len() {
            return Err(IndexError::Corruption("bucket entry offset outside payload"));
        }
        Ok(off)
    }

    /// Stored key bytes of entry `idx`.
    pub fn key_bytes(&self, idx: usize) -> Result<&[u8]> {
        let off = self.entry_offset(idx)?;
        let (len_at, key_at) = if self.is_leaf()? {
            (off + ENTRY_KEY_LEN, off + LEAF_ENTRY_HEADER_LEN)
        } else {
            (off + NON_LEAF_KEY_LEN, off + NON_LEAF_ENTRY_HEADER_LEN)
        };
        let len = read_u32(self.buf(), len_at)? as usize;
        read_bytes(self.buf(), key_at, len)
    }

    /// Binary search by decoded key: `Ok(idx)` on a match, `Err(insertion_point)` otherwise.
    pub fn find(
        &self,
        key: &Key,
        decode: impl Fn(&[u8]) -> Result<Key>,
    ) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = self.size()?;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = decode(self.key_bytes(mid)?)?;
            match probe.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Fixed fields of leaf entry `idx`.
    pub fn leaf_header(&self, idx: usize) -> Result<LeafHeader> {
        let off = self.entry_offset(idx)?;
        let buf = self.buf();
        let header = LeafHeader {
            next_item: read_u32(buf, off + ENTRY_NEXT_ITEM)?,
            embedded: read_u8(buf, off + ENTRY_EMBEDDED)?,
            total: read_u32(buf, off + ENTRY_TOTAL)?,
            m_id: read_u64(buf, off + ENTRY_M_ID)?,
        };
        if header.embedded as usize > EMBEDDED_ITEMS_THRESHOLD
            || header.total < u32::from(header.embedded)
        {
            return Err(IndexError::Corruption("leaf entry counters inconsistent"));
        }
        Ok(header)
    }

    /// Overflow id of leaf entry `idx`.
    pub fn m_id(&self, idx: usize) -> Result<u64> {
        Ok(self.leaf_header(idx)?.m_id)
    }

    /// Total record ids (embedded and overflow) of leaf entry `idx`.
    pub fn entries_count(&self, idx: usize) -> Result<u32> {
        Ok(self.leaf_header(idx)?.total)
    }

    /// Embedded record ids of leaf entry `idx`, head first then chain order.
    pub fn values(&self, idx: usize) -> Result<SmallVec<[Rid; 8]>> {
        let off = self.entry_offset(idx)?;
        let header = self.leaf_header(idx)?;
        let buf = self.buf();
        let mut out = SmallVec::new();
        if header.embedded == 0 {
            return Ok(out);
        }
        out.push(read_rid(buf, off + ENTRY_HEAD)?);
        let mut link = header.next_item as usize;
        while link != 0 {
            let count = read_u8(buf, link + ITEM_COUNT)? as usize;
            for j in 0..count {
                out.push(read_rid(buf, link + ITEM_HEADER_LEN + j * Rid::ENCODED_LEN)?);
            }
            if out.len() > header.embedded as usize {
                return Err(IndexError::Corruption("item chain longer than embedded count"));
            }
            link = read_u32(buf, link + ITEM_NEXT)? as usize;
        }
        if out.len() != header.embedded as usize {
            return Err(IndexError::Corruption("item chain shorter than embedded count"));
        }
        Ok(out)
    }

    /// Owned copy of leaf entry `idx`.
    pub fn leaf_entry(&self, idx: usize) -> Result<LeafEntry> {
        let header = self.leaf_header(idx)?;
        Ok(LeafEntry {
            key: self.key_bytes(idx)?.to_vec(),
            m_id: header.m_id,
            total: header.total,
            values: self.values(idx)?.into_vec(),
        })
    }

    /// Left child of non-leaf entry `idx`.
    pub fn left(&self, idx: usize) -> Result<PageId> {
        let off = self.entry_offset(idx)?;
        Ok(PageId(read_u64(self.buf(), off + NON_LEAF_LEFT)?))
    }

    /// Right child of non-leaf entry `idx`.
    pub fn right(&self, idx: usize) -> Result<PageId> {
        let off = self.entry_offset(idx)?;
        Ok(PageId(read_u64(self.buf(), off + NON_LEAF_RIGHT)?))
    }

    /// Owned copy of non-leaf entry `idx`.
    pub fn non_leaf_entry(&self, idx: usize) -> Result<NonLeafEntry> {
        Ok(NonLeafEntry {
            key: self.key_bytes(idx)?.to_vec(),
            left: self.left(idx)?,
            right: self.right(idx)?,
        })
    }

    /// Owned copy of entry `idx`, whichever kind the bucket is.
    pub fn entry(&self, idx: usize) -> Result<BucketEntry> {
        if self.is_leaf()? {
            Ok(BucketEntry::Leaf(self.leaf_entry(idx)?))
        } else {
            Ok(BucketEntry::NonLeaf(self.non_leaf_entry(idx)?))
        }
    }

    /// Owned copies of entries `from..to`.
    pub fn entries(&self, from: usize, to: usize) -> Result<Vec<BucketEntry>> {
        (from..to).map(|idx| self.entry(idx)).collect()
    }

    /// Byte ranges `(offset, len)` occupied by leaf entry `idx` and its item blocks.
    fn leaf_regions(&self, idx: usize) -> Result<SmallVec<[(usize, usize); 8]>> {
        let off = self.entry_offset(idx)?;
        let buf = self.buf();
        let key_len = read_u32(buf, off + ENTRY_KEY_LEN)? as usize;
        let mut regions = SmallVec::new();
        regions.push((off, LEAF_ENTRY_HEADER_LEN + key_len));
        let mut link = read_u32(buf, off + ENTRY_NEXT_ITEM)? as usize;
        while link != 0 {
            if regions.len() > EMBEDDED_ITEMS_THRESHOLD {
                return Err(IndexError::Corruption("item chain does not terminate"));
            }
            let count = read_u8(buf, link + ITEM_COUNT)? as usize;
            regions.push((link, ITEM_HEADER_LEN + count * Rid::ENCODED_LEN));
            link = read_u32(buf, link + ITEM_NEXT)? as usize;
        }
        Ok(regions)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bucket<B> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Formats the page as an empty bucket of the given kind without sibling links.
    pub fn init(&mut self, leaf: bool) -> Result<()> {
        let page_len = u32::try_from(self.page_len())
            .map_err(|_| IndexError::Invalid("page too large for bucket offsets"))?;
        let buf = self.buf_mut();
        write_bytes(buf, 0, &[0u8; POSITIONS_OFFSET])?;
        write_u8(buf, KIND_OFFSET, if leaf { LEAF_KIND } else { NON_LEAF_KIND })?;
        write_u32(buf, FREE_POINTER_OFFSET, page_len)?;
        Ok(())
    }

    fn set_size(&mut self, size: usize) -> Result<()> {
        write_u32(self.buf_mut(), SIZE_OFFSET, size as u32)
    }

    fn set_free_pointer(&mut self, fp: usize) -> Result<()> {
        write_u32(self.buf_mut(), FREE_POINTER_OFFSET, fp as u32)
    }

    /// Links the previous leaf.
    pub fn set_left_sibling(&mut self, page: Option<PageId>) -> Result<()> {
        write_u64(
            self.buf_mut(),
            LEFT_SIBLING_OFFSET,
            page.map_or(0, |p| p.0),
        )
    }

    /// Links the next leaf.
    pub fn set_right_sibling(&mut self, page: Option<PageId>) -> Result<()> {
        write_u64(
            self.buf_mut(),
            RIGHT_SIBLING_OFFSET,
            page.map_or(0, |p| p.0),
        )
    }

    /// Reserves `len` payload bytes, returning their offset, or `None` if they do not fit
    /// together with `slots` extra position-table slots.
    fn reserve(&mut self, len: usize, slots: usize) -> Result<Option<usize>> {
        if self.free_space()? < len + slots * SLOT_LEN {
            return Ok(None);
        }
        let fp = self.free_pointer()? - len;
        self.set_free_pointer(fp)?;
        Ok(Some(fp))
    }

    fn insert_slot(&mut self, idx: usize, offset: usize) -> Result<()> {
        let size = self.size()?;
        if idx > size {
            return Err(IndexError::Corruption("bucket insert index out of range"));
        }
        let start = POSITIONS_OFFSET + idx * SLOT_LEN;
        let end = POSITIONS_OFFSET + size * SLOT_LEN;
        self.buf_mut().copy_within(start..end, start + SLOT_LEN);
        write_u32(self.buf_mut(), start, offset as u32)?;
        self.set_size(size + 1)
    }

    fn remove_slot(&mut self, idx: usize) -> Result<()> {
        let size = self.size()?;
        if idx >= size {
            return Err(IndexError::Corruption("bucket remove index out of range"));
        }
        let start = POSITIONS_OFFSET + idx * SLOT_LEN;
        let end = POSITIONS_OFFSET + size * SLOT_LEN;
        self.buf_mut().copy_within(start + SLOT_LEN..end, start);
        write_u32(self.buf_mut(), end - SLOT_LEN, 0)?;
        self.set_size(size - 1)
    }

    /// Inserts a leaf entry at `idx` with `values` embedded, writing all ids after the head
    /// into a single item block. Returns `false` when the entry does not fit.
    pub fn create_main_leaf_entry(
        &mut self,
        idx: usize,
        key: &[u8],
        values: &[Rid],
        m_id: u64,
        total: u32,
    ) -> Result<bool> {
        if values.len() > EMBEDDED_ITEMS_THRESHOLD || (total as usize) < values.len() {
            return Err(IndexError::Invalid("leaf entry counters inconsistent"));
        }
        let entry_len = LEAF_ENTRY_HEADER_LEN + key.len();
        let block_len = match values.len() {
            0 | 1 => 0,
            n => ITEM_HEADER_LEN + (n - 1) * Rid::ENCODED_LEN,
        };
        let Some(off) = self.reserve(entry_len + block_len, 1)? else {
            return Ok(false);
        };
        let block = off + entry_len;
        let buf = self.buf_mut();
        write_u32(
            buf,
            off + ENTRY_NEXT_ITEM,
            if block_len == 0 { 0 } else { block as u32 },
        )?;
        write_u8(buf, off + ENTRY_EMBEDDED, values.len() as u8)?;
        write_u32(buf, off + ENTRY_TOTAL, total)?;
        write_u64(buf, off + ENTRY_M_ID, m_id)?;
        write_rid(
            buf,
            off + ENTRY_HEAD,
            values.first().copied().unwrap_or(Rid::new(0, 0)),
        )?;
        write_u32(buf, off + ENTRY_KEY_LEN, key.len() as u32)?;
        write_bytes(buf, off + LEAF_ENTRY_HEADER_LEN, key)?;
        if block_len > 0 {
            write_u32(buf, block + ITEM_NEXT, 0)?;
            write_u8(buf, block + ITEM_COUNT, (values.len() - 1) as u8)?;
            for (j, rid) in values[1..].iter().enumerate() {
                write_rid(buf, block + ITEM_HEADER_LEN + j * Rid::ENCODED_LEN, *rid)?;
            }
        }
        self.insert_slot(idx, off)?;
        Ok(true)
    }

    /// Embeds one more id into leaf entry `idx`, bumping both embedded and total counts.
    ///
    /// The first id goes into the head slot; later ones prepend a one-id item block.
    /// Returns `false` when the block does not fit.
    pub fn append_new_leaf_entry(&mut self, idx: usize, rid: Rid) -> Result<bool> {
        let header = self.leaf_header(idx)?;
        if header.embedded as usize >= EMBEDDED_ITEMS_THRESHOLD {
            return Err(IndexError::Invalid("leaf entry embedded values are saturated"));
        }
        if header.embedded == 0 {
            let off = self.entry_offset(idx)?;
            write_rid(self.buf_mut(), off + ENTRY_HEAD, rid)?;
        } else {
            let Some(block) = self.reserve(ITEM_HEADER_LEN + Rid::ENCODED_LEN, 0)? else {
                return Ok(false);
            };
            let off = self.entry_offset(idx)?;
            let buf = self.buf_mut();
            write_u32(buf, block + ITEM_NEXT, header.next_item)?;
            write_u8(buf, block + ITEM_COUNT, 1)?;
            write_rid(buf, block + ITEM_HEADER_LEN, rid)?;
            write_u32(buf, off + ENTRY_NEXT_ITEM, block as u32)?;
        }
        let off = self.entry_offset(idx)?;
        let buf = self.buf_mut();
        write_u8(buf, off + ENTRY_EMBEDDED, header.embedded + 1)?;
        write_u32(buf, off + ENTRY_TOTAL, header.total + 1)?;
        Ok(true)
    }

    /// Removes `rid` from the embedded ids of leaf entry `idx`, decrementing embedded and
    /// total counts. Returns `false` if the id is not embedded in this entry.
    pub fn remove_leaf_entry_value(&mut self, idx: usize, rid: Rid) -> Result<bool> {
        let header = self.leaf_header(idx)?;
        if header.embedded == 0 {
            return Ok(false);
        }
        let off = self.entry_offset(idx)?;
        let head = read_rid(self.buf(), off + ENTRY_HEAD)?;
        if head == rid {
            self.set_leaf_counts(off, header.embedded - 1, header.total - 1)?;
            if header.next_item == 0 {
                write_rid(self.buf_mut(), off + ENTRY_HEAD, Rid::new(0, 0))?;
                return Ok(true);
            }
            let block = header.next_item as usize;
            let promoted = read_rid(self.buf(), block + ITEM_HEADER_LEN)?;
            write_rid(self.buf_mut(), off + ENTRY_HEAD, promoted)?;
            self.remove_from_block(off + ENTRY_NEXT_ITEM, block, 0)?;
            return Ok(true);
        }
        let mut link_field = off + ENTRY_NEXT_ITEM;
        let mut block = header.next_item as usize;
        let mut hops = 0usize;
        while block != 0 {
            hops += 1;
            if hops > EMBEDDED_ITEMS_THRESHOLD {
                return Err(IndexError::Corruption("item chain does not terminate"));
            }
            let count = read_u8(self.buf(), block + ITEM_COUNT)? as usize;
            for j in 0..count {
                let at = block + ITEM_HEADER_LEN + j * Rid::ENCODED_LEN;
                if read_rid(self.buf(), at)? == rid {
                    self.set_leaf_counts(off, header.embedded - 1, header.total - 1)?;
                    self.remove_from_block(link_field, block, j)?;
                    return Ok(true);
                }
            }
            link_field = block + ITEM_NEXT;
            block = read_u32(self.buf(), block + ITEM_NEXT)? as usize;
        }
        Ok(false)
    }

    fn set_leaf_counts(&mut self, off: usize, embedded: u8, total: u32) -> Result<()> {
        let buf = self.buf_mut();
        write_u8(buf, off + ENTRY_EMBEDDED, embedded)?;
        write_u32(buf, off + ENTRY_TOTAL, total)
    }

    /// Drops id `j` of the block at `block`; `link_field` is the pointer referencing it.
    fn remove_from_block(&mut self, link_field: usize, block: usize, j: usize) -> Result<()> {
        let count = read_u8(self.buf(), block + ITEM_COUNT)? as usize;
        if count <= 1 {
            let next = read_u32(self.buf(), block + ITEM_NEXT)?;
            write_u32(self.buf_mut(), link_field, next)?;
            self.compact(block, ITEM_HEADER_LEN + count * Rid::ENCODED_LEN)
        } else {
            write_u8(self.buf_mut(), block + ITEM_COUNT, (count - 1) as u8)?;
            self.compact(block + ITEM_HEADER_LEN + j * Rid::ENCODED_LEN, Rid::ENCODED_LEN)
        }
    }

    /// Frees `[start, start + len)` by sliding every payload byte below it up by `len`,
    /// then patches every table offset and chain link that pointed below `start`.
    pub fn compact(&mut self, start: usize, len: usize) -> Result<()> {
        let fp = self.free_pointer()?;
        if start < fp || start + len > self.page_len() {
            return Err(IndexError::Corruption("compaction range outside payload"));
        }
        self.buf_mut().copy_within(fp..start, fp + len);
        write_bytes(self.buf_mut(), fp, &vec![0u8; len])?;
        self.set_free_pointer(fp + len)?;

        let size = self.size()?;
        let leaf = self.is_leaf()?;
        for idx in 0..size {
            let slot = POSITIONS_OFFSET + idx * SLOT_LEN;
            let mut off = read_u32(self.buf(), slot)? as usize;
            if off < start {
                off += len;
                write_u32(self.buf_mut(), slot, off as u32)?;
            }
            if leaf {
                self.patch_chain(off + ENTRY_NEXT_ITEM, start, len)?;
            }
        }
        Ok(())
    }

    fn patch_chain(&mut self, mut link_field: usize, start: usize, len: usize) -> Result<()> {
        for _ in 0..=EMBEDDED_ITEMS_THRESHOLD {
            let mut link = read_u32(self.buf(), link_field)? as usize;
            if link == 0 {
                return Ok(());
            }
            if link < start {
                link += len;
                write_u32(self.buf_mut(), link_field, link as u32)?;
            }
            link_field = link + ITEM_NEXT;
        }
        Err(IndexError::Corruption("item chain does not terminate"))
    }

    /// Removes entry `idx` and all of its payload, compacting the page.
    pub fn remove_entry(&mut self, idx: usize) -> Result<()> {
        let mut regions: SmallVec<[(usize, usize); 8]> = if self.is_leaf()? {
            self.leaf_regions(idx)?
        } else {
            let off = self.entry_offset(idx)?;
            let key_len = read_u32(self.buf(), off + NON_LEAF_KEY_LEN)? as usize;
            smallvec::smallvec![(off, NON_LEAF_ENTRY_HEADER_LEN + key_len)]
        };
        self.remove_slot(idx)?;
        // Lower regions move when a region is freed; higher ones never do.
        regions.sort_unstable();
        for (start, len) in regions {
            self.compact(start, len)?;
        }
        Ok(())
    }

    /// Adds one to the total count of leaf entry `idx` after an overflow insert.
    pub fn increment_entries_count(&mut self, idx: usize) -> Result<()> {
        let header = self.leaf_header(idx)?;
        let off = self.entry_offset(idx)?;
        write_u32(self.buf_mut(), off + ENTRY_TOTAL, header.total + 1)
    }

    /// Subtracts one from the total count of leaf entry `idx` after an overflow removal.
    pub fn decrement_entries_count(&mut self, idx: usize) -> Result<()> {
        let header = self.leaf_header(idx)?;
        if header.total <= u32::from(header.embedded) {
            return Err(IndexError::Corruption("leaf entry total below embedded count"));
        }
        let off = self.entry_offset(idx)?;
        write_u32(self.buf_mut(), off + ENTRY_TOTAL, header.total - 1)
    }

    /// Inserts a separator at `idx`. With `update_neighbors`, the right child of entry
    /// `idx - 1` becomes `left` and the left child of entry `idx + 1` becomes `right`.
    pub fn add_non_leaf_entry(
        &mut self,
        idx: usize,
        key: &[u8],
        left: PageId,
        right: PageId,
        update_neighbors: bool,
    ) -> Result<bool> {
        let Some(off) = self.reserve(NON_LEAF_ENTRY_HEADER_LEN + key.len(), 1)? else {
            return Ok(false);
        };
        let buf = self.buf_mut();
        write_u64(buf, off + NON_LEAF_LEFT, left.0)?;
        write_u64(buf, off + NON_LEAF_RIGHT, right.0)?;
        write_u32(buf, off + NON_LEAF_KEY_LEN, key.len() as u32)?;
        write_bytes(buf, off + NON_LEAF_ENTRY_HEADER_LEN, key)?;
        self.insert_slot(idx, off)?;
        if update_neighbors {
            let size = self.size()?;
            if idx > 0 {
                let prev = self.entry_offset(idx - 1)?;
                write_u64(self.buf_mut(), prev + NON_LEAF_RIGHT, left.0)?;
            }
            if idx + 1 < size {
                let next = self.entry_offset(idx + 1)?;
                write_u64(self.buf_mut(), next + NON_LEAF_LEFT, right.0)?;
            }
        }
        Ok(true)
    }

    /// Appends owned entries in order. Fails with `Corruption` if they do not fit, which
    /// cannot happen for entries taken from a bucket of the same page size.
    pub fn add_all(&mut self, entries: &[BucketEntry]) -> Result<()> {
        for entry in entries {
            let idx = self.size()?;
            let added = match entry {
                BucketEntry::Leaf(e) => {
                    self.create_main_leaf_entry(idx, &e.key, &e.values, e.m_id, e.total)?
                }
                BucketEntry::NonLeaf(e) => {
                    self.add_non_leaf_entry(idx, &e.key, e.left, e.right, false)?
                }
            };
            if !added {
                return Err(IndexError::Corruption("bucket entries exceed page capacity"));
            }
        }
        Ok(())
    }

    /// Keeps the first `new_size` entries, rewriting them compactly. Sibling links survive.
    pub fn shrink(&mut self, new_size: usize) -> Result<()> {
        let kept = self.entries(0, new_size)?;
        let leaf = self.is_leaf()?;
        let left = self.left_sibling()?;
        let right = self.right_sibling()?;
        self.init(leaf)?;
        self.set_left_sibling(left)?;
        self.set_right_sibling(right)?;
        self.add_all(&kept)
    }
}
