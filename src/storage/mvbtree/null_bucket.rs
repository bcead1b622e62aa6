//! Single page holding the record ids stored under the null key.
//!
//! Layout: `m_id u64 | embedded u8 | total u32 | embedded × (cluster i16, position i64)`.
//! Ids beyond [`EMBEDDED_ITEMS_THRESHOLD`] live in the overflow container under `m_id`.

use smallvec::SmallVec;

use crate::primitives::bytes::{
    read_i16, read_i64, read_u32, read_u64, read_u8, write_bytes, write_i16, write_i64,
    write_u32, write_u64, write_u8,
};
use crate::types::{IndexError, Result, Rid};

use super::EMBEDDED_ITEMS_THRESHOLD;

const M_ID_OFFSET: usize = 0;
const EMBEDDED_OFFSET: usize = 8;
const TOTAL_OFFSET: usize = 9;
const VALUES_OFFSET: usize = 13;

/// Bytes of a page used by the null bucket at most.
pub const NULL_BUCKET_LEN: usize = VALUES_OFFSET + EMBEDDED_ITEMS_THRESHOLD * Rid::ENCODED_LEN;

/// Typed view over the null-key page.
pub struct NullBucket<B> {
    data: B,
}

impl<B: AsRef<[u8]>> NullBucket<B> {
    /// Wraps a page buffer.
    pub fn new(data: B) -> Self {
        Self { data }
    }

    fn buf(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Overflow id of the null key.
    pub fn m_id(&self) -> Result<u64> {
        read_u64(self.buf(), M_ID_OFFSET)
    }

    /// Number of ids stored on the page.
    pub fn embedded(&self) -> Result<usize> {
        let embedded = read_u8(self.buf(), EMBEDDED_OFFSET)? as usize;
        if embedded > EMBEDDED_ITEMS_THRESHOLD {
            return Err(IndexError::Corruption("null bucket embedded count too large"));
        }
        Ok(embedded)
    }

    /// Embedded plus overflow ids.
    pub fn total(&self) -> Result<u32> {
        let total = read_u32(self.buf(), TOTAL_OFFSET)?;
        if (total as usize) < self.embedded()? {
            return Err(IndexError::Corruption("null bucket total below embedded count"));
        }
        Ok(total)
    }

    /// Ids stored on the page, in insertion order.
    pub fn values(&self) -> Result<SmallVec<[Rid; 8]>> {
        let embedded = self.embedded()?;
        let buf = self.buf();
        (0..embedded)
            .map(|i| {
                let at = VALUES_OFFSET + i * Rid::ENCODED_LEN;
                Ok(Rid::new(read_i16(buf, at)?, read_i64(buf, at + 2)?))
            })
            .collect()
    }

    /// Returns true when `rid` is embedded on the page.
    pub fn contains(&self, rid: Rid) -> Result<bool> {
        Ok(self.values()?.contains(&rid))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> NullBucket<B> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Formats an empty null bucket owning overflow id `m_id`.
    pub fn init(&mut self, m_id: u64) -> Result<()> {
        let buf = self.buf_mut();
        write_bytes(buf, 0, &[0u8; NULL_BUCKET_LEN])?;
        write_u64(buf, M_ID_OFFSET, m_id)
    }

    /// Embeds `rid` if there is room. Returns `false` when the page is saturated and the
    /// id must go to the overflow container instead. Callers check for duplicates.
    pub fn add_value(&mut self, rid: Rid) -> Result<bool> {
        let embedded = self.embedded()?;
        if embedded >= EMBEDDED_ITEMS_THRESHOLD {
            return Ok(false);
        }
        let total = self.total()?;
        let at = VALUES_OFFSET + embedded * Rid::ENCODED_LEN;
        let buf = self.buf_mut();
        write_i16(buf, at, rid.cluster_id)?;
        write_i64(buf, at + 2, rid.cluster_position)?;
        write_u8(buf, EMBEDDED_OFFSET, (embedded + 1) as u8)?;
        write_u32(buf, TOTAL_OFFSET, total + 1)?;
        Ok(true)
    }

    /// Removes an embedded `rid`, shifting later ids down. Returns `false` if it is not
    /// embedded.
    pub fn remove_value(&mut self, rid: Rid) -> Result<bool> {
        let values = self.values()?;
        let Some(pos) = values.iter().position(|v| *v == rid) else {
            return Ok(false);
        };
        let embedded = values.len();
        let total = self.total()?;
        let start = VALUES_OFFSET + pos * Rid::ENCODED_LEN;
        let end = VALUES_OFFSET + embedded * Rid::ENCODED_LEN;
        let buf = self.buf_mut();
        buf.copy_within(start + Rid::ENCODED_LEN..end, start);
        write_bytes(buf, end - Rid::ENCODED_LEN, &[0u8; Rid::ENCODED_LEN])?;
        write_u8(buf, EMBEDDED_OFFSET, (embedded - 1) as u8)?;
        write_u32(buf, TOTAL_OFFSET, total - 1)?;
        Ok(true)
    }

    /// Adds one to the total after an overflow insert.
    pub fn increment_total(&mut self) -> Result<()> {
        let total = self.total()?;
        write_u32(self.buf_mut(), TOTAL_OFFSET, total + 1)
    }

    /// Subtracts one from the total after an overflow removal.
    pub fn decrement_total(&mut self) -> Result<()> {
        let total = self.total()?;
        if total as usize <= self.embedded()? {
            return Err(IndexError::Corruption("null bucket total below embedded count"));
        }
        write_u32(self.buf_mut(), TOTAL_OFFSET, total - 1)
    }
}
