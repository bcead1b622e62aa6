#![forbid(unsafe_code)]
//! Bounds-checked big-endian accessors over page buffers, plus varints for key codecs.
//!
//! Every accessor reports [`IndexError::Corruption`] instead of panicking when an
//! offset read from disk points outside the buffer.

use crate::types::{IndexError, Result};

const OUT_OF_RANGE: &str = "page access out of range";

#[inline]
fn slice(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or(IndexError::Corruption(OUT_OF_RANGE))
}

#[inline]
fn slice_mut(buf: &mut [u8], off: usize, len: usize) -> Result<&mut [u8]> {
    off.checked_add(len)
        .and_then(move |end| buf.get_mut(off..end))
        .ok_or(IndexError::Corruption(OUT_OF_RANGE))
}

#[inline]
fn array<const N: usize>(buf: &[u8], off: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(slice(buf, off, N)?);
    Ok(out)
}

/// Reads `len` bytes starting at `off`.
pub fn read_bytes(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    slice(buf, off, len)
}

/// Copies `src` into `buf` at `off`.
pub fn write_bytes(buf: &mut [u8], off: usize, src: &[u8]) -> Result<()> {
    slice_mut(buf, off, src.len())?.copy_from_slice(src);
    Ok(())
}

/// Reads one byte.
pub fn read_u8(buf: &[u8], off: usize) -> Result<u8> {
    buf.get(off)
        .copied()
        .ok_or(IndexError::Corruption(OUT_OF_RANGE))
}

/// Writes one byte.
pub fn write_u8(buf: &mut [u8], off: usize, v: u8) -> Result<()> {
    let slot = buf
        .get_mut(off)
        .ok_or(IndexError::Corruption(OUT_OF_RANGE))?;
    *slot = v;
    Ok(())
}

/// Reads a big-endian `u16`.
pub fn read_u16(buf: &[u8], off: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(array(buf, off)?))
}

/// Writes a big-endian `u16`.
pub fn write_u16(buf: &mut [u8], off: usize, v: u16) -> Result<()> {
    write_bytes(buf, off, &v.to_be_bytes())
}

/// Reads a big-endian `u32`.
pub fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(array(buf, off)?))
}

/// Writes a big-endian `u32`.
pub fn write_u32(buf: &mut [u8], off: usize, v: u32) -> Result<()> {
    write_bytes(buf, off, &v.to_be_bytes())
}

/// Reads a big-endian `u64`.
pub fn read_u64(buf: &[u8], off: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(array(buf, off)?))
}

/// Writes a big-endian `u64`.
pub fn write_u64(buf: &mut [u8], off: usize, v: u64) -> Result<()> {
    write_bytes(buf, off, &v.to_be_bytes())
}

/// Reads a big-endian `i16`.
pub fn read_i16(buf: &[u8], off: usize) -> Result<i16> {
    Ok(i16::from_be_bytes(array(buf, off)?))
}

/// Writes a big-endian `i16`.
pub fn write_i16(buf: &mut [u8], off: usize, v: i16) -> Result<()> {
    write_bytes(buf, off, &v.to_be_bytes())
}

/// Reads a big-endian `i64`.
pub fn read_i64(buf: &[u8], off: usize) -> Result<i64> {
    Ok(i64::from_be_bytes(array(buf, off)?))
}

/// Writes a big-endian `i64`.
pub fn write_i64(buf: &mut [u8], off: usize, v: i64) -> Result<()> {
    write_bytes(buf, off, &v.to_be_bytes())
}

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{IndexError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(IndexError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(IndexError::Corruption("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(IndexError::Corruption("varint longer than 10 bytes"))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_width_roundtrip() -> Result<()> {
        let mut page = vec![0u8; 32];
        write_u32(&mut page, 0, 0xdead_beef)?;
        write_u64(&mut page, 4, u64::MAX - 7)?;
        write_i16(&mut page, 12, -12)?;
        write_i64(&mut page, 14, i64::MIN)?;
        write_u8(&mut page, 22, 9)?;
        assert_eq!(read_u32(&page, 0)?, 0xdead_beef);
        assert_eq!(read_u64(&page, 4)?, u64::MAX - 7);
        assert_eq!(read_i16(&page, 12)?, -12);
        assert_eq!(read_i64(&page, 14)?, i64::MIN);
        assert_eq!(read_u8(&page, 22)?, 9);
        Ok(())
    }

    #[test]
    fn out_of_range_reports_corruption() {
        let mut page = vec![0u8; 8];
        assert!(matches!(read_u64(&page, 1), Err(IndexError::Corruption(_))));
        assert!(matches!(read_u32(&page, usize::MAX - 1), Err(IndexError::Corruption(_))));
        assert!(matches!(write_u16(&mut page, 7, 1), Err(IndexError::Corruption(_))));
        assert!(read_bytes(&page, 8, 0).is_ok());
    }

    #[test]
    fn varint_rejects_truncated_and_long_inputs() {
        let mut off = 0;
        assert!(var::decode_u64(&[0x80], &mut off).is_err());
        off = 0;
        assert!(var::decode_u64(&[0x81; 11], &mut off).is_err());
    }

    proptest! {
        #[test]
        fn varint_roundtrip_i64_prop(v in any::<i64>()) {
            let mut buf = Vec::new();
            var::encode_i64(v, &mut buf);
            let mut off = 0;
            prop_assert_eq!(var::decode_i64(&buf, &mut off).unwrap(), v);
            prop_assert_eq!(off, buf.len());
        }
    }
}
