use super::{Key, KeyType};
use crate::primitives::bytes::var;
use crate::types::{IndexError, Result};

const TAG_BOOL: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BINARY: u8 = 5;
const TAG_COMPOSITE: u8 = 6;

/// Converts keys to and from the bytes stored in buckets.
pub trait KeySerializer: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Encodes a key. Sentinel components must be rejected.
    fn serialize(&self, key: &Key, hints: &[KeyType]) -> Result<Vec<u8>>;

    /// Decodes bytes produced by [`KeySerializer::serialize`].
    fn deserialize(&self, bytes: &[u8], hints: &[KeyType]) -> Result<Key>;

    /// Normalizes a key before comparison or storage.
    ///
    /// The default widens integers to doubles wherever the matching hint says
    /// [`KeyType::Double`], component by component.
    fn preprocess(&self, key: &Key, hints: &[KeyType]) -> Result<Key> {
        Ok(match key {
            Key::Composite(parts) => Key::Composite(
                parts
                    .iter()
                    .enumerate()
                    .map(|(idx, part)| widen(part, hints.get(idx)))
                    .collect(),
            ),
            scalar => widen(scalar, hints.first()),
        })
    }
}

fn widen(key: &Key, hint: Option<&KeyType>) -> Key {
    match (key, hint) {
        (Key::Long(v), Some(KeyType::Double)) => Key::Double(*v as f64),
        _ => key.clone(),
    }
}

/// Optional transform applied to serialized key bytes before they reach a page.
pub trait KeyEncryption: Send + Sync {
    /// Encrypts serialized key bytes.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;
    /// Reverses [`KeyEncryption::encrypt`].
    fn decrypt(&self, stored: &[u8]) -> Result<Vec<u8>>;
}

/// Tagged binary codec: one type byte per value, varint lengths and integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeySerializer;

impl DefaultKeySerializer {
    fn write(key: &Key, out: &mut Vec<u8>) -> Result<()> {
        match key {
            Key::Bool(v) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*v));
            }
            Key::Long(v) => {
                out.push(TAG_LONG);
                var::encode_i64(*v, out);
            }
            Key::Double(v) => {
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Key::Text(v) => {
                out.push(TAG_TEXT);
                var::encode_u64(v.len() as u64, out);
                out.extend_from_slice(v.as_bytes());
            }
            Key::Binary(v) => {
                out.push(TAG_BINARY);
                var::encode_u64(v.len() as u64, out);
                out.extend_from_slice(v);
            }
            Key::Composite(parts) => {
                out.push(TAG_COMPOSITE);
                var::encode_u64(parts.len() as u64, out);
                for part in parts {
                    if matches!(part, Key::Composite(_)) {
                        return Err(IndexError::Invalid("composite keys cannot nest"));
                    }
                    Self::write(part, out)?;
                }
            }
            Key::AlwaysLess | Key::AlwaysGreater => {
                return Err(IndexError::Invalid("sentinel keys cannot be stored"));
            }
        }
        Ok(())
    }

    fn take<'a>(src: &'a [u8], off: &mut usize, len: usize) -> Result<&'a [u8]> {
        let end = off
            .checked_add(len)
            .filter(|end| *end <= src.len())
            .ok_or_else(|| IndexError::Serialization("key bytes truncated".into()))?;
        let out = &src[*off..end];
        *off = end;
        Ok(out)
    }

    fn read(src: &[u8], off: &mut usize, nested: bool) -> Result<Key> {
        let tag = Self::take(src, off, 1)?[0];
        let key = match tag {
            TAG_BOOL => Key::Bool(Self::take(src, off, 1)?[0] != 0),
            TAG_LONG => Key::Long(var::decode_i64(src, off)?),
            TAG_DOUBLE => {
                let mut bits = [0u8; 8];
                bits.copy_from_slice(Self::take(src, off, 8)?);
                Key::Double(f64::from_bits(u64::from_be_bytes(bits)))
            }
            TAG_TEXT => {
                let len = var::decode_u64(src, off)? as usize;
                let body = Self::take(src, off, len)?;
                let text = std::str::from_utf8(body)
                    .map_err(|err| IndexError::Serialization(err.to_string()))?;
                Key::Text(text.to_owned())
            }
            TAG_BINARY => {
                let len = var::decode_u64(src, off)? as usize;
                Key::Binary(Self::take(src, off, len)?.to_vec())
            }
            TAG_COMPOSITE if !nested => {
                let count = var::decode_u64(src, off)? as usize;
                let mut parts = Vec::with_capacity(count.min(16));
                for _ in 0..count {
                    parts.push(Self::read(src, off, true)?);
                }
                Key::Composite(parts)
            }
            other => {
                return Err(IndexError::Serialization(format!(
                    "unknown key tag {other}"
                )))
            }
        };
        Ok(key)
    }
}

impl KeySerializer for DefaultKeySerializer {
    fn name(&self) -> &'static str {
        "default"
    }

    fn serialize(&self, key: &Key, _hints: &[KeyType]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        Self::write(key, &mut out)?;
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8], _hints: &[KeyType]) -> Result<Key> {
        let mut off = 0;
        let key = Self::read(bytes, &mut off, false)?;
        if off != bytes.len() {
            return Err(IndexError::Serialization(
                "trailing bytes after key".into(),
            ));
        }
        Ok(key)
    }
}
