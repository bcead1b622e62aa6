#![forbid(unsafe_code)]
//! Index keys: scalar and composite values with a total order, partial composite
//! bounds, and the codec that turns keys into stored bytes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::types::Result;

mod serializer;

pub use serializer::{DefaultKeySerializer, KeyEncryption, KeySerializer};

/// A key stored in, or used to search, a multi-value tree.
#[derive(Clone, Debug)]
pub enum Key {
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Long(i64),
    /// Floating point scalar; compares numerically with [`Key::Long`].
    Double(f64),
    /// UTF-8 string scalar.
    Text(String),
    /// Raw byte string scalar.
    Binary(Vec<u8>),
    /// Ordered sequence of scalar components.
    Composite(Vec<Key>),
    /// Search-only component that sorts before every other key.
    AlwaysLess,
    /// Search-only component that sorts after every other key.
    AlwaysGreater,
}

/// Type hint for one key component, consulted by [`KeySerializer::preprocess`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Boolean component.
    Bool,
    /// Integer component.
    Long,
    /// Floating point component.
    Double,
    /// String component.
    Text,
    /// Byte string component.
    Binary,
}

/// Which end of a composite prefix a partial key should resolve to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartialSearchMode {
    /// Pad with [`Key::AlwaysLess`]: the lowest full key sharing the prefix.
    LowestBoundary,
    /// Pad with [`Key::AlwaysGreater`]: the highest full key sharing the prefix.
    HighestBoundary,
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::AlwaysLess => 0,
            Key::Bool(_) => 1,
            Key::Long(_) | Key::Double(_) => 2,
            Key::Text(_) => 3,
            Key::Binary(_) => 4,
            Key::Composite(_) => 5,
            Key::AlwaysGreater => 6,
        }
    }

    /// Returns true for the comparison-only sentinels or a composite containing one.
    pub fn has_sentinel(&self) -> bool {
        match self {
            Key::AlwaysLess | Key::AlwaysGreater => true,
            Key::Composite(parts) => parts.iter().any(Key::has_sentinel),
            _ => false,
        }
    }

    /// Number of components: the composite length, or 1 for a scalar.
    pub fn components(&self) -> usize {
        match self {
            Key::Composite(parts) => parts.len(),
            _ => 1,
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

// 2^63 as f64; every finite double at or above it exceeds i64::MAX.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn cmp_i64_f64(i: i64, d: f64) -> Ordering {
    if d.is_nan() || d >= I64_BOUND {
        return Ordering::Less;
    }
    if d < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = d.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => cmp_f64(whole, d),
        other => other,
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Long(a), Key::Long(b)) => a.cmp(b),
            (Key::Double(a), Key::Double(b)) => cmp_f64(*a, *b),
            (Key::Long(a), Key::Double(b)) => cmp_i64_f64(*a, *b),
            (Key::Double(a), Key::Long(b)) => cmp_i64_f64(*b, *a).reverse(),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Composite(a), Key::Composite(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(v) => write!(f, "{v}"),
            Key::Long(v) => write!(f, "{v}"),
            Key::Double(v) => write!(f, "{v:?}"),
            Key::Text(v) => write!(f, "{v:?}"),
            Key::Binary(v) => write!(f, "0x{}", hex::encode(v)),
            Key::Composite(parts) => {
                f.write_str("[")?;
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("]")
            }
            Key::AlwaysLess => f.write_str("<min>"),
            Key::AlwaysGreater => f.write_str("<max>"),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Long(v)
    }
}

impl From<f64> for Key {
    fn from(v: f64) -> Self {
        Key::Double(v)
    }
}

impl From<bool> for Key {
    fn from(v: bool) -> Self {
        Key::Bool(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Text(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Text(v)
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key::Binary(v)
    }
}

/// Pads a partial composite key with sentinels so it addresses one end of its prefix range.
///
/// Scalars are wrapped into a composite first when the index has more than one component.
/// Keys that already carry `key_size` components are returned unchanged.
pub fn enhance_composite_key(key: &Key, mode: PartialSearchMode, key_size: usize) -> Key {
    if key_size <= 1 {
        return key.clone();
    }
    let mut parts = match key {
        Key::Composite(parts) => parts.clone(),
        scalar => vec![scalar.clone()],
    };
    if parts.len() >= key_size {
        return Key::Composite(parts);
    }
    let pad = match mode {
        PartialSearchMode::LowestBoundary => Key::AlwaysLess,
        PartialSearchMode::HighestBoundary => Key::AlwaysGreater,
    };
    parts.resize(key_size, pad);
    Key::Composite(parts)
}

/// Serializer, type hints and optional encryption bound together for one tree.
#[derive(Clone)]
pub struct KeyCodec {
    serializer: Arc<dyn KeySerializer>,
    encryption: Option<Arc<dyn KeyEncryption>>,
    hints: Vec<KeyType>,
}

impl KeyCodec {
    /// Builds a codec from its collaborators.
    pub fn new(
        serializer: Arc<dyn KeySerializer>,
        encryption: Option<Arc<dyn KeyEncryption>>,
        hints: Vec<KeyType>,
    ) -> Self {
        Self {
            serializer,
            encryption,
            hints,
        }
    }

    /// Applies type-driven normalization before comparing or storing.
    pub fn preprocess(&self, key: &Key) -> Result<Key> {
        self.serializer.preprocess(key, &self.hints)
    }

    /// Produces the stored byte form of a key.
    pub fn encode(&self, key: &Key) -> Result<Vec<u8>> {
        let plain = self.serializer.serialize(key, &self.hints)?;
        match &self.encryption {
            Some(enc) => enc.encrypt(&plain),
            None => Ok(plain),
        }
    }

    /// Restores a key from its stored byte form.
    pub fn decode(&self, stored: &[u8]) -> Result<Key> {
        match &self.encryption {
            Some(enc) => {
                let plain = enc.decrypt(stored)?;
                self.serializer.deserialize(&plain, &self.hints)
            }
            None => self.serializer.deserialize(stored, &self.hints),
        }
    }
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCodec")
            .field("serializer", &self.serializer.name())
            .field("encrypted", &self.encryption.is_some())
            .field("hints", &self.hints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn composite(parts: &[Key]) -> Key {
        Key::Composite(parts.to_vec())
    }

    #[test]
    fn numeric_keys_compare_across_variants() {
        assert_eq!(Key::Long(3), Key::Double(3.0));
        assert!(Key::Long(3) < Key::Double(3.5));
        assert!(Key::Double(-2.5) < Key::Long(-2));
        assert!(Key::Long(i64::MAX) < Key::Double(1e19));
        assert!(Key::Double(f64::NAN) > Key::Long(i64::MAX));
        assert_eq!(Key::Double(-0.0), Key::Long(0));
    }

    #[test]
    fn sentinels_bound_everything() {
        let samples = [
            Key::Bool(false),
            Key::Long(i64::MIN),
            Key::Text(String::new()),
            Key::Binary(vec![0xff]),
            composite(&[Key::Long(1)]),
        ];
        for key in &samples {
            assert!(Key::AlwaysLess < *key);
            assert!(Key::AlwaysGreater > *key);
        }
    }

    #[test]
    fn composite_prefix_sorts_first() {
        let a = composite(&["A".into()]);
        let a1 = composite(&["A".into(), 1i64.into()]);
        let b = composite(&["B".into()]);
        assert!(a < a1);
        assert!(a1 < b);
    }

    #[test]
    fn enhance_pads_partial_keys() {
        let lo = enhance_composite_key(&"A".into(), PartialSearchMode::LowestBoundary, 2);
        let hi = enhance_composite_key(&"A".into(), PartialSearchMode::HighestBoundary, 2);
        let a1 = composite(&["A".into(), 1i64.into()]);
        let a9 = composite(&["A".into(), 9i64.into()]);
        assert!(lo < a1 && a9 < hi);
        assert!(hi < composite(&["B".into(), i64::MIN.into()]));
        assert_eq!(
            enhance_composite_key(&a1, PartialSearchMode::HighestBoundary, 2),
            a1
        );
        assert_eq!(
            enhance_composite_key(&Key::Long(4), PartialSearchMode::LowestBoundary, 1),
            Key::Long(4)
        );
    }

    #[test]
    fn display_is_readable() {
        let key = composite(&["x".into(), 2i64.into(), Key::Binary(vec![0xab])]);
        assert_eq!(key.to_string(), "[\"x\", 2, 0xab]");
    }

    fn scalar() -> impl Strategy<Value = Key> {
        prop_oneof![
            any::<bool>().prop_map(Key::Bool),
            any::<i64>().prop_map(Key::Long),
            (-1e12f64..1e12).prop_map(Key::Double),
            "[a-z]{0,6}".prop_map(Key::Text),
        ]
    }

    proptest! {
        #[test]
        fn ordering_is_transitive(a in scalar(), b in scalar(), c in scalar()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }
    }
}
