use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bucket::{
    non_leaf_entry_footprint, ITEM_HEADER_LEN, LEAF_ENTRY_HEADER_LEN, POSITIONS_OFFSET,
    SLOT_LEN,
};
use super::EMBEDDED_ITEMS_THRESHOLD;
use crate::storage::key::{DefaultKeySerializer, KeyCodec, KeyEncryption, KeySerializer, KeyType};
use crate::types::{IndexError, Result, Rid};

/// Tunables for a multi-value tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    /// Largest serialized (and encrypted) key accepted by `put`.
    pub max_key_size: usize,
    /// Deepest root-to-leaf path tolerated before the tree is declared corrupt.
    pub max_path_length: usize,
    /// Minimum number of `(key, rid)` pairs a cursor buffers per lock acquisition.
    pub prefetch_size: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_key_size: 1024,
            max_path_length: 64,
            prefetch_size: 10,
        }
    }
}

/// Worst-case bytes of one saturated leaf entry: every embedded id beyond the head sits in
/// its own one-id block.
fn saturated_leaf_footprint(key_len: usize) -> usize {
    SLOT_LEN
        + LEAF_ENTRY_HEADER_LEN
        + key_len
        + (EMBEDDED_ITEMS_THRESHOLD - 1) * (ITEM_HEADER_LEN + Rid::ENCODED_LEN)
}

impl TreeOptions {
    /// Checks the options against the bucket geometry of `page_size`.
    ///
    /// A leaf must hold two saturated maximum-size entries and a non-leaf four maximum-size
    /// separators, so every split leaves both halves non-empty.
    pub fn validate(&self, page_size: usize) -> Result<()> {
        if self.max_key_size == 0 {
            return Err(IndexError::Invalid("max_key_size must be positive"));
        }
        if self.max_path_length < 2 {
            return Err(IndexError::Invalid("max_path_length must be at least 2"));
        }
        if self.prefetch_size == 0 {
            return Err(IndexError::Invalid("prefetch_size must be positive"));
        }
        let capacity = page_size.saturating_sub(POSITIONS_OFFSET);
        if 2 * saturated_leaf_footprint(self.max_key_size) > capacity
            || 4 * non_leaf_entry_footprint(self.max_key_size) > capacity
        {
            return Err(IndexError::Invalid("max_key_size too large for page size"));
        }
        Ok(())
    }

    /// Parses options from a TOML document; missing fields take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|err| IndexError::Serialization(err.to_string()))
    }
}

/// Creation-time description of the keys a tree stores.
#[derive(Clone)]
pub struct KeyDefinition {
    /// Key serializer collaborator.
    pub serializer: Arc<dyn KeySerializer>,
    /// Per-component type hints passed to the serializer.
    pub key_types: Vec<KeyType>,
    /// Number of components of a full key; 1 for scalar keys.
    pub key_size: usize,
    /// Whether `None` keys are accepted.
    pub null_key_supported: bool,
    /// Optional transform applied to stored key bytes.
    pub encryption: Option<Arc<dyn KeyEncryption>>,
}

impl KeyDefinition {
    /// Scalar keys of one type, default serializer, no encryption.
    pub fn scalar(key_type: KeyType) -> Self {
        Self {
            serializer: Arc::new(DefaultKeySerializer),
            key_types: vec![key_type],
            key_size: 1,
            null_key_supported: false,
            encryption: None,
        }
    }

    /// Composite keys with one component per entry of `key_types`.
    pub fn composite(key_types: Vec<KeyType>) -> Self {
        Self {
            key_size: key_types.len().max(1),
            key_types,
            ..Self::scalar(KeyType::Text)
        }
    }

    /// Enables or disables the null key.
    pub fn with_null_key(mut self, supported: bool) -> Self {
        self.null_key_supported = supported;
        self
    }

    /// Installs a key encryption hook.
    pub fn with_encryption(mut self, encryption: Arc<dyn KeyEncryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Replaces the serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn KeySerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub(crate) fn codec(&self) -> KeyCodec {
        KeyCodec::new(
            Arc::clone(&self.serializer),
            self.encryption.clone(),
            self.key_types.clone(),
        )
    }
}

impl fmt::Debug for KeyDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDefinition")
            .field("serializer", &self.serializer.name())
            .field("key_types", &self.key_types)
            .field("key_size", &self.key_size)
            .field("null_key_supported", &self.null_key_supported)
            .field("encrypted", &self.encryption.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fit_default_page() -> Result<()> {
        TreeOptions::default().validate(8192)?;
        assert!(TreeOptions::default().validate(2048).is_err());
        let small = TreeOptions {
            max_key_size: 64,
            ..TreeOptions::default()
        };
        small.validate(4096)?;
        Ok(())
    }

    #[test]
    fn toml_overrides_selected_fields() -> Result<()> {
        let options = TreeOptions::from_toml_str("prefetch_size = 3\nmax_key_size = 200")?;
        assert_eq!(options.prefetch_size, 3);
        assert_eq!(options.max_key_size, 200);
        assert_eq!(options.max_path_length, 64);
        assert!(TreeOptions::from_toml_str("bogus = 1").is_err());
        Ok(())
    }

    #[test]
    fn composite_definition_counts_components() {
        let def = KeyDefinition::composite(vec![KeyType::Text, KeyType::Long]).with_null_key(true);
        assert_eq!(def.key_size, 2);
        assert!(def.null_key_supported);
    }
}
