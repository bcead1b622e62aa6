//! Index storage: keys, the overflow container and the multi-value tree built on them.

/// Key model, total order and key codec.
pub mod key;

/// Multi-value B+ tree with embedded and overflow record id storage.
pub mod mvbtree;

/// Ordered `(m_id, rid)` container for record ids that spill out of leaf entries.
pub mod overflow;
