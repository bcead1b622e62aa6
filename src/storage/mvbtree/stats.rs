use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of multi-value tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Root-to-leaf descents performed
    pub searches: u64,
    /// Leaf bucket splits (root excluded)
    pub leaf_splits: u64,
    /// Non-leaf bucket splits (root excluded)
    pub non_leaf_splits: u64,
    /// Root splits, each of which adds a level
    pub root_splits: u64,
    /// Record ids written to the overflow container
    pub overflow_inserts: u64,
    /// Record ids deleted from the overflow container
    pub overflow_removes: u64,
    /// Leaf entries dropped after their last record id was removed
    pub entry_removals: u64,
    /// Sibling leaves visited while chasing boundary duplicates
    pub sibling_walks: u64,
    /// Cursor batches fetched
    pub cursor_batches: u64,
}

/// Thread-safe statistics tracking for multi-value tree operations.
#[derive(Default, Debug)]
pub struct TreeStats {
    searches: AtomicU64,
    leaf_splits: AtomicU64,
    non_leaf_splits: AtomicU64,
    root_splits: AtomicU64,
    overflow_inserts: AtomicU64,
    overflow_removes: AtomicU64,
    entry_removals: AtomicU64,
    sibling_walks: AtomicU64,
    cursor_batches: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

impl TreeStats {
    pub(crate) fn inc_searches(&self) {
        bump(&self.searches);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        bump(&self.leaf_splits);
    }

    pub(crate) fn inc_non_leaf_splits(&self) {
        bump(&self.non_leaf_splits);
    }

    pub(crate) fn inc_root_splits(&self) {
        bump(&self.root_splits);
    }

    pub(crate) fn inc_overflow_inserts(&self) {
        bump(&self.overflow_inserts);
    }

    pub(crate) fn inc_overflow_removes(&self) {
        bump(&self.overflow_removes);
    }

    pub(crate) fn inc_entry_removals(&self) {
        bump(&self.entry_removals);
    }

    pub(crate) fn inc_sibling_walks(&self) {
        bump(&self.sibling_walks);
    }

    pub(crate) fn inc_cursor_batches(&self) {
        bump(&self.cursor_batches);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        TreeStatsSnapshot {
            searches: load(&self.searches),
            leaf_splits: load(&self.leaf_splits),
            non_leaf_splits: load(&self.non_leaf_splits),
            root_splits: load(&self.root_splits),
            overflow_inserts: load(&self.overflow_inserts),
            overflow_removes: load(&self.overflow_removes),
            entry_removals: load(&self.entry_removals),
            sibling_walks: load(&self.sibling_walks),
            cursor_batches: load(&self.cursor_batches),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, tree: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "mvbtree::stats",
            tree,
            searches = snapshot.searches,
            leaf_splits = snapshot.leaf_splits,
            non_leaf_splits = snapshot.non_leaf_splits,
            root_splits = snapshot.root_splits,
            overflow_inserts = snapshot.overflow_inserts,
            overflow_removes = snapshot.overflow_removes,
            entry_removals = snapshot.entry_removals,
            sibling_walks = snapshot.sibling_walks,
            cursor_batches = snapshot.cursor_batches,
            "mvbtree stats snapshot"
        );
    }
}
