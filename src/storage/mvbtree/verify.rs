use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use super::bucket::Bucket;
use super::entry_point::EntryPoint;
use super::null_bucket::NullBucket;
use super::tree::{MultiValueTree, ENTRY_POINT_PAGE, ROOT_PAGE};
use super::EMBEDDED_ITEMS_THRESHOLD;
use crate::primitives::pager::PageRead;
use crate::storage::key::Key;
use crate::types::{PageId, Result};

/// Findings of [`MultiValueTree::verify`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    /// Buckets reachable from the root.
    pub buckets: u64,
    /// Leaf buckets among them.
    pub leaves: u64,
    /// Levels from the root down to the leaves.
    pub depth: usize,
    /// Keyed leaf entries.
    pub keys: u64,
    /// Record ids stored under non-null keys.
    pub values: u64,
    /// Record ids stored under the null key.
    pub null_values: u64,
    /// Rows held by the overflow container.
    pub overflow_rows: u64,
    /// Entry point record count.
    pub tree_size: u64,
    /// Human readable invariant violations; empty for a healthy tree.
    pub issues: Vec<String>,
}

impl VerifyReport {
    /// Returns true when no invariant violation was found.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Default)]
struct Walk {
    report: VerifyReport,
    visited: HashSet<PageId>,
    leaves: Vec<(PageId, Option<PageId>, Option<PageId>)>,
    leaf_depth: Option<usize>,
    last_key: Option<Key>,
    // m_id -> rows expected in the overflow container
    expected_rows: BTreeMap<u64, u64>,
}

impl Walk {
    fn issue(&mut self, message: String) {
        tracing::warn!(target: "mvbtree::verify", %message, "invariant violated");
        self.report.issues.push(message);
    }
}

impl MultiValueTree {
    /// Walks every bucket and cross-checks counters, order and links.
    ///
    /// Invariant violations are collected into the report; only failures to read the
    /// page store itself are returned as errors.
    pub fn verify<R: PageRead + ?Sized>(&self, tx: &R) -> Result<VerifyReport> {
        self.check_store(tx).map_err(|e| e.in_tree(&self.name, "verify"))?;
        let _lock = tx.shared_lock(&self.lock_name);
        self.verify_inner(tx).map_err(|e| e.in_tree(&self.name, "verify"))
    }

    fn verify_inner<R: PageRead + ?Sized>(&self, tx: &R) -> Result<VerifyReport> {
        let mut walk = Walk::default();
        walk.report.tree_size = {
            let image = tx.read_page(self.file, ENTRY_POINT_PAGE)?;
            EntryPoint::new(image.data()).tree_size()?
        };
        self.visit(tx, ROOT_PAGE, 1, None, None, &mut walk);
        self.check_leaf_chain(&mut walk);
        self.check_null_bucket(tx, &mut walk)?;

        let counted = walk.report.values + walk.report.null_values;
        if counted != walk.report.tree_size {
            walk.issue(format!(
                "entry point records {} values but buckets hold {counted}",
                walk.report.tree_size
            ));
        }
        let actual = self.overflow.counts_by_m_id(tx)?;
        walk.report.overflow_rows = actual.values().sum();
        let expected = std::mem::take(&mut walk.expected_rows);
        for (m_id, rows) in &expected {
            let found = actual.get(m_id).copied().unwrap_or(0);
            if found != *rows {
                walk.issue(format!("overflow id {m_id} expects {rows} rows, found {found}"));
            }
        }
        for (m_id, rows) in &actual {
            if !expected.contains_key(m_id) {
                walk.issue(format!("{rows} overflow rows under unreferenced id {m_id}"));
            }
        }
        walk.report.depth = walk.leaf_depth.unwrap_or(1);
        tracing::info!(
            target: "mvbtree::verify",
            tree = %self.name,
            buckets = walk.report.buckets,
            keys = walk.report.keys,
            issues = walk.report.issues.len(),
            "verification finished"
        );
        Ok(walk.report)
    }

    fn visit<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        page: PageId,
        depth: usize,
        lower: Option<&Key>,
        upper: Option<&Key>,
        walk: &mut Walk,
    ) {
        if depth > self.options.max_path_length {
            walk.issue(format!(
                "page {page} lies deeper than {} levels",
                self.options.max_path_length
            ));
            return;
        }
        if !walk.visited.insert(page) {
            walk.issue(format!("page {page} is reachable twice"));
            return;
        }
        walk.report.buckets += 1;
        let children = match self.check_bucket(tx, page, depth, lower, upper, walk) {
            Ok(children) => children,
            Err(err) => {
                walk.issue(format!("page {page}: {err}"));
                return;
            }
        };
        for (child, child_lower, child_upper) in children {
            self.visit(
                tx,
                child,
                depth + 1,
                child_lower.as_ref().or(lower),
                child_upper.as_ref().or(upper),
                walk,
            );
        }
    }

    /// Checks one bucket and returns its children with their key bounds.
    #[allow(clippy::type_complexity)]
    fn check_bucket<R: PageRead + ?Sized>(
        &self,
        tx: &R,
        page: PageId,
        depth: usize,
        lower: Option<&Key>,
        upper: Option<&Key>,
        walk: &mut Walk,
    ) -> Result<Vec<(PageId, Option<Key>, Option<Key>)>> {
        let image = tx.read_page(self.file, page)?;
        let bucket = Bucket::new(image.data());
        bucket.free_space()?;
        let size = bucket.size()?;
        let mut keys = Vec::with_capacity(size);
        for idx in 0..size {
            keys.push(self.decode(bucket.key_bytes(idx)?)?);
        }
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            walk.issue(format!("page {page}: keys out of order"));
        }
        for key in &keys {
            let below = lower.is_some_and(|lower| key < lower);
            if below || upper.is_some_and(|upper| key >= upper) {
                walk.issue(format!("page {page}: key {key} outside parent separators"));
            }
        }

        if bucket.is_leaf()? {
            walk.report.leaves += 1;
            match walk.leaf_depth {
                None => walk.leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    walk.issue(format!("leaf {page} at depth {depth}, expected {expected}"));
                }
                Some(_) => {}
            }
            let links = (bucket.left_sibling()?, bucket.right_sibling()?);
            walk.leaves.push((page, links.0, links.1));
            for (idx, key) in keys.into_iter().enumerate() {
                let header = bucket.leaf_header(idx)?;
                let embedded = bucket.values(idx)?;
                if embedded.len() != header.embedded as usize
                    || embedded.len() > EMBEDDED_ITEMS_THRESHOLD
                    || header.total < u32::from(header.embedded)
                    || header.total == 0
                {
                    walk.issue(format!(
                        "page {page}: entry {key} has {} embedded of {} total",
                        header.embedded, header.total
                    ));
                }
                if walk.last_key.as_ref().is_some_and(|last| *last >= key) {
                    walk.issue(format!("page {page}: key {key} breaks leaf order"));
                }
                let rows = u64::from(header.total.saturating_sub(u32::from(header.embedded)));
                if walk.expected_rows.insert(header.m_id, rows).is_some() {
                    walk.issue(format!("overflow id {} shared by several keys", header.m_id));
                }
                walk.report.keys += 1;
                walk.report.values += u64::from(header.total);
                walk.last_key = Some(key);
            }
            return Ok(Vec::new());
        }

        if size == 0 {
            walk.issue(format!("non-leaf page {page} has no entries"));
            return Ok(Vec::new());
        }
        let mut children = Vec::with_capacity(size + 1);
        for idx in 0..size {
            let entry = bucket.non_leaf_entry(idx)?;
            if idx + 1 < size && entry.right != bucket.left(idx + 1)? {
                walk.issue(format!(
                    "page {page}: entries {idx} and {} disagree on a child",
                    idx + 1
                ));
            }
            if idx == 0 {
                children.push((entry.left, None, Some(keys[0].clone())));
            }
            let next = keys.get(idx + 1).cloned();
            children.push((entry.right, Some(keys[idx].clone()), next));
        }
        Ok(children)
    }

    fn check_leaf_chain(&self, walk: &mut Walk) {
        let leaves = std::mem::take(&mut walk.leaves);
        if let Some((first, left, _)) = leaves.first() {
            if left.is_some() {
                walk.issue(format!("leftmost leaf {first} has a left sibling"));
            }
        }
        if let Some((last, _, right)) = leaves.last() {
            if right.is_some() {
                walk.issue(format!("rightmost leaf {last} has a right sibling"));
            }
        }
        for pair in leaves.windows(2) {
            let (page, _, right) = pair[0];
            let (next, left, _) = pair[1];
            if right != Some(next) || left != Some(page) {
                walk.issue(format!("leaves {page} and {next} are not linked both ways"));
            }
        }
    }

    fn check_null_bucket<R: PageRead + ?Sized>(&self, tx: &R, walk: &mut Walk) -> Result<()> {
        let Some(null_file) = self.null_file else {
            return Ok(());
        };
        let image = tx.read_page(null_file, PageId(0))?;
        let bucket = NullBucket::new(image.data());
        let (m_id, embedded, total) = (bucket.m_id()?, bucket.embedded()?, bucket.total()?);
        if total < embedded as u32 {
            walk.issue(format!("null bucket has {embedded} embedded of {total} total"));
        }
        let rows = u64::from(total).saturating_sub(embedded as u64);
        if walk.expected_rows.insert(m_id, rows).is_some() {
            walk.issue(format!("overflow id {m_id} shared by the null bucket"));
        }
        walk.report.null_values = u64::from(total);
        Ok(())
    }
}
