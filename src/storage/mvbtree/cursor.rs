//! Range cursors over a [`MultiValueTree`].
//!
//! A cursor never keeps a page between batches. Each batch takes the tree's shared lock,
//! re-searches from the last key it emitted and buffers whole keys until at least
//! `prefetch_size` pairs are ready, so writers only wait for one batch at a time.

use std::collections::VecDeque;
use std::ops::Bound;

use super::bucket::Bucket;
use super::tree::search::Edge;
use super::tree::MultiValueTree;
use crate::primitives::pager::PageRead;
use crate::storage::key::{enhance_composite_key, Key, PartialSearchMode};
use crate::types::{IndexError, PageId, Result, Rid};

/// Resumable position of a scan between batches.
#[derive(Debug)]
struct Scan {
    lower: Bound<Key>,
    upper: Bound<Key>,
    ascending: bool,
    resume: Option<Key>,
    done: bool,
}

impl Scan {
    fn past_end(&self, key: &Key) -> bool {
        if self.ascending {
            match &self.upper {
                Bound::Included(upper) => key > upper,
                Bound::Excluded(upper) => key >= upper,
                Bound::Unbounded => false,
            }
        } else {
            match &self.lower {
                Bound::Included(lower) => key < lower,
                Bound::Excluded(lower) => key <= lower,
                Bound::Unbounded => false,
            }
        }
    }

    /// Leaf and index the batch starts from. Ascending scans read `idx` onwards;
    /// descending scans read the entries below `idx`.
    fn start<R: PageRead + ?Sized>(
        &self,
        tree: &MultiValueTree,
        tx: &R,
    ) -> Result<(PageId, usize)> {
        let bound = match &self.resume {
            Some(key) => Bound::Excluded(key),
            None if self.ascending => self.lower.as_ref(),
            None => self.upper.as_ref(),
        };
        let (key, inclusive) = match bound {
            Bound::Unbounded => {
                return if self.ascending {
                    Ok((tree.edge_leaf(tx, Edge::Leftmost)?, 0))
                } else {
                    Ok((tree.edge_leaf(tx, Edge::Rightmost)?, usize::MAX))
                };
            }
            Bound::Included(key) => (key, true),
            Bound::Excluded(key) => (key, false),
        };
        let (page, slot) = tree.find_bucket(tx, key)?;
        let idx = match slot {
            Ok(found) if inclusive == self.ascending => found,
            Ok(found) => found + 1,
            Err(insertion) => insertion,
        };
        Ok((page, idx))
    }

    /// Appends whole keys to `out` until `budget` pairs were produced or the range ends.
    fn fill<R: PageRead + ?Sized>(
        &mut self,
        tree: &MultiValueTree,
        tx: &R,
        with_values: bool,
        out: &mut VecDeque<(Key, Vec<Rid>)>,
    ) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let _lock = tx.shared_lock(&tree.lock_name);
        tree.stats.inc_cursor_batches();
        let budget = tree.options.prefetch_size;
        let limit = tree.walk_limit(tx)?;
        let (mut page, mut idx) = self.start(tree, tx)?;
        let mut produced = 0usize;
        let mut hops = 0u64;
        loop {
            let (size, next) = {
                let image = tx.read_page(tree.file, page)?;
                let bucket = Bucket::new(image.data());
                let next = if self.ascending {
                    bucket.right_sibling()?
                } else {
                    bucket.left_sibling()?
                };
                (bucket.size()?, next)
            };
            if !self.ascending {
                idx = idx.min(size);
            }
            loop {
                let entry = if self.ascending {
                    if idx >= size {
                        break;
                    }
                    idx += 1;
                    idx - 1
                } else {
                    if idx == 0 {
                        break;
                    }
                    idx -= 1;
                    idx
                };
                let key = {
                    let image = tx.read_page(tree.file, page)?;
                    tree.decode(Bucket::new(image.data()).key_bytes(entry)?)?
                };
                if self.past_end(&key) {
                    self.done = true;
                    return Ok(());
                }
                let values = if with_values {
                    tree.entry_values(tx, page, entry)?.into_vec()
                } else {
                    Vec::new()
                };
                produced += values.len().max(1);
                self.resume = Some(key.clone());
                out.push_back((key, values));
                if produced >= budget {
                    tracing::trace!(
                        target: "mvbtree::cursor",
                        produced,
                        page = page.0,
                        "batch filled"
                    );
                    return Ok(());
                }
            }
            let Some(next) = next else {
                self.done = true;
                return Ok(());
            };
            hops += 1;
            if hops > limit {
                return Err(IndexError::Corruption("leaf sibling chain loops"));
            }
            page = next;
            idx = if self.ascending { 0 } else { usize::MAX };
        }
    }
}

/// Lazy ordered sequence of `(key, rid)` pairs within a key range.
///
/// Record ids of one key are yielded in ascending order by an ascending cursor and in
/// descending order by a descending one, so the two directions mirror each other.
pub struct EntryCursor<'t, R: PageRead + ?Sized> {
    tree: &'t MultiValueTree,
    tx: &'t R,
    scan: Scan,
    buffer: VecDeque<(Key, Rid)>,
}

impl<'t, R: PageRead + ?Sized> EntryCursor<'t, R> {
    fn refill(&mut self) -> Result<()> {
        let mut batch = VecDeque::new();
        self.scan.fill(self.tree, self.tx, true, &mut batch)?;
        for (key, mut rids) in batch {
            rids.sort_unstable();
            if !self.scan.ascending {
                rids.reverse();
            }
            self.buffer.extend(rids.into_iter().map(|rid| (key.clone(), rid)));
        }
        Ok(())
    }

    /// Hands the next pair to `f`. Returns `false`, without calling `f`, once the range
    /// is exhausted.
    pub fn try_advance(&mut self, f: impl FnOnce(Key, Rid)) -> Result<bool> {
        match self.next() {
            Some(Ok((key, rid))) => {
                f(key, rid);
                Ok(true)
            }
            Some(Err(err)) => Err(err),
            None => Ok(false),
        }
    }

    /// Whether the cursor walks keys in ascending order.
    pub fn is_ascending(&self) -> bool {
        self.scan.ascending
    }
}

impl<R: PageRead + ?Sized> Iterator for EntryCursor<'_, R> {
    type Item = Result<(Key, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.scan.done {
                return None;
            }
            if let Err(err) = self.refill() {
                self.scan.done = true;
                return Some(Err(err.in_tree(&self.tree.name, "cursor")));
            }
        }
    }
}

/// Lazy ascending sequence of the distinct non-null keys of a tree.
pub struct KeyStream<'t, R: PageRead + ?Sized> {
    tree: &'t MultiValueTree,
    tx: &'t R,
    scan: Scan,
    buffer: VecDeque<Key>,
}

impl<R: PageRead + ?Sized> Iterator for KeyStream<'_, R> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(key));
            }
            if self.scan.done {
                return None;
            }
            let mut batch = VecDeque::new();
            if let Err(err) = self.scan.fill(self.tree, self.tx, false, &mut batch) {
                self.scan.done = true;
                return Some(Err(err.in_tree(&self.tree.name, "key_stream")));
            }
            self.buffer.extend(batch.into_iter().map(|(key, _)| key));
        }
    }
}

impl MultiValueTree {
    fn lower_bound(&self, key: &Key, inclusive: bool) -> Result<Bound<Key>> {
        let key = self.codec.preprocess(key)?;
        Ok(if inclusive {
            Bound::Included(enhance_composite_key(
                &key,
                PartialSearchMode::LowestBoundary,
                self.key_size,
            ))
        } else {
            Bound::Excluded(enhance_composite_key(
                &key,
                PartialSearchMode::HighestBoundary,
                self.key_size,
            ))
        })
    }

    fn upper_bound(&self, key: &Key, inclusive: bool) -> Result<Bound<Key>> {
        let key = self.codec.preprocess(key)?;
        Ok(if inclusive {
            Bound::Included(enhance_composite_key(
                &key,
                PartialSearchMode::HighestBoundary,
                self.key_size,
            ))
        } else {
            Bound::Excluded(enhance_composite_key(
                &key,
                PartialSearchMode::LowestBoundary,
                self.key_size,
            ))
        })
    }

    fn cursor<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
        lower: Bound<Key>,
        upper: Bound<Key>,
        ascending: bool,
    ) -> EntryCursor<'t, R> {
        tracing::debug!(
            target: "mvbtree::cursor",
            tree = %self.name,
            ?lower,
            ?upper,
            ascending,
            "cursor opened"
        );
        EntryCursor {
            tree: self,
            tx,
            scan: Scan {
                lower,
                upper,
                ascending,
                resume: None,
                done: false,
            },
            buffer: VecDeque::new(),
        }
    }

    /// Pairs with keys between `from` and `to`. Partial composite bounds cover every key
    /// sharing the given prefix.
    pub fn iterate_entries_between<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
        from: &Key,
        from_inclusive: bool,
        to: &Key,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'t, R>> {
        self.check_store(tx)
            .and_then(|()| {
                Ok(self.cursor(
                    tx,
                    self.lower_bound(from, from_inclusive)?,
                    self.upper_bound(to, to_inclusive)?,
                    ascending,
                ))
            })
            .map_err(|e| e.in_tree(&self.name, "iterate_entries_between"))
    }

    /// Pairs with keys above `from`.
    pub fn iterate_entries_major<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
        from: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'t, R>> {
        self.check_store(tx)
            .and_then(|()| {
                let lower = self.lower_bound(from, inclusive)?;
                Ok(self.cursor(tx, lower, Bound::Unbounded, ascending))
            })
            .map_err(|e| e.in_tree(&self.name, "iterate_entries_major"))
    }

    /// Pairs with keys below `to`.
    pub fn iterate_entries_minor<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
        to: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryCursor<'t, R>> {
        self.check_store(tx)
            .and_then(|()| {
                let upper = self.upper_bound(to, inclusive)?;
                Ok(self.cursor(tx, Bound::Unbounded, upper, ascending))
            })
            .map_err(|e| e.in_tree(&self.name, "iterate_entries_minor"))
    }

    /// Every pair of the tree in key order; the null key is not included.
    pub fn iterate_all<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
        ascending: bool,
    ) -> Result<EntryCursor<'t, R>> {
        self.check_store(tx)
            .map_err(|e| e.in_tree(&self.name, "iterate_all"))?;
        Ok(self.cursor(tx, Bound::Unbounded, Bound::Unbounded, ascending))
    }

    /// Distinct non-null keys in ascending order.
    pub fn key_stream<'t, R: PageRead + ?Sized>(
        &'t self,
        tx: &'t R,
    ) -> Result<KeyStream<'t, R>> {
        self.check_store(tx)
            .map_err(|e| e.in_tree(&self.name, "key_stream"))?;
        Ok(KeyStream {
            tree: self,
            tx,
            scan: Scan {
                lower: Bound::Unbounded,
                upper: Bound::Unbounded,
                ascending: true,
                resume: None,
                done: false,
            },
            buffer: VecDeque::new(),
        })
    }
}
