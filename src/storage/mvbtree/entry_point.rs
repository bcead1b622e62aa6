//! Page 0 of the tree file: tree-wide counters and the batched overflow-id limit.

use parking_lot::Mutex;

use crate::primitives::bytes::{read_u64, write_u64};
use crate::types::Result;

use super::M_ID_BATCH_SIZE;

const TREE_SIZE_OFFSET: usize = 0;
const PAGES_SIZE_OFFSET: usize = 8;
const M_ID_LIMIT_OFFSET: usize = 16;

/// Typed view over the entry point page.
pub struct EntryPoint<B> {
    data: B,
}

impl<B: AsRef<[u8]>> EntryPoint<B> {
    /// Wraps a page buffer.
    pub fn new(data: B) -> Self {
        Self { data }
    }

    /// Number of `(key, rid)` pairs stored, null key included.
    pub fn tree_size(&self) -> Result<u64> {
        read_u64(self.data.as_ref(), TREE_SIZE_OFFSET)
    }

    /// Highest bucket page index in use.
    pub fn pages_size(&self) -> Result<u64> {
        read_u64(self.data.as_ref(), PAGES_SIZE_OFFSET)
    }

    /// First overflow id not covered by a durable reservation.
    pub fn m_id_limit(&self) -> Result<u64> {
        read_u64(self.data.as_ref(), M_ID_LIMIT_OFFSET)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> EntryPoint<B> {
    /// Formats a fresh entry point: empty tree whose root lives on page 1.
    pub fn init(&mut self) -> Result<()> {
        self.set_tree_size(0)?;
        self.set_pages_size(1)?;
        self.set_m_id_limit(0)
    }

    /// Stores the pair count.
    pub fn set_tree_size(&mut self, size: u64) -> Result<()> {
        write_u64(self.data.as_mut(), TREE_SIZE_OFFSET, size)
    }

    /// Stores the highest bucket page index in use.
    pub fn set_pages_size(&mut self, pages: u64) -> Result<()> {
        write_u64(self.data.as_mut(), PAGES_SIZE_OFFSET, pages)
    }

    /// Stores the overflow id reservation limit.
    pub fn set_m_id_limit(&mut self, limit: u64) -> Result<()> {
        write_u64(self.data.as_mut(), M_ID_LIMIT_OFFSET, limit)
    }
}

/// In-memory overflow id counter backed by a durable reservation limit.
///
/// Ids below the handle's own reservation may be handed out without touching the entry
/// point. When the counter reaches it, a new batch of [`M_ID_BATCH_SIZE`] ids is reserved
/// by writing a higher limit in the caller's atomic operation. After a restart the counter
/// resumes from the persisted limit, so ids issued before a crash are never reused.
///
/// A new batch always starts at or above the limit found on the page, so several handles
/// loaded on the same tree never issue the same id.
#[derive(Debug)]
pub struct MIdCounter {
    state: Mutex<Reservation>,
}

#[derive(Debug)]
struct Reservation {
    next: u64,
    // exclusive upper bound of the batch this handle reserved
    limit: u64,
}

impl MIdCounter {
    /// Counter for a tree whose entry point records `persisted_limit`.
    pub fn resume(persisted_limit: u64) -> Self {
        Self {
            state: Mutex::new(Reservation {
                next: persisted_limit.max(1),
                limit: persisted_limit,
            }),
        }
    }

    /// Next id that would be issued if no other handle reserves a batch first.
    pub fn peek(&self) -> u64 {
        self.state.lock().next
    }

    /// Issues one id, reserving a new batch through `entry_point` when needed.
    ///
    /// A page limit below this handle's reservation means the reservation was rolled back,
    /// so it is made again.
    pub fn next_id<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        entry_point: &mut EntryPoint<B>,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let persisted = entry_point.m_id_limit()?;
        if state.next >= state.limit || persisted < state.limit {
            let start = state.next.max(persisted);
            let limit = start + M_ID_BATCH_SIZE;
            entry_point.set_m_id_limit(limit)?;
            tracing::debug!(
                target: "mvbtree::lifecycle",
                start,
                limit,
                "reserved overflow id batch"
            );
            state.next = start;
            state.limit = limit;
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sets_root_page() -> Result<()> {
        let mut ep = EntryPoint::new(vec![0xffu8; 64]);
        ep.init()?;
        assert_eq!(ep.tree_size()?, 0);
        assert_eq!(ep.pages_size()?, 1);
        assert_eq!(ep.m_id_limit()?, 0);
        Ok(())
    }

    #[test]
    fn ids_are_reserved_in_batches() -> Result<()> {
        let mut ep = EntryPoint::new(vec![0u8; 64]);
        ep.init()?;
        let counter = MIdCounter::resume(ep.m_id_limit()?);
        assert_eq!(counter.next_id(&mut ep)?, 1);
        assert_eq!(ep.m_id_limit()?, 1 + M_ID_BATCH_SIZE);
        for expected in 2..100 {
            assert_eq!(counter.next_id(&mut ep)?, expected);
        }
        assert_eq!(ep.m_id_limit()?, 1 + M_ID_BATCH_SIZE);
        Ok(())
    }

    #[test]
    fn restart_resumes_at_batch_boundary() -> Result<()> {
        let mut ep = EntryPoint::new(vec![0u8; 64]);
        ep.init()?;
        let counter = MIdCounter::resume(ep.m_id_limit()?);
        let issued = counter.next_id(&mut ep)?;
        let reopened = MIdCounter::resume(ep.m_id_limit()?);
        let fresh = reopened.next_id(&mut ep)?;
        assert!(fresh > issued);
        assert_eq!(fresh, 1 + M_ID_BATCH_SIZE);
        assert_eq!(ep.m_id_limit()?, 1 + 2 * M_ID_BATCH_SIZE);
        Ok(())
    }

    #[test]
    fn lost_reservation_is_redone() -> Result<()> {
        let mut ep = EntryPoint::new(vec![0u8; 64]);
        ep.init()?;
        let counter = MIdCounter::resume(0);
        counter.next_id(&mut ep)?;
        // Simulate a rolled back operation: the limit write never landed.
        ep.set_m_id_limit(0)?;
        assert_eq!(counter.next_id(&mut ep)?, 2);
        assert_eq!(ep.m_id_limit()?, 2 + M_ID_BATCH_SIZE);
        Ok(())
    }

    #[test]
    fn concurrent_handles_never_share_ids() -> Result<()> {
        let mut ep = EntryPoint::new(vec![0u8; 64]);
        ep.init()?;
        let first = MIdCounter::resume(ep.m_id_limit()?);
        assert_eq!(first.next_id(&mut ep)?, 1);
        let second = MIdCounter::resume(ep.m_id_limit()?);
        assert_eq!(second.peek(), 1 + M_ID_BATCH_SIZE);

        let mut issued = std::collections::HashSet::new();
        issued.insert(1);
        for _ in 0..(M_ID_BATCH_SIZE + 10) {
            assert!(issued.insert(second.next_id(&mut ep)?), "second handle reused an id");
            assert!(issued.insert(first.next_id(&mut ep)?), "first handle reused an id");
        }
        assert!(first.peek() > 1 + M_ID_BATCH_SIZE);
        Ok(())
    }
}
