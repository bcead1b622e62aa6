#![forbid(unsafe_code)]
//! Page store collaborator: named files of fixed-size pages, atomic operations with
//! copy-on-write overlays, and an in-memory store with snapshot persistence.

mod mem;
mod pager;

pub use mem::{MemPager, PagerStats};
pub use pager::{
    run_atomic, AtomicOperation, ChangeSet, PageMut, PageRead, PageRef, PageStore,
    PagerOptions, ReadGuard, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
