use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::primitives::concurrency::{ExclusiveLock, LockManager, SharedLock};
use crate::types::{FileId, IndexError, Lsn, PageId, Result};

/// Default size of every page in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Smallest page size a store accepts.
pub const MIN_PAGE_SIZE: usize = 1024;
/// Largest page size a store accepts; bucket offsets are stored as `u32`.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Configuration options for a page store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagerOptions {
    /// Size of each page in bytes (e.g., 8192).
    pub page_size: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PagerOptions {
    /// Checks that the page size is within the supported range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(IndexError::Invalid("page_size must be within 1KiB..=64KiB"));
        }
        Ok(())
    }

    /// Parses options from a TOML document; missing fields take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(src).map_err(|err| IndexError::Serialization(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}

/// Page images and file bookkeeping produced by one committed atomic operation.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Full page images to install, in the order they were first touched.
    pub pages: Vec<(FileId, PageId, Vec<u8>)>,
    /// New page counts for files that grew.
    pub filled: Vec<(FileId, u64)>,
    /// Files dropped by the operation.
    pub deleted_files: Vec<FileId>,
}

impl ChangeSet {
    /// Returns true when applying the set would not change the store.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.filled.is_empty() && self.deleted_files.is_empty()
    }
}

/// Durable page collaborator used by trees.
///
/// Implementations hold a registry of named files made of fixed-size pages. Readers see
/// only committed page images; writers stage their changes in an [`AtomicOperation`] and
/// publish them with [`PageStore::apply`].
pub trait PageStore: Send + Sync {
    /// Process-unique identity of this store instance.
    fn id(&self) -> u64;
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;
    /// Looks up a file by name.
    fn file_id(&self, name: &str) -> Option<FileId>;
    /// Registers an empty file. Fails with `Invalid` if the name is taken.
    fn create_file(&self, name: &str) -> Result<FileId>;
    /// Drops a file and all of its pages immediately.
    fn remove_file(&self, file: FileId) -> Result<()>;
    /// Number of pages currently committed for `file`.
    fn filled_up_to(&self, file: FileId) -> Result<u64>;
    /// Loads the committed image of one page.
    fn load_page(&self, file: FileId, page: PageId) -> Result<Arc<[u8]>>;
    /// Atomically installs a change set and returns its sequence number.
    fn apply(&self, changes: ChangeSet) -> Result<Lsn>;
    /// Named component locks shared by every user of the store.
    fn locks(&self) -> &LockManager;
}

impl<'s> dyn PageStore + 's {
    /// Begins a read-only view over committed pages.
    pub fn begin_read(&self) -> ReadGuard<'_> {
        ReadGuard::new(self)
    }

    /// Begins an atomic operation.
    pub fn begin_write(&self) -> AtomicOperation<'_> {
        AtomicOperation::new(self)
    }
}

/// Borrowed view of a page, either committed or staged by the current operation.
pub enum PageRef<'a> {
    /// Image shared with the store.
    Committed(Arc<[u8]>),
    /// Image staged by an uncommitted operation.
    Pending(&'a [u8]),
}

impl PageRef<'_> {
    /// Returns the page data as a byte slice.
    pub fn data(&self) -> &[u8] {
        match self {
            PageRef::Committed(data) => data,
            PageRef::Pending(data) => data,
        }
    }
}

/// A mutable page staged inside an atomic operation.
pub struct PageMut<'a> {
    /// Page identifier.
    pub id: PageId,
    data: &'a mut [u8],
}

impl PageMut<'_> {
    /// Returns the page data as an immutable byte slice.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Returns the page data as a mutable byte slice.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

/// Read access shared by [`ReadGuard`] and [`AtomicOperation`].
pub trait PageRead {
    /// Store the view reads from.
    fn store(&self) -> &dyn PageStore;
    /// Loads a page as seen by this view.
    fn read_page(&self, file: FileId, page: PageId) -> Result<PageRef<'_>>;
    /// Number of pages of `file` visible to this view.
    fn pages_in(&self, file: FileId) -> Result<u64>;
    /// Takes a shared component lock for one search or cursor batch.
    ///
    /// Returns `None` when the view already holds the exclusive lock on `name`, so a
    /// writer can read its own tree without deadlocking on itself.
    fn shared_lock(&self, name: &str) -> Option<SharedLock>;
}

/// Read-only view over committed pages.
pub struct ReadGuard<'s> {
    store: &'s dyn PageStore,
}

impl<'s> ReadGuard<'s> {
    /// Creates a view over `store`.
    pub fn new(store: &'s dyn PageStore) -> Self {
        Self { store }
    }
}

impl PageRead for ReadGuard<'_> {
    fn store(&self) -> &dyn PageStore {
        self.store
    }

    fn read_page(&self, file: FileId, page: PageId) -> Result<PageRef<'_>> {
        Ok(PageRef::Committed(self.store.load_page(file, page)?))
    }

    fn pages_in(&self, file: FileId) -> Result<u64> {
        self.store.filled_up_to(file)
    }

    fn shared_lock(&self, name: &str) -> Option<SharedLock> {
        Some(self.store.locks().shared(name))
    }
}

/// Group of page mutations that become visible together on [`AtomicOperation::commit`].
///
/// Pages are copied on first write into a private overlay. Dropping the operation without
/// committing discards the overlay, removes files it created and releases its locks.
pub struct AtomicOperation<'s> {
    store: &'s dyn PageStore,
    overlay: HashMap<(FileId, PageId), Vec<u8>>,
    touched: Vec<(FileId, PageId)>,
    filled: HashMap<FileId, u64>,
    created_files: Vec<FileId>,
    deleted_files: HashSet<FileId>,
    held: HashSet<String>,
    locks: Vec<ExclusiveLock>,
    committed: bool,
}

impl<'s> AtomicOperation<'s> {
    /// Starts an empty operation against `store`.
    pub fn new(store: &'s dyn PageStore) -> Self {
        Self {
            store,
            overlay: HashMap::new(),
            touched: Vec::new(),
            filled: HashMap::new(),
            created_files: Vec::new(),
            deleted_files: HashSet::new(),
            held: HashSet::new(),
            locks: Vec::new(),
            committed: false,
        }
    }

    fn check_live(&self, file: FileId) -> Result<()> {
        if self.deleted_files.contains(&file) {
            return Err(IndexError::NotFound);
        }
        Ok(())
    }

    /// Returns a writable copy of a page, staging it on first access.
    pub fn page_mut(&mut self, file: FileId, page: PageId) -> Result<PageMut<'_>> {
        self.check_live(file)?;
        let key = (file, page);
        if !self.overlay.contains_key(&key) {
            let committed = self.store.load_page(file, page)?;
            self.overlay.insert(key, committed.to_vec());
            self.touched.push(key);
        }
        let data = self
            .overlay
            .get_mut(&key)
            .ok_or(IndexError::Corruption("staged page vanished"))?;
        Ok(PageMut { id: page, data })
    }

    /// Appends a zeroed page to `file` and returns its index.
    pub fn allocate_page(&mut self, file: FileId) -> Result<PageId> {
        self.check_live(file)?;
        let next = self.pages_in(file)?;
        let page = PageId(next);
        self.filled.insert(file, next + 1);
        self.overlay
            .insert((file, page), vec![0u8; self.store.page_size()]);
        self.touched.push((file, page));
        Ok(page)
    }

    /// Creates a named file; it is removed again if the operation rolls back.
    pub fn create_file(&mut self, name: &str) -> Result<FileId> {
        let file = self.store.create_file(name)?;
        self.created_files.push(file);
        Ok(file)
    }

    /// Schedules `file` for removal at commit.
    pub fn delete_file(&mut self, file: FileId) -> Result<()> {
        self.check_live(file)?;
        self.store.filled_up_to(file)?;
        self.overlay.retain(|(f, _), _| *f != file);
        self.touched.retain(|(f, _)| *f != file);
        self.filled.remove(&file);
        self.deleted_files.insert(file);
        Ok(())
    }

    /// Takes the exclusive lock on `name` until this operation ends. Re-acquiring a held
    /// lock is a no-op.
    pub fn acquire_exclusive_lock(&mut self, name: &str) {
        if self.held.contains(name) {
            return;
        }
        self.locks.push(self.store.locks().exclusive(name));
        self.held.insert(name.to_owned());
    }

    /// Returns true when the operation holds the exclusive lock on `name`.
    pub fn holds_lock(&self, name: &str) -> bool {
        self.held.contains(name)
    }

    /// Number of staged pages.
    pub fn dirty_pages(&self) -> usize {
        self.touched.len()
    }

    /// Publishes every staged change and releases the operation's locks.
    pub fn commit(mut self) -> Result<Lsn> {
        let mut changes = ChangeSet::default();
        for key in std::mem::take(&mut self.touched) {
            if let Some(image) = self.overlay.remove(&key) {
                changes.pages.push((key.0, key.1, image));
            }
        }
        changes.filled = self.filled.drain().collect();
        changes.deleted_files = self.deleted_files.drain().collect();
        let staged = changes.pages.len();
        let lsn = self.store.apply(changes)?;
        self.committed = true;
        tracing::debug!(target: "pager::atomic", lsn = lsn.0, pages = staged, "operation committed");
        Ok(lsn)
    }
}

impl PageRead for AtomicOperation<'_> {
    fn store(&self) -> &dyn PageStore {
        self.store
    }

    fn read_page(&self, file: FileId, page: PageId) -> Result<PageRef<'_>> {
        self.check_live(file)?;
        match self.overlay.get(&(file, page)) {
            Some(image) => Ok(PageRef::Pending(image)),
            None => Ok(PageRef::Committed(self.store.load_page(file, page)?)),
        }
    }

    fn pages_in(&self, file: FileId) -> Result<u64> {
        self.check_live(file)?;
        match self.filled.get(&file) {
            Some(count) => Ok(*count),
            None => self.store.filled_up_to(file),
        }
    }

    fn shared_lock(&self, name: &str) -> Option<SharedLock> {
        if self.held.contains(name) {
            None
        } else {
            Some(self.store.locks().shared(name))
        }
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for file in self.created_files.drain(..).rev() {
            if let Err(err) = self.store.remove_file(file) {
                tracing::warn!(
                    target: "pager::atomic",
                    file = file.0,
                    error = %err,
                    "rollback could not remove created file"
                );
            }
        }
        if !self.touched.is_empty() {
            tracing::debug!(
                target: "pager::atomic",
                pages = self.touched.len(),
                "operation rolled back"
            );
        }
    }
}

/// Runs `f` inside a fresh atomic operation, committing on success and rolling back on error.
pub fn run_atomic<T>(
    store: &dyn PageStore,
    f: impl FnOnce(&mut AtomicOperation<'_>) -> Result<T>,
) -> Result<T> {
    let mut op = AtomicOperation::new(store);
    let out = f(&mut op)?;
    op.commit()?;
    Ok(out)
}
