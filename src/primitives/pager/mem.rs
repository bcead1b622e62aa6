use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::pager::{AtomicOperation, ChangeSet, PageStore, PagerOptions, ReadGuard};
use crate::primitives::concurrency::LockManager;
use crate::types::{page_crc32, FileId, IndexError, Lsn, PageId, Result};

const SNAPSHOT_MAGIC: &[u8; 8] = b"MVBTSNAP";
const SNAPSHOT_VERSION: u32 = 1;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Counters describing page traffic through a [`MemPager`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerStats {
    /// Pages handed out to readers and writers.
    pub page_loads: u64,
    /// Change sets applied.
    pub commits: u64,
    /// Page images installed by commits.
    pub pages_written: u64,
}

struct MemFile {
    name: String,
    pages: Vec<Arc<[u8]>>,
}

#[derive(Default)]
struct MemState {
    files: BTreeMap<u32, MemFile>,
    names: HashMap<String, FileId>,
    next_file: u32,
    lsn: u64,
}

/// In-memory page store with optional snapshot persistence.
///
/// Committed pages are immutable `Arc<[u8]>` images, so readers never observe a
/// half-applied change set.
pub struct MemPager {
    id: u64,
    options: PagerOptions,
    state: RwLock<MemState>,
    locks: LockManager,
    page_loads: AtomicU64,
    commits: AtomicU64,
    pages_written: AtomicU64,
}

impl MemPager {
    /// Creates an empty store.
    pub fn new(options: PagerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            id: NEXT_STORE_ID.fetch_add(1, AtomicOrdering::Relaxed),
            options,
            state: RwLock::new(MemState::default()),
            locks: LockManager::new(),
            page_loads: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        })
    }

    /// Starts a read view over committed pages.
    pub fn begin_read(&self) -> ReadGuard<'_> {
        ReadGuard::new(self)
    }

    /// Starts an atomic operation against this store.
    pub fn begin_write(&self) -> AtomicOperation<'_> {
        AtomicOperation::new(self)
    }

    /// Options the store was created with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Returns a snapshot of pager statistics.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            page_loads: self.page_loads.load(AtomicOrdering::Relaxed),
            commits: self.commits.load(AtomicOrdering::Relaxed),
            pages_written: self.pages_written.load(AtomicOrdering::Relaxed),
        }
    }

    /// Names of all registered files in creation order.
    pub fn file_names(&self) -> Vec<String> {
        let state = self.state.read();
        state.files.values().map(|f| f.name.clone()).collect()
    }

    /// Last committed sequence number.
    pub fn last_lsn(&self) -> Lsn {
        Lsn(self.state.read().lsn)
    }

    /// Writes every committed page to `path`, each page prefixed by its crc32.
    ///
    /// The snapshot is written to a sibling temporary file and renamed into place.
    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let state = self.state.read();
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            out.write_all(SNAPSHOT_MAGIC)?;
            out.write_all(&SNAPSHOT_VERSION.to_be_bytes())?;
            out.write_all(&(self.options.page_size as u32).to_be_bytes())?;
            out.write_all(&state.lsn.to_be_bytes())?;
            out.write_all(&(state.files.len() as u32).to_be_bytes())?;
            for (&file_no, file) in &state.files {
                let name = file.name.as_bytes();
                let name_len = u16::try_from(name.len())
                    .map_err(|_| IndexError::Invalid("file name longer than 64KiB"))?;
                out.write_all(&file_no.to_be_bytes())?;
                out.write_all(&name_len.to_be_bytes())?;
                out.write_all(name)?;
                out.write_all(&(file.pages.len() as u64).to_be_bytes())?;
                for (page_no, page) in file.pages.iter().enumerate() {
                    let crc = page_crc32(file_no, page_no as u64, page);
                    out.write_all(&crc.to_be_bytes())?;
                    out.write_all(page)?;
                }
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        tracing::info!(
            target: "pager::mem",
            path = %path.display(),
            files = state.files.len(),
            lsn = state.lsn,
            "snapshot written"
        );
        Ok(())
    }

    /// Loads a snapshot written by [`MemPager::checkpoint`].
    ///
    /// The page size recorded in the snapshot wins over `options.page_size`.
    pub fn open(path: &Path, options: PagerOptions) -> Result<Self> {
        let mut input = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        input.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(IndexError::Corruption("snapshot magic mismatch"));
        }
        if read_u32(&mut input)? != SNAPSHOT_VERSION {
            return Err(IndexError::Corruption("unsupported snapshot version"));
        }
        let page_size = read_u32(&mut input)? as usize;
        if page_size != options.page_size {
            tracing::warn!(
                target: "pager::mem",
                requested = options.page_size,
                stored = page_size,
                "snapshot page size overrides options"
            );
        }
        let options = PagerOptions { page_size };
        let pager = Self::new(options)?;
        let lsn = read_u64(&mut input)?;
        let file_count = read_u32(&mut input)?;
        {
            let mut state = pager.state.write();
            state.lsn = lsn;
            for _ in 0..file_count {
                let file_no = read_u32(&mut input)?;
                let mut name_len = [0u8; 2];
                input.read_exact(&mut name_len)?;
                let mut name = vec![0u8; u16::from_be_bytes(name_len) as usize];
                input.read_exact(&mut name)?;
                let name = String::from_utf8(name)
                    .map_err(|_| IndexError::Corruption("snapshot file name is not UTF-8"))?;
                let page_count = read_u64(&mut input)?;
                let mut pages = Vec::new();
                for page_no in 0..page_count {
                    let crc = read_u32(&mut input)?;
                    let mut page = vec![0u8; page_size];
                    input.read_exact(&mut page)?;
                    if page_crc32(file_no, page_no, &page) != crc {
                        return Err(IndexError::Corruption("page checksum mismatch"));
                    }
                    pages.push(Arc::from(page));
                }
                if state.names.insert(name.clone(), FileId(file_no)).is_some() {
                    return Err(IndexError::Corruption("duplicate file name in snapshot"));
                }
                state.files.insert(file_no, MemFile { name, pages });
                state.next_file = state.next_file.max(file_no + 1);
            }
        }
        tracing::info!(
            target: "pager::mem",
            path = %path.display(),
            files = file_count,
            lsn,
            "snapshot loaded"
        );
        Ok(pager)
    }
}

fn read_u32(input: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(input: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

impl PageStore for MemPager {
    fn id(&self) -> u64 {
        self.id
    }

    fn page_size(&self) -> usize {
        self.options.page_size
    }

    fn file_id(&self, name: &str) -> Option<FileId> {
        self.state.read().names.get(name).copied()
    }

    fn create_file(&self, name: &str) -> Result<FileId> {
        let mut state = self.state.write();
        if state.names.contains_key(name) {
            return Err(IndexError::Invalid("file already exists"));
        }
        let file = FileId(state.next_file);
        state.next_file += 1;
        state.names.insert(name.to_owned(), file);
        state.files.insert(
            file.0,
            MemFile {
                name: name.to_owned(),
                pages: Vec::new(),
            },
        );
        tracing::debug!(target: "pager::mem", name, file = file.0, "file created");
        Ok(file)
    }

    fn remove_file(&self, file: FileId) -> Result<()> {
        let mut state = self.state.write();
        let removed = state.files.remove(&file.0).ok_or(IndexError::NotFound)?;
        state.names.remove(&removed.name);
        tracing::debug!(target: "pager::mem", name = %removed.name, file = file.0, "file removed");
        Ok(())
    }

    fn filled_up_to(&self, file: FileId) -> Result<u64> {
        let state = self.state.read();
        let entry = state.files.get(&file.0).ok_or(IndexError::NotFound)?;
        Ok(entry.pages.len() as u64)
    }

    fn load_page(&self, file: FileId, page: PageId) -> Result<Arc<[u8]>> {
        let state = self.state.read();
        let entry = state.files.get(&file.0).ok_or(IndexError::NotFound)?;
        let image = usize::try_from(page.0)
            .ok()
            .and_then(|idx| entry.pages.get(idx))
            .ok_or(IndexError::Corruption("page beyond end of file"))?;
        self.page_loads.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Arc::clone(image))
    }

    fn apply(&self, changes: ChangeSet) -> Result<Lsn> {
        let page_size = self.options.page_size;
        let mut state = self.state.write();
        // Validate before touching anything so a bad set leaves the store unchanged.
        for (file, _, image) in &changes.pages {
            if image.len() != page_size {
                return Err(IndexError::Invalid("page image has the wrong size"));
            }
            if !state.files.contains_key(&file.0) {
                return Err(IndexError::NotFound);
            }
        }
        for (file, filled) in &changes.filled {
            let entry = state.files.get_mut(&file.0).ok_or(IndexError::NotFound)?;
            let target = usize::try_from(*filled)
                .map_err(|_| IndexError::Invalid("file too large"))?;
            while entry.pages.len() < target {
                entry.pages.push(Arc::from(vec![0u8; page_size]));
            }
        }
        let written = changes.pages.len() as u64;
        for (file, page, image) in changes.pages {
            let entry = state.files.get_mut(&file.0).ok_or(IndexError::NotFound)?;
            let slot = usize::try_from(page.0)
                .ok()
                .and_then(|idx| entry.pages.get_mut(idx))
                .ok_or(IndexError::Corruption("page beyond end of file"))?;
            *slot = Arc::from(image);
        }
        for file in changes.deleted_files {
            if let Some(removed) = state.files.remove(&file.0) {
                state.names.remove(&removed.name);
            }
        }
        state.lsn += 1;
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
        self.pages_written.fetch_add(written, AtomicOrdering::Relaxed);
        tracing::trace!(target: "pager::mem", lsn = state.lsn, pages = written, "change set applied");
        Ok(Lsn(state.lsn))
    }

    fn locks(&self) -> &LockManager {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{run_atomic, AtomicOperation, PageRead};
    use std::sync::Once;
    use tempfile::tempdir;
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pager=debug"));
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        });
    }

    fn small_pager() -> MemPager {
        MemPager::new(PagerOptions { page_size: 1024 }).unwrap()
    }

    #[test]
    fn commit_publishes_and_drop_rolls_back() -> Result<()> {
        init_tracing();
        let pager = small_pager();
        let store: &dyn PageStore = &pager;
        let file = run_atomic(store, |op| {
            let file = op.create_file("data")?;
            let page = op.allocate_page(file)?;
            op.page_mut(file, page)?.data_mut()[0] = 7;
            Ok(file)
        })?;
        assert_eq!(store.filled_up_to(file)?, 1);
        assert_eq!(store.load_page(file, PageId(0))?[0], 7);

        {
            let mut op = AtomicOperation::new(store);
            op.page_mut(file, PageId(0))?.data_mut()[0] = 9;
            op.allocate_page(file)?;
            op.create_file("scratch")?;
            assert_eq!(op.dirty_pages(), 2);
            assert_eq!(op.read_page(file, PageId(0))?.data()[0], 9);
            assert_eq!(op.pages_in(file)?, 2);
        }
        assert_eq!(store.load_page(file, PageId(0))?[0], 7);
        assert_eq!(store.filled_up_to(file)?, 1);
        assert!(store.file_id("scratch").is_none());
        assert_eq!(pager.stats().commits, 1);
        Ok(())
    }

    #[test]
    fn exclusive_lock_is_held_until_commit() -> Result<()> {
        let pager = small_pager();
        let store: &dyn PageStore = &pager;
        let mut op = store.begin_write();
        assert!(!op.holds_lock("tree"));
        op.acquire_exclusive_lock("tree");
        op.acquire_exclusive_lock("tree");
        assert!(op.holds_lock("tree"));
        assert!(op.shared_lock("tree").is_none());
        assert!(store.locks().try_exclusive("tree").is_none());
        op.commit()?;
        assert!(store.locks().try_exclusive("tree").is_some());
        Ok(())
    }

    #[test]
    fn rollback_survives_file_already_removed() -> Result<()> {
        init_tracing();
        let pager = small_pager();
        let store: &dyn PageStore = &pager;
        {
            let mut op = store.begin_write();
            let file = op.create_file("scratch")?;
            store.remove_file(file)?;
        }
        assert!(store.file_id("scratch").is_none());
        assert_eq!(pager.stats().commits, 0);
        Ok(())
    }

    #[test]
    fn delete_file_applies_at_commit() -> Result<()> {
        let pager = small_pager();
        let store: &dyn PageStore = &pager;
        let file = run_atomic(store, |op| op.create_file("gone"))?;
        let mut op = store.begin_write();
        op.delete_file(file)?;
        assert!(matches!(op.pages_in(file), Err(IndexError::NotFound)));
        assert!(store.file_id("gone").is_some());
        op.commit()?;
        assert!(store.file_id("gone").is_none());
        Ok(())
    }

    #[test]
    fn snapshot_roundtrip_and_checksum() -> Result<()> {
        init_tracing();
        let dir = tempdir()?;
        let path = dir.path().join("store.snap");
        let pager = small_pager();
        let store: &dyn PageStore = &pager;
        run_atomic(store, |op| {
            let file = op.create_file("tree.cbt")?;
            for fill in 1..=3u8 {
                let page = op.allocate_page(file)?;
                op.page_mut(file, page)?.data_mut()[10] = fill;
            }
            Ok(())
        })?;
        pager.checkpoint(&path)?;

        let reopened = MemPager::open(&path, PagerOptions::default())?;
        assert_eq!(reopened.page_size(), 1024);
        let file = reopened.file_id("tree.cbt").ok_or(IndexError::NotFound)?;
        assert_eq!(reopened.filled_up_to(file)?, 3);
        assert_eq!(reopened.load_page(file, PageId(2))?[10], 3);
        assert_eq!(reopened.last_lsn(), pager.last_lsn());

        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes)?;
        assert!(matches!(
            MemPager::open(&path, PagerOptions::default()),
            Err(IndexError::Corruption("page checksum mismatch"))
        ));
        Ok(())
    }

    #[test]
    fn options_parse_from_toml() -> Result<()> {
        let options = PagerOptions::from_toml_str("page_size = 4096")?;
        assert_eq!(options.page_size, 4096);
        assert_eq!(PagerOptions::from_toml_str("")?, PagerOptions::default());
        assert!(PagerOptions::from_toml_str("page_size = 100").is_err());
        Ok(())
    }
}
