use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::frame::{Frame, FrameCell};
use super::meta::{create_meta, load_meta, read_meta_page, write_meta_page, Meta};
use crate::primitives::io::{FileBackend, MemBackend, StoreIo};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN, PAGE_MAGIC};
use crate::types::{page_crc32, LarchError, Lsn, PageId, Result};

/// Tunables for a [`Pager`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagerOptions {
    /// Page size for new stores; existing stores keep the size they were
    /// created with.
    pub page_size: u32,
    /// Committed page images kept in the LRU cache.
    pub cache_pages: usize,
    /// Sync policy applied at commit.
    pub synchronous: Synchronous,
    /// Longest wait for a page latch before the transaction gives up.
    pub latch_timeout_ms: u64,
    /// Upper bound on the number of pages in the store.
    pub max_pages: Option<u64>,
    /// Verify page checksums when images are loaded from storage.
    pub verify_checksums: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 256,
            synchronous: Synchronous::Full,
            latch_timeout_ms: 5_000,
            max_pages: None,
            verify_checksums: true,
        }
    }
}

impl PagerOptions {
    /// Rejects values the pager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < page::MIN_PAGE_SIZE
            || self.page_size > page::MAX_PAGE_SIZE
        {
            return Err(LarchError::Config(format!(
                "page_size {} must be a power of two in {}..={}",
                self.page_size,
                page::MIN_PAGE_SIZE,
                page::MAX_PAGE_SIZE
            )));
        }
        if self.cache_pages == 0 {
            return Err(LarchError::Config("cache_pages must be at least 1".into()));
        }
        if matches!(self.max_pages, Some(max) if max < 3) {
            return Err(LarchError::Config(
                "max_pages must leave room for meta, superblock and a root".into(),
            ));
        }
        Ok(())
    }
}

/// Durability mode applied when a write transaction commits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Sync data pages, then the meta page.
    #[default]
    Full,
    /// One sync after the meta page.
    Normal,
    /// No explicit syncs.
    Off,
}

/// Snapshot of pager counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PagerStats {
    /// Committed write transactions.
    pub commits: u64,
    /// Write transactions dropped without commit.
    pub rollbacks: u64,
    /// Page images written by commits.
    pub pages_written: u64,
    /// Latch acquisitions that had to wait.
    pub latch_waits: u64,
    /// Committed image lookups served from the cache.
    pub cache_hits: u64,
    /// Committed image lookups that went to storage.
    pub cache_misses: u64,
}

#[derive(Default)]
struct PagerCounters {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    pages_written: AtomicU64,
    latch_waits: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl PagerCounters {
    fn snapshot(&self) -> PagerStats {
        PagerStats {
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            latch_waits: self.latch_waits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// Page-level storage with copy-on-write write transactions.
pub trait PageStore: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> u32;
    /// Salt mixed into page checksums and stamped into page headers.
    fn salt(&self) -> u64;
    /// Begins a read transaction; commits wait until it is dropped.
    fn begin_read(&self) -> Result<ReadGuard>;
    /// Retrieves a committed page within a read transaction.
    fn get_page(&self, guard: &ReadGuard, id: PageId) -> Result<PageRef>;
    /// Begins a write transaction.
    ///
    /// Write transactions may run side by side; they only exclude each
    /// other on the pages they latch, and every latch is held until commit
    /// or rollback.
    fn begin_write(&self) -> Result<WriteGuard<'_>>;
    /// Publishes every page written by `guard` and releases its latches.
    fn commit(&self, guard: WriteGuard<'_>) -> Result<Lsn>;
    /// Returns the committed metadata.
    fn meta(&self) -> Result<Meta>;
    /// Returns a snapshot of pager statistics.
    fn stats(&self) -> PagerStats;
}

/// Immutable committed page image.
#[derive(Clone, Debug)]
pub struct PageRef {
    /// Page identifier.
    pub id: PageId,
    data: Arc<[u8]>,
}

impl PageRef {
    /// Returns the page data as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Exclusive borrow of a transaction-private page image.
///
/// Only one `PageMut` per page may be alive at a time; a second borrow of
/// the same page fails instead of blocking.
pub struct PageMut {
    /// Page identifier.
    pub id: PageId,
    guard: ArcMutexGuard<RawMutex, Frame>,
}

impl PageMut {
    /// Returns the page data as an immutable byte slice.
    pub fn data(&self) -> &[u8] {
        &self.guard.data
    }

    /// Returns the page data as a mutable byte slice and marks the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard.dirty = true;
        &mut self.guard.data
    }
}

/// Read transaction over committed pages.
pub struct ReadGuard {
    publish: ArcRwLockReadGuard<RawRwLock, ()>,
    snapshot_lsn: Lsn,
}

impl ReadGuard {
    /// Returns the LSN of the last commit visible to this guard.
    pub fn snapshot_lsn(&self) -> Lsn {
        self.snapshot_lsn
    }
}

#[derive(Default)]
struct TxnExtensions {
    map: HashMap<TypeId, Box<dyn Any>>,
}

impl TxnExtensions {
    fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    fn insert<T: Any>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }
}

/// Write transaction.
///
/// Every page touched is latched on first access and stays latched until the
/// guard is committed or dropped. Writes go to private copies; dropping the
/// guard without committing discards them, allocator state included.
pub struct WriteGuard<'a> {
    pager: &'a Pager,
    latches: Vec<(PageId, ArcMutexGuard<RawMutex, ()>)>,
    frames: HashMap<PageId, FrameCell>,
    page_budget: Option<usize>,
    extensions: TxnExtensions,
    committed: bool,
}

impl<'a> WriteGuard<'a> {
    fn new(pager: &'a Pager) -> Self {
        Self {
            pager,
            latches: Vec::new(),
            frames: HashMap::new(),
            page_budget: None,
            extensions: TxnExtensions::default(),
            committed: false,
        }
    }

    /// Page size of the underlying store.
    pub fn page_size(&self) -> usize {
        self.pager.page_size
    }

    /// Salt of the underlying store.
    pub fn salt(&self) -> u64 {
        self.pager.salt
    }

    /// Borrows the private image of `id`, latching the page on first access.
    pub fn page_mut(&mut self, id: PageId) -> Result<PageMut> {
        let cell = self.frame(id)?;
        let guard = cell
            .try_lock_arc()
            .ok_or(LarchError::Invalid("page already borrowed in this transaction"))?;
        Ok(PageMut { id, guard })
    }

    fn frame(&mut self, id: PageId) -> Result<FrameCell> {
        if let Some(cell) = self.frames.get(&id) {
            return Ok(Arc::clone(cell));
        }
        let latch = self.pager.latch(id)?;
        self.latches.push((id, latch));
        let image = self.pager.read_committed(id)?;
        let cell = Frame::copy_of(&image);
        self.frames.insert(id, Arc::clone(&cell));
        Ok(cell)
    }

    /// Allocates a zeroed page, reusing the free list before growing the
    /// store.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let mut meta = self.load_meta()?;
        let id = match meta.free_head.non_zero() {
            Some(head) => {
                let mut page = self.page_mut(head)?;
                PageHeader::expect(page.data(), head, PageKind::Free)?;
                let next = read_free_link(page.data())?;
                if next != PageId::NONE && next >= meta.next_page {
                    return Err(LarchError::Corruption("free list link out of range"));
                }
                page.data_mut().fill(0);
                page.guard.freed = false;
                meta.free_head = next;
                meta.free_count = meta.free_count.saturating_sub(1);
                head
            }
            None => {
                if let Some(max) = self.pager.options.max_pages {
                    if meta.next_page.0 >= max {
                        return Err(LarchError::OutOfSpace);
                    }
                }
                let id = meta.next_page;
                meta.next_page = PageId(id.0 + 1);
                let latch = self.pager.latch(id)?;
                self.latches.push((id, latch));
                self.frames.insert(id, Frame::zeroed(self.pager.page_size));
                id
            }
        };
        self.store_meta(&meta)?;
        trace!(target: "larch::pager", page = id.0, "allocated page");
        Ok(id)
    }

    /// Returns `id` to the free list. Freeing a page that is already free is
    /// corruption.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        if id.0 < 2 {
            return Err(LarchError::Invalid("reserved page cannot be freed"));
        }
        let mut meta = self.load_meta()?;
        if id >= meta.next_page {
            return Err(LarchError::Invalid("page was never allocated"));
        }
        let mut page = self.page_mut(id)?;
        if matches!(PageHeader::decode(page.data()), Ok(header) if header.kind == PageKind::Free) {
            return Err(LarchError::Corruption("page freed twice"));
        }
        let salt = self.pager.salt;
        page::init_page(page.data_mut(), id, PageKind::Free, salt)?;
        page.data_mut()[PAGE_HDR_LEN..PAGE_HDR_LEN + 8]
            .copy_from_slice(&meta.free_head.0.to_be_bytes());
        page.guard.freed = true;
        drop(page);
        meta.free_head = id;
        meta.free_count += 1;
        self.store_meta(&meta)?;
        trace!(target: "larch::pager", page = id.0, "freed page");
        Ok(())
    }

    fn load_meta(&mut self) -> Result<Meta> {
        let page = self.page_mut(PageId(0))?;
        read_meta_page(page.data())
    }

    fn store_meta(&mut self, meta: &Meta) -> Result<()> {
        let mut page = self.page_mut(PageId(0))?;
        write_meta_page(page.data_mut(), meta)
    }

    /// Caps the number of pages this transaction may charge; checked at
    /// commit.
    pub fn set_page_budget(&mut self, budget: Option<usize>) {
        self.page_budget = budget;
    }

    /// Current page budget, if any.
    pub fn page_budget(&self) -> Option<usize> {
        self.page_budget
    }

    /// Pages charged against the budget: written pages that are not free at
    /// the end of the transaction. The pager meta page is never charged.
    pub fn pages_charged(&self) -> usize {
        self.frames
            .iter()
            .filter(|(id, _)| id.0 != 0)
            .filter(|(_, cell)| {
                cell.try_lock()
                    .map_or(true, |frame| frame.dirty && !frame.freed)
            })
            .count()
    }

    /// Returns a mutable reference to a transaction-scoped extension.
    pub fn extension_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut::<T>()
    }

    /// Stores a transaction-scoped extension, replacing any previous value.
    pub fn store_extension<T: Any>(&mut self, value: T) {
        self.extensions.insert(value);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pager.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
            if !self.frames.is_empty() {
                debug!(
                    target: "larch::pager",
                    pages = self.frames.len(),
                    "write transaction rolled back"
                );
            }
        }
        self.frames.clear();
        self.latches.clear();
        self.pager.prune_latches();
    }
}

fn read_free_link(data: &[u8]) -> Result<PageId> {
    let raw: [u8; 8] = data
        .get(PAGE_HDR_LEN..PAGE_HDR_LEN + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(LarchError::Corruption("free page truncated"))?;
    Ok(PageId(u64::from_be_bytes(raw)))
}

fn stamp_crc(id: PageId, salt: u64, data: &mut [u8]) {
    if data.len() < PAGE_HDR_LEN || data[page::header::MAGIC] != PAGE_MAGIC {
        return;
    }
    let crc = page_crc32(id, salt, data);
    data[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

fn verify_image(id: PageId, salt: u64, data: &[u8]) -> Result<()> {
    // Allocated pages that were never initialised stay zero and carry no CRC.
    if data[page::header::MAGIC] != PAGE_MAGIC {
        return Ok(());
    }
    let header = PageHeader::decode(data)?;
    if header.page_no != id {
        return Err(LarchError::Corruption("page number mismatch"));
    }
    if page_crc32(id, salt, data) != header.crc32 {
        return Err(LarchError::Corruption("page checksum mismatch"));
    }
    Ok(())
}

/// Single-file page store.
///
/// Commits are serialised with readers through a publish gate: a commit
/// waits for open [`ReadGuard`]s, so a thread must drop its read guard
/// before committing.
pub struct Pager {
    io: Arc<dyn StoreIo>,
    options: PagerOptions,
    page_size: usize,
    salt: u64,
    gate: Arc<RwLock<()>>,
    cache: Mutex<LruCache<PageId, Arc<[u8]>>>,
    latches: Mutex<HashMap<PageId, Arc<Mutex<()>>>>,
    last_lsn: AtomicU64,
    counters: PagerCounters,
}

impl Pager {
    /// Creates a new store at `path`; the file must not hold data yet.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = FileBackend::open(path)?;
        if !io.is_fresh()? {
            return Err(LarchError::Invalid("store file already exists"));
        }
        Self::with_io(Arc::new(io), options)
    }

    /// Opens an existing store at `path`.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LarchError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("store file {} not found", path.display()),
            )));
        }
        let io = FileBackend::open(path)?;
        if io.is_fresh()? {
            return Err(LarchError::Invalid("store file is empty"));
        }
        Self::with_io(Arc::new(io), options)
    }

    /// Opens `path`, creating the store when the file is missing or empty.
    pub fn open_or_create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        Self::with_io(Arc::new(FileBackend::open(path)?), options)
    }

    /// Creates a volatile store.
    pub fn in_memory(options: PagerOptions) -> Result<Self> {
        Self::with_io(Arc::new(MemBackend::new()), options)
    }

    /// Builds a pager over an arbitrary backend, initialising it when empty.
    pub fn with_io(io: Arc<dyn StoreIo>, options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let meta = if io.is_fresh()? {
            let meta = create_meta(io.as_ref(), options.page_size, rand::random())?;
            // Superblock page exists from the start, zeroed until a tree claims it.
            let zeros = vec![0u8; meta.page_size as usize];
            io.write_all_at(u64::from(meta.page_size), &zeros)?;
            io.flush()?;
            debug!(target: "larch::pager", page_size = meta.page_size, "created store");
            meta
        } else {
            let meta = load_meta(io.as_ref())?;
            if meta.page_size != options.page_size {
                debug!(
                    target: "larch::pager",
                    stored = meta.page_size,
                    requested = options.page_size,
                    "using page size recorded in store"
                );
            }
            meta
        };
        let cache_pages = NonZeroUsize::new(options.cache_pages)
            .ok_or_else(|| LarchError::Config("cache_pages must be at least 1".into()))?;
        Ok(Self {
            io,
            page_size: meta.page_size as usize,
            salt: meta.salt,
            options,
            gate: Arc::new(RwLock::new(())),
            cache: Mutex::new(LruCache::new(cache_pages)),
            latches: Mutex::new(HashMap::new()),
            last_lsn: AtomicU64::new(0),
            counters: PagerCounters::default(),
        })
    }

    /// Options the pager was opened with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Returns a snapshot of pager statistics.
    pub fn stats(&self) -> PagerStats {
        self.counters.snapshot()
    }

    fn offset(&self, id: PageId) -> Result<u64> {
        id.0
            .checked_mul(self.page_size as u64)
            .ok_or(LarchError::Corruption("page id out of range"))
    }

    fn latch_timeout(&self) -> Duration {
        Duration::from_millis(self.options.latch_timeout_ms)
    }

    fn latch(&self, id: PageId) -> Result<ArcMutexGuard<RawMutex, ()>> {
        let cell = Arc::clone(
            self.latches
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );
        if let Some(guard) = cell.try_lock_arc() {
            return Ok(guard);
        }
        self.counters.latch_waits.fetch_add(1, Ordering::Relaxed);
        trace!(target: "larch::pager", page = id.0, "waiting for page latch");
        cell.try_lock_arc_for(self.latch_timeout())
            .ok_or(LarchError::LatchTimeout(id))
    }

    fn prune_latches(&self) {
        self.latches
            .lock()
            .retain(|_, cell| Arc::strong_count(cell) > 1);
    }

    fn read_committed(&self, id: PageId) -> Result<Arc<[u8]>> {
        if let Some(image) = self.cache.lock().get(&id) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(image));
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let mut buf = vec![0u8; self.page_size];
        match self.io.read_exact_at(self.offset(id)?, &mut buf) {
            Ok(()) => {}
            Err(LarchError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(LarchError::Corruption("page beyond end of store"));
            }
            Err(err) => return Err(err),
        }
        if self.options.verify_checksums {
            verify_image(id, self.salt, &buf)?;
        }
        let image: Arc<[u8]> = Arc::from(buf);
        self.cache.lock().put(id, Arc::clone(&image));
        Ok(image)
    }

    fn commit_txn(&self, mut guard: WriteGuard<'_>) -> Result<Lsn> {
        if let Some(budget) = guard.page_budget {
            let used = guard.pages_charged();
            if used > budget {
                debug!(target: "larch::pager", budget, used, "page budget exhausted");
                return Err(LarchError::BudgetExhausted { budget, used });
            }
        }
        let mut images: Vec<(PageId, Box<[u8]>)> = Vec::new();
        for (id, cell) in &guard.frames {
            let mut frame = cell
                .try_lock()
                .ok_or(LarchError::Invalid("page still borrowed at commit"))?;
            if !frame.dirty {
                continue;
            }
            let mut data = std::mem::take(&mut frame.data);
            stamp_crc(*id, self.salt, &mut data);
            images.push((*id, data));
        }
        images.sort_unstable_by_key(|(id, _)| *id);

        let publish = self.gate.write();
        // No WAL: a failed write here can leave the file torn.
        for (id, data) in images.iter().filter(|(id, _)| id.0 != 0) {
            self.io.write_all_at(self.offset(*id)?, data)?;
        }
        if !images.is_empty() {
            if self.options.synchronous == Synchronous::Full {
                self.io.flush()?;
            }
            if let Some((_, data)) = images.iter().find(|(id, _)| id.0 == 0) {
                self.io.write_all_at(0, data)?;
            }
            if self.options.synchronous != Synchronous::Off {
                self.io.flush()?;
            }
        }
        let written = images.len() as u64;
        {
            let mut cache = self.cache.lock();
            for (id, data) in images {
                cache.put(id, Arc::from(data));
            }
        }
        let lsn = Lsn(self.last_lsn.fetch_add(1, Ordering::SeqCst) + 1);
        guard.committed = true;
        drop(publish);
        drop(guard);
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        self.counters
            .pages_written
            .fetch_add(written, Ordering::Relaxed);
        trace!(target: "larch::pager", lsn = lsn.0, pages = written, "committed");
        Ok(lsn)
    }
}

impl PageStore for Pager {
    fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    fn salt(&self) -> u64 {
        self.salt
    }

    fn begin_read(&self) -> Result<ReadGuard> {
        let publish = self.gate.read_arc();
        Ok(ReadGuard {
            publish,
            snapshot_lsn: Lsn(self.last_lsn.load(Ordering::SeqCst)),
        })
    }

    fn get_page(&self, guard: &ReadGuard, id: PageId) -> Result<PageRef> {
        if !Arc::ptr_eq(ArcRwLockReadGuard::rwlock(&guard.publish), &self.gate) {
            return Err(LarchError::Invalid("read guard belongs to another pager"));
        }
        Ok(PageRef {
            id,
            data: self.read_committed(id)?,
        })
    }

    fn begin_write(&self) -> Result<WriteGuard<'_>> {
        Ok(WriteGuard::new(self))
    }

    fn commit(&self, guard: WriteGuard<'_>) -> Result<Lsn> {
        self.commit_txn(guard)
    }

    fn meta(&self) -> Result<Meta> {
        let _publish = self.gate.read();
        read_meta_page(&self.read_committed(PageId(0))?)
    }

    fn stats(&self) -> PagerStats {
        Pager::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_options() -> PagerOptions {
        PagerOptions {
            page_size: 256,
            latch_timeout_ms: 20,
            ..PagerOptions::default()
        }
    }

    #[test]
    fn commit_publishes_and_rollback_discards() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut tx = pager.begin_write()?;
        let id = tx.allocate_page()?;
        {
            let mut page = tx.page_mut(id)?;
            page::init_page(page.data_mut(), id, PageKind::Overflow, tx.salt())?;
            page.data_mut()[100] = 42;
        }
        pager.commit(tx)?;

        let mut tx = pager.begin_write()?;
        tx.page_mut(id)?.data_mut()[100] = 7;
        let _ = tx.allocate_page()?;
        drop(tx);

        let read = pager.begin_read()?;
        assert_eq!(pager.get_page(&read, id)?.data()[100], 42);
        drop(read);
        assert_eq!(pager.meta()?.next_page, PageId(id.0 + 1));
        assert_eq!(pager.stats().rollbacks, 1);
        Ok(())
    }

    #[test]
    fn freed_pages_are_reused() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut tx = pager.begin_write()?;
        let a = tx.allocate_page()?;
        let b = tx.allocate_page()?;
        pager.commit(tx)?;

        let mut tx = pager.begin_write()?;
        tx.free_page(a)?;
        assert!(tx.free_page(a).unwrap_err().is_corruption());
        pager.commit(tx)?;
        assert_eq!(pager.meta()?.free_count, 1);

        let mut tx = pager.begin_write()?;
        assert_eq!(tx.allocate_page()?, a);
        assert_eq!(tx.allocate_page()?, PageId(b.0 + 1));
        pager.commit(tx)?;
        assert_eq!(pager.meta()?.free_count, 0);
        Ok(())
    }

    #[test]
    fn double_borrow_is_rejected() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut tx = pager.begin_write()?;
        let id = tx.allocate_page()?;
        let first = tx.page_mut(id)?;
        assert!(matches!(tx.page_mut(id), Err(LarchError::Invalid(_))));
        drop(first);
        assert!(tx.page_mut(id).is_ok());
        Ok(())
    }

    #[test]
    fn latch_held_by_other_transaction_times_out() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut first = pager.begin_write()?;
        first.page_mut(PageId(1))?;
        let mut second = pager.begin_write()?;
        match second.page_mut(PageId(1)) {
            Err(LarchError::LatchTimeout(id)) => assert_eq!(id, PageId(1)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("latch should be held"),
        }
        drop(second);
        drop(first);
        assert!(pager.stats().latch_waits >= 1);
        let mut third = pager.begin_write()?;
        assert!(third.page_mut(PageId(1)).is_ok());
        Ok(())
    }

    #[test]
    fn budget_counts_net_pages_and_rolls_back() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut tx = pager.begin_write()?;
        tx.set_page_budget(Some(1));
        tx.allocate_page()?;
        tx.allocate_page()?;
        assert_eq!(tx.pages_charged(), 2);
        match pager.commit(tx) {
            Err(LarchError::BudgetExhausted { budget, used }) => {
                assert_eq!((budget, used), (1, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(pager.meta()?.next_page, PageId(2));
        Ok(())
    }

    #[test]
    fn max_pages_reports_out_of_space() -> Result<()> {
        let pager = Pager::in_memory(PagerOptions {
            max_pages: Some(3),
            ..small_options()
        })?;
        let mut tx = pager.begin_write()?;
        tx.allocate_page()?;
        assert!(matches!(tx.allocate_page(), Err(LarchError::OutOfSpace)));
        Ok(())
    }

    #[test]
    fn reopen_reads_committed_pages_and_detects_damage() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("store.larch");
        let id = {
            let pager = Pager::create(&path, small_options())?;
            let mut tx = pager.begin_write()?;
            let id = tx.allocate_page()?;
            {
                let mut page = tx.page_mut(id)?;
                page::init_page(page.data_mut(), id, PageKind::Overflow, tx.salt())?;
                page.data_mut()[200] = 9;
            }
            pager.commit(tx)?;
            id
        };
        assert!(Pager::create(&path, small_options()).is_err());
        {
            let pager = Pager::open(&path, small_options())?;
            let read = pager.begin_read()?;
            assert_eq!(pager.get_page(&read, id)?.data()[200], 9);
        }
        let io = FileBackend::open(&path)?;
        io.write_all_at(id.0 * 256 + 201, &[1])?;
        let pager = Pager::open(&path, small_options())?;
        let read = pager.begin_read()?;
        assert!(pager.get_page(&read, id).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn extensions_are_scoped_to_the_transaction() -> Result<()> {
        let pager = Pager::in_memory(small_options())?;
        let mut tx = pager.begin_write()?;
        assert!(tx.extension_mut::<Vec<u32>>().is_none());
        tx.store_extension(vec![1u32]);
        if let Some(list) = tx.extension_mut::<Vec<u32>>() {
            list.push(2);
        }
        assert_eq!(tx.extension_mut::<Vec<u32>>(), Some(&mut vec![1, 2]));
        drop(tx);
        let mut tx = pager.begin_write()?;
        assert!(tx.extension_mut::<Vec<u32>>().is_none());
        Ok(())
    }

    #[test]
    fn synchronous_reads_lowercase_names() -> Result<()> {
        let options: PagerOptions = toml::from_str("synchronous = \"normal\"")
            .map_err(|err| LarchError::Config(err.to_string()))?;
        assert_eq!(options.synchronous, Synchronous::Normal);
        assert!(toml::from_str::<PagerOptions>("synchronous = \"NORMAL\"").is_err());
        Ok(())
    }
}
