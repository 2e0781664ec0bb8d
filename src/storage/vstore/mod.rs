#![forbid(unsafe_code)]

//! Out-of-line storage for values too large to live inside a leaf record.
//!
//! A large value is a singly linked chain of overflow pages. Each page holds
//! a 16 byte overflow header (`next u64`, `used u32`, reserved) followed by a
//! chunk of the payload. The [`LargeRef`] stored in the leaf carries the
//! chain length, payload length and CRC32 so a chain can be validated
//! end-to-end when it is acquired.

use std::cmp::min;
use std::collections::HashSet;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::primitives::pager::{PageMut, PageStore, ReadGuard, WriteGuard};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{Checksum, Crc32Fast, LargeRef, LarchError, PageId, Result};

const OVERFLOW_HEADER_LEN: usize = 16;

/// Fully materialised large value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LargeValue {
    /// Reference the bytes were read from.
    pub reference: LargeRef,
    /// Payload.
    pub bytes: Vec<u8>,
}

impl LargeValue {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Chains already freed by the current transaction, keyed by start page.
#[derive(Default)]
struct FreedChains(HashSet<PageId>);

/// Overflow traffic since the store was opened. Counts include work done by
/// transactions that later rolled back.
#[derive(Default)]
pub struct VStoreMetrics {
    pages_allocated: AtomicU64,
    pages_freed: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// Copy of [`VStoreMetrics`] taken at one instant.
#[derive(Clone, Copy, Debug, Default)]
pub struct VStoreMetricsSnapshot {
    /// Chain pages handed out.
    pub pages_allocated: u64,
    /// Chain pages given back.
    pub pages_freed: u64,
    /// Value bytes written into chains.
    pub bytes_written: u64,
    /// Value bytes read back out of chains.
    pub bytes_read: u64,
}

impl VStoreMetricsSnapshot {
    /// Chain pages still in use; negative only if counts were taken mid-update.
    pub fn live_pages(&self) -> i64 {
        self.pages_allocated as i64 - self.pages_freed as i64
    }
}

impl VStoreMetrics {
    /// Loads all four counters.
    pub fn snapshot(&self) -> VStoreMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        VStoreMetricsSnapshot {
            pages_allocated: load(&self.pages_allocated),
            pages_freed: load(&self.pages_freed),
            bytes_written: load(&self.bytes_written),
            bytes_read: load(&self.bytes_read),
        }
    }

    fn bump(counter: &AtomicU64, delta: u64) {
        if delta != 0 {
            counter.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

/// Large-value manager over a [`PageStore`].
pub struct VStore {
    store: Arc<dyn PageStore>,
    page_size: usize,
    salt: u64,
    data_capacity: usize,
    metrics: Arc<VStoreMetrics>,
}

impl VStore {
    /// Creates a manager for overflow chains stored in `store`.
    pub fn new(store: Arc<dyn PageStore>) -> Result<Self> {
        let page_size = store.page_size() as usize;
        if page_size <= PAGE_HDR_LEN + OVERFLOW_HEADER_LEN {
            return Err(LarchError::Invalid(
                "page size leaves no room for value chain data",
            ));
        }
        Ok(Self {
            salt: store.salt(),
            store,
            page_size,
            data_capacity: page_size - PAGE_HDR_LEN - OVERFLOW_HEADER_LEN,
            metrics: Arc::new(VStoreMetrics::default()),
        })
    }

    /// Payload bytes carried by one overflow page.
    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    /// Pages needed to hold `len` payload bytes.
    pub fn pages_for(&self, len: usize) -> usize {
        len.div_ceil(self.data_capacity).max(1)
    }

    /// Overflow counters for this store.
    pub fn metrics_snapshot(&self) -> VStoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Writes `bytes` to a fresh chain.
    pub fn allocate(&self, tx: &mut WriteGuard<'_>, bytes: &[u8]) -> Result<LargeRef> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| LarchError::Invalid("value larger than 4GB not supported"))?;
        let needed = self.pages_for(bytes.len());
        let n_pages = u32::try_from(needed)
            .map_err(|_| LarchError::Invalid("page count exceeds u32::MAX"))?;
        let mut pages = Vec::with_capacity(needed);
        for _ in 0..needed {
            pages.push(tx.allocate_page()?);
        }
        if let Some(freed) = tx.extension_mut::<FreedChains>() {
            for id in &pages {
                freed.0.remove(id);
            }
        }
        let mut checksum = Crc32Fast::default();
        let mut chunks = bytes.chunks(self.data_capacity);
        for (idx, page_id) in pages.iter().enumerate() {
            let next = pages.get(idx + 1).copied().unwrap_or(PageId::NONE);
            let chunk = chunks.next().unwrap_or(&[]);
            checksum.update(chunk);
            let mut page = tx.page_mut(*page_id)?;
            self.init_overflow_page(&mut page, *page_id, next, chunk)?;
        }
        VStoreMetrics::bump(&self.metrics.pages_allocated, needed as u64);
        VStoreMetrics::bump(&self.metrics.bytes_written, bytes.len() as u64);
        trace!(
            target: "larch::vstore",
            start = pages[0].0,
            pages = needed,
            len = bytes.len(),
            "allocated large value"
        );
        Ok(LargeRef {
            start_page: pages[0],
            n_pages,
            len,
            checksum: checksum.finalize(),
        })
    }

    /// Reads and validates a whole chain inside a write transaction. Every
    /// page of the chain ends up latched by `tx`.
    pub fn acquire(&self, tx: &mut WriteGuard<'_>, reference: LargeRef) -> Result<LargeValue> {
        let bytes = self.collect(reference, |id| Ok(tx.page_mut(id)?.data().to_vec()))?;
        trace!(
            target: "larch::vstore",
            start = reference.start_page.0,
            len = reference.len,
            "acquired large value"
        );
        Ok(LargeValue { reference, bytes })
    }

    /// Reads and validates a whole chain from committed pages.
    pub fn read(&self, guard: &ReadGuard, reference: LargeRef) -> Result<Vec<u8>> {
        self.collect(reference, |id| Ok(self.store.get_page(guard, id)?.data().to_vec()))
    }

    fn collect<F>(&self, reference: LargeRef, mut load: F) -> Result<Vec<u8>>
    where
        F: FnMut(PageId) -> Result<Vec<u8>>,
    {
        if reference.n_pages == 0 {
            return Err(LarchError::Corruption("large value reference has no pages"));
        }
        let mut dst = Vec::with_capacity(reference.len as usize);
        let mut checksum = Crc32Fast::default();
        let mut current = reference.start_page;
        let mut remaining = reference.len as usize;
        for _ in 0..reference.n_pages {
            if current == PageId::NONE {
                return Err(LarchError::Corruption("overflow chain terminated early"));
            }
            let image = load(current)?;
            let (next, data) = self.decode_page(&image, current)?;
            if data.len() > remaining {
                return Err(LarchError::Corruption(
                    "value chain runs past its recorded page count",
                ));
            }
            dst.extend_from_slice(data);
            checksum.update(data);
            remaining -= data.len();
            current = next;
        }
        if current != PageId::NONE {
            return Err(LarchError::Corruption("overflow chain longer than n_pages"));
        }
        if remaining != 0 {
            return Err(LarchError::Corruption(
                "value chain ends before its recorded length",
            ));
        }
        if checksum.finalize() != reference.checksum {
            return Err(LarchError::Corruption("overflow checksum mismatch"));
        }
        VStoreMetrics::bump(&self.metrics.bytes_read, dst.len() as u64);
        Ok(dst)
    }

    /// Frees every page of the chain. A second free of the same chain within
    /// one transaction is a no-op.
    pub fn free(&self, tx: &mut WriteGuard<'_>, reference: LargeRef) -> Result<()> {
        let start = reference.start_page;
        if tx
            .extension_mut::<FreedChains>()
            .is_some_and(|freed| freed.0.contains(&start))
        {
            trace!(target: "larch::vstore", start = start.0, "chain already freed");
            return Ok(());
        }
        let mut current = start;
        for _ in 0..reference.n_pages {
            if current == PageId::NONE {
                return Err(LarchError::Corruption(
                    "freed value chain is missing pages",
                ));
            }
            let page = tx.page_mut(current)?;
            let (next, _) = self.decode_page(page.data(), current)?;
            drop(page);
            tx.free_page(current)?;
            current = next;
        }
        if current != PageId::NONE {
            return Err(LarchError::Corruption(
                "freed value chain has extra pages",
            ));
        }
        match tx.extension_mut::<FreedChains>() {
            Some(freed) => {
                freed.0.insert(start);
            }
            None => tx.store_extension(FreedChains(HashSet::from([start]))),
        }
        VStoreMetrics::bump(&self.metrics.pages_freed, u64::from(reference.n_pages));
        trace!(
            target: "larch::vstore",
            start = start.0,
            pages = reference.n_pages,
            "freed large value"
        );
        Ok(())
    }

    /// Rewrites the chain with `bytes`, in place when the existing pages have
    /// room, otherwise by allocating a new chain and freeing the old one.
    pub fn replace(
        &self,
        tx: &mut WriteGuard<'_>,
        reference: &mut LargeRef,
        bytes: &[u8],
    ) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| LarchError::Invalid("value larger than 4GB not supported"))?;
        let capacity = self.data_capacity * reference.n_pages as usize;
        if bytes.len() > capacity {
            let replacement = self.allocate(tx, bytes)?;
            self.free(tx, *reference)?;
            *reference = replacement;
            trace!(
                target: "larch::vstore",
                start = reference.start_page.0,
                len = reference.len,
                "replaced large value by reallocation"
            );
            return Ok(());
        }
        let mut current = reference.start_page;
        let mut remaining = bytes;
        let mut checksum = Crc32Fast::default();
        for _ in 0..reference.n_pages {
            if current == PageId::NONE {
                return Err(LarchError::Corruption("overflow chain terminated early"));
            }
            let mut page = tx.page_mut(current)?;
            let (next, _) = self.decode_page(page.data(), current)?;
            let (chunk, rest) = remaining.split_at(min(remaining.len(), self.data_capacity));
            checksum.update(chunk);
            write_payload(&mut page.data_mut()[PAGE_HDR_LEN..self.page_size], next, chunk);
            remaining = rest;
            current = next;
        }
        reference.len = len;
        reference.checksum = checksum.finalize();
        VStoreMetrics::bump(&self.metrics.bytes_written, bytes.len() as u64);
        trace!(
            target: "larch::vstore",
            start = reference.start_page.0,
            len,
            "rewrote large value in place"
        );
        Ok(())
    }

    fn init_overflow_page(
        &self,
        page: &mut PageMut,
        page_id: PageId,
        next: PageId,
        payload: &[u8],
    ) -> Result<()> {
        let buf = page.data_mut();
        page::init_page(buf, page_id, PageKind::Overflow, self.salt)?;
        write_payload(&mut buf[PAGE_HDR_LEN..self.page_size], next, payload);
        Ok(())
    }

    fn decode_page<'a>(&self, data: &'a [u8], expected: PageId) -> Result<(PageId, &'a [u8])> {
        if data.len() < self.page_size {
            return Err(LarchError::Corruption("overflow page truncated"));
        }
        let header = PageHeader::decode(data)?;
        if header.kind == PageKind::Free {
            return Err(LarchError::Corruption(
                "large value reference points at a free page",
            ));
        }
        if header.kind != PageKind::Overflow {
            return Err(LarchError::Corruption("page kind mismatch"));
        }
        if header.page_no != expected {
            return Err(LarchError::Corruption("overflow page id mismatch"));
        }
        let payload = &data[PAGE_HDR_LEN..self.page_size];
        let next = PageId(u64::from_be_bytes(payload[..8].try_into().map_err(
            |_| LarchError::Corruption("overflow next pointer truncated"),
        )?));
        let used = u32::from_be_bytes(
            payload[8..12]
                .try_into()
                .map_err(|_| LarchError::Corruption("overflow used bytes truncated"))?,
        ) as usize;
        if payload[12..16] != [0; 4] {
            return Err(LarchError::Corruption("overflow reserved bytes not zero"));
        }
        if used > self.data_capacity {
            return Err(LarchError::Corruption(
                "value chain page claims more bytes than it holds",
            ));
        }
        Ok((next, &payload[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + used]))
    }
}

fn write_payload(payload_buf: &mut [u8], next: PageId, payload: &[u8]) {
    payload_buf.fill(0);
    payload_buf[..8].copy_from_slice(&next.0.to_be_bytes());
    payload_buf[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    payload_buf[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + payload.len()]
        .copy_from_slice(payload);
}
