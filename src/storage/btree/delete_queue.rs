//! Append-only log of deleted keys, reached from the superblock.
//!
//! Each page carries a 16 byte queue header (`next u64`, `used u16`,
//! `count u16`, reserved) followed by `(recency u64, key_len u16, key)`
//! records.
//!
//! The queue is unbounded. Nothing in the tree trims it: every logged delete
//! adds a record, including deletes that found no key, and queue pages stay
//! allocated for the life of the store. Use
//! [`DeleteOperation::without_queue`](super::DeleteOperation::without_queue)
//! for deletes that should not be logged.

use std::ops::Range;

use tracing::trace;

use super::superblock::Superblock;
use crate::primitives::pager::{PageStore, ReadGuard, WriteGuard};
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{LarchError, PageId, ReplTimestamp, Result};

const NEXT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const USED: Range<usize> = NEXT.end..NEXT.end + 2;
const COUNT: Range<usize> = USED.end..USED.end + 2;
const RECORDS: usize = PAGE_HDR_LEN + 16;
const RECORD_FIXED: usize = 10;

/// Pages an append may dirty: the current tail and a new tail.
pub const PAGES_PER_APPEND: usize = 2;

/// One logged deletion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeleteQueueEntry {
    /// Recency of the deleting operation.
    pub recency: ReplTimestamp,
    /// Deleted key.
    pub key: Vec<u8>,
}

/// Appends `(recency, key)`, growing the page chain when the tail is full.
pub fn append(
    tx: &mut WriteGuard<'_>,
    sb: &mut Superblock,
    recency: ReplTimestamp,
    key: &[u8],
) -> Result<()> {
    let record_len = RECORD_FIXED + key.len();
    if RECORDS + record_len > tx.page_size() {
        return Err(LarchError::Invalid("key too long for a delete queue page"));
    }
    if sb.delete_queue_tail == PageId::NONE {
        let id = new_queue_page(tx)?;
        sb.delete_queue_head = id;
        sb.delete_queue_tail = id;
    }
    let mut tail = sb.delete_queue_tail;
    let used = {
        let page = tx.page_mut(tail)?;
        PageHeader::expect(page.data(), tail, PageKind::DeleteQueue)?;
        read_u16(page.data(), USED)? as usize
    };
    let mut offset = RECORDS + used;
    if offset + record_len > tx.page_size() {
        let fresh = new_queue_page(tx)?;
        tx.page_mut(tail)?.data_mut()[NEXT].copy_from_slice(&fresh.0.to_be_bytes());
        sb.delete_queue_tail = fresh;
        tail = fresh;
        offset = RECORDS;
    }
    let mut page = tx.page_mut(tail)?;
    let buf = page.data_mut();
    buf[offset..offset + 8].copy_from_slice(&recency.0.to_be_bytes());
    buf[offset + 8..offset + 10].copy_from_slice(&(key.len() as u16).to_be_bytes());
    buf[offset + 10..offset + record_len].copy_from_slice(key);
    let used = (offset + record_len - RECORDS) as u16;
    let count = read_u16(buf, COUNT)? + 1;
    buf[USED].copy_from_slice(&used.to_be_bytes());
    buf[COUNT].copy_from_slice(&count.to_be_bytes());
    sb.delete_queue_len += 1;
    trace!(
        target: "larch::modify",
        page = tail.0,
        recency = recency.0,
        "logged deletion"
    );
    Ok(())
}

fn new_queue_page(tx: &mut WriteGuard<'_>) -> Result<PageId> {
    let id = tx.allocate_page()?;
    let salt = tx.salt();
    let mut page = tx.page_mut(id)?;
    page::init_page(page.data_mut(), id, PageKind::DeleteQueue, salt)?;
    Ok(id)
}

/// Lists the queue within a write transaction.
pub fn entries(tx: &mut WriteGuard<'_>, sb: &Superblock) -> Result<Vec<DeleteQueueEntry>> {
    collect(sb, |id| Ok(tx.page_mut(id)?.data().to_vec()))
}

/// Lists the queue from committed pages.
pub fn read_entries(
    store: &dyn PageStore,
    read: &ReadGuard,
    sb: &Superblock,
) -> Result<Vec<DeleteQueueEntry>> {
    collect(sb, |id| Ok(store.get_page(read, id)?.data().to_vec()))
}

fn collect<F>(sb: &Superblock, mut load: F) -> Result<Vec<DeleteQueueEntry>>
where
    F: FnMut(PageId) -> Result<Vec<u8>>,
{
    let mut out = Vec::new();
    let mut current = sb.delete_queue_head;
    while current != PageId::NONE {
        let data = load(current)?;
        PageHeader::expect(&data, current, PageKind::DeleteQueue)?;
        let used = read_u16(&data, USED)? as usize;
        let count = read_u16(&data, COUNT)? as usize;
        let records = data
            .get(RECORDS..RECORDS + used)
            .ok_or(LarchError::Corruption("delete queue page overflows"))?;
        let mut pos = 0;
        for _ in 0..count {
            let header = records
                .get(pos..pos + RECORD_FIXED)
                .ok_or(LarchError::Corruption("delete queue record truncated"))?;
            let recency = u64::from_be_bytes(header[..8].try_into().map_err(|_| {
                LarchError::Corruption("delete queue record truncated")
            })?);
            let key_len = u16::from_be_bytes([header[8], header[9]]) as usize;
            let key = records
                .get(pos + RECORD_FIXED..pos + RECORD_FIXED + key_len)
                .ok_or(LarchError::Corruption("delete queue record truncated"))?;
            out.push(DeleteQueueEntry {
                recency: ReplTimestamp(recency),
                key: key.to_vec(),
            });
            pos += RECORD_FIXED + key_len;
        }
        if pos != used {
            return Err(LarchError::Corruption("delete queue used bytes disagree"));
        }
        let next = PageId(u64::from_be_bytes(data[NEXT].try_into().map_err(|_| {
            LarchError::Corruption("delete queue link truncated")
        })?));
        if next == PageId::NONE && current != sb.delete_queue_tail {
            return Err(LarchError::Corruption("delete queue ends before its tail"));
        }
        current = next;
    }
    if out.len() as u64 != sb.delete_queue_len {
        return Err(LarchError::Corruption("delete queue length mismatch"));
    }
    Ok(out)
}

fn read_u16(data: &[u8], range: Range<usize>) -> Result<u16> {
    data.get(range)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or(LarchError::Corruption("delete queue header truncated"))
}
