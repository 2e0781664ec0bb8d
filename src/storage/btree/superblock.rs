use std::ops::Range;

use crate::primitives::pager::WriteGuard;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN, PAGE_MAGIC};
use crate::types::{LarchError, PageId, ReplTimestamp, Result};

const ROOT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const DEPTH: Range<usize> = ROOT.end..ROOT.end + 4;
const RESERVED: Range<usize> = DEPTH.end..DEPTH.end + 4;
const LAST_RECENCY: Range<usize> = RESERVED.end..RESERVED.end + 8;
const DQ_HEAD: Range<usize> = LAST_RECENCY.end..LAST_RECENCY.end + 8;
const DQ_TAIL: Range<usize> = DQ_HEAD.end..DQ_HEAD.end + 8;
const DQ_LEN: Range<usize> = DQ_TAIL.end..DQ_TAIL.end + 8;

/// Tree root pointer and the bookkeeping that travels with it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Superblock {
    /// Root node page, [`PageId::NONE`] for an empty tree.
    pub root: PageId,
    /// Number of levels; 0 for an empty tree, 1 for a lone root leaf.
    pub depth: u32,
    /// Latest recency stamped by a modify operation.
    pub last_recency: ReplTimestamp,
    /// First delete queue page.
    pub delete_queue_head: PageId,
    /// Delete queue page receiving appends.
    pub delete_queue_tail: PageId,
    /// Records in the delete queue.
    pub delete_queue_len: u64,
}

impl Superblock {
    /// Whether `data` holds an initialised superblock page.
    pub fn is_initialized(data: &[u8]) -> bool {
        data.len() >= PAGE_HDR_LEN && data[page::header::MAGIC] == PAGE_MAGIC
    }

    /// Reads the superblock from page `id`, latching it for the transaction.
    pub fn load(tx: &mut WriteGuard<'_>, id: PageId) -> Result<Self> {
        let page = tx.page_mut(id)?;
        Self::decode(page.data(), id)
    }

    /// Writes the superblock to page `id`.
    pub fn store(&self, tx: &mut WriteGuard<'_>, id: PageId) -> Result<()> {
        let salt = tx.salt();
        let mut page = tx.page_mut(id)?;
        let buf = page.data_mut();
        page::init_page(buf, id, PageKind::Superblock, salt)?;
        buf[ROOT].copy_from_slice(&self.root.0.to_be_bytes());
        buf[DEPTH].copy_from_slice(&self.depth.to_be_bytes());
        buf[LAST_RECENCY].copy_from_slice(&self.last_recency.0.to_be_bytes());
        buf[DQ_HEAD].copy_from_slice(&self.delete_queue_head.0.to_be_bytes());
        buf[DQ_TAIL].copy_from_slice(&self.delete_queue_tail.0.to_be_bytes());
        buf[DQ_LEN].copy_from_slice(&self.delete_queue_len.to_be_bytes());
        Ok(())
    }

    /// Decodes a superblock page image.
    pub fn decode(data: &[u8], id: PageId) -> Result<Self> {
        PageHeader::expect(data, id, PageKind::Superblock)?;
        if data.len() < DQ_LEN.end {
            return Err(LarchError::Corruption("superblock truncated"));
        }
        let sb = Self {
            root: PageId(u64::from_be_bytes(field(data, ROOT)?)),
            depth: u32::from_be_bytes(field(data, DEPTH)?),
            last_recency: ReplTimestamp(u64::from_be_bytes(field(data, LAST_RECENCY)?)),
            delete_queue_head: PageId(u64::from_be_bytes(field(data, DQ_HEAD)?)),
            delete_queue_tail: PageId(u64::from_be_bytes(field(data, DQ_TAIL)?)),
            delete_queue_len: u64::from_be_bytes(field(data, DQ_LEN)?),
        };
        if (sb.root == PageId::NONE) != (sb.depth == 0) {
            return Err(LarchError::Corruption("superblock root and depth disagree"));
        }
        if (sb.delete_queue_head == PageId::NONE) != (sb.delete_queue_tail == PageId::NONE) {
            return Err(LarchError::Corruption("delete queue head and tail disagree"));
        }
        Ok(sb)
    }
}

fn field<const N: usize>(data: &[u8], range: Range<usize>) -> Result<[u8; N]> {
    data[range]
        .try_into()
        .map_err(|_| LarchError::Corruption("superblock field truncated"))
}
