//! The callback contract between the modify protocol and a concrete edit.

use super::node::{LeafValue, ValueMeta, ValuePayload};
use super::superblock::Superblock;
use crate::primitives::pager::WriteGuard;
use crate::storage::vstore::{LargeValue, VStore};
use crate::types::{CasTime, LargeRef, Result, ReplTimestamp, StoreKey};

/// Deepest tree the page budget accounts for.
pub const MAX_TREE_DEPTH: usize = 24;

/// What the protocol should do with the leaf slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Leave the slot untouched.
    Keep,
    /// Store this value in the slot.
    Replace(LeafValue),
    /// Remove the slot.
    Delete,
}

/// Leaf-level view handed to [`ModifyOperation::operate`].
pub struct OperationContext<'a, 'g> {
    tx: &'a mut WriteGuard<'g>,
    vstore: &'a VStore,
    castime: CasTime,
    inline_limit: usize,
    max_value_len: usize,
}

impl<'a, 'g> OperationContext<'a, 'g> {
    pub(crate) fn new(
        tx: &'a mut WriteGuard<'g>,
        vstore: &'a VStore,
        castime: CasTime,
        inline_limit: usize,
        max_value_len: usize,
    ) -> Self {
        Self {
            tx,
            vstore,
            castime,
            inline_limit,
            max_value_len,
        }
    }

    /// Write transaction the operation runs in.
    pub fn tx(&mut self) -> &mut WriteGuard<'g> {
        &mut *self.tx
    }

    /// Large-value manager.
    pub fn vstore(&self) -> &'a VStore {
        self.vstore
    }

    /// Stamp generated for this operation.
    pub fn castime(&self) -> CasTime {
        self.castime
    }

    /// Values longer than this go out of line.
    pub fn inline_limit(&self) -> usize {
        self.inline_limit
    }

    /// Longest value the tree accepts.
    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    /// Metadata for a value written by this operation.
    pub fn stamp(&self, flags: u32) -> ValueMeta {
        ValueMeta {
            flags,
            cas: self.castime.cas,
            recency: self.castime.recency,
        }
    }

    /// Places `bytes` inline or in a fresh overflow chain.
    pub fn store_payload(&mut self, bytes: Vec<u8>) -> Result<ValuePayload> {
        if bytes.len() <= self.inline_limit {
            return Ok(ValuePayload::Inline(bytes));
        }
        Ok(ValuePayload::Large(self.vstore.allocate(self.tx, &bytes)?))
    }

    /// Like [`store_payload`](Self::store_payload), but rewrites the
    /// existing chain of `old` in place when the new bytes need exactly as
    /// many pages. Otherwise the old chain is left for the protocol to free.
    pub fn store_payload_reusing(
        &mut self,
        bytes: Vec<u8>,
        old: Option<&LargeValue>,
    ) -> Result<ValuePayload> {
        match old {
            Some(old)
                if bytes.len() > self.inline_limit
                    && self.vstore.pages_for(bytes.len()) == old.reference.n_pages as usize =>
            {
                let mut reference = old.reference;
                self.vstore.replace(self.tx, &mut reference, &bytes)?;
                Ok(ValuePayload::Large(reference))
            }
            _ => self.store_payload(bytes),
        }
    }
}

/// A single-key edit driven by [`run_modify_operation`](super::run_modify_operation).
pub trait ModifyOperation {
    /// Upper bound on pages the operation may dirty for a given block size.
    fn compute_expected_change_count(&self, block_size: usize) -> usize;

    /// Decides the new contents of the slot for `key`. `old_large` holds the
    /// acquired bytes when `old` refers to a large value.
    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        old_large: Option<&LargeValue>,
    ) -> Result<Decision>;

    /// Runs after the superblock is acquired and before any node is touched.
    fn superblock_sidequest(
        &mut self,
        _tx: &mut WriteGuard<'_>,
        _superblock: &mut Superblock,
        _recency: ReplTimestamp,
        _key: &StoreKey,
    ) -> Result<()> {
        Ok(())
    }

    /// Materialises the old large value before [`operate`](Self::operate).
    fn acquire_large_value(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        reference: LargeRef,
    ) -> Result<LargeValue> {
        let vstore = ctx.vstore();
        vstore.acquire(ctx.tx(), reference)
    }
}

/// Pages the tree itself may dirty during one modify operation: the
/// superblock, up to three pages per level (node, new sibling or merge
/// partner, and headroom for a redistributed neighbour) and a new root.
pub fn tree_change_bound() -> usize {
    1 + 3 * MAX_TREE_DEPTH + 1
}

/// Overflow pages a value of `len` bytes may need at `block_size`.
pub fn large_value_pages(block_size: usize, len: usize) -> usize {
    let per_page = block_size.saturating_sub(48).max(1);
    len.div_ceil(per_page).max(1)
}

/// Budget for an operation that writes a value of at most `value_len`
/// bytes.
pub fn change_count_for_value(block_size: usize, value_len: usize) -> usize {
    tree_change_bound() + large_value_pages(block_size, value_len)
}
