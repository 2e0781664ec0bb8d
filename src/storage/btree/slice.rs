use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::delete_queue::DeleteQueueEntry;
use super::modify::{run_modify_operation, ModifyReport};
use super::node::BTreeOptions;
use super::operation::ModifyOperation;
use super::ops::{
    AppendPrependOperation, AppendPrependResult, DeleteOperation, DeleteResult,
    IncrDecrOperation, IncrDecrResult, SetMode, SetOperation, SetResult, TouchOperation,
};
use super::stats::BTreeStatsSnapshot;
use super::superblock::Superblock;
use super::tree::{BTree, StoredValue, TreeReport};
use crate::primitives::pager::PageStore;
use crate::types::{CasTime, LarchError, ReplTimestamp, Result, StoreKey};

/// Generates one [`CasTime`] per logical operation.
///
/// Cas tokens start from a random seed and count up. Recency timestamps are
/// kept strictly above the last recency persisted in the superblock.
#[derive(Debug)]
pub struct CasTimeSource {
    cas: AtomicU64,
    recency: AtomicU64,
}

impl CasTimeSource {
    /// Source whose recencies follow `last`.
    pub fn new(last: ReplTimestamp) -> Self {
        Self::with_seed(rand::random::<u64>() | 1, last)
    }

    /// Source with a fixed first cas token.
    pub fn with_seed(cas_seed: u64, last: ReplTimestamp) -> Self {
        Self {
            cas: AtomicU64::new(cas_seed),
            recency: AtomicU64::new(last.0),
        }
    }

    /// Next stamp; the recency is greater than both `floor` and every
    /// recency handed out before.
    pub fn next_after(&self, floor: ReplTimestamp) -> CasTime {
        let mut cas = self.cas.fetch_add(1, Ordering::Relaxed);
        if cas == 0 {
            cas = self.cas.fetch_add(1, Ordering::Relaxed);
        }
        self.recency.fetch_max(floor.0, Ordering::Relaxed);
        let recency = self.recency.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        CasTime::new(cas, ReplTimestamp(recency))
    }
}

/// A tree plus the caller side of the modify protocol: page reservation,
/// stamp generation and commit.
///
/// Every operation latches the superblock first and keeps the latch until it
/// commits, so writers on one slice run one at a time even when their keys
/// are disjoint. Readers are not blocked by the latch.
pub struct BTreeSlice {
    tree: BTree,
    castime: CasTimeSource,
}

impl BTreeSlice {
    /// Opens (or initialises) the tree stored in `store`.
    pub fn open(store: Arc<dyn PageStore>, options: BTreeOptions) -> Result<Self> {
        let tree = BTree::open_or_create(store, options)?;
        let last = {
            let read = tree.store().begin_read()?;
            tree.superblock(&read)?.last_recency
        };
        Ok(Self {
            tree,
            castime: CasTimeSource::new(last),
        })
    }

    /// Underlying tree.
    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Runs `operation` on `key` in its own write transaction.
    ///
    /// The transaction's page budget is the operation's expected change
    /// count. The superblock is latched before the stamp is drawn, so stamps
    /// follow commit order.
    pub fn run<O: ModifyOperation + ?Sized>(
        &self,
        operation: &mut O,
        key: &StoreKey,
    ) -> Result<ModifyReport> {
        let store = self.tree.store();
        let mut tx = store.begin_write()?;
        tx.set_page_budget(Some(
            operation.compute_expected_change_count(store.page_size() as usize),
        ));
        let last = Superblock::load(&mut tx, self.tree.superblock_page())?.last_recency;
        let castime = self.castime.next_after(last);
        let report = run_modify_operation(&self.tree, &mut tx, operation, key, castime)?;
        let charged = tx.pages_charged();
        let lsn = store.commit(tx)?;
        trace!(
            target: "larch::modify",
            lsn = lsn.0,
            pages = charged,
            cas = castime.cas,
            "modify committed"
        );
        Ok(report)
    }

    fn key(bytes: &[u8]) -> Result<StoreKey> {
        StoreKey::new(bytes.to_vec())
    }

    fn set_with(&self, key: &[u8], value: &[u8], flags: u32, mode: SetMode) -> Result<SetResult> {
        let mut op = SetOperation::new(value.to_vec(), flags, mode);
        self.run(&mut op, &Self::key(key)?)?;
        op.result().ok_or(LarchError::Invalid("set did not reach a leaf"))
    }

    /// Stores `value` unconditionally.
    pub fn set(&self, key: &[u8], value: &[u8], flags: u32) -> Result<SetResult> {
        self.set_with(key, value, flags, SetMode::Set)
    }

    /// Stores `value` if `key` is absent.
    pub fn add(&self, key: &[u8], value: &[u8], flags: u32) -> Result<SetResult> {
        self.set_with(key, value, flags, SetMode::Add)
    }

    /// Stores `value` if `key` is present.
    pub fn replace(&self, key: &[u8], value: &[u8], flags: u32) -> Result<SetResult> {
        self.set_with(key, value, flags, SetMode::Replace)
    }

    /// Stores `value` if the current value carries `cas`.
    pub fn cas(&self, key: &[u8], value: &[u8], flags: u32, cas: u64) -> Result<SetResult> {
        self.set_with(key, value, flags, SetMode::Cas(cas))
    }

    fn append_prepend(&self, key: &[u8], data: &[u8], prepend: bool) -> Result<AppendPrependResult> {
        let mut op =
            AppendPrependOperation::new(data.to_vec(), prepend, self.tree.options().max_value_len);
        self.run(&mut op, &Self::key(key)?)?;
        op.result()
            .ok_or(LarchError::Invalid("append did not reach a leaf"))
    }

    /// Appends `data` to the current value.
    pub fn append(&self, key: &[u8], data: &[u8]) -> Result<AppendPrependResult> {
        self.append_prepend(key, data, false)
    }

    /// Prepends `data` to the current value.
    pub fn prepend(&self, key: &[u8], data: &[u8]) -> Result<AppendPrependResult> {
        self.append_prepend(key, data, true)
    }

    fn incr_decr(&self, key: &[u8], delta: u64, increment: bool) -> Result<IncrDecrResult> {
        let mut op = IncrDecrOperation::new(delta, increment);
        self.run(&mut op, &Self::key(key)?)?;
        op.result()
            .ok_or(LarchError::Invalid("incr/decr did not reach a leaf"))
    }

    /// Adds `delta` to a decimal counter.
    pub fn incr(&self, key: &[u8], delta: u64) -> Result<IncrDecrResult> {
        self.incr_decr(key, delta, true)
    }

    /// Subtracts `delta` from a decimal counter, stopping at zero.
    pub fn decr(&self, key: &[u8], delta: u64) -> Result<IncrDecrResult> {
        self.incr_decr(key, delta, false)
    }

    /// Removes `key`, logging the deletion.
    pub fn delete(&self, key: &[u8]) -> Result<DeleteResult> {
        let mut op = DeleteOperation::new();
        self.run(&mut op, &Self::key(key)?)?;
        op.result()
            .ok_or(LarchError::Invalid("delete did not reach a leaf"))
    }

    /// Refreshes the stamp of `key`; returns whether it exists.
    pub fn touch(&self, key: &[u8]) -> Result<bool> {
        let mut op = TouchOperation::default();
        self.run(&mut op, &Self::key(key)?)?;
        op.found()
            .ok_or(LarchError::Invalid("touch did not reach a leaf"))
    }

    /// Reads the committed value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<StoredValue>> {
        let read = self.tree.store().begin_read()?;
        self.tree.get(&read, key)
    }

    /// Checks the committed tree.
    pub fn verify(&self) -> Result<TreeReport> {
        let read = self.tree.store().begin_read()?;
        self.tree.verify(&read)
    }

    /// Committed superblock.
    pub fn superblock(&self) -> Result<Superblock> {
        let read = self.tree.store().begin_read()?;
        self.tree.superblock(&read)
    }

    /// Committed delete queue.
    pub fn delete_queue(&self) -> Result<Vec<DeleteQueueEntry>> {
        let read = self.tree.store().begin_read()?;
        self.tree.delete_queue(&read)
    }

    /// Tree statistics.
    pub fn stats(&self) -> BTreeStatsSnapshot {
        self.tree.stats().snapshot()
    }
}
