use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Structural changes and value-chain releases counted by [`BTreeStats`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Event {
    LeafSplit,
    InternalSplit,
    RootSplit,
    LeafMerge,
    InternalMerge,
    Redistribution,
    RootCollapse,
    LargeValueFreed,
}

/// Point-in-time copy of [`BTreeStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Full leaves split ahead of an insert.
    pub leaf_splits: u64,
    /// Full internal nodes split during descent.
    pub internal_splits: u64,
    /// Splits that added a level above the old root.
    pub root_splits: u64,
    /// Underfull leaves folded into a sibling.
    pub leaf_merges: u64,
    /// Internal nodes folded into a sibling.
    pub internal_merges: u64,
    /// Entries shifted between siblings instead of merging.
    pub redistributions: u64,
    /// Single-entry internal roots replaced by their child.
    pub root_collapses: u64,
    /// Operations that wrote or removed a value.
    pub modify_ops: u64,
    /// Operations that left the slot as it was.
    pub noop_ops: u64,
    /// Overflow chains released after an overwrite or delete.
    pub large_values_freed: u64,
    /// Depth after the most recent operation.
    pub depth_last: u64,
    /// Greatest depth seen.
    pub depth_max: u64,
}

/// Lock-free counters shared by every operation on one tree.
#[derive(Default)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    root_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    redistributions: AtomicU64,
    root_collapses: AtomicU64,
    large_values_freed: AtomicU64,
    modify_ops: AtomicU64,
    noop_ops: AtomicU64,
    depth_last: AtomicU64,
    depth_max: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn record(&self, event: Event) {
        let counter = match event {
            Event::LeafSplit => &self.leaf_splits,
            Event::InternalSplit => &self.internal_splits,
            Event::RootSplit => &self.root_splits,
            Event::LeafMerge => &self.leaf_merges,
            Event::InternalMerge => &self.internal_merges,
            Event::Redistribution => &self.redistributions,
            Event::RootCollapse => &self.root_collapses,
            Event::LargeValueFreed => &self.large_values_freed,
        };
        counter.fetch_add(1, Relaxed);
    }

    /// Counts a finished operation and the depth it left the tree at.
    pub(crate) fn record_outcome(&self, changed: bool, depth: u32) {
        let counter = if changed {
            &self.modify_ops
        } else {
            &self.noop_ops
        };
        counter.fetch_add(1, Relaxed);
        self.depth_last.store(u64::from(depth), Relaxed);
        self.depth_max.fetch_max(u64::from(depth), Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits.load(Relaxed),
            internal_splits: self.internal_splits.load(Relaxed),
            root_splits: self.root_splits.load(Relaxed),
            leaf_merges: self.leaf_merges.load(Relaxed),
            internal_merges: self.internal_merges.load(Relaxed),
            redistributions: self.redistributions.load(Relaxed),
            root_collapses: self.root_collapses.load(Relaxed),
            modify_ops: self.modify_ops.load(Relaxed),
            noop_ops: self.noop_ops.load(Relaxed),
            large_values_freed: self.large_values_freed.load(Relaxed),
            depth_last: self.depth_last.load(Relaxed),
            depth_max: self.depth_max.load(Relaxed),
        }
    }

    /// Logs a snapshot at info level under `larch::stats`.
    pub fn emit_tracing(&self) {
        let s = self.snapshot();
        tracing::info!(
            target: "larch::stats",
            splits = s.leaf_splits + s.internal_splits,
            root_splits = s.root_splits,
            merges = s.leaf_merges + s.internal_merges,
            redistributions = s.redistributions,
            root_collapses = s.root_collapses,
            modify_ops = s.modify_ops,
            noop_ops = s.noop_ops,
            large_values_freed = s.large_values_freed,
            depth = s.depth_last,
            depth_max = s.depth_max,
            "tree counters"
        );
    }
}
