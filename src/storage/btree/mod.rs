#![forbid(unsafe_code)]

//! Transactional B-tree driven by single-key modify operations.

/// Preemptive split and underfull handling.
pub mod balance;
/// Log of deleted keys reached from the superblock.
pub mod delete_queue;
mod modify;
/// Node encoding, in-memory nodes and size thresholds.
pub mod node;
mod operation;
/// Memcached-style commands.
pub mod ops;
mod slice;
mod stats;
mod superblock;
mod tree;

pub use delete_queue::DeleteQueueEntry;
pub use modify::{run_modify_operation, ModifyOutcome, ModifyReport};
pub use node::{BTreeOptions, LeafValue, NodeGeometry, ValueMeta, ValuePayload};
pub use operation::{
    change_count_for_value, large_value_pages, tree_change_bound, Decision, ModifyOperation,
    OperationContext, MAX_TREE_DEPTH,
};
pub use ops::{
    AppendPrependOperation, AppendPrependResult, DeleteOperation, DeleteResult,
    IncrDecrOperation, IncrDecrResult, SetMode, SetOperation, SetResult, TouchOperation,
};
pub use slice::{BTreeSlice, CasTimeSource};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use superblock::Superblock;
pub use tree::{BTree, StoredValue, TreeCounts, TreeReport};
