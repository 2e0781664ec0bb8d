//! Larch: a disk-backed, transactional B-tree whose every mutation goes
//! through one single-key modify protocol.
//!
//! A [`BTreeSlice`] opens a write transaction per operation, generates a
//! [`CasTime`] stamp and runs a [`ModifyOperation`] through
//! [`run_modify_operation`](storage::btree::run_modify_operation), which
//! splits and merges nodes preemptively on the way down and spills large
//! values into overflow chains.

#![warn(missing_docs)]

/// TOML configuration.
pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::LarchConfig;
pub use primitives::pager::{PageStore, Pager, PagerOptions, Synchronous};
pub use storage::btree::{
    BTree, BTreeOptions, BTreeSlice, Decision, ModifyOperation, ModifyOutcome, ModifyReport,
    OperationContext,
};
pub use types::{CasTime, LarchError, PageId, ReplTimestamp, Result, StoreKey};
