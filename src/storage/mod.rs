//! Tree storage: the modify-protocol B-tree and the large-value store it
//! spills oversized values into.

/// B-tree driven by single-key modify operations.
pub mod btree;

/// Overflow-chain storage for large values.
pub mod vstore;

pub use btree::{BTree, BTreeOptions, BTreeSlice, ModifyOperation};
pub use vstore::{LargeValue, VStore};
