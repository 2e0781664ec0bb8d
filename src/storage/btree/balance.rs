//! Preemptive split and underfull handling applied while descending.
//!
//! The ancestor of a node is passed as `&mut Option<Held<InternalNode>>`;
//! `None` stands for the superblock, i.e. the node is the root. Both entry
//! points write every page they change before returning, so the in-memory
//! copies held by the caller always match the transaction's page images.

use smallvec::SmallVec;
use tracing::debug;

use super::node::{
    internal_record_len, leaf_record_len, split_point, InternalNode, LeafValue, Node,
};
use super::stats::Event;
use super::superblock::Superblock;
use super::tree::BTree;
use crate::primitives::pager::WriteGuard;
use crate::types::{LarchError, PageId, Result};

/// A decoded node together with the page it lives on.
#[derive(Clone, Debug)]
pub struct Held<N> {
    /// Page the node is stored in.
    pub id: PageId,
    /// Decoded contents.
    pub node: N,
}

impl<N> Held<N> {
    /// Pairs a node with its page.
    pub fn new(id: PageId, node: N) -> Self {
        Self { id, node }
    }
}

impl Held<InternalNode> {
    fn store(&self, tx: &mut WriteGuard<'_>) -> Result<()> {
        Node::Internal(self.node.clone()).store(tx, self.id)
    }
}

/// Splits `node` when it cannot absorb what is coming.
///
/// An internal node splits when one more maximal separator would not fit,
/// so its parent can always take the separator of a split below it. A leaf
/// splits when upserting `(key, new_value)` would overflow it; leaves are
/// only checked once the new value is known. After a split `node` is the
/// half whose key range covers `key`. A split of the root grows the tree by
/// one level and installs the new root as `parent`.
///
/// Returns whether a split happened.
#[allow(clippy::too_many_arguments)]
pub fn check_and_handle_split(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    node: &mut Held<Node>,
    parent: &mut Option<Held<InternalNode>>,
    superblock: &mut Superblock,
    key: &[u8],
    new_value: Option<&LeafValue>,
) -> Result<bool> {
    let geometry = tree.geometry();
    let (separator, right) = match &mut node.node {
        Node::Internal(internal) => {
            if !geometry.internal_is_full(internal) {
                return Ok(false);
            }
            let (separator, right) = internal.split_at_median()?;
            tree.stats().record(Event::InternalSplit);
            (separator, Node::Internal(right))
        }
        Node::Leaf(leaf) => {
            let Some(value) = new_value else {
                return Ok(false);
            };
            if leaf.len_after_upsert(key, value) <= geometry.capacity {
                return Ok(false);
            }
            let (separator, right) = leaf.split_for_upsert(key, value);
            tree.stats().record(Event::LeafSplit);
            (separator, Node::Leaf(right))
        }
    };
    let left_id = node.id;
    let right_id = tx.allocate_page()?;
    node.node.store(tx, left_id)?;
    right.store(tx, right_id)?;

    match parent {
        Some(ancestor) => {
            ancestor.node.insert_separator(separator.clone(), right_id)?;
            ancestor.store(tx)?;
        }
        None => {
            let root_id = tx.allocate_page()?;
            let root = Held::new(
                root_id,
                InternalNode {
                    entries: vec![(Vec::new(), left_id), (separator.clone(), right_id)],
                },
            );
            root.store(tx)?;
            superblock.root = root_id;
            superblock.depth += 1;
            tree.stats().record(Event::RootSplit);
            debug!(
                target: "larch::split",
                root = root_id.0,
                depth = superblock.depth,
                "grew tree by one level"
            );
            *parent = Some(root);
        }
    }
    debug!(
        target: "larch::split",
        left = left_id.0,
        right = right_id.0,
        leaf = right.is_leaf(),
        separator_len = separator.len(),
        "split node"
    );
    if key >= separator.as_slice() {
        *node = Held::new(right_id, right);
    }
    Ok(true)
}

/// Tops up `node` from an adjacent sibling when it is underfull.
///
/// Leaves are underfull below `min_fill`; internal nodes are topped up as
/// soon as losing one separator could take them below it. The root is
/// exempt. Both neighbours are considered for a merge (left first); when
/// neither merge fits one page, entries are redistributed with the left
/// neighbour, or the right one for the leftmost child. A merge that leaves
/// the root with a single child makes that child the root.
///
/// Returns whether anything changed. Afterwards `node` is the node whose key
/// range covers `key`.
pub fn check_and_handle_underfull(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    node: &mut Held<Node>,
    parent: &mut Option<Held<InternalNode>>,
    superblock: &mut Superblock,
    key: &[u8],
) -> Result<bool> {
    let Some(ancestor) = parent.as_mut() else {
        return Ok(false);
    };
    let geometry = tree.geometry();
    let underfull = match &node.node {
        Node::Internal(internal) => geometry.internal_at_risk(internal),
        Node::Leaf(leaf) => geometry.leaf_is_underfull(leaf),
    };
    if !underfull {
        return Ok(false);
    }
    let idx = ancestor
        .node
        .position_of(node.id)
        .ok_or(LarchError::Corruption("child missing from its parent"))?;
    let fanout = ancestor.node.entries.len();
    if fanout < 2 {
        return Err(LarchError::Corruption("non-root node without siblings"));
    }

    let mut candidates: SmallVec<[(usize, PageId); 2]> = SmallVec::new();
    if idx > 0 {
        candidates.push((idx - 1, ancestor.node.entries[idx - 1].1));
    }
    if idx + 1 < fanout {
        candidates.push((idx + 1, ancestor.node.entries[idx + 1].1));
    }
    let mut fallback: Option<(usize, Held<Node>)> = None;
    for (sibling_idx, sibling_id) in candidates {
        let sibling = Held::new(sibling_id, Node::load(tx, sibling_id)?);
        if sibling.node.is_leaf() != node.node.is_leaf() {
            return Err(LarchError::Corruption("siblings on different levels"));
        }
        if geometry.can_merge(&node.node, &sibling.node) {
            merge(tree, tx, node, sibling, idx, sibling_idx, parent, superblock)?;
            return Ok(true);
        }
        if fallback.is_none() {
            fallback = Some((sibling_idx, sibling));
        }
    }
    let (sibling_idx, sibling) =
        fallback.ok_or(LarchError::Corruption("non-root node without siblings"))?;
    let ancestor = parent
        .as_mut()
        .ok_or(LarchError::Corruption("redistribution without a parent"))?;
    redistribute(tree, tx, node, sibling, idx, sibling_idx, ancestor, key)?;
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn merge(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    node: &mut Held<Node>,
    sibling: Held<Node>,
    idx: usize,
    sibling_idx: usize,
    parent: &mut Option<Held<InternalNode>>,
    superblock: &mut Superblock,
) -> Result<()> {
    let current = Held::new(node.id, node.node.take());
    let (mut left, right, right_idx) = if sibling_idx < idx {
        (sibling, current, idx)
    } else {
        (current, sibling, sibling_idx)
    };
    let is_leaf = left.node.is_leaf();
    match (&mut left.node, right.node) {
        (Node::Leaf(l), Node::Leaf(mut r)) => l.entries.append(&mut r.entries),
        (Node::Internal(l), Node::Internal(mut r)) => l.entries.append(&mut r.entries),
        _ => return Err(LarchError::Corruption("siblings on different levels")),
    }
    left.node.store(tx, left.id)?;
    tx.free_page(right.id)?;
    if is_leaf {
        tree.stats().record(Event::LeafMerge);
    } else {
        tree.stats().record(Event::InternalMerge);
    }
    debug!(
        target: "larch::merge",
        survivor = left.id.0,
        freed = right.id.0,
        leaf = is_leaf,
        "merged siblings"
    );

    let Some(ancestor) = parent.as_mut() else {
        return Err(LarchError::Corruption("merge without a parent"));
    };
    ancestor.node.entries.remove(right_idx);
    if ancestor.id == superblock.root && ancestor.node.entries.len() == 1 {
        tx.free_page(ancestor.id)?;
        superblock.root = left.id;
        superblock.depth = superblock.depth.saturating_sub(1);
        tree.stats().record(Event::RootCollapse);
        debug!(
            target: "larch::merge",
            root = left.id.0,
            depth = superblock.depth,
            "collapsed single-child root"
        );
        *parent = None;
    } else {
        ancestor.store(tx)?;
    }
    *node = left;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn redistribute(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    node: &mut Held<Node>,
    sibling: Held<Node>,
    idx: usize,
    sibling_idx: usize,
    ancestor: &mut Held<InternalNode>,
    key: &[u8],
) -> Result<()> {
    let current = Held::new(node.id, node.node.take());
    let (mut left, mut right, right_idx) = if sibling_idx < idx {
        (sibling, current, idx)
    } else {
        (current, sibling, sibling_idx)
    };
    match (&mut left.node, &mut right.node) {
        (Node::Leaf(l), Node::Leaf(r)) => {
            rebalance_entries(&mut l.entries, &mut r.entries, |(k, v)| {
                leaf_record_len(k.len(), v)
            })
        }
        (Node::Internal(l), Node::Internal(r)) => {
            rebalance_entries(&mut l.entries, &mut r.entries, |(sep, _)| {
                internal_record_len(sep.len())
            })
        }
        _ => return Err(LarchError::Corruption("siblings on different levels")),
    }
    let separator = right
        .node
        .first_key()
        .ok_or(LarchError::Corruption("redistribution emptied a sibling"))?
        .to_vec();
    left.node.store(tx, left.id)?;
    right.node.store(tx, right.id)?;
    ancestor.node.entries[right_idx].0 = separator.clone();
    ancestor.store(tx)?;
    tree.stats().record(Event::Redistribution);
    debug!(
        target: "larch::merge",
        left = left.id.0,
        right = right.id.0,
        left_entries = left.node.entry_count(),
        right_entries = right.node.entry_count(),
        "redistributed siblings"
    );
    *node = if key >= separator.as_slice() { right } else { left };
    Ok(())
}

fn rebalance_entries<T, F>(left: &mut Vec<T>, right: &mut Vec<T>, size: F)
where
    F: Fn(&T) -> usize,
{
    let mut all = std::mem::take(left);
    all.append(right);
    let sizes: Vec<usize> = all.iter().map(&size).collect();
    *right = all.split_off(split_point(&sizes));
    *left = all;
}
