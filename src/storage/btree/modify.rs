//! The single-key modify protocol.
//!
//! [`run_modify_operation`] acquires the superblock, descends from the root
//! to the leaf covering the key while splitting full and topping up underfull
//! internal nodes, hands the leaf slot to a [`ModifyOperation`] and writes
//! back whatever it decides. All page writes go through the caller's
//! transaction; nothing is visible until the caller commits it.

use tracing::{debug, trace};

use super::balance::{check_and_handle_split, check_and_handle_underfull, Held};
use super::node::{InternalNode, LeafNode, LeafValue, Node, ValuePayload};
use super::operation::{Decision, ModifyOperation, OperationContext, MAX_TREE_DEPTH};
use super::stats::Event;
use super::superblock::Superblock;
use super::tree::BTree;
use crate::primitives::pager::WriteGuard;
use crate::types::{CasTime, LargeRef, LarchError, PageId, Result, StoreKey};

/// What happened to the leaf slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModifyOutcome {
    /// The operation declined to change the slot.
    Kept,
    /// A value was written.
    Replaced,
    /// The slot was removed (or was already absent).
    Deleted,
}

/// Summary of one modify operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModifyReport {
    /// Effect on the leaf slot.
    pub outcome: ModifyOutcome,
    /// Tree depth after the operation; 0 for an empty tree.
    pub depth: u32,
    /// Root page after the operation, [`PageId::NONE`] for an empty tree.
    pub root: PageId,
}

/// Applies `operation` to `key` inside `tx`.
///
/// Errors leave `tx` in an unspecified state; the caller is expected to drop
/// it, which rolls every page back.
pub fn run_modify_operation<O: ModifyOperation + ?Sized>(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    operation: &mut O,
    key: &StoreKey,
    castime: CasTime,
) -> Result<ModifyReport> {
    let geometry = *tree.geometry();
    if key.len() > geometry.max_key_len {
        return Err(LarchError::Invalid("key longer than the tree accepts"));
    }
    let sb_page = tree.superblock_page();
    let mut sb = Superblock::load(tx, sb_page)?;
    operation.superblock_sidequest(tx, &mut sb, castime.recency, key)?;

    if sb.root == PageId::NONE {
        let root = tx.allocate_page()?;
        Node::Leaf(LeafNode::default()).store(tx, root)?;
        sb.root = root;
        sb.depth = 1;
        debug!(target: "larch::modify", root = root.0, "created root leaf");
    }

    let k = key.as_bytes();
    let mut parent: Option<Held<InternalNode>> = None;
    let mut node = Held::new(sb.root, Node::load(tx, sb.root)?);
    let mut levels = 1usize;
    while !node.node.is_leaf() {
        check_and_handle_split(tree, tx, &mut node, &mut parent, &mut sb, k, None)?;
        check_and_handle_underfull(tree, tx, &mut node, &mut parent, &mut sb, k)?;
        let child_id = match &node.node {
            Node::Internal(internal) => internal
                .child_for(k)
                .ok_or(LarchError::Corruption("internal node without children"))?,
            Node::Leaf(_) => return Err(LarchError::Corruption("rebalancing changed node level")),
        };
        levels += 1;
        if levels > MAX_TREE_DEPTH {
            return Err(LarchError::Corruption("tree deeper than supported"));
        }
        let child = Held::new(child_id, Node::load(tx, child_id)?);
        let Held { id, node: current } = std::mem::replace(&mut node, child);
        if let Node::Internal(internal) = current {
            parent = Some(Held::new(id, internal));
        }
    }

    let old = match &node.node {
        Node::Leaf(leaf) => leaf.get(k).cloned(),
        Node::Internal(_) => return Err(LarchError::Corruption("descent ended above leaf level")),
    };
    let old_ref = old.as_ref().and_then(LeafValue::large_ref);
    let old_large = match old_ref {
        Some(reference) => {
            let mut ctx = context(tree, tx, castime);
            Some(operation.acquire_large_value(&mut ctx, reference)?)
        }
        None => None,
    };
    let decision = {
        let mut ctx = context(tree, tx, castime);
        operation.operate(&mut ctx, old.as_ref(), old_large.as_ref())?
    };

    let outcome = match decision {
        Decision::Keep => {
            if parent.is_none() && node.node.entry_count() == 0 {
                drop_empty_root(tx, &mut sb, node.id)?;
            }
            ModifyOutcome::Kept
        }
        Decision::Replace(value) => {
            if let ValuePayload::Inline(bytes) = &value.payload {
                if bytes.len() > geometry.inline_limit {
                    return Err(LarchError::Invalid("inline value longer than inline_limit"));
                }
            }
            let new_ref = value.large_ref();
            check_and_handle_split(tree, tx, &mut node, &mut parent, &mut sb, k, Some(&value))?;
            match &mut node.node {
                Node::Leaf(leaf) => {
                    leaf.upsert(k, value);
                }
                Node::Internal(_) => {
                    return Err(LarchError::Corruption("leaf split produced an internal node"))
                }
            }
            node.node.store(tx, node.id)?;
            check_and_handle_underfull(tree, tx, &mut node, &mut parent, &mut sb, k)?;
            release_superseded(tree, tx, old_ref, new_ref)?;
            ModifyOutcome::Replaced
        }
        Decision::Delete => {
            if let Node::Leaf(leaf) = &mut node.node {
                leaf.remove(k);
            }
            node.node.store(tx, node.id)?;
            if parent.is_none() {
                if node.node.entry_count() == 0 {
                    drop_empty_root(tx, &mut sb, node.id)?;
                }
            } else {
                check_and_handle_underfull(tree, tx, &mut node, &mut parent, &mut sb, k)?;
            }
            release_superseded(tree, tx, old_ref, None)?;
            ModifyOutcome::Deleted
        }
    };

    sb.last_recency = sb.last_recency.max(castime.recency);
    sb.store(tx, sb_page)?;
    tree.stats().record_outcome(outcome != ModifyOutcome::Kept, sb.depth);
    trace!(
        target: "larch::modify",
        key = %key,
        outcome = ?outcome,
        depth = sb.depth,
        cas = castime.cas,
        recency = castime.recency.0,
        "modify operation applied"
    );
    Ok(ModifyReport {
        outcome,
        depth: sb.depth,
        root: sb.root,
    })
}

fn context<'a, 'g>(
    tree: &'a BTree,
    tx: &'a mut WriteGuard<'g>,
    castime: CasTime,
) -> OperationContext<'a, 'g> {
    OperationContext::new(
        tx,
        tree.vstore(),
        castime,
        tree.geometry().inline_limit,
        tree.options().max_value_len,
    )
}

fn drop_empty_root(tx: &mut WriteGuard<'_>, sb: &mut Superblock, root: PageId) -> Result<()> {
    tx.free_page(root)?;
    sb.root = PageId::NONE;
    sb.depth = 0;
    debug!(target: "larch::modify", page = root.0, "tree emptied");
    Ok(())
}

fn release_superseded(
    tree: &BTree,
    tx: &mut WriteGuard<'_>,
    old: Option<LargeRef>,
    new: Option<LargeRef>,
) -> Result<()> {
    let Some(old) = old else {
        return Ok(());
    };
    if new.is_some_and(|new| new.same_chain(&old)) {
        return Ok(());
    }
    tree.vstore().free(tx, old)?;
    tree.stats().record(Event::LargeValueFreed);
    Ok(())
}
