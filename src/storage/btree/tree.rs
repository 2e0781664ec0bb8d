use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::delete_queue::{self, DeleteQueueEntry};
use super::node::{BTreeOptions, Node, NodeGeometry, ValueMeta, ValuePayload};
use super::operation::MAX_TREE_DEPTH;
use super::stats::BTreeStats;
use super::superblock::Superblock;
use crate::primitives::pager::{PageStore, ReadGuard};
use crate::storage::vstore::VStore;
use crate::types::{LargeRef, LarchError, PageId, Result};

const MAX_FINDINGS: usize = 32;

/// A value read back from committed pages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredValue {
    /// Flags and stamps.
    pub meta: ValueMeta,
    /// Value bytes, resolved through the large-value store when needed.
    pub bytes: Vec<u8>,
    /// Chain the bytes came from, for large values.
    pub large: Option<LargeRef>,
}

/// Structure counts gathered by [`BTree::verify`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct TreeCounts {
    /// Depth recorded in the superblock.
    pub depth: u32,
    /// Internal nodes visited.
    pub internal_nodes: u64,
    /// Leaves visited.
    pub leaves: u64,
    /// Leaf entries.
    pub entries: u64,
    /// Entries whose value lives in an overflow chain.
    pub large_values: u64,
    /// Overflow pages referenced by those entries.
    pub large_pages: u64,
    /// Records in the delete queue.
    pub delete_queue_len: u64,
}

/// Result of [`BTree::verify`].
#[derive(Clone, Debug, Serialize)]
pub struct TreeReport {
    /// Whether no invariant violation was found.
    pub success: bool,
    /// Violations, capped at a fixed number.
    pub findings: Vec<String>,
    /// What was visited.
    pub counts: TreeCounts,
}

/// A modify-protocol B-tree stored in a [`PageStore`].
///
/// The handle itself is stateless apart from statistics: every operation
/// reads the root from the superblock inside its own transaction.
pub struct BTree {
    store: Arc<dyn PageStore>,
    vstore: VStore,
    options: BTreeOptions,
    geometry: NodeGeometry,
    superblock_page: PageId,
    stats: Arc<BTreeStats>,
}

impl BTree {
    /// Opens the tree in `store`, writing an empty superblock first if the
    /// store is new.
    pub fn open_or_create(store: Arc<dyn PageStore>, options: BTreeOptions) -> Result<Self> {
        let page_size = store.page_size() as usize;
        let geometry = NodeGeometry::new(page_size, &options)?;
        let superblock_page = store.meta()?.superblock;
        if superblock_page == PageId::NONE {
            return Err(LarchError::Corruption("store has no superblock page"));
        }
        let existing = {
            let read = store.begin_read()?;
            let page = store.get_page(&read, superblock_page)?;
            if Superblock::is_initialized(page.data()) {
                Some(Superblock::decode(page.data(), superblock_page)?)
            } else {
                None
            }
        };
        if let Some(sb) = existing {
            debug!(
                target: "larch::modify",
                root = sb.root.0,
                depth = sb.depth,
                "opened tree"
            );
        } else {
            let mut tx = store.begin_write()?;
            let fresh = !Superblock::is_initialized(tx.page_mut(superblock_page)?.data());
            if fresh {
                Superblock::default().store(&mut tx, superblock_page)?;
            }
            store.commit(tx)?;
            info!(
                target: "larch::modify",
                page = superblock_page.0,
                page_size,
                "initialised empty tree"
            );
        }
        let vstore = VStore::new(Arc::clone(&store))?;
        Ok(Self {
            store,
            vstore,
            options,
            geometry,
            superblock_page,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Page store the tree lives in.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Large-value manager.
    pub fn vstore(&self) -> &VStore {
        &self.vstore
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Size thresholds for the store's page size.
    pub fn geometry(&self) -> &NodeGeometry {
        &self.geometry
    }

    /// Page holding the superblock.
    pub fn superblock_page(&self) -> PageId {
        self.superblock_page
    }

    /// Live statistics counters.
    pub fn stats(&self) -> &Arc<BTreeStats> {
        &self.stats
    }

    /// Committed superblock.
    pub fn superblock(&self, read: &ReadGuard) -> Result<Superblock> {
        let page = self.store.get_page(read, self.superblock_page)?;
        Superblock::decode(page.data(), self.superblock_page)
    }

    /// Committed delete queue, oldest first.
    pub fn delete_queue(&self, read: &ReadGuard) -> Result<Vec<DeleteQueueEntry>> {
        let sb = self.superblock(read)?;
        delete_queue::read_entries(self.store.as_ref(), read, &sb)
    }

    /// Point lookup over committed pages.
    pub fn get(&self, read: &ReadGuard, key: &[u8]) -> Result<Option<StoredValue>> {
        let sb = self.superblock(read)?;
        let mut id = sb.root;
        if id == PageId::NONE {
            return Ok(None);
        }
        for _ in 0..MAX_TREE_DEPTH {
            let page = self.store.get_page(read, id)?;
            match Node::decode(page.data(), id)? {
                Node::Internal(internal) => {
                    id = internal
                        .child_for(key)
                        .ok_or(LarchError::Corruption("internal node without children"))?;
                }
                Node::Leaf(leaf) => {
                    let Some(value) = leaf.get(key) else {
                        return Ok(None);
                    };
                    let bytes = match &value.payload {
                        ValuePayload::Inline(bytes) => bytes.clone(),
                        ValuePayload::Large(reference) => self.vstore.read(read, *reference)?,
                    };
                    return Ok(Some(StoredValue {
                        meta: value.meta,
                        bytes,
                        large: value.large_ref(),
                    }));
                }
            }
        }
        Err(LarchError::Corruption("tree deeper than supported"))
    }

    /// Walks the whole committed tree and checks its structural invariants:
    /// key order and separator bounds, occupancy, uniform leaf depth that
    /// matches the superblock, and readable, unshared overflow chains.
    ///
    /// IO failures are returned as errors; violations are reported as
    /// findings.
    pub fn verify(&self, read: &ReadGuard) -> Result<TreeReport> {
        let sb = self.superblock(read)?;
        let mut walk = Walk {
            tree: self,
            read,
            sb: &sb,
            findings: Vec::new(),
            counts: TreeCounts {
                depth: sb.depth,
                ..TreeCounts::default()
            },
            chains: HashSet::new(),
        };
        if sb.root != PageId::NONE {
            walk.node(sb.root, &[], None, 1)?;
        }
        match delete_queue::read_entries(self.store.as_ref(), read, &sb) {
            Ok(entries) => walk.counts.delete_queue_len = entries.len() as u64,
            Err(err) if err.is_corruption() => walk.finding(format!("delete queue: {err}")),
            Err(err) => return Err(err),
        }
        let Walk {
            findings, counts, ..
        } = walk;
        Ok(TreeReport {
            success: findings.is_empty(),
            findings,
            counts,
        })
    }
}

struct Walk<'a> {
    tree: &'a BTree,
    read: &'a ReadGuard,
    sb: &'a Superblock,
    findings: Vec<String>,
    counts: TreeCounts,
    chains: HashSet<PageId>,
}

impl Walk<'_> {
    fn finding(&mut self, message: String) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(message);
        }
    }

    fn node(&mut self, id: PageId, lo: &[u8], hi: Option<&[u8]>, level: u32) -> Result<()> {
        if level as usize > MAX_TREE_DEPTH {
            self.finding(format!("page {id}: deeper than {MAX_TREE_DEPTH} levels"));
            return Ok(());
        }
        let page = self.tree.store.get_page(self.read, id)?;
        let node = match Node::decode(page.data(), id) {
            Ok(node) => node,
            Err(err) if err.is_corruption() => {
                self.finding(format!("page {id}: {err}"));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let geometry = self.tree.geometry;
        let is_root = id == self.sb.root;
        let used = node.encoded_len();
        if used > geometry.capacity {
            self.finding(format!("page {id}: {used} bytes exceed capacity"));
        }
        if !is_root && used < geometry.min_fill {
            self.finding(format!(
                "page {id}: {used} bytes below minimum fill {}",
                geometry.min_fill
            ));
        }
        let in_bounds = |key: &[u8]| key >= lo && hi.map_or(true, |hi| key < hi);
        match node {
            Node::Leaf(leaf) => {
                self.counts.leaves += 1;
                if level != self.sb.depth {
                    self.finding(format!(
                        "leaf {id} at level {level}, superblock depth is {}",
                        self.sb.depth
                    ));
                }
                if is_root && leaf.is_empty() {
                    self.finding(format!("root leaf {id} is empty"));
                }
                for (key, value) in &leaf.entries {
                    self.counts.entries += 1;
                    if !in_bounds(key) {
                        self.finding(format!("leaf {id}: key outside its parent's range"));
                    }
                    if key.len() > geometry.max_key_len {
                        self.finding(format!("leaf {id}: key longer than max_key_len"));
                    }
                    if value.meta.recency > self.sb.last_recency {
                        self.finding(format!("leaf {id}: value newer than the superblock"));
                    }
                    match &value.payload {
                        ValuePayload::Inline(bytes) if bytes.len() > geometry.inline_limit => {
                            self.finding(format!("leaf {id}: inline value over inline_limit"));
                        }
                        ValuePayload::Inline(_) => {}
                        ValuePayload::Large(reference) => self.chain(id, *reference)?,
                    }
                }
            }
            Node::Internal(internal) => {
                self.counts.internal_nodes += 1;
                if level >= self.sb.depth {
                    self.finding(format!("internal node {id} at leaf level {level}"));
                    return Ok(());
                }
                if internal.entries.len() < 2 {
                    self.finding(format!("internal node {id} has a single child"));
                }
                if internal.entries[0].0.as_slice() != lo {
                    self.finding(format!("internal node {id}: low bound disagrees with parent"));
                }
                for (idx, (sep, child)) in internal.entries.iter().enumerate() {
                    if idx > 0 && !in_bounds(sep) {
                        self.finding(format!("internal node {id}: separator outside range"));
                    }
                    let next = internal
                        .entries
                        .get(idx + 1)
                        .map(|(sep, _)| sep.as_slice())
                        .or(hi);
                    self.node(*child, sep, next, level + 1)?;
                }
            }
        }
        Ok(())
    }

    fn chain(&mut self, leaf: PageId, reference: LargeRef) -> Result<()> {
        self.counts.large_values += 1;
        self.counts.large_pages += u64::from(reference.n_pages);
        if !self.chains.insert(reference.start_page) {
            self.finding(format!(
                "leaf {leaf}: overflow chain {} referenced twice",
                reference.start_page
            ));
            return Ok(());
        }
        if reference.len as usize <= self.tree.geometry.inline_limit {
            self.finding(format!("leaf {leaf}: large value short enough to inline"));
        }
        match self.tree.vstore.read(self.read, reference) {
            Ok(_) => Ok(()),
            Err(err) if err.is_corruption() => {
                self.finding(format!("leaf {leaf}: {err}"));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
