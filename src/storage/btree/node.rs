//! Node encoding and the in-memory node types the modify protocol works on.
//!
//! A node page is a [`PageHeader`] followed by an 8 byte node header
//! (`count u16`, `used u16`, reserved) and `count` records packed back to
//! back. Nodes are decoded into owned [`LeafNode`] / [`InternalNode`]
//! values, mutated, and re-encoded as a whole.
//!
//! Internal entry `i` routes keys `>= separator_i`. The separator of entry 0
//! is the node's own low bound: empty on the leftmost spine, otherwise equal
//! to the separator the parent stores for this node.

use serde::{Deserialize, Serialize};

use crate::primitives::pager::WriteGuard;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{LargeRef, LarchError, PageId, ReplTimestamp, Result, MAX_KEY_LEN};

/// Node header length following the page header.
pub const NODE_HEADER_LEN: usize = 8;
/// Fixed bytes of a leaf record besides key and payload.
pub const LEAF_RECORD_FIXED: usize = 23;
/// Fixed bytes of an internal record besides the separator.
pub const INTERNAL_RECORD_FIXED: usize = 10;

const COUNT_OFFSET: usize = PAGE_HDR_LEN;
const USED_OFFSET: usize = PAGE_HDR_LEN + 2;
const RECORDS_OFFSET: usize = PAGE_HDR_LEN + NODE_HEADER_LEN;

const TAG_INLINE: u8 = 0;
const TAG_LARGE: u8 = 1;

/// Bytes available for records in a node page.
pub fn capacity(page_size: usize) -> usize {
    page_size.saturating_sub(RECORDS_OFFSET)
}

/// Per-value metadata stored alongside every leaf entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValueMeta {
    /// Client flags.
    pub flags: u32,
    /// Compare-and-swap token of the edit that wrote the value.
    pub cas: u64,
    /// Recency of the edit that wrote the value.
    pub recency: ReplTimestamp,
}

/// Where a value's bytes live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValuePayload {
    /// Stored inside the leaf record.
    Inline(Vec<u8>),
    /// Stored in an overflow chain.
    Large(LargeRef),
}

impl ValuePayload {
    fn encoded_len(&self) -> usize {
        match self {
            ValuePayload::Inline(bytes) => 2 + bytes.len(),
            ValuePayload::Large(_) => LargeRef::ENCODED_LEN,
        }
    }

    /// Logical value length in bytes.
    pub fn value_len(&self) -> usize {
        match self {
            ValuePayload::Inline(bytes) => bytes.len(),
            ValuePayload::Large(reference) => reference.len as usize,
        }
    }
}

/// Value stored in a leaf slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeafValue {
    /// Flags and concurrency stamps.
    pub meta: ValueMeta,
    /// Value bytes or a reference to them.
    pub payload: ValuePayload,
}

impl LeafValue {
    /// Inline value.
    pub fn inline(bytes: impl Into<Vec<u8>>, meta: ValueMeta) -> Self {
        Self {
            meta,
            payload: ValuePayload::Inline(bytes.into()),
        }
    }

    /// Reference to the overflow chain, when the value is large.
    pub fn large_ref(&self) -> Option<LargeRef> {
        match &self.payload {
            ValuePayload::Large(reference) => Some(*reference),
            ValuePayload::Inline(_) => None,
        }
    }
}

/// Encoded size of a leaf record.
pub fn leaf_record_len(key_len: usize, value: &LeafValue) -> usize {
    LEAF_RECORD_FIXED + key_len + value.payload.encoded_len()
}

/// Encoded size of an internal record.
pub fn internal_record_len(key_len: usize) -> usize {
    INTERNAL_RECORD_FIXED + key_len
}

/// Chooses where to cut a run of records so the larger half is as small as
/// possible. Returns the index of the first record of the right half, in
/// `1..sizes.len()`.
pub(crate) fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut best = 1;
    let mut best_max = usize::MAX;
    let mut prefix = 0;
    for (idx, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        prefix += size;
        let larger = prefix.max(total - prefix);
        if larger < best_max {
            best_max = larger;
            best = idx + 1;
        }
    }
    best
}

/// Leaf node: ordered `(key, value)` entries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LeafNode {
    /// Entries in strictly increasing key order.
    pub entries: Vec<(Vec<u8>, LeafValue)>,
}

impl LeafNode {
    /// Sum of encoded record sizes.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, value)| leaf_record_len(key.len(), value))
            .sum()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the leaf holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(probe, _)| probe.as_slice().cmp(key))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&LeafValue> {
        self.search(key).ok().map(|idx| &self.entries[idx].1)
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn upsert(&mut self, key: &[u8], value: LeafValue) -> Option<LeafValue> {
        match self.search(key) {
            Ok(idx) => Some(std::mem::replace(&mut self.entries[idx].1, value)),
            Err(idx) => {
                self.entries.insert(idx, (key.to_vec(), value));
                None
            }
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<LeafValue> {
        self.search(key)
            .ok()
            .map(|idx| self.entries.remove(idx).1)
    }

    /// Encoded size after `upsert(key, value)`.
    pub fn len_after_upsert(&self, key: &[u8], value: &LeafValue) -> usize {
        let added = leaf_record_len(key.len(), value);
        match self.search(key) {
            Ok(idx) => {
                let (old_key, old_value) = &self.entries[idx];
                self.encoded_len() - leaf_record_len(old_key.len(), old_value) + added
            }
            Err(_) => self.encoded_len() + added,
        }
    }

    /// Splits the leaf as if `(key, value)` had already been upserted, so
    /// that after the upsert both halves are as close to half full as
    /// possible. `self` keeps the left half; returns the separator and the
    /// right half. The pending entry is not inserted, so one half may be
    /// empty until it is.
    pub fn split_for_upsert(&mut self, key: &[u8], value: &LeafValue) -> (Vec<u8>, LeafNode) {
        let (pos, replacing) = match self.search(key) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        };
        let mut sizes: Vec<usize> = self
            .entries
            .iter()
            .map(|(k, v)| leaf_record_len(k.len(), v))
            .collect();
        let pending = leaf_record_len(key.len(), value);
        if replacing {
            sizes[pos] = pending;
        } else {
            sizes.insert(pos, pending);
        }
        let cut = split_point(&sizes);
        let real_cut = if replacing || cut <= pos { cut } else { cut - 1 };
        let right = LeafNode {
            entries: self.entries.split_off(real_cut),
        };
        let separator = if !replacing && cut == pos {
            key.to_vec()
        } else {
            right.entries[0].0.clone()
        };
        (separator, right)
    }
}

/// Internal node: ordered `(separator, child)` entries.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InternalNode {
    /// Entries in increasing separator order.
    pub entries: Vec<(Vec<u8>, PageId)>,
}

impl InternalNode {
    /// Sum of encoded record sizes.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(sep, _)| internal_record_len(sep.len()))
            .sum()
    }

    /// Index of the entry whose subtree covers `key`.
    pub fn route(&self, key: &[u8]) -> usize {
        match self
            .entries
            .binary_search_by(|(sep, _)| sep.as_slice().cmp(key))
        {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        }
    }

    /// Child page covering `key`.
    pub fn child_for(&self, key: &[u8]) -> Option<PageId> {
        self.entries.get(self.route(key)).map(|(_, child)| *child)
    }

    /// Position of the entry pointing at `child`.
    pub fn position_of(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|(_, id)| *id == child)
    }

    /// Adds a separator for a freshly split right sibling.
    pub fn insert_separator(&mut self, separator: Vec<u8>, child: PageId) -> Result<()> {
        match self
            .entries
            .binary_search_by(|(sep, _)| sep.as_slice().cmp(&separator))
        {
            Ok(_) => Err(LarchError::Corruption("duplicate separator in internal node")),
            Err(0) => Err(LarchError::Corruption("separator below node low bound")),
            Err(idx) => {
                self.entries.insert(idx, (separator, child));
                Ok(())
            }
        }
    }

    /// Splits at the byte median; `self` keeps the left half. The right half
    /// keeps its first separator as its low bound, which is also the
    /// separator to push into the parent.
    pub fn split_at_median(&mut self) -> Result<(Vec<u8>, InternalNode)> {
        if self.entries.len() < 2 {
            return Err(LarchError::Corruption("internal node too small to split"));
        }
        let sizes: Vec<usize> = self
            .entries
            .iter()
            .map(|(sep, _)| internal_record_len(sep.len()))
            .collect();
        let right = InternalNode {
            entries: self.entries.split_off(split_point(&sizes)),
        };
        Ok((right.entries[0].0.clone(), right))
    }
}

/// Decoded B-tree node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// Leaf node.
    Leaf(LeafNode),
    /// Internal node.
    Internal(InternalNode),
}

impl Default for Node {
    fn default() -> Self {
        Node::Leaf(LeafNode::default())
    }
}

impl Node {
    /// Whether this is a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Sum of encoded record sizes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.encoded_len(),
            Node::Internal(internal) => internal.encoded_len(),
        }
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(internal) => internal.entries.len(),
        }
    }

    /// Key of the first entry, if any.
    pub fn first_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(leaf) => leaf.entries.first().map(|(key, _)| key.as_slice()),
            Node::Internal(internal) => internal.entries.first().map(|(sep, _)| sep.as_slice()),
        }
    }

    /// Moves the node out, leaving an empty leaf behind.
    pub fn take(&mut self) -> Node {
        std::mem::take(self)
    }

    /// Reads and decodes page `id` within `tx`.
    pub fn load(tx: &mut WriteGuard<'_>, id: PageId) -> Result<Node> {
        let page = tx.page_mut(id)?;
        Node::decode(page.data(), id)
    }

    /// Encodes the node into page `id` within `tx`.
    pub fn store(&self, tx: &mut WriteGuard<'_>, id: PageId) -> Result<()> {
        let salt = tx.salt();
        let mut page = tx.page_mut(id)?;
        self.encode(page.data_mut(), id, salt)
    }

    /// Decodes a node page image.
    pub fn decode(data: &[u8], id: PageId) -> Result<Node> {
        let header = PageHeader::decode(data)?;
        if header.page_no != id {
            return Err(LarchError::Corruption("node page number mismatch"));
        }
        if header.page_size as usize != data.len() {
            return Err(LarchError::Corruption("node page size mismatch"));
        }
        let count = read_u16(data, COUNT_OFFSET)? as usize;
        let used = read_u16(data, USED_OFFSET)? as usize;
        if used > capacity(data.len()) {
            return Err(LarchError::Corruption("node records exceed page capacity"));
        }
        let mut reader = RecordReader {
            data: &data[RECORDS_OFFSET..RECORDS_OFFSET + used],
            pos: 0,
        };
        let node = match header.kind {
            PageKind::BTreeLeaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = reader.key()?;
                    if key.is_empty() {
                        return Err(LarchError::Corruption("empty key in leaf"));
                    }
                    let meta = ValueMeta {
                        flags: reader.u32()?,
                        cas: reader.u64()?,
                        recency: ReplTimestamp(reader.u64()?),
                    };
                    let payload = match reader.u8()? {
                        TAG_INLINE => {
                            let len = reader.u16()? as usize;
                            ValuePayload::Inline(reader.bytes(len)?.to_vec())
                        }
                        TAG_LARGE => ValuePayload::Large(LargeRef {
                            start_page: PageId(reader.u64()?),
                            n_pages: reader.u32()?,
                            len: reader.u32()?,
                            checksum: reader.u32()?,
                        }),
                        _ => return Err(LarchError::Corruption("unknown leaf payload tag")),
                    };
                    entries.push((key.to_vec(), LeafValue { meta, payload }));
                }
                if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                    return Err(LarchError::Corruption("leaf keys out of order"));
                }
                Node::Leaf(LeafNode { entries })
            }
            PageKind::BTreeInternal => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let sep = reader.key()?.to_vec();
                    let child = PageId(reader.u64()?);
                    if child == PageId::NONE {
                        return Err(LarchError::Corruption("internal entry without child"));
                    }
                    entries.push((sep, child));
                }
                if entries.is_empty() {
                    return Err(LarchError::Corruption("internal node without children"));
                }
                if entries.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
                    return Err(LarchError::Corruption("separators out of order"));
                }
                Node::Internal(InternalNode { entries })
            }
            _ => return Err(LarchError::Corruption("page is not a btree node")),
        };
        if reader.pos != used {
            return Err(LarchError::Corruption("node used bytes disagree with records"));
        }
        Ok(node)
    }

    /// Encodes the node into a full page image.
    pub fn encode(&self, buf: &mut [u8], id: PageId, salt: u64) -> Result<()> {
        let used = self.encoded_len();
        if used > capacity(buf.len()) {
            return Err(LarchError::Invalid("node exceeds page capacity"));
        }
        let count = u16::try_from(self.entry_count())
            .map_err(|_| LarchError::Invalid("too many node entries"))?;
        let kind = if self.is_leaf() {
            PageKind::BTreeLeaf
        } else {
            PageKind::BTreeInternal
        };
        page::init_page(buf, id, kind, salt)?;
        buf[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&count.to_be_bytes());
        buf[USED_OFFSET..USED_OFFSET + 2].copy_from_slice(&(used as u16).to_be_bytes());
        let mut out = RecordWriter {
            buf: &mut buf[RECORDS_OFFSET..RECORDS_OFFSET + used],
            pos: 0,
        };
        match self {
            Node::Leaf(leaf) => {
                for (key, value) in &leaf.entries {
                    out.key(key)?;
                    out.put(&value.meta.flags.to_be_bytes());
                    out.put(&value.meta.cas.to_be_bytes());
                    out.put(&value.meta.recency.0.to_be_bytes());
                    match &value.payload {
                        ValuePayload::Inline(bytes) => {
                            let len = u16::try_from(bytes.len())
                                .map_err(|_| LarchError::Invalid("inline value too long"))?;
                            out.put(&[TAG_INLINE]);
                            out.put(&len.to_be_bytes());
                            out.put(bytes);
                        }
                        ValuePayload::Large(reference) => {
                            out.put(&[TAG_LARGE]);
                            out.put(&reference.start_page.0.to_be_bytes());
                            out.put(&reference.n_pages.to_be_bytes());
                            out.put(&reference.len.to_be_bytes());
                            out.put(&reference.checksum.to_be_bytes());
                        }
                    }
                }
            }
            Node::Internal(internal) => {
                for (sep, child) in &internal.entries {
                    out.key(sep)?;
                    out.put(&child.0.to_be_bytes());
                }
            }
        }
        Ok(())
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u16::from_be_bytes)
        .ok_or(LarchError::Corruption("node header truncated"))
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(LarchError::Corruption("node record truncated"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.bytes(N)?
            .try_into()
            .map_err(|_| LarchError::Corruption("node record truncated"))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn key(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        if len > MAX_KEY_LEN {
            return Err(LarchError::Corruption("key longer than maximum"));
        }
        self.bytes(len)
    }
}

struct RecordWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl RecordWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn key(&mut self, key: &[u8]) -> Result<()> {
        let len = u16::try_from(key.len()).map_err(|_| LarchError::Invalid("key too long"))?;
        self.put(&len.to_be_bytes());
        self.put(key);
        Ok(())
    }
}

/// Tree shape options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BTreeOptions {
    /// Non-root nodes are kept at least this full (percent of capacity).
    pub min_fill_percent: u8,
    /// Longest key the tree accepts.
    pub max_key_len: usize,
    /// Values longer than this are stored in overflow chains.
    pub inline_limit: usize,
    /// Longest value the operations accept.
    pub max_value_len: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            min_fill_percent: 25,
            max_key_len: MAX_KEY_LEN,
            inline_limit: 1024,
            max_value_len: 1024 * 1024,
        }
    }
}

/// Size thresholds derived from [`BTreeOptions`] and the page size.
///
/// The bounds are chosen so that one split or one merge per level can always
/// be absorbed by the parent: internal nodes are split while they still have
/// room for one more maximal separator, and topped up while they can still
/// lose one without dropping below `min_fill`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeGeometry {
    /// Page size in bytes.
    pub page_size: usize,
    /// Bytes available for records.
    pub capacity: usize,
    /// Minimum encoded size of a non-root node.
    pub min_fill: usize,
    /// Longest key accepted.
    pub max_key_len: usize,
    /// Longest inline value.
    pub inline_limit: usize,
    /// Largest internal record.
    pub max_internal_record: usize,
    /// Largest leaf record.
    pub max_leaf_record: usize,
}

impl NodeGeometry {
    /// Derives and validates thresholds for `page_size`.
    pub fn new(page_size: usize, options: &BTreeOptions) -> Result<Self> {
        if options.max_key_len == 0 || options.max_key_len > MAX_KEY_LEN {
            return Err(LarchError::Config(format!(
                "max_key_len {} must be in 1..={MAX_KEY_LEN}",
                options.max_key_len
            )));
        }
        if options.min_fill_percent == 0 || options.min_fill_percent >= 50 {
            return Err(LarchError::Config(format!(
                "min_fill_percent {} must be in 1..50",
                options.min_fill_percent
            )));
        }
        if options.max_value_len < options.inline_limit {
            return Err(LarchError::Config(
                "max_value_len must be at least inline_limit".into(),
            ));
        }
        let capacity = capacity(page_size);
        let min_fill = capacity * options.min_fill_percent as usize / 100;
        let max_internal_record = internal_record_len(options.max_key_len);
        let max_leaf_record = LEAF_RECORD_FIXED
            + options.max_key_len
            + (2 + options.inline_limit).max(LargeRef::ENCODED_LEN);
        if max_leaf_record > capacity / 2 {
            return Err(LarchError::Config(format!(
                "a leaf record of up to {max_leaf_record} bytes does not fit twice in {capacity} bytes; \
                 lower inline_limit or max_key_len, or raise page_size"
            )));
        }
        if 6 * max_internal_record > capacity {
            return Err(LarchError::Config(format!(
                "internal records of up to {max_internal_record} bytes need pages with at least \
                 {} bytes of capacity",
                6 * max_internal_record
            )));
        }
        let upper = (capacity / 2 - 2 * max_internal_record).min((capacity - max_leaf_record) / 2);
        if min_fill <= max_internal_record || min_fill > upper {
            return Err(LarchError::Config(format!(
                "min_fill_percent {} gives {min_fill} bytes; it must be above {max_internal_record} \
                 and at most {upper} for this page size",
                options.min_fill_percent
            )));
        }
        Ok(Self {
            page_size,
            capacity,
            min_fill,
            max_key_len: options.max_key_len,
            inline_limit: options.inline_limit,
            max_internal_record,
            max_leaf_record,
        })
    }

    /// An internal node is full once one more maximal separator would not fit.
    pub fn internal_is_full(&self, node: &InternalNode) -> bool {
        node.encoded_len() + self.max_internal_record > self.capacity
    }

    /// An internal node is at risk when losing one separator could leave it
    /// below `min_fill`.
    pub fn internal_at_risk(&self, node: &InternalNode) -> bool {
        node.encoded_len() < self.min_fill + self.max_internal_record
    }

    /// Whether a leaf is below `min_fill`.
    pub fn leaf_is_underfull(&self, node: &LeafNode) -> bool {
        node.encoded_len() < self.min_fill
    }

    /// Whether `left` and `right` may be merged into one page.
    pub fn can_merge(&self, left: &Node, right: &Node) -> bool {
        let combined = left.encoded_len() + right.encoded_len();
        if left.is_leaf() {
            combined <= self.capacity
        } else {
            combined + self.max_internal_record <= self.capacity
        }
    }
}
