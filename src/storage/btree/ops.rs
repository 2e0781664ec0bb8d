//! Memcached-style commands expressed as [`ModifyOperation`]s.
//!
//! Each command records its client-visible result on itself; read it with
//! `result()` after the operation ran. A command that refuses to act returns
//! [`Decision::Keep`] and leaves the tree untouched apart from rebalancing
//! done on the way down.

use super::delete_queue::{self, PAGES_PER_APPEND};
use super::node::{LeafValue, ValueMeta, ValuePayload};
use super::operation::{
    change_count_for_value, tree_change_bound, Decision, ModifyOperation, OperationContext,
};
use super::superblock::Superblock;
use crate::primitives::pager::WriteGuard;
use crate::storage::vstore::LargeValue;
use crate::types::{LarchError, ReplTimestamp, Result, StoreKey};

/// Longest decimal rendering of a `u64`.
const MAX_NUMERIC_LEN: usize = 20;

fn current_bytes(old: &LeafValue, old_large: Option<&LargeValue>) -> Result<Vec<u8>> {
    match &old.payload {
        ValuePayload::Inline(bytes) => Ok(bytes.clone()),
        ValuePayload::Large(_) => old_large
            .map(|large| large.bytes.clone())
            .ok_or(LarchError::Corruption("large value was not acquired")),
    }
}

/// Which precondition a set applies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetMode {
    /// Store unconditionally.
    Set,
    /// Store only when the key is absent.
    Add,
    /// Store only when the key is present.
    Replace,
    /// Store only when the current value carries this cas token.
    Cas(u64),
}

/// Result of a [`SetOperation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetResult {
    /// The value was written.
    Stored,
    /// The add/replace precondition failed.
    NotStored,
    /// The cas token did not match.
    Exists,
    /// Cas on an absent key.
    NotFound,
    /// The value exceeds `max_value_len`.
    TooLarge,
}

/// set / add / replace / cas.
#[derive(Debug)]
pub struct SetOperation {
    value: Vec<u8>,
    value_len: usize,
    flags: u32,
    mode: SetMode,
    result: Option<SetResult>,
}

impl SetOperation {
    /// Creates a set of `value` with client `flags`.
    pub fn new(value: impl Into<Vec<u8>>, flags: u32, mode: SetMode) -> Self {
        let value = value.into();
        Self {
            value_len: value.len(),
            value,
            flags,
            mode,
            result: None,
        }
    }

    /// Outcome, once the operation ran.
    pub fn result(&self) -> Option<SetResult> {
        self.result
    }

    fn refuse(&mut self, result: SetResult) -> Result<Decision> {
        self.result = Some(result);
        Ok(Decision::Keep)
    }
}

impl ModifyOperation for SetOperation {
    fn compute_expected_change_count(&self, block_size: usize) -> usize {
        change_count_for_value(block_size, self.value_len)
    }

    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        if self.value.len() > ctx.max_value_len() {
            return self.refuse(SetResult::TooLarge);
        }
        match (self.mode, old) {
            (SetMode::Add, Some(_)) | (SetMode::Replace, None) => {
                return self.refuse(SetResult::NotStored)
            }
            (SetMode::Cas(_), None) => return self.refuse(SetResult::NotFound),
            (SetMode::Cas(expected), Some(old)) if old.meta.cas != expected => {
                return self.refuse(SetResult::Exists)
            }
            _ => {}
        }
        let bytes = std::mem::take(&mut self.value);
        let payload = ctx.store_payload_reusing(bytes, old_large)?;
        self.result = Some(SetResult::Stored);
        Ok(Decision::Replace(LeafValue {
            meta: ctx.stamp(self.flags),
            payload,
        }))
    }
}

/// Result of an [`AppendPrependOperation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendPrependResult {
    /// The data was added.
    Success,
    /// The key is absent.
    NotFound,
    /// The combined value would exceed `max_value_len`.
    TooLarge,
}

/// append / prepend. The value keeps its flags and gets a new stamp.
#[derive(Debug)]
pub struct AppendPrependOperation {
    data: Vec<u8>,
    prepend: bool,
    value_bound: usize,
    result: Option<AppendPrependResult>,
}

impl AppendPrependOperation {
    /// Adds `data` after (or before, when `prepend`) the current value.
    /// `value_bound` is the longest value the tree accepts and sizes the
    /// page reservation.
    pub fn new(data: impl Into<Vec<u8>>, prepend: bool, value_bound: usize) -> Self {
        Self {
            data: data.into(),
            prepend,
            value_bound,
            result: None,
        }
    }

    /// Outcome, once the operation ran.
    pub fn result(&self) -> Option<AppendPrependResult> {
        self.result
    }
}

impl ModifyOperation for AppendPrependOperation {
    fn compute_expected_change_count(&self, block_size: usize) -> usize {
        change_count_for_value(block_size, self.value_bound)
    }

    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        let Some(old) = old else {
            self.result = Some(AppendPrependResult::NotFound);
            return Ok(Decision::Keep);
        };
        let current_len = old.payload.value_len();
        if current_len + self.data.len() > ctx.max_value_len() {
            self.result = Some(AppendPrependResult::TooLarge);
            return Ok(Decision::Keep);
        }
        let current = current_bytes(old, old_large)?;
        let mut combined = Vec::with_capacity(current.len() + self.data.len());
        if self.prepend {
            combined.extend_from_slice(&self.data);
            combined.extend_from_slice(&current);
        } else {
            combined.extend_from_slice(&current);
            combined.extend_from_slice(&self.data);
        }
        let payload = ctx.store_payload_reusing(combined, old_large)?;
        self.result = Some(AppendPrependResult::Success);
        Ok(Decision::Replace(LeafValue {
            meta: ctx.stamp(old.meta.flags),
            payload,
        }))
    }
}

/// Result of an [`IncrDecrOperation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IncrDecrResult {
    /// The new counter value.
    Value(u64),
    /// The key is absent.
    NotFound,
    /// The current value is not an unsigned decimal number.
    NotNumeric,
}

/// incr / decr on a value holding an ASCII decimal `u64`.
///
/// Increments wrap at `u64::MAX`; decrements stop at zero.
#[derive(Debug)]
pub struct IncrDecrOperation {
    delta: u64,
    increment: bool,
    result: Option<IncrDecrResult>,
}

impl IncrDecrOperation {
    /// Adds (or subtracts, when `!increment`) `delta`.
    pub fn new(delta: u64, increment: bool) -> Self {
        Self {
            delta,
            increment,
            result: None,
        }
    }

    /// Outcome, once the operation ran.
    pub fn result(&self) -> Option<IncrDecrResult> {
        self.result
    }
}

fn parse_counter(bytes: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(bytes).ok()?.trim_end_matches([' ', '\r', '\n']);
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

impl ModifyOperation for IncrDecrOperation {
    fn compute_expected_change_count(&self, block_size: usize) -> usize {
        change_count_for_value(block_size, MAX_NUMERIC_LEN)
    }

    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        let Some(old) = old else {
            self.result = Some(IncrDecrResult::NotFound);
            return Ok(Decision::Keep);
        };
        if old.payload.value_len() > MAX_NUMERIC_LEN + 2 {
            self.result = Some(IncrDecrResult::NotNumeric);
            return Ok(Decision::Keep);
        }
        let Some(current) = parse_counter(&current_bytes(old, old_large)?) else {
            self.result = Some(IncrDecrResult::NotNumeric);
            return Ok(Decision::Keep);
        };
        let next = if self.increment {
            current.wrapping_add(self.delta)
        } else {
            current.saturating_sub(self.delta)
        };
        let payload = ctx.store_payload(next.to_string().into_bytes())?;
        self.result = Some(IncrDecrResult::Value(next));
        Ok(Decision::Replace(LeafValue {
            meta: ctx.stamp(old.meta.flags),
            payload,
        }))
    }
}

/// Result of a [`DeleteOperation`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteResult {
    /// The key was removed.
    Deleted,
    /// The key was absent.
    NotFound,
}

/// Removes a key and logs the deletion to the delete queue.
#[derive(Debug)]
pub struct DeleteOperation {
    log_deletion: bool,
    result: Option<DeleteResult>,
}

impl Default for DeleteOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteOperation {
    /// Delete that is recorded in the delete queue.
    pub fn new() -> Self {
        Self {
            log_deletion: true,
            result: None,
        }
    }

    /// Delete that bypasses the delete queue.
    pub fn without_queue() -> Self {
        Self {
            log_deletion: false,
            result: None,
        }
    }

    /// Outcome, once the operation ran.
    pub fn result(&self) -> Option<DeleteResult> {
        self.result
    }
}

impl ModifyOperation for DeleteOperation {
    fn compute_expected_change_count(&self, _block_size: usize) -> usize {
        tree_change_bound() + PAGES_PER_APPEND
    }

    fn operate(
        &mut self,
        _ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        _old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        if old.is_none() {
            self.result = Some(DeleteResult::NotFound);
            return Ok(Decision::Keep);
        }
        self.result = Some(DeleteResult::Deleted);
        Ok(Decision::Delete)
    }

    fn superblock_sidequest(
        &mut self,
        tx: &mut WriteGuard<'_>,
        superblock: &mut Superblock,
        recency: ReplTimestamp,
        key: &StoreKey,
    ) -> Result<()> {
        if self.log_deletion {
            delete_queue::append(tx, superblock, recency, key.as_bytes())?;
        }
        Ok(())
    }
}

/// Stamps the current value without changing it; used to refresh recency.
#[derive(Debug, Default)]
pub struct TouchOperation {
    found: Option<bool>,
}

impl TouchOperation {
    /// Whether the key existed, once the operation ran.
    pub fn found(&self) -> Option<bool> {
        self.found
    }
}

impl ModifyOperation for TouchOperation {
    fn compute_expected_change_count(&self, _block_size: usize) -> usize {
        tree_change_bound()
    }

    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        _old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        self.found = Some(old.is_some());
        let Some(old) = old else {
            return Ok(Decision::Keep);
        };
        let meta = ValueMeta {
            flags: old.meta.flags,
            ..ctx.stamp(0)
        };
        Ok(Decision::Replace(LeafValue {
            meta,
            payload: old.payload.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_parse_plain_decimal_only() {
        assert_eq!(parse_counter(b"42"), Some(42));
        assert_eq!(parse_counter(b"7\r\n"), Some(7));
        assert_eq!(parse_counter(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_counter(b"18446744073709551616"), None);
        assert_eq!(parse_counter(b"-1"), None);
        assert_eq!(parse_counter(b" 1"), None);
        assert_eq!(parse_counter(b""), None);
    }

    #[test]
    fn budgets_cover_value_and_queue_pages() {
        let set = SetOperation::new(vec![0u8; 10_000], 0, SetMode::Set);
        assert!(set.compute_expected_change_count(4096) >= tree_change_bound() + 3);
        let delete = DeleteOperation::new();
        assert_eq!(
            delete.compute_expected_change_count(4096),
            tree_change_bound() + PAGES_PER_APPEND
        );
    }
}
