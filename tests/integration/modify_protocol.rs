#![allow(missing_docs)]

use std::sync::Arc;

use larch::storage::btree::delete_queue::{self, PAGES_PER_APPEND};
use larch::storage::btree::{
    change_count_for_value, run_modify_operation, tree_change_bound, CasTimeSource,
    DeleteOperation, LeafValue, SetMode, SetOperation, SetResult, Superblock, ValuePayload,
};
use larch::storage::vstore::LargeValue;
use larch::{
    BTreeOptions, BTreeSlice, CasTime, Decision, LarchError, ModifyOperation, ModifyOutcome,
    OperationContext, PageId, PageStore, Pager, PagerOptions, ReplTimestamp, Result, StoreKey,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn kib_pages() -> PagerOptions {
    PagerOptions {
        page_size: 1024,
        latch_timeout_ms: 200,
        ..PagerOptions::default()
    }
}

fn short_keys() -> BTreeOptions {
    BTreeOptions {
        max_key_len: 16,
        inline_limit: 64,
        max_value_len: 16 * 1024,
        ..BTreeOptions::default()
    }
}

fn open_memory() -> Result<(Arc<Pager>, BTreeSlice)> {
    let pager = Arc::new(Pager::in_memory(kib_pages())?);
    let store: Arc<dyn PageStore> = pager.clone();
    let slice = BTreeSlice::open(store, short_keys())?;
    Ok((pager, slice))
}

fn key(bytes: &[u8]) -> Result<StoreKey> {
    StoreKey::new(bytes.to_vec())
}

/// Upper-cases an inline value in place, recording what it saw.
#[derive(Default)]
struct Uppercase {
    seen: Option<Vec<u8>>,
    stamp: Option<CasTime>,
}

impl ModifyOperation for Uppercase {
    fn compute_expected_change_count(&self, block_size: usize) -> usize {
        change_count_for_value(block_size, 64)
    }

    fn operate(
        &mut self,
        ctx: &mut OperationContext<'_, '_>,
        old: Option<&LeafValue>,
        _old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        self.stamp = Some(ctx.castime());
        let Some(old) = old else {
            return Ok(Decision::Keep);
        };
        let ValuePayload::Inline(bytes) = &old.payload else {
            return Ok(Decision::Keep);
        };
        self.seen = Some(bytes.clone());
        let payload = ctx.store_payload(bytes.to_ascii_uppercase())?;
        Ok(Decision::Replace(LeafValue {
            meta: ctx.stamp(old.meta.flags),
            payload,
        }))
    }
}

/// Logs the key to the delete queue, then either keeps the slot or fails.
struct LogThen {
    fail: bool,
}

impl ModifyOperation for LogThen {
    fn compute_expected_change_count(&self, _block_size: usize) -> usize {
        tree_change_bound() + PAGES_PER_APPEND
    }

    fn operate(
        &mut self,
        _ctx: &mut OperationContext<'_, '_>,
        _old: Option<&LeafValue>,
        _old_large: Option<&LargeValue>,
    ) -> Result<Decision> {
        if self.fail {
            return Err(LarchError::Invalid("operation refused"));
        }
        Ok(Decision::Keep)
    }

    fn superblock_sidequest(
        &mut self,
        tx: &mut larch::primitives::pager::WriteGuard<'_>,
        superblock: &mut Superblock,
        recency: ReplTimestamp,
        key: &StoreKey,
    ) -> Result<()> {
        delete_queue::append(tx, superblock, recency, key.as_bytes())
    }
}

#[test]
fn custom_operation_sees_old_value_and_writes_its_stamp() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    assert_eq!(slice.set(b"ab", b"hello", 7)?, SetResult::Stored);
    let before = slice.get(b"ab")?.expect("value stored");

    let mut op = Uppercase::default();
    let report = slice.run(&mut op, &key(b"ab")?)?;
    assert_eq!(report.outcome, ModifyOutcome::Replaced);
    assert_eq!(report.depth, 1);
    assert_eq!(op.seen.as_deref(), Some(&b"hello"[..]));

    let stamp = op.stamp.expect("operate ran");
    let after = slice.get(b"ab")?.expect("value kept");
    assert_eq!(after.bytes, b"HELLO");
    assert_eq!(after.meta.flags, 7);
    assert_eq!(after.meta.cas, stamp.cas);
    assert_eq!(after.meta.recency, stamp.recency);
    assert!(after.meta.recency > before.meta.recency);
    assert_eq!(slice.superblock()?.last_recency, stamp.recency);

    let root = slice.superblock()?.root;
    let mut op = Uppercase::default();
    let report = slice.run(&mut op, &key(b"zz")?)?;
    assert_eq!(report.outcome, ModifyOutcome::Kept);
    assert_eq!(report.root, root);
    assert!(slice.get(b"zz")?.is_none());
    Ok(())
}

#[test]
fn reported_depth_follows_the_superblock() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    let mut keys: Vec<Vec<u8>> = (0..600).map(|i| format!("key{i:05}").into_bytes()).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0x1a2c));

    let mut last_depth = 0;
    let mut max_depth = 0;
    for k in &keys {
        let mut op = SetOperation::new(vec![b'x'; 40], 0, SetMode::Set);
        let report = slice.run(&mut op, &key(k)?)?;
        assert_eq!(op.result(), Some(SetResult::Stored));
        let sb = slice.superblock()?;
        assert_eq!(report.depth, sb.depth);
        assert_eq!(report.root, sb.root);
        max_depth = max_depth.max(report.depth);
        last_depth = report.depth;
    }
    assert!(max_depth >= 2);
    let report = slice.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.entries, 600);
    assert_eq!(report.counts.depth, last_depth);

    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0x3b4d));
    for k in &keys {
        let mut op = DeleteOperation::without_queue();
        let report = slice.run(&mut op, &key(k)?)?;
        assert_eq!(report.outcome, ModifyOutcome::Deleted);
        assert_eq!(report.depth, slice.superblock()?.depth);
    }
    let sb = slice.superblock()?;
    assert_eq!(sb.root, PageId::NONE);
    assert_eq!(sb.depth, 0);
    assert_eq!(sb.delete_queue_len, 0);
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn protocol_runs_inside_a_caller_transaction() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    let tree = slice.tree();
    let source = CasTimeSource::with_seed(100, ReplTimestamp(0));

    {
        let mut tx = tree.store().begin_write()?;
        let mut op = SetOperation::new(b"first".to_vec(), 0, SetMode::Set);
        let stamp = source.next_after(ReplTimestamp(0));
        let report = run_modify_operation(tree, &mut tx, &mut op, &key(b"k")?, stamp)?;
        assert_eq!(report.outcome, ModifyOutcome::Replaced);
        assert_eq!(report.depth, 1);
    }
    assert!(slice.get(b"k")?.is_none(), "dropped transaction rolls back");
    assert_eq!(slice.superblock()?.root, PageId::NONE);

    let mut tx = tree.store().begin_write()?;
    let mut op = SetOperation::new(b"second".to_vec(), 3, SetMode::Set);
    let stamp = source.next_after(ReplTimestamp(0));
    run_modify_operation(tree, &mut tx, &mut op, &key(b"k")?, stamp)?;
    tree.store().commit(tx)?;

    let stored = slice.get(b"k")?.expect("committed");
    assert_eq!(stored.bytes, b"second");
    assert_eq!(stored.meta.cas, 101);
    assert_eq!(stored.meta.recency, stamp.recency);
    assert_eq!(slice.superblock()?.last_recency, stamp.recency);
    Ok(())
}

#[test]
fn sidequest_survives_a_kept_slot_on_an_empty_tree() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    let report = slice.run(&mut LogThen { fail: false }, &key(b"gone")?)?;
    assert_eq!(report.outcome, ModifyOutcome::Kept);
    assert_eq!(report.root, PageId::NONE);

    let queue = slice.delete_queue()?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].key, b"gone");
    assert_eq!(queue[0].recency, slice.superblock()?.last_recency);
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn failed_operation_discards_sidequest_and_splits() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    for i in 0..40 {
        slice.set(format!("k{i:03}").as_bytes(), &[b'v'; 60], 0)?;
    }
    let sb_before = slice.superblock()?;

    let err = slice
        .run(&mut LogThen { fail: true }, &key(b"k010")?)
        .unwrap_err();
    assert!(matches!(err, LarchError::Invalid(_)));
    assert!(!err.is_retryable());

    let sb_after = slice.superblock()?;
    assert_eq!(sb_after, sb_before);
    assert!(slice.delete_queue()?.is_empty());
    assert_eq!(slice.get(b"k010")?.expect("untouched").bytes, vec![b'v'; 60]);
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn recency_keeps_rising_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.larch");

    let last = {
        let pager = Arc::new(Pager::create(&path, kib_pages())?);
        let store: Arc<dyn PageStore> = pager.clone();
        let slice = BTreeSlice::open(store, short_keys())?;
        for i in 0..25 {
            slice.set(format!("r{i}").as_bytes(), b"payload", 0)?;
        }
        slice.delete(b"r3")?;
        slice.superblock()?.last_recency
    };

    let pager = Arc::new(Pager::open(&path, kib_pages())?);
    let store: Arc<dyn PageStore> = pager.clone();
    let slice = BTreeSlice::open(store, short_keys())?;
    assert_eq!(slice.superblock()?.last_recency, last);
    assert_eq!(slice.delete_queue()?.len(), 1);

    slice.set(b"r0", b"again", 0)?;
    let value = slice.get(b"r0")?.expect("stored");
    assert!(value.meta.recency > last);
    assert!(slice.get(b"r3")?.is_none());
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn superblock_survives_a_round_trip_through_the_page() -> Result<()> {
    let (pager, slice) = open_memory()?;
    slice.set(b"a", b"1", 0)?;
    let mut tx = pager.begin_write()?;
    let sb = Superblock::load(&mut tx, slice.tree().superblock_page())?;
    drop(tx);
    assert_eq!(sb, slice.superblock()?);
    assert_eq!(sb.depth, 1);
    assert_ne!(sb.root, PageId::NONE);
    Ok(())
}
