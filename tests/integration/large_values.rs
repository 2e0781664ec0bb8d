#![allow(missing_docs)]

use std::sync::Arc;

use larch::storage::btree::{AppendPrependResult, DeleteResult, SetResult};
use larch::{BTreeOptions, BTreeSlice, PageStore, Pager, PagerOptions, Result};
use tempfile::tempdir;

/// 256 byte pages leave 208 data bytes per overflow page.
fn small_pages() -> PagerOptions {
    PagerOptions {
        page_size: 256,
        latch_timeout_ms: 200,
        ..PagerOptions::default()
    }
}

fn small_tree() -> BTreeOptions {
    BTreeOptions {
        min_fill_percent: 20,
        max_key_len: 4,
        inline_limit: 15,
        max_value_len: 4096,
    }
}

fn open_memory() -> Result<(Arc<Pager>, BTreeSlice)> {
    let pager = Arc::new(Pager::in_memory(small_pages())?);
    let store: Arc<dyn PageStore> = pager.clone();
    let slice = BTreeSlice::open(store, small_tree())?;
    Ok((pager, slice))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn live_large_pages(slice: &BTreeSlice) -> i64 {
    slice.tree().vstore().metrics_snapshot().live_pages()
}

#[test]
fn values_past_the_inline_limit_spill_into_chains() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    assert_eq!(slice.set(b"in", &pattern(15, 1), 0)?, SetResult::Stored);
    assert_eq!(slice.set(b"out", &pattern(16, 2), 0)?, SetResult::Stored);
    assert_eq!(slice.set(b"big", &pattern(1000, 3), 9)?, SetResult::Stored);

    let inline = slice.get(b"in")?.expect("stored");
    assert!(inline.large.is_none());
    assert_eq!(inline.bytes, pattern(15, 1));

    let spilled = slice.get(b"out")?.expect("stored");
    let reference = spilled.large.expect("large");
    assert_eq!(reference.n_pages, 1);
    assert_eq!(reference.len, 16);

    let big = slice.get(b"big")?.expect("stored");
    assert_eq!(big.bytes, pattern(1000, 3));
    assert_eq!(big.meta.flags, 9);
    assert_eq!(big.large.expect("large").n_pages, 5);

    let report = slice.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.large_values, 2);
    assert_eq!(report.counts.large_pages, 6);
    assert_eq!(live_large_pages(&slice), 6);
    Ok(())
}

#[test]
fn append_walks_a_value_from_inline_to_multi_page() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    slice.set(b"log", b"0123456789", 0)?;
    let mut expected = b"0123456789".to_vec();

    for round in 0..6u8 {
        let chunk = pattern(100, round);
        assert_eq!(slice.append(b"log", &chunk)?, AppendPrependResult::Success);
        expected.extend_from_slice(&chunk);
        let value = slice.get(b"log")?.expect("present");
        assert_eq!(value.bytes, expected);
        let pages = value.large.expect("past the inline limit").n_pages as usize;
        assert_eq!(pages, expected.len().div_ceil(208));
        assert_eq!(live_large_pages(&slice), pages as i64);
    }

    assert_eq!(slice.prepend(b"log", b"head:")?, AppendPrependResult::Success);
    let value = slice.get(b"log")?.expect("present");
    assert!(value.bytes.starts_with(b"head:0123456789"));
    assert_eq!(value.bytes.len(), expected.len() + 5);
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn shrinking_to_inline_and_deleting_release_every_chain() -> Result<()> {
    let (pager, slice) = open_memory()?;
    slice.set(b"a", &pattern(900, 1), 0)?;
    slice.set(b"b", &pattern(300, 2), 0)?;
    assert_eq!(live_large_pages(&slice), 5 + 2);

    slice.set(b"a", b"tiny", 0)?;
    let a = slice.get(b"a")?.expect("present");
    assert!(a.large.is_none());
    assert_eq!(live_large_pages(&slice), 2);
    assert_eq!(slice.stats().large_values_freed, 1);

    assert_eq!(slice.delete(b"b")?, DeleteResult::Deleted);
    assert_eq!(live_large_pages(&slice), 0);
    assert_eq!(slice.stats().large_values_freed, 2);

    let freed_before = pager.meta()?.free_count;
    slice.set(b"c", &pattern(600, 4), 0)?;
    let meta = pager.meta()?;
    assert!(meta.free_count < freed_before, "chain reuses freed pages");
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn oversized_values_are_refused_without_touching_the_tree() -> Result<()> {
    let (_pager, slice) = open_memory()?;
    assert_eq!(slice.set(b"huge", &pattern(4097, 0), 0)?, SetResult::TooLarge);
    assert!(slice.get(b"huge")?.is_none());
    assert_eq!(slice.superblock()?.depth, 0);

    slice.set(b"near", &pattern(4000, 1), 0)?;
    assert_eq!(
        slice.append(b"near", &pattern(97, 2))?,
        AppendPrependResult::TooLarge
    );
    assert_eq!(slice.get(b"near")?.expect("kept").bytes, pattern(4000, 1));
    assert_eq!(slice.append(b"near", &pattern(96, 2))?, AppendPrependResult::Success);
    assert_eq!(slice.get(b"near")?.expect("grown").bytes.len(), 4096);
    assert!(slice.verify()?.success);
    Ok(())
}

#[test]
fn chains_survive_reopen_and_checksums_hold() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("large.larch");
    let keys: Vec<Vec<u8>> = (0..30).map(|i| format!("v{i:02}").into_bytes()).collect();

    {
        let pager = Arc::new(Pager::create(&path, small_pages())?);
        let store: Arc<dyn PageStore> = pager.clone();
        let slice = BTreeSlice::open(store, small_tree())?;
        for (i, key) in keys.iter().enumerate() {
            slice.set(key, &pattern(50 + i * 37, i as u8), i as u32)?;
        }
    }

    let pager = Arc::new(Pager::open(&path, small_pages())?);
    let store: Arc<dyn PageStore> = pager.clone();
    let slice = BTreeSlice::open(store, small_tree())?;
    for (i, key) in keys.iter().enumerate() {
        let value = slice.get(key)?.expect("persisted");
        assert_eq!(value.bytes, pattern(50 + i * 37, i as u8));
        assert_eq!(value.meta.flags, i as u32);
    }
    let report = slice.verify()?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.large_values, 30);
    Ok(())
}
