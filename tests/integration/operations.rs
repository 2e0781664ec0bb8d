#![allow(missing_docs)]

use std::sync::Arc;

use larch::storage::btree::{AppendPrependResult, DeleteResult, IncrDecrResult, SetResult};
use larch::{BTreeOptions, BTreeSlice, PageStore, Pager, PagerOptions, Result};

fn open_memory() -> Result<BTreeSlice> {
    let pager = Arc::new(Pager::in_memory(PagerOptions {
        page_size: 1024,
        ..PagerOptions::default()
    })?);
    let store: Arc<dyn PageStore> = pager;
    BTreeSlice::open(
        store,
        BTreeOptions {
            max_key_len: 16,
            inline_limit: 64,
            max_value_len: 8 * 1024,
            ..BTreeOptions::default()
        },
    )
}

fn value_of(slice: &BTreeSlice, key: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(slice.get(key)?.map(|value| value.bytes))
}

#[test]
fn add_and_replace_respect_presence() -> Result<()> {
    let slice = open_memory()?;
    assert_eq!(slice.replace(b"k", b"v0", 0)?, SetResult::NotStored);
    assert_eq!(value_of(&slice, b"k")?, None);

    assert_eq!(slice.add(b"k", b"v1", 1)?, SetResult::Stored);
    assert_eq!(slice.add(b"k", b"v2", 2)?, SetResult::NotStored);
    assert_eq!(value_of(&slice, b"k")?.as_deref(), Some(&b"v1"[..]));

    assert_eq!(slice.replace(b"k", b"v3", 3)?, SetResult::Stored);
    let stored = slice.get(b"k")?.expect("present");
    assert_eq!(stored.bytes, b"v3");
    assert_eq!(stored.meta.flags, 3);

    assert_eq!(slice.set(b"k", b"", 0)?, SetResult::Stored);
    assert_eq!(value_of(&slice, b"k")?.as_deref(), Some(&b""[..]));
    Ok(())
}

#[test]
fn cas_accepts_only_the_current_token() -> Result<()> {
    let slice = open_memory()?;
    assert_eq!(slice.cas(b"c", b"x", 0, 1)?, SetResult::NotFound);

    slice.set(b"c", b"first", 0)?;
    let token = slice.get(b"c")?.expect("present").meta.cas;
    assert_ne!(token, 0);
    assert_eq!(slice.cas(b"c", b"stale", 0, token.wrapping_add(1))?, SetResult::Exists);
    assert_eq!(slice.cas(b"c", b"second", 5, token)?, SetResult::Stored);

    let stored = slice.get(b"c")?.expect("present");
    assert_eq!(stored.bytes, b"second");
    assert_eq!(stored.meta.flags, 5);
    assert_ne!(stored.meta.cas, token);
    assert_eq!(slice.cas(b"c", b"third", 0, token)?, SetResult::Exists);
    Ok(())
}

#[test]
fn every_write_gets_a_fresh_stamp() -> Result<()> {
    let slice = open_memory()?;
    let mut seen = Vec::new();
    let mut last_recency = slice.superblock()?.last_recency;
    for round in 0..20u32 {
        slice.set(b"s", &round.to_be_bytes(), round)?;
        let meta = slice.get(b"s")?.expect("present").meta;
        assert!(meta.recency > last_recency);
        assert!(!seen.contains(&meta.cas));
        seen.push(meta.cas);
        last_recency = meta.recency;
    }
    assert_eq!(slice.superblock()?.last_recency, last_recency);
    Ok(())
}

#[test]
fn append_and_prepend_keep_flags() -> Result<()> {
    let slice = open_memory()?;
    assert_eq!(slice.append(b"a", b"tail")?, AppendPrependResult::NotFound);
    assert_eq!(slice.prepend(b"a", b"head")?, AppendPrependResult::NotFound);
    assert_eq!(value_of(&slice, b"a")?, None);

    slice.set(b"a", b"mid", 42)?;
    let before = slice.get(b"a")?.expect("present").meta;
    assert_eq!(slice.append(b"a", b"-tail")?, AppendPrependResult::Success);
    assert_eq!(slice.prepend(b"a", b"head-")?, AppendPrependResult::Success);

    let stored = slice.get(b"a")?.expect("present");
    assert_eq!(stored.bytes, b"head-mid-tail");
    assert_eq!(stored.meta.flags, 42);
    assert!(stored.meta.recency > before.recency);
    assert_ne!(stored.meta.cas, before.cas);
    Ok(())
}

#[test]
fn counters_move_within_u64() -> Result<()> {
    let slice = open_memory()?;
    assert_eq!(slice.incr(b"n", 1)?, IncrDecrResult::NotFound);

    slice.set(b"n", b"10", 7)?;
    assert_eq!(slice.incr(b"n", 5)?, IncrDecrResult::Value(15));
    assert_eq!(slice.decr(b"n", 4)?, IncrDecrResult::Value(11));
    assert_eq!(slice.decr(b"n", 100)?, IncrDecrResult::Value(0));
    let stored = slice.get(b"n")?.expect("present");
    assert_eq!(stored.bytes, b"0");
    assert_eq!(stored.meta.flags, 7);

    slice.set(b"max", u64::MAX.to_string().as_bytes(), 0)?;
    assert_eq!(slice.incr(b"max", 2)?, IncrDecrResult::Value(1));

    slice.set(b"crlf", b"41\r\n", 0)?;
    assert_eq!(slice.incr(b"crlf", 1)?, IncrDecrResult::Value(42));
    assert_eq!(value_of(&slice, b"crlf")?.as_deref(), Some(&b"42"[..]));
    Ok(())
}

#[test]
fn non_numeric_counters_are_left_alone() -> Result<()> {
    let slice = open_memory()?;
    let cases: [(&[u8], &[u8]); 6] = [
        (b"neg", b"-1"),
        (b"word", b"twelve"),
        (b"empty", b""),
        (b"space", b" 12"),
        (b"over", b"18446744073709551616"),
        (b"long", &[b'1'; 40]),
    ];
    for (key, value) in cases {
        slice.set(key, value, 0)?;
        assert_eq!(slice.incr(key, 1)?, IncrDecrResult::NotNumeric, "{key:?}");
        assert_eq!(value_of(&slice, key)?.as_deref(), Some(value));
    }
    Ok(())
}

#[test]
fn deletes_are_logged_in_recency_order() -> Result<()> {
    let slice = open_memory()?;
    for key in [&b"d1"[..], &b"d2"[..], &b"d3"[..]] {
        slice.set(key, b"v", 0)?;
    }
    assert_eq!(slice.delete(b"d2")?, DeleteResult::Deleted);
    assert_eq!(slice.delete(b"d2")?, DeleteResult::NotFound);
    assert_eq!(slice.delete(b"d1")?, DeleteResult::Deleted);

    let queue = slice.delete_queue()?;
    let keys: Vec<&[u8]> = queue.iter().map(|entry| entry.key.as_slice()).collect();
    assert_eq!(keys, vec![&b"d2"[..], &b"d2"[..], &b"d1"[..]]);
    assert!(queue.windows(2).all(|pair| pair[0].recency < pair[1].recency));
    assert_eq!(slice.superblock()?.delete_queue_len, 3);

    assert_eq!(value_of(&slice, b"d1")?, None);
    assert_eq!(value_of(&slice, b"d3")?.as_deref(), Some(&b"v"[..]));
    Ok(())
}

#[test]
fn touch_restamps_without_rewriting() -> Result<()> {
    let slice = open_memory()?;
    assert!(!slice.touch(b"t")?);
    assert_eq!(slice.superblock()?.depth, 0);

    slice.set(b"t", &[b'z'; 300], 11)?;
    let before = slice.get(b"t")?.expect("present");
    assert!(slice.touch(b"t")?);
    let after = slice.get(b"t")?.expect("present");
    assert_eq!(after.bytes, before.bytes);
    assert_eq!(after.meta.flags, 11);
    assert_eq!(after.large, before.large);
    assert!(after.meta.recency > before.meta.recency);
    assert_ne!(after.meta.cas, before.meta.cas);
    assert_eq!(slice.stats().large_values_freed, 0);
    Ok(())
}

#[test]
fn refusals_count_as_noops() -> Result<()> {
    let slice = open_memory()?;
    slice.set(b"x", b"1", 0)?;
    let before = slice.stats();
    slice.add(b"x", b"2", 0)?;
    slice.append(b"y", b"2")?;
    slice.incr(b"y", 1)?;
    let after = slice.stats();
    assert_eq!(after.noop_ops, before.noop_ops + 3);
    assert_eq!(after.modify_ops, before.modify_ops);
    Ok(())
}
