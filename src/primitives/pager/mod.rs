#![forbid(unsafe_code)]

mod frame;
mod meta;
mod pager;

pub use meta::{load_meta, Meta, SUPERBLOCK_PAGE};
pub use pager::{
    PageMut, PageRef, PageStore, Pager, PagerOptions, PagerStats, ReadGuard, Synchronous,
    WriteGuard,
};
