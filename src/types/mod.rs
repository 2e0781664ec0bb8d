#![forbid(unsafe_code)]

//! Identifiers, error taxonomy and small value types shared across the engine.

use std::fmt;

/// Checksum helpers.
pub mod checksum;
/// On-disk page header shared by every page kind.
pub mod page;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Identifier of a fixed-size page (block) in the page store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel stored on disk for "no page".
    pub const NONE: PageId = PageId(0);

    /// Returns `None` for the sentinel, `Some(self)` otherwise.
    pub fn non_zero(self) -> Option<PageId> {
        (self.0 != 0).then_some(self)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number assigned to each committed write transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Logical recency timestamp attached to every edit.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ReplTimestamp(pub u64);

impl ReplTimestamp {
    /// Timestamp that orders before every real edit.
    pub const DISTANT_PAST: ReplTimestamp = ReplTimestamp(0);

    /// Returns the following timestamp.
    pub fn next(self) -> ReplTimestamp {
        ReplTimestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for ReplTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compare-and-swap token plus recency timestamp, generated once per logical
/// operation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CasTime {
    /// Token stamped on the value written by the operation.
    pub cas: u64,
    /// Logical time of the operation.
    pub recency: ReplTimestamp,
}

impl CasTime {
    /// Creates a new stamp.
    pub fn new(cas: u64, recency: ReplTimestamp) -> Self {
        Self { cas, recency }
    }
}

/// Hard upper bound on key length accepted by any tree configuration.
pub const MAX_KEY_LEN: usize = 250;

/// Variable-length key; the total byte order defines the tree structure.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Builds a key, rejecting empty keys and keys longer than [`MAX_KEY_LEN`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(LarchError::Invalid("key must not be empty"));
        }
        if bytes.len() > MAX_KEY_LEN {
            return Err(LarchError::Invalid("key longer than 250 bytes"));
        }
        Ok(Self(bytes))
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Keys are never empty; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for StoreKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

/// Reference to an out-of-line value stored as an overflow page chain.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct LargeRef {
    /// First page of the chain; identifies the chain.
    pub start_page: PageId,
    /// Number of pages in the chain.
    pub n_pages: u32,
    /// Payload length in bytes.
    pub len: u32,
    /// CRC32 of the payload.
    pub checksum: u32,
}

impl LargeRef {
    /// Encoded size inside a leaf record.
    pub const ENCODED_LEN: usize = 20;

    /// Whether `other` addresses the same chain (contents may differ after an
    /// in-place rewrite).
    pub fn same_chain(&self, other: &LargeRef) -> bool {
        self.start_page == other.start_page
    }
}

/// Errors produced by the engine.
///
/// Resource denials ([`LarchError::is_retryable`]) and structural corruption
/// ([`LarchError::is_corruption`]) are kept apart so callers can tell "try
/// again" from "data is broken".
#[derive(thiserror::Error, Debug)]
pub enum LarchError {
    /// Underlying storage failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A page latch could not be acquired in time.
    #[error("latch on page {0} not acquired before timeout")]
    LatchTimeout(PageId),
    /// The transaction wrote more pages than its reservation allowed.
    #[error("transaction touched {used} pages, reservation was {budget}")]
    BudgetExhausted {
        /// Pages reserved by the caller.
        budget: usize,
        /// Pages actually charged.
        used: usize,
    },
    /// The page store reached its configured size limit.
    #[error("page store is full")]
    OutOfSpace,
    /// An on-disk structure failed an invariant check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the engine cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A configuration value is out of range.
    #[error("configuration: {0}")]
    Config(String),
}

impl LarchError {
    /// Resource denials; retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LarchError::Io(_)
                | LarchError::LatchTimeout(_)
                | LarchError::BudgetExhausted { .. }
                | LarchError::OutOfSpace
        )
    }

    /// Structural damage; the operation can never succeed on this data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, LarchError::Corruption(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LarchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_rejects_empty_and_oversized() {
        assert!(StoreKey::new(Vec::new()).is_err());
        assert!(StoreKey::new(vec![b'k'; MAX_KEY_LEN + 1]).is_err());
        let key = StoreKey::new(vec![b'k'; MAX_KEY_LEN]).unwrap();
        assert_eq!(key.len(), MAX_KEY_LEN);
    }

    #[test]
    fn store_key_display_falls_back_to_hex() {
        assert_eq!(StoreKey::new("apple").unwrap().to_string(), "apple");
        assert_eq!(StoreKey::new(vec![0xff, 0x00]).unwrap().to_string(), "0xff00");
    }

    #[test]
    fn error_classes_are_disjoint() {
        let denial = LarchError::LatchTimeout(PageId(3));
        let broken = LarchError::Corruption("overflow chain terminated early");
        assert!(denial.is_retryable() && !denial.is_corruption());
        assert!(broken.is_corruption() && !broken.is_retryable());
        assert!(!LarchError::Invalid("x").is_retryable());
    }
}
