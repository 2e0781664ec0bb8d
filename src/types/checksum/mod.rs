#![forbid(unsafe_code)]

//! CRC32 helpers shared by the pager (page images) and the large-value store
//! (overflow chains).

use super::page::header::CRC32;
use super::PageId;

/// Incremental checksum over a byte stream.
pub trait Checksum {
    /// Clears all previously absorbed bytes.
    fn reset(&mut self);
    /// Absorbs `bytes`.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything absorbed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Computes the checksum of a full page image.
///
/// The CRC field of the page header is treated as zero so the value can be
/// stored inside the image it covers.
pub fn page_crc32(page_no: PageId, salt: u64, image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.0.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    if image.len() < CRC32.end {
        hasher.update(image);
        return hasher.finalize();
    }
    hasher.update(&image[..CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&image[CRC32.end..]);
    hasher.finalize()
}
