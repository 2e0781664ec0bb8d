use std::io::ErrorKind;
use std::ops::Range;

use crate::primitives::io::StoreIo;
use crate::types::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{page_crc32, LarchError, PageId, Result};

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_PAGE_SIZE: Range<usize> = META_SALT.end..META_SALT.end + 4;
const META_FORMAT_VERSION: Range<usize> = META_PAGE_SIZE.end..META_PAGE_SIZE.end + 2;
const META_RESERVED: Range<usize> = META_FORMAT_VERSION.end..META_FORMAT_VERSION.end + 2;
const META_FREE_HEAD: Range<usize> = META_RESERVED.end..META_RESERVED.end + 8;
const META_FREE_COUNT: Range<usize> = META_FREE_HEAD.end..META_FREE_HEAD.end + 8;
const META_NEXT_PAGE: Range<usize> = META_FREE_COUNT.end..META_FREE_COUNT.end + 8;
const META_SUPERBLOCK: Range<usize> = META_NEXT_PAGE.end..META_NEXT_PAGE.end + 8;

/// Page reserved for the tree superblock in every store.
pub const SUPERBLOCK_PAGE: PageId = PageId(1);

/// Pager metadata stored on page 0.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Meta {
    /// Page size in bytes.
    pub page_size: u32,
    /// Random salt mixed into every page checksum.
    pub salt: u64,
    /// Page format version.
    pub format_version: u16,
    /// Head of the free page list (0 when empty).
    pub free_head: PageId,
    /// Number of pages on the free list.
    pub free_count: u64,
    /// Next never-used page id.
    pub next_page: PageId,
    /// Page holding the tree superblock.
    pub superblock: PageId,
}

impl Meta {
    /// Metadata for an empty store; pages 0 and 1 are reserved.
    pub fn fresh(page_size: u32, salt: u64) -> Self {
        Self {
            page_size,
            salt,
            format_version: page::PAGE_FORMAT_VERSION,
            free_head: PageId::NONE,
            free_count: 0,
            next_page: PageId(2),
            superblock: SUPERBLOCK_PAGE,
        }
    }
}

/// Writes page 0 for a brand new store and syncs it.
pub fn create_meta(io: &dyn StoreIo, page_size: u32, salt: u64) -> Result<Meta> {
    let meta = Meta::fresh(page_size, salt);
    let mut buf = vec![0u8; page_size as usize];
    write_meta_page(&mut buf, &meta)?;
    let crc = page_crc32(PageId(0), salt, &buf);
    buf[page::header::CRC32].copy_from_slice(&crc.to_be_bytes());
    io.write_all_at(0, &buf)?;
    io.flush()?;
    Ok(meta)
}

/// Loads page 0, learning the page size from its header, and verifies its
/// checksum.
pub fn load_meta(io: &dyn StoreIo) -> Result<Meta> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    read_or_truncated(io, 0, &mut hdr)?;
    let header = PageHeader::expect(&hdr, PageId(0), PageKind::Meta)?;
    let mut buf = vec![0u8; header.page_size as usize];
    read_or_truncated(io, 0, &mut buf)?;
    if page_crc32(PageId(0), header.salt, &buf) != header.crc32 {
        return Err(LarchError::Corruption("meta page checksum mismatch"));
    }
    read_meta_page(&buf)
}

fn read_or_truncated(io: &dyn StoreIo, off: u64, dst: &mut [u8]) -> Result<()> {
    match io.read_exact_at(off, dst) {
        Err(LarchError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Err(LarchError::Corruption("meta page truncated"))
        }
        other => other,
    }
}

/// Encodes `meta` into a page image (header included, CRC left zero).
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size || page_size < META_SUPERBLOCK.end {
        return Err(LarchError::Invalid("meta buffer too small"));
    }
    buf[..page_size].fill(0);
    PageHeader::new(PageId(0), PageKind::Meta, meta.page_size, meta.salt)?
        .encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_FREE_COUNT].copy_from_slice(&meta.free_count.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_SUPERBLOCK].copy_from_slice(&meta.superblock.0.to_be_bytes());
    Ok(())
}

/// Decodes a meta page image.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_SUPERBLOCK.end {
        return Err(LarchError::Corruption("meta page truncated"));
    }
    let header = PageHeader::expect(buf, PageId(0), PageKind::Meta)?;
    let salt = u64::from_be_bytes(field(buf, META_SALT)?);
    let page_size = u32::from_be_bytes(field(buf, META_PAGE_SIZE)?);
    if salt != header.salt || page_size != header.page_size {
        return Err(LarchError::Corruption("meta header disagrees with body"));
    }
    let format_version = u16::from_be_bytes(field(buf, META_FORMAT_VERSION)?);
    if format_version != page::PAGE_FORMAT_VERSION {
        return Err(LarchError::Corruption("unsupported meta format version"));
    }
    let meta = Meta {
        page_size,
        salt,
        format_version,
        free_head: PageId(u64::from_be_bytes(field(buf, META_FREE_HEAD)?)),
        free_count: u64::from_be_bytes(field(buf, META_FREE_COUNT)?),
        next_page: PageId(u64::from_be_bytes(field(buf, META_NEXT_PAGE)?)),
        superblock: PageId(u64::from_be_bytes(field(buf, META_SUPERBLOCK)?)),
    };
    if meta.next_page.0 < 2 || meta.free_head >= meta.next_page {
        return Err(LarchError::Corruption("meta page allocator state out of range"));
    }
    Ok(meta)
}

fn field<const N: usize>(buf: &[u8], range: Range<usize>) -> Result<[u8; N]> {
    buf[range]
        .try_into()
        .map_err(|_| LarchError::Corruption("meta field truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemBackend;

    #[test]
    fn meta_survives_create_and_load() -> Result<()> {
        let io = MemBackend::new();
        let created = create_meta(&io, 512, 0xABCD)?;
        let loaded = load_meta(&io)?;
        assert_eq!(created, loaded);
        assert_eq!(loaded.next_page, PageId(2));
        assert_eq!(loaded.superblock, SUPERBLOCK_PAGE);
        Ok(())
    }

    #[test]
    fn flipped_byte_is_detected() -> Result<()> {
        let io = MemBackend::new();
        create_meta(&io, 256, 7)?;
        io.write_all_at(200, &[1])?;
        assert!(load_meta(&io).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn empty_store_reports_truncation() {
        let io = MemBackend::new();
        assert!(matches!(
            load_meta(&io),
            Err(LarchError::Corruption("meta page truncated"))
        ));
    }
}
