//! Fixed header carried at the start of every page.

use core::convert::{TryFrom, TryInto};

use super::{LarchError, PageId, Result};

/// Magic bytes identifying a page written by this engine.
pub const PAGE_MAGIC: [u8; 4] = *b"LRCH";
/// Current page format version.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Page size used when the caller does not pick one.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 128;
/// Largest supported page size; node offsets are 16-bit.
pub const MAX_PAGE_SIZE: u32 = 65536;
/// Length of the fixed page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const PAGE_KIND: usize = 6;
    pub const RESERVED: usize = 7;
    pub const PAGE_SIZE: Range<usize> = 8..12;
    pub const PAGE_NO: Range<usize> = 12..20;
    pub const SALT: Range<usize> = 20..28;
    pub const CRC32: Range<usize> = 28..32;
}

/// What a page holds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Pager metadata (page 0).
    Meta = 1,
    /// Page on the free list.
    Free = 2,
    /// B-tree leaf node.
    BTreeLeaf = 3,
    /// B-tree internal node.
    BTreeInternal = 4,
    /// Chunk of a large value.
    Overflow = 5,
    /// Tree root pointer.
    Superblock = 6,
    /// Delete queue segment.
    DeleteQueue = 7,
}

impl PageKind {
    /// Returns the on-disk tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = LarchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::Free),
            3 => Ok(PageKind::BTreeLeaf),
            4 => Ok(PageKind::BTreeInternal),
            5 => Ok(PageKind::Overflow),
            6 => Ok(PageKind::Superblock),
            7 => Ok(PageKind::DeleteQueue),
            _ => Err(LarchError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Format version the page was written with.
    pub format_version: u16,
    /// Page contents.
    pub kind: PageKind,
    /// Page size recorded at write time.
    pub page_size: u32,
    /// Page number the image belongs to.
    pub page_no: PageId,
    /// Store salt.
    pub salt: u64,
    /// CRC32 of the image, filled in at commit.
    pub crc32: u32,
}

impl PageHeader {
    /// Creates a header for `page_no`.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(LarchError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
            salt,
            crc32: 0,
        })
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(LarchError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Parses and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(LarchError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(LarchError::Corruption("invalid page magic"));
        }
        let format_version = u16::from_be_bytes(read_array(&hdr[header::FORMAT_VERSION])?);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(LarchError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 {
            return Err(LarchError::Corruption("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_size = u32::from_be_bytes(read_array(&hdr[header::PAGE_SIZE])?);
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(LarchError::Corruption("page size smaller than header"));
        }
        let page_no = PageId(u64::from_be_bytes(read_array(&hdr[header::PAGE_NO])?));
        let salt = u64::from_be_bytes(read_array(&hdr[header::SALT])?);
        let crc32 = u32::from_be_bytes(read_array(&hdr[header::CRC32])?);
        Ok(Self {
            format_version,
            kind,
            page_size,
            page_no,
            salt,
            crc32,
        })
    }

    /// Decodes the header and checks it describes `expected_id` of `kind`.
    pub fn expect(src: &[u8], expected_id: PageId, kind: PageKind) -> Result<Self> {
        let header = Self::decode(src)?;
        if header.kind != kind {
            return Err(LarchError::Corruption("page kind mismatch"));
        }
        if header.page_no != expected_id {
            return Err(LarchError::Corruption("page number mismatch"));
        }
        Ok(header)
    }
}

/// Overwrites the page with zeroes and a fresh header of `kind`.
pub fn init_page(buf: &mut [u8], page_no: PageId, kind: PageKind, salt: u64) -> Result<()> {
    let page_size = u32::try_from(buf.len())
        .map_err(|_| LarchError::Invalid("page buffer larger than u32::MAX"))?;
    buf.fill(0);
    PageHeader::new(page_no, kind, page_size, salt)?.encode(buf)
}

fn read_array<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
    src.try_into()
        .map_err(|_| LarchError::Corruption("page header field truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_preserves_fields() {
        let mut buf = [0u8; PAGE_HDR_LEN];
        let mut header = PageHeader::new(PageId(42), PageKind::Superblock, 4096, 777).unwrap();
        header.crc32 = 0xDEAD_BEEF;
        header.encode(&mut buf).unwrap();
        assert_eq!(PageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn expect_rejects_wrong_kind_and_id() {
        let mut buf = vec![0u8; 256];
        init_page(&mut buf, PageId(7), PageKind::Overflow, 1).unwrap();
        assert!(PageHeader::expect(&buf, PageId(7), PageKind::Overflow).is_ok());
        assert!(PageHeader::expect(&buf, PageId(8), PageKind::Overflow).is_err());
        assert!(PageHeader::expect(&buf, PageId(7), PageKind::Free).is_err());
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let err = PageKind::try_from(0).unwrap_err();
        assert!(err.is_corruption());
    }
}
