//! Title metadata (`.tmd`) parsing.

use std::{mem::size_of, path::Path};

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    static_assert,
    title::{SignedHeader, TitleId, BOOT1_TITLE_ID},
    util::{fixed_str, read::read_file_limited},
    Error, Result, ResultContext,
};

/// Content is encrypted with the title key.
pub const CONTENT_ENCRYPTED: u16 = 0x0001;
/// Content is split into sector-hashed blocks.
pub const CONTENT_HASHED: u16 = 0x0002;

const MAX_TMD_SIZE: u64 = 0x100000;
const CMD_GROUP_COUNT: usize = 64;
/// Minimum size of a v1 TMD (0xB58): header, group table, one extra content-info record
/// and one content entry.
const TMD_V1_MIN_SIZE: usize = size_of::<TmdHeader>()
    + size_of::<CmdGroupHeader>()
    + size_of::<ContentInfo>()
    + size_of::<WupContentEntry>();
/// Size of the Wii U boot1 TMD, which lacks the extra content-info record.
const TMD_BOOT1_SIZE: usize = TMD_V1_MIN_SIZE - size_of::<ContentInfo>();

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TmdHeader {
    pub header: SignedHeader,
    pub sig_issuer: [u8; 64],
    pub version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    _pad1: u8,
    pub sys_version: [u8; 8],
    pub title_id: [u8; 8],
    pub title_type: U32,
    pub group_id: U16,
    _reserved1: [u8; 2],
    pub region: U16,
    pub ratings: [u8; 16],
    _reserved2: [u8; 12],
    pub ipc_mask: [u8; 12],
    _reserved3: [u8; 18],
    pub access_rights: U32,
    pub title_version: U16,
    pub num_contents: U16,
    pub boot_idx: U16,
    _pad2: [u8; 2],
}

static_assert!(size_of::<TmdHeader>() == 0x1E4);

/// One content-info record of the v1 group table.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ContentInfo {
    pub offset: U16,
    pub count: U16,
    pub hash: [u8; 32],
}

static_assert!(size_of::<ContentInfo>() == 0x24);

/// v1 content-info group table.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CmdGroupHeader {
    pub hash: [u8; 32],
    pub groups: [ContentInfo; CMD_GROUP_COUNT],
}

static_assert!(size_of::<CmdGroupHeader>() == 0x920);

#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct WiiContentEntry {
    content_id: U32,
    index: U16,
    kind: U16,
    size: U64,
    hash: [u8; 20],
}

static_assert!(size_of::<WiiContentEntry>() == 0x24);

#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct WupContentEntry {
    content_id: U32,
    index: U16,
    kind: U16,
    size: U64,
    hash: [u8; 32],
}

static_assert!(size_of::<WupContentEntry>() == 0x30);

/// A content table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentEntry {
    /// Content index, as stored in the table.
    pub index: u16,
    /// Content ID; the `.app` file name.
    pub content_id: u32,
    /// Content type flags.
    pub type_flags: u16,
    /// Content size in bytes.
    pub size: u64,
}

impl ContentEntry {
    /// Whether the content is encrypted.
    #[inline]
    pub fn is_encrypted(&self) -> bool { self.type_flags & CONTENT_ENCRYPTED != 0 }

    /// Whether the content is sector-hashed.
    #[inline]
    pub fn is_hashed(&self) -> bool { self.type_flags & CONTENT_HASHED != 0 }
}

impl From<&WiiContentEntry> for ContentEntry {
    fn from(e: &WiiContentEntry) -> Self {
        ContentEntry {
            index: e.index.get(),
            content_id: e.content_id.get(),
            type_flags: e.kind.get(),
            size: e.size.get(),
        }
    }
}

impl From<&WupContentEntry> for ContentEntry {
    fn from(e: &WupContentEntry) -> Self {
        ContentEntry {
            index: e.index.get(),
            content_id: e.content_id.get(),
            type_flags: e.kind.get(),
            size: e.size.get(),
        }
    }
}

/// Format-specific TMD data.
#[derive(Debug, Clone)]
pub enum TmdFormat {
    /// Wii TMD.
    V0 {
        /// Content table.
        contents: Vec<ContentEntry>,
    },
    /// Wii U TMD with content-info groups.
    V1 {
        /// Content-info group table.
        groups: Box<CmdGroupHeader>,
        /// Content table, covering every group.
        contents: Vec<ContentEntry>,
    },
}

/// A parsed TMD.
#[derive(Debug, Clone)]
pub struct Tmd {
    header: Box<TmdHeader>,
    format: TmdFormat,
}

impl Tmd {
    /// Parses a TMD file.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn parse(buf: &[u8]) -> Result<Tmd> {
        let Ok((header, rest)) = TmdHeader::read_from_prefix(buf) else {
            return Err(Error::Format("TMD is too small".to_string()));
        };
        let num_contents = header.num_contents.get() as usize;
        let format = match header.version {
            0 => {
                if rest.len() < size_of::<WiiContentEntry>() {
                    return Err(Error::Format("v0 TMD has no content table".to_string()));
                }
                TmdFormat::V0 { contents: read_entries::<WiiContentEntry>(rest, num_contents) }
            }
            1 => {
                let title_id = TitleId::from_bytes(header.title_id);
                if buf.len() < TMD_V1_MIN_SIZE
                    && !(title_id.0 == BOOT1_TITLE_ID && buf.len() == TMD_BOOT1_SIZE)
                {
                    return Err(Error::Format(format!(
                        "v1 TMD is too small ({:#X} bytes)",
                        buf.len()
                    )));
                }
                let Ok((groups, entries)) = CmdGroupHeader::read_from_prefix(rest) else {
                    return Err(Error::Format("v1 TMD group table is truncated".to_string()));
                };
                TmdFormat::V1 {
                    groups: Box::new(groups),
                    contents: read_entries::<WupContentEntry>(entries, num_contents),
                }
            }
            v => return Err(Error::Format(format!("unsupported TMD format version {}", v))),
        };
        if !header.header.is_valid_sig_type(header.version) {
            return Err(Error::Format(format!(
                "invalid TMD signature type {:#X}",
                header.header.sig_type.get()
            )));
        }
        Ok(Tmd { header: Box::new(header), format })
    }

    /// Reads and parses a TMD file.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn load(path: &Path) -> Result<Tmd> {
        let buf = read_file_limited(path, MAX_TMD_SIZE)
            .with_context(|| format!("Reading TMD {}", path.display()))?;
        Tmd::parse(&buf)
    }

    /// The raw TMD header.
    #[inline]
    pub fn header(&self) -> &TmdHeader { &self.header }

    /// Format-specific data.
    #[inline]
    pub fn format(&self) -> &TmdFormat { &self.format }

    /// TMD format version. (0 or 1)
    #[inline]
    pub fn format_version(&self) -> u8 { self.header.version }

    /// Title ID.
    #[inline]
    pub fn title_id(&self) -> TitleId { TitleId::from_bytes(self.header.title_id) }

    /// Title version.
    #[inline]
    pub fn title_version(&self) -> u16 { self.header.title_version.get() }

    /// Index of the boot content.
    #[inline]
    pub fn boot_index(&self) -> u16 { self.header.boot_idx.get() }

    /// Signature issuer.
    #[inline]
    pub fn issuer(&self) -> Option<&str> { fixed_str(&self.header.sig_issuer) }

    /// The full content table.
    #[inline]
    pub fn contents(&self) -> &[ContentEntry] {
        match &self.format {
            TmdFormat::V0 { contents } | TmdFormat::V1 { contents, .. } => contents,
        }
    }

    /// Content entries of a v1 content-info group.
    ///
    /// Returns an empty slice for v0 TMDs, unknown groups, or groups outside the table.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn contents_v1(&self, group: usize) -> &[ContentEntry] {
        let TmdFormat::V1 { groups, contents } = &self.format else {
            return &[];
        };
        let Some(info) = groups.groups.get(group) else {
            return &[];
        };
        let start = info.offset.get() as usize;
        let end = start + info.count.get() as usize;
        contents.get(start..end.min(contents.len())).unwrap_or_default()
    }
}

/// Reads up to `count` entries, stopping at the end of the buffer.
fn read_entries<T>(buf: &[u8], count: usize) -> Vec<ContentEntry>
where
    T: FromBytes,
    for<'a> ContentEntry: From<&'a T>,
{
    buf.chunks_exact(size_of::<T>())
        .take(count)
        .filter_map(|chunk| T::read_from_bytes(chunk).ok())
        .map(|entry| ContentEntry::from(&entry))
        .collect()
}
