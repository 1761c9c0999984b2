//! Ticket (`.tik`) parsing.

use std::{mem::size_of, path::Path};

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    crypto,
    keys::{CommonKey, KeyError, KeyProvider},
    static_assert,
    title::{parse_issuer, SignedHeader, TitleId, BOOT1_TITLE_ID},
    util::{fixed_str, read::read_file_limited},
    Error, KeyBytes, Result, ResultContext,
};

/// Largest ticket file that will be read.
const MAX_TICKET_SIZE: u64 = 0x10000;
/// Minimum size of a v1 ticket file.
const TICKET_V1_MIN_SIZE: usize = 0x350;
/// Size of the Wii U boot1 ticket.
const TICKET_BOOT1_SIZE: usize = 0x2B8;

/// Ticket time limit entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TicketTimeLimit {
    pub enable_time_limit: U32,
    pub time_limit: U32,
}

static_assert!(size_of::<TicketTimeLimit>() == 8);

/// Version 0 ticket, also the common prefix of version 1 tickets.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TicketHeader {
    pub header: SignedHeader,
    pub sig_issuer: [u8; 64],
    pub ecdh: [u8; 60],
    pub version: u8,
    _pad1: [u8; 2],
    pub title_key: KeyBytes,
    _unk1: u8,
    pub ticket_id: [u8; 8],
    pub console_id: U32,
    pub title_id: [u8; 8],
    _unk2: [u8; 2],
    pub ticket_title_version: U16,
    pub permitted_titles_mask: U32,
    pub permit_mask: U32,
    pub title_export_allowed: u8,
    pub common_key_idx: u8,
    _unk3: [u8; 48],
    pub content_access_permissions: [u8; 64],
    _pad2: [u8; 2],
    pub time_limits: [TicketTimeLimit; 8],
}

static_assert!(size_of::<TicketHeader>() == 0x2A4);

/// Header of the version 1 section table that follows a [`TicketHeader`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TicketV1Header {
    pub header_version: U16,
    pub header_size: U16,
    pub data_size: U32,
    pub section_headers_offset: U32,
    pub num_section_headers: U16,
    pub section_header_size: U16,
    pub flags: U32,
}

static_assert!(size_of::<TicketV1Header>() == 0x14);

/// A version 1 section header.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TicketV1Section {
    pub offset: U32,
    pub num_records: U32,
    pub record_size: U32,
    pub section_size: U32,
    pub section_type: U16,
    pub flags: U16,
}

static_assert!(size_of::<TicketV1Section>() == 0x14);

/// Format-specific ticket data.
#[derive(Debug, Clone)]
pub enum TicketFormat {
    /// Wii ticket.
    V0,
    /// Wii U / 3DS ticket with a section table.
    V1 {
        /// Section table header.
        header: TicketV1Header,
        /// Section headers that lie within the file.
        sections: Vec<TicketV1Section>,
    },
}

/// A parsed ticket.
#[derive(Debug, Clone)]
pub struct Ticket {
    header: Box<TicketHeader>,
    format: TicketFormat,
}

impl Ticket {
    /// Parses a ticket file.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn parse(buf: &[u8]) -> Result<Ticket> {
        let Ok((header, rest)) = TicketHeader::read_from_prefix(buf) else {
            return Err(Error::Format("ticket is too small".to_string()));
        };
        let title_id = TitleId::from_bytes(header.title_id);
        let format = match header.version {
            0 => TicketFormat::V0,
            1 => {
                if buf.len() < TICKET_V1_MIN_SIZE
                    && !(title_id.0 == BOOT1_TITLE_ID && buf.len() == TICKET_BOOT1_SIZE)
                {
                    return Err(Error::Format(format!(
                        "v1 ticket is too small ({:#X} bytes)",
                        buf.len()
                    )));
                }
                let Ok((v1, _)) = TicketV1Header::read_from_prefix(rest) else {
                    return Err(Error::Format("v1 ticket header is truncated".to_string()));
                };
                let sections = read_sections(rest, &v1);
                TicketFormat::V1 { header: v1, sections }
            }
            v => return Err(Error::Format(format!("unsupported ticket format version {}", v))),
        };
        if !header.header.is_valid_sig_type(header.version) {
            return Err(Error::Format(format!(
                "invalid ticket signature type {:#X}",
                header.header.sig_type.get()
            )));
        }
        if !header.sig_issuer.starts_with(b"Root-") {
            return Err(Error::Format("invalid ticket issuer".to_string()));
        }
        Ok(Ticket { header: Box::new(header), format })
    }

    /// Reads and parses a ticket file.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn load(path: &Path) -> Result<Ticket> {
        let buf = read_file_limited(path, MAX_TICKET_SIZE)
            .with_context(|| format!("Reading ticket {}", path.display()))?;
        Ticket::parse(&buf)
    }

    /// The raw ticket header.
    #[inline]
    pub fn header(&self) -> &TicketHeader { &self.header }

    /// Format-specific data.
    #[inline]
    pub fn format(&self) -> &TicketFormat { &self.format }

    /// Ticket format version. (0 or 1)
    #[inline]
    pub fn format_version(&self) -> u8 { self.header.version }

    /// Title ID.
    #[inline]
    pub fn title_id(&self) -> TitleId { TitleId::from_bytes(self.header.title_id) }

    /// Signature issuer.
    #[inline]
    pub fn issuer(&self) -> Option<&str> { fixed_str(&self.header.sig_issuer) }

    /// The common key that encrypts this ticket's title key.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn common_key(&self) -> Result<CommonKey, KeyError> {
        let issuer = || self.issuer().unwrap_or_default().to_string();
        let (ca, xs) =
            parse_issuer(&self.header.sig_issuer).ok_or_else(|| KeyError::UnknownIssuer(issuer()))?;
        CommonKey::from_issuer(ca, xs, self.header.common_key_idx)
            .ok_or_else(|| KeyError::UnknownIssuer(issuer()))
    }

    /// Decrypts the title key with the common key obtained from `keys`.
    ///
    /// The IV is the title ID followed by 8 zero bytes.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn decrypt_title_key(&self, keys: &dyn KeyProvider) -> Result<KeyBytes> {
        let common_key = keys.common_key(self.common_key()?)?;
        let mut iv: KeyBytes = [0; 16];
        iv[..8].copy_from_slice(&self.header.title_id);
        let mut title_key = self.header.title_key;
        crypto::decrypt_cbc(&common_key, iv, &mut title_key)?;
        Ok(title_key)
    }
}

fn read_sections(rest: &[u8], v1: &TicketV1Header) -> Vec<TicketV1Section> {
    let start = v1.section_headers_offset.get() as usize;
    let count = v1.num_section_headers.get() as usize;
    let Some(table) = rest.get(start..) else {
        return Vec::new();
    };
    table
        .chunks_exact(size_of::<TicketV1Section>())
        .take(count)
        .filter_map(|chunk| TicketV1Section::read_from_bytes(chunk).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;
    use crate::title::{SIG_RSA2048_SHA1, SIG_RSA2048_SHA256};

    const COMMON_KEY: KeyBytes = [0x44; 16];

    struct TestKeys;

    impl KeyProvider for TestKeys {
        fn common_key(&self, key: CommonKey) -> Result<KeyBytes, KeyError> {
            match key {
                CommonKey::WupWiiUCommon => Ok(COMMON_KEY),
                _ => Err(KeyError::Missing(key.name().to_string())),
            }
        }
    }

    fn header(version: u8, issuer: &[u8]) -> TicketHeader {
        let mut header = TicketHeader::new_zeroed();
        header.header.sig_type.set(if version == 0 { SIG_RSA2048_SHA1 } else { SIG_RSA2048_SHA256 });
        header.sig_issuer[..issuer.len()].copy_from_slice(issuer);
        header.version = version;
        header.title_id = [0x00, 0x05, 0x00, 0x00, 0x10, 0x10, 0x1F, 0x00];
        header
    }

    fn v1_bytes(header: &TicketHeader) -> Vec<u8> {
        let mut buf = header.as_bytes().to_vec();
        let mut v1 = TicketV1Header::new_zeroed();
        v1.header_version.set(1);
        v1.header_size.set(0x14);
        v1.section_headers_offset.set(0x14);
        v1.num_section_headers.set(1);
        v1.section_header_size.set(0x14);
        buf.extend_from_slice(v1.as_bytes());
        let mut section = TicketV1Section::new_zeroed();
        section.section_type.set(3);
        buf.extend_from_slice(section.as_bytes());
        buf.resize(TICKET_V1_MIN_SIZE, 0);
        buf
    }

    #[test]
    fn test_parse_v0() {
        let header = header(0, b"Root-CA00000001-XS00000003");
        let ticket = Ticket::parse(header.as_bytes()).unwrap();
        assert_eq!(ticket.format_version(), 0);
        assert!(matches!(ticket.format(), TicketFormat::V0));
        assert_eq!(ticket.issuer(), Some("Root-CA00000001-XS00000003"));
        assert_eq!(ticket.common_key(), Ok(CommonKey::RvlCommon));
    }

    #[test]
    fn test_parse_v1() {
        let header = header(1, b"Root-CA00000003-XS0000000c");
        let ticket = Ticket::parse(&v1_bytes(&header)).unwrap();
        assert_eq!(ticket.title_id().to_string(), "00050000-10101F00");
        let TicketFormat::V1 { header, sections } = ticket.format() else {
            panic!("expected v1 ticket");
        };
        assert_eq!(header.num_section_headers.get(), 1);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].section_type.get(), 3);
    }

    #[test]
    fn test_invalid_tickets() {
        // Truncated v1
        let header_v1 = header(1, b"Root-CA00000003-XS0000000c");
        assert!(Ticket::parse(header_v1.as_bytes()).is_err());
        // Bad version
        let mut bad = header(0, b"Root-CA00000001-XS00000003");
        bad.version = 2;
        assert!(Ticket::parse(bad.as_bytes()).is_err());
        // SHA-256 signatures need v1
        let mut bad = header(0, b"Root-CA00000001-XS00000003");
        bad.header.sig_type.set(SIG_RSA2048_SHA256);
        assert!(Ticket::parse(bad.as_bytes()).is_err());
        // Issuer
        let bad = header(0, b"Fake-CA00000001-XS00000003");
        assert!(Ticket::parse(bad.as_bytes()).is_err());
        assert!(Ticket::parse(&[0u8; 0x100]).is_err());
    }

    #[cfg(feature = "decryption")]
    #[test]
    fn test_decrypt_title_key() {
        let title_key: KeyBytes = *b"0123456789abcdef";
        let mut header = header(1, b"Root-CA00000003-XS0000000c");
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&header.title_id);
        header.title_key = title_key;
        crypto::encrypt_cbc(&COMMON_KEY, iv, &mut header.title_key).unwrap();
        let ticket = Ticket::parse(&v1_bytes(&header)).unwrap();
        assert_eq!(ticket.decrypt_title_key(&TestKeys).unwrap(), title_key);

        let debug = Ticket::parse(&v1_bytes(&self::header(1, b"Root-CA00000004-XS0000000f")))
            .unwrap();
        assert!(matches!(debug.decrypt_title_key(&TestKeys), Err(Error::Key(KeyError::Missing(_)))));
    }
}
