//! Ticket and title metadata (TMD) parsing.

use std::{fmt, mem::size_of};

use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{static_assert, util::fixed_str};

pub(crate) mod ticket;
pub(crate) mod tmd;

/// RSA-2048 with SHA-1.
pub(crate) const SIG_RSA2048_SHA1: u32 = 0x10001;
/// RSA-2048 with SHA-256.
pub(crate) const SIG_RSA2048_SHA256: u32 = 0x10004;
/// Set on signature types of Wii U-specific ticket/TMD formats.
pub(crate) const SIG_WUP_FLAG: u32 = 0x20000;

/// Wii U boot1 has slightly smaller ticket and TMD files than every other title.
pub(crate) const BOOT1_TITLE_ID: u64 = 0x0005_0010_1000_0100;

/// Signed blob header shared by tickets and TMDs.
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SignedHeader {
    /// Signature type
    pub sig_type: U32,
    /// RSA-2048 signature
    pub sig: [u8; 256],
    _pad: [u8; 60],
}

static_assert!(size_of::<SignedHeader>() == 0x140);

impl SignedHeader {
    /// Whether the signature type is valid for the given format version.
    pub(crate) fn is_valid_sig_type(&self, format_version: u8) -> bool {
        match self.sig_type.get() {
            SIG_RSA2048_SHA1 => true,
            sig if sig & !SIG_WUP_FLAG == SIG_RSA2048_SHA256 => format_version >= 1,
            _ => false,
        }
    }
}

/// 64-bit title ID, displayed as `HHHHHHHH-LLLLLLLL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TitleId(pub u64);

impl TitleId {
    /// Creates a title ID from its big-endian bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self { TitleId(u64::from_be_bytes(bytes)) }

    /// High 32 bits (the title type).
    #[inline]
    pub fn hi(self) -> u32 { (self.0 >> 32) as u32 }

    /// Low 32 bits.
    #[inline]
    pub fn lo(self) -> u32 { self.0 as u32 }

    /// Big-endian bytes.
    #[inline]
    pub fn to_bytes(self) -> [u8; 8] { self.0.to_be_bytes() }
}

impl fmt::Display for TitleId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}-{:08X}", self.hi(), self.lo())
    }
}

/// Parses an issuer of the form `Root-CAxxxxxxxx-XSxxxxxxxx`.
pub(crate) fn parse_issuer(issuer: &[u8]) -> Option<(u32, u32)> {
    let issuer = fixed_str(issuer)?;
    let rest = issuer.strip_prefix("Root-CA")?;
    let (ca, xs) = rest.split_once("-XS")?;
    if ca.len() != 8 || xs.len() != 8 {
        return None;
    }
    Some((u32::from_str_radix(ca, 16).ok()?, u32::from_str_radix(xs, 16).ok()?))
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeros;

    use super::*;

    #[test]
    fn test_title_id() {
        let id = TitleId::from_bytes([0x00, 0x05, 0x00, 0x0E, 0x10, 0x10, 0x1C, 0x00]);
        assert_eq!(id.to_string(), "0005000E-10101C00");
        assert_eq!(id.hi(), 0x0005_000E);
        assert_eq!(id.lo(), 0x1010_1C00);
    }

    #[test]
    fn test_parse_issuer() {
        let mut issuer = [0u8; 64];
        issuer[..26].copy_from_slice(b"Root-CA00000003-XS0000000c");
        assert_eq!(parse_issuer(&issuer), Some((3, 0xC)));
        assert_eq!(parse_issuer(b"Root-CA00000003-CP0000000b\0"), None);
        assert_eq!(parse_issuer(b"Root\0"), None);
    }

    #[test]
    fn test_sig_types() {
        let mut header = SignedHeader::new_zeroed();
        header.sig_type.set(SIG_RSA2048_SHA1);
        assert!(header.is_valid_sig_type(0));
        header.sig_type.set(SIG_RSA2048_SHA256 | SIG_WUP_FLAG);
        assert!(!header.is_valid_sig_type(0));
        assert!(header.is_valid_sig_type(1));
        // RSA-4096 is only used by certificates.
        header.sig_type.set(0x10000);
        assert!(!header.is_valid_sig_type(1));
    }
}
