//! Title icon (`iconTex.tga`).

use std::mem::size_of;

use zerocopy::{little_endian::U16, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{static_assert, Error, Result};

#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct TgaHeader {
    id_length: u8,
    color_map_type: u8,
    image_type: u8,
    color_map_origin: U16,
    color_map_length: U16,
    color_map_depth: u8,
    x_origin: U16,
    y_origin: U16,
    width: U16,
    height: U16,
    bits_per_pixel: u8,
    descriptor: u8,
}

static_assert!(size_of::<TgaHeader>() == 18);

/// A title icon in TGA format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconTex {
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Bits per pixel.
    pub bits_per_pixel: u8,
    /// TGA image type.
    pub image_type: u8,
    /// The complete file, header included.
    pub data: Vec<u8>,
}

impl IconTex {
    /// Probes the TGA header of `data`.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn parse(data: Vec<u8>) -> Result<IconTex> {
        let Ok((header, _)) = TgaHeader::read_from_prefix(data.as_slice()) else {
            return Err(Error::Format(format!("icon is too small ({} bytes)", data.len())));
        };
        if !matches!(header.image_type, 1 | 2 | 3 | 9 | 10 | 11) {
            return Err(Error::Format(format!("invalid TGA image type {}", header.image_type)));
        }
        let (width, height) = (header.width.get(), header.height.get());
        if width == 0 || height == 0 {
            return Err(Error::Format(format!("invalid TGA dimensions {}x{}", width, height)));
        }
        if !matches!(header.bits_per_pixel, 8 | 15 | 16 | 24 | 32) {
            return Err(Error::Format(format!("invalid TGA depth {}", header.bits_per_pixel)));
        }
        Ok(IconTex {
            width,
            height,
            bits_per_pixel: header.bits_per_pixel,
            image_type: header.image_type,
            data,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An uncompressed 128x128 32bpp TGA header.
    pub(crate) fn tga_header() -> [u8; 18] {
        let mut header = [0u8; 18];
        header[2] = 2;
        header[12..14].copy_from_slice(&128u16.to_le_bytes());
        header[14..16].copy_from_slice(&128u16.to_le_bytes());
        header[16] = 32;
        header
    }

    #[test]
    fn test_parse() {
        let mut data = tga_header().to_vec();
        data.extend_from_slice(&[0x80; 64]);
        let icon = IconTex::parse(data.clone()).unwrap();
        assert_eq!((icon.width, icon.height), (128, 128));
        assert_eq!(icon.bits_per_pixel, 32);
        assert_eq!(icon.image_type, 2);
        assert_eq!(icon.data, data);
    }

    #[test]
    fn test_invalid() {
        assert!(IconTex::parse(vec![0; 10]).is_err());

        let mut header = tga_header();
        header[2] = 4;
        assert!(IconTex::parse(header.to_vec()).is_err());

        let mut header = tga_header();
        header[14..16].copy_from_slice(&0u16.to_le_bytes());
        assert!(IconTex::parse(header.to_vec()).is_err());

        let mut header = tga_header();
        header[16] = 12;
        assert!(IconTex::parse(header.to_vec()).is_err());
    }
}
