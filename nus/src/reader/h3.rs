//! Read stream for sector-hashed ("H3") contents.

use std::{
    io,
    io::{Read, Seek, SeekFrom},
};

use sha1::{digest, Digest, Sha1};
use zerocopy::FromZeros;

use crate::{
    array_ref, crypto,
    crypto::ZERO_IV,
    streams::ReadStream,
    util::div_rem,
    Error, ErrorContext, HashBytes, KeyBytes, OpenOptions, Result, ResultContext,
};

/// Size of an encrypted sector.
pub const H3_SECTOR_SIZE: usize = 0x10000;
/// Size of the hash block at the start of each sector.
pub const H3_HASHES_SIZE: usize = 0x400;
/// Size of the payload of each sector.
pub const H3_SECTOR_DATA_SIZE: usize = H3_SECTOR_SIZE - H3_HASHES_SIZE; // 0xFC00

const H1_OFFSET: usize = 0x140;
const H2_OFFSET: usize = 0x280;
const HASH_TABLE_SIZE: usize = 16 * 20;

/// Decrypting read stream over a sector-hashed content file.
///
/// Each 0x10000-byte sector holds an encrypted hash block followed by 0xFC00 bytes of
/// encrypted payload. The payload IV is taken from the sector's own H0 hash entry.
pub struct SectorHashReader<R> {
    inner: Option<R>,
    key: KeyBytes,
    partition_size: u64,
    data_size: u64,
    pos: u64,
    sector_buf: Box<[u8; H3_SECTOR_SIZE]>,
    sector: u32,
    sectors_decrypted: u64,
    verify: bool,
    h3_table: Option<Box<[u8]>>,
}

impl<R> SectorHashReader<R>
where R: Read + Seek
{
    /// Creates a new reader over the whole of `inner`.
    #[inline]
    pub fn new(mut inner: R, key: KeyBytes, options: &OpenOptions) -> Result<Self> {
        if !crypto::is_supported() {
            return Err(Error::Unsupported("built without the `decryption` feature".to_string()));
        }
        let partition_size =
            inner.seek(SeekFrom::End(0)).context("Determining content size")?;
        let (sectors, rem) = div_rem(partition_size, H3_SECTOR_SIZE as u64);
        if rem != 0 {
            log::warn!(
                "Hashed content size {:#X} is not a multiple of {:#X}; ignoring trailing data",
                partition_size,
                H3_SECTOR_SIZE
            );
        }
        let sector_buf = <[u8; H3_SECTOR_SIZE]>::new_box_zeroed()
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))
            .context("Allocating sector buffer")?;
        Ok(Self {
            inner: Some(inner),
            key,
            partition_size,
            data_size: sectors * H3_SECTOR_DATA_SIZE as u64,
            pos: 0,
            sector_buf,
            sector: u32::MAX,
            sectors_decrypted: 0,
            verify: options.validate_hashes,
            h3_table: None,
        })
    }

    /// Sets the content's H3 table, checked against each sector's H2 table when hash
    /// validation is enabled.
    #[inline]
    pub fn with_h3_table(mut self, table: Box<[u8]>) -> Self {
        self.h3_table = Some(table);
        self
    }

    /// Size of the encrypted content file.
    #[inline]
    pub fn partition_size(&self) -> u64 { self.partition_size }

    /// Number of sectors decrypted so far. Cache hits are not counted.
    #[inline]
    pub fn sectors_decrypted(&self) -> u64 { self.sectors_decrypted }

    /// Releases the source. Every later operation fails with [`Error::Closed`].
    #[inline]
    pub fn close(&mut self) { self.inner = None; }

    /// Loads and decrypts a sector into the sector cache.
    fn read_sector(&mut self, sector: u32) -> Result<()> {
        if sector == self.sector {
            return Ok(());
        }
        // Any failure below leaves the cache invalid.
        self.sector = u32::MAX;
        let inner = self.inner.as_mut().ok_or(Error::Closed)?;
        let offset = sector as u64 * H3_SECTOR_SIZE as u64;
        inner
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("Seeking to sector {}", sector))?;
        inner
            .read_exact(self.sector_buf.as_mut())
            .with_context(|| format!("Reading sector {}", sector))?;

        let (hashes, data) = self.sector_buf.split_at_mut(H3_HASHES_SIZE);
        crypto::decrypt_cbc(&self.key, ZERO_IV, hashes)?;
        let iv = *array_ref![hashes, (sector as usize % 16) * 20, 16];
        crypto::decrypt_cbc(&self.key, iv, data)?;
        self.sectors_decrypted += 1;

        if self.verify {
            verify_hashes(&self.sector_buf, sector, self.h3_table.as_deref())?;
        }
        self.sector = sector;
        Ok(())
    }

    /// Reads and decrypts up to `buf.len()` bytes at the current position.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn read_decrypted(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.is_none() {
            return Err(Error::Closed);
        }
        if self.pos >= self.data_size || buf.is_empty() {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.data_size - self.pos) as usize;
        let mut read = 0;
        while read < size {
            let (sector, offset) =
                div_rem(self.pos + read as u64, H3_SECTOR_DATA_SIZE as u64);
            self.read_sector(sector as u32)?;
            let offset = offset as usize;
            let len = (H3_SECTOR_DATA_SIZE - offset).min(size - read);
            let start = H3_HASHES_SIZE + offset;
            buf[read..read + len].copy_from_slice(&self.sector_buf[start..start + len]);
            read += len;
        }
        self.pos += size as u64;
        Ok(size)
    }

    /// Seeks to a logical position, clamped to the payload size.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.inner.is_none() {
            return Err(Error::Closed);
        }
        let new_pos = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(p) => self.data_size.checked_add_signed(p),
            SeekFrom::Current(p) => self.pos.checked_add_signed(p),
        }
        .ok_or_else(|| Error::InvalidArgument("seek to a negative position".to_string()))?;
        self.pos = new_pos.min(self.data_size);
        Ok(self.pos)
    }
}

#[inline(always)]
fn as_digest(slice: &HashBytes) -> digest::Output<Sha1> { (*slice).into() }

fn check_hash(data: &[u8], expected: &HashBytes, level: &str, index: usize) -> Result<()> {
    let output = Sha1::digest(data);
    let expected = as_digest(expected);
    if output != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid {} hash! (index {}) {:x}\n\texpected {:x}", level, index, output, expected),
        )
        .context("Verifying sector hashes"));
    }
    Ok(())
}

fn verify_hashes(buf: &[u8; H3_SECTOR_SIZE], sector: u32, h3_table: Option<&[u8]>) -> Result<()> {
    let sector = sector as usize;
    let h0 = sector % 16;
    let h1 = (sector / 16) % 16;
    let h2 = (sector / 256) % 16;
    check_hash(&buf[H3_HASHES_SIZE..], array_ref![buf, h0 * 20, 20], "H0", h0)?;
    check_hash(&buf[..HASH_TABLE_SIZE], array_ref![buf, H1_OFFSET + h1 * 20, 20], "H1", h1)?;
    check_hash(
        &buf[H1_OFFSET..H1_OFFSET + HASH_TABLE_SIZE],
        array_ref![buf, H2_OFFSET + h2 * 20, 20],
        "H2",
        h2,
    )?;
    if let Some(table) = h3_table {
        let h3 = sector / 4096;
        let Some(expected) = table.get(h3 * 20..h3 * 20 + 20) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("H3 table of {:#X} bytes has no entry {}", table.len(), h3),
            )
            .context("Verifying sector hashes"));
        };
        check_hash(
            &buf[H2_OFFSET..H2_OFFSET + HASH_TABLE_SIZE],
            array_ref![expected, 0, 20],
            "H3",
            h3,
        )?;
    }
    Ok(())
}

impl<R> Read for SectorHashReader<R>
where R: Read + Seek
{
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { Ok(self.read_decrypted(buf)?) }
}

impl<R> Seek for SectorHashReader<R>
where R: Read + Seek
{
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> { Ok(self.seek_to(pos)?) }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.pos) }
}

impl<R> ReadStream for SectorHashReader<R>
where R: Read + Seek
{
    #[inline]
    fn size(&self) -> u64 { self.data_size }

    #[inline]
    fn tell(&self) -> u64 { self.pos }
}

#[cfg(all(test, feature = "decryption"))]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::errno;

    const KEY: KeyBytes = [0x33; 16];

    fn payload(sector: usize) -> Vec<u8> {
        (0..H3_SECTOR_DATA_SIZE).map(|i| (i as u8) ^ (sector as u8).wrapping_mul(31)).collect()
    }

    /// Builds an encrypted hashed content of up to 16 sectors with consistent H0-H2 tables.
    /// Returns the content and its H3 table.
    pub(crate) fn build_content(key: &KeyBytes, payloads: &[Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
        assert!(payloads.len() <= 16);
        let mut hashes = [0u8; H3_HASHES_SIZE];
        for (i, data) in payloads.iter().enumerate() {
            hashes[i * 20..i * 20 + 20].copy_from_slice(&Sha1::digest(data));
        }
        let h1 = Sha1::digest(&hashes[..HASH_TABLE_SIZE]);
        hashes[H1_OFFSET..H1_OFFSET + 20].copy_from_slice(&h1);
        let h2 = Sha1::digest(&hashes[H1_OFFSET..H1_OFFSET + HASH_TABLE_SIZE]);
        hashes[H2_OFFSET..H2_OFFSET + 20].copy_from_slice(&h2);
        let h3 = Sha1::digest(&hashes[H2_OFFSET..H2_OFFSET + HASH_TABLE_SIZE]).to_vec();

        let mut out = Vec::with_capacity(payloads.len() * H3_SECTOR_SIZE);
        for (i, data) in payloads.iter().enumerate() {
            let iv = *array_ref![hashes, i * 20, 16];
            let mut enc_hashes = hashes;
            crypto::encrypt_cbc(key, ZERO_IV, &mut enc_hashes).unwrap();
            let mut enc_data = data.clone();
            crypto::encrypt_cbc(key, iv, &mut enc_data).unwrap();
            out.extend_from_slice(&enc_hashes);
            out.extend_from_slice(&enc_data);
        }
        (out, h3)
    }

    fn reader(sectors: usize, verify: bool) -> (SectorHashReader<Cursor<Vec<u8>>>, Vec<u8>) {
        let payloads: Vec<Vec<u8>> = (0..sectors).map(payload).collect();
        let (content, _) = build_content(&KEY, &payloads);
        let options = OpenOptions { validate_hashes: verify };
        let reader = SectorHashReader::new(Cursor::new(content), KEY, &options).unwrap();
        (reader, payloads.concat())
    }

    #[test]
    fn test_sizes() {
        let (reader, plain) = reader(3, false);
        assert_eq!(reader.size(), 3 * H3_SECTOR_DATA_SIZE as u64);
        assert_eq!(reader.partition_size(), 3 * H3_SECTOR_SIZE as u64);
        assert_eq!(plain.len() as u64, reader.size());
    }

    #[test]
    fn test_read_across_sectors() {
        let (mut reader, plain) = reader(3, true);
        let start = H3_SECTOR_DATA_SIZE - 100;
        reader.seek(SeekFrom::Start(start as u64)).unwrap();
        let mut buf = vec![0u8; H3_SECTOR_DATA_SIZE + 200];
        assert_eq!(reader.read(&mut buf).unwrap(), buf.len());
        assert_eq!(buf, &plain[start..start + buf.len()]);

        let mut full = Vec::new();
        reader.seek(SeekFrom::Start(0)).unwrap();
        reader.read_to_end(&mut full).unwrap();
        assert_eq!(full, plain);
    }

    #[test]
    fn test_sector_cache() {
        let (mut reader, _) = reader(2, false);
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.sectors_decrypted(), 1);

        reader.seek(SeekFrom::Start(H3_SECTOR_DATA_SIZE as u64)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.sectors_decrypted(), 2);

        reader.seek(SeekFrom::Start(0)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.sectors_decrypted(), 3);
    }

    #[test]
    fn test_end_of_stream() {
        let (mut reader, plain) = reader(1, false);
        reader.seek(SeekFrom::End(-8)).unwrap();
        let mut buf = [0xEEu8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &plain[plain.len() - 8..]);
        assert_eq!(&buf[8..], &[0xEE; 8]);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        let err = reader.seek(SeekFrom::Current(-0x100000)).unwrap_err();
        assert_eq!(crate::errno_of(&err), -errno::EINVAL);
    }

    #[test]
    fn test_hash_mismatch_invalidates_cache() {
        let payloads = vec![payload(0)];
        let (mut content, _) = build_content(&KEY, &payloads);
        content[H3_HASHES_SIZE + 5] ^= 0xFF;
        let options = OpenOptions { validate_hashes: true };
        let mut reader = SectorHashReader::new(Cursor::new(content), KEY, &options).unwrap();
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(reader.sector, u32::MAX);
        assert_eq!(reader.tell(), 0);
    }

    #[test]
    fn test_h3_table() {
        let payloads = vec![payload(0), payload(1)];
        let (content, h3) = build_content(&KEY, &payloads);
        let options = OpenOptions { validate_hashes: true };
        let mut reader = SectorHashReader::new(Cursor::new(content.clone()), KEY, &options)
            .unwrap()
            .with_h3_table(h3.into_boxed_slice());
        let mut buf = [0u8; 16];
        reader.read_exact(&mut buf).unwrap();

        let mut reader = SectorHashReader::new(Cursor::new(content), KEY, &options)
            .unwrap()
            .with_h3_table(vec![0u8; 20].into_boxed_slice());
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_short_h3_table() {
        let payloads = vec![payload(0)];
        let (content, _) = build_content(&KEY, &payloads);
        let options = OpenOptions { validate_hashes: true };
        let mut reader = SectorHashReader::new(Cursor::new(content), KEY, &options)
            .unwrap()
            .with_h3_table(Box::default());
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(crate::errno_of(&err), -errno::EIO);
    }

    #[test]
    fn test_closed() {
        let (mut reader, _) = reader(1, false);
        reader.close();
        let mut buf = [0u8; 4];
        assert!(matches!(reader.read_decrypted(&mut buf), Err(Error::Closed)));
        assert_eq!(reader.seek_to(SeekFrom::Start(0)).unwrap_err().errno(), -errno::EBADF);
    }
}
