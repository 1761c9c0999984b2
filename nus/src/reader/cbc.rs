//! AES-128 block cipher read stream.

use std::{
    io,
    io::{Read, Seek, SeekFrom},
};

use crate::{
    array_ref, crypto,
    crypto::BLOCK_SIZE,
    streams::ReadStream,
    Error, KeyBytes, Result, ResultContext,
};

/// How a [`BlockCipherReader`] transforms its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherMode {
    /// Data is returned as-is.
    Passthrough,
    /// AES-128-ECB.
    Ecb {
        /// Decryption key.
        key: KeyBytes,
    },
    /// AES-128-CBC.
    Cbc {
        /// Decryption key.
        key: KeyBytes,
        /// IV for the first block of the region.
        iv: KeyBytes,
    },
}

impl CipherMode {
    /// Selects the mode from an optional key and IV.
    ///
    /// An IV without a key is rejected.
    #[inline]
    pub fn new(key: Option<KeyBytes>, iv: Option<KeyBytes>) -> Result<Self> {
        match (key, iv) {
            (None, None) => Ok(CipherMode::Passthrough),
            (None, Some(_)) => {
                Err(Error::InvalidArgument("an IV was given without a key".to_string()))
            }
            (Some(key), None) => Ok(CipherMode::Ecb { key }),
            (Some(key), Some(iv)) => Ok(CipherMode::Cbc { key, iv }),
        }
    }

    /// Whether data is decrypted.
    #[inline]
    pub fn is_encrypted(&self) -> bool { !matches!(self, CipherMode::Passthrough) }
}

/// Decrypting read stream over `[offset, offset + length)` of a source stream.
///
/// Reads at any position and length are supported. In CBC mode the chaining value for a
/// block is taken from the ciphertext preceding it. The last ciphertext block read is kept,
/// so sequential reads never seek backwards in the source.
pub struct BlockCipherReader<R> {
    inner: Option<R>,
    offset: u64,
    length: u64,
    pos: u64,
    mode: CipherMode,
    source_pos: Option<u64>,
    last_block: Option<(u64, [u8; BLOCK_SIZE])>,
}

impl<R> BlockCipherReader<R>
where R: Read + Seek
{
    /// Creates a new reader over a region of `inner`.
    ///
    /// In ECB and CBC modes, a length that is not a multiple of 16 is rounded down.
    #[inline]
    pub fn new(inner: R, offset: u64, length: u64, mode: CipherMode) -> Result<Self> {
        let mut length = length;
        if mode.is_encrypted() {
            if !crypto::is_supported() {
                return Err(Error::Unsupported(
                    "built without the `decryption` feature".to_string(),
                ));
            }
            if length % BLOCK_SIZE as u64 != 0 {
                log::debug!(
                    "Truncating encrypted region of {:#X} bytes to a block boundary",
                    length
                );
                length &= !(BLOCK_SIZE as u64 - 1);
            }
        }
        Ok(Self {
            inner: Some(inner),
            offset,
            length,
            pos: 0,
            mode,
            source_pos: None,
            last_block: None,
        })
    }

    /// Creates a new reader from an optional key and IV. See [`CipherMode::new`].
    #[inline]
    pub fn with_key(
        inner: R,
        offset: u64,
        length: u64,
        key: Option<KeyBytes>,
        iv: Option<KeyBytes>,
    ) -> Result<Self> {
        Self::new(inner, offset, length, CipherMode::new(key, iv)?)
    }

    /// The cipher mode in use.
    #[inline]
    pub fn mode(&self) -> &CipherMode { &self.mode }

    /// Releases the source. Every later operation fails with [`Error::Closed`].
    #[inline]
    pub fn close(&mut self) { self.inner = None; }

    /// Whether the source is still open.
    #[inline]
    pub fn is_open(&self) -> bool { self.inner.is_some() }

    /// Reads and decrypts up to `buf.len()` bytes at the current position.
    ///
    /// Returns 0 at the end of the region. The position is only advanced on success.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn read_decrypted(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.is_none() {
            return Err(Error::Closed);
        }
        if self.pos >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.length - self.pos) as usize;
        let buf = &mut buf[..size];
        let pos = self.pos;
        match self.mode.clone() {
            CipherMode::Passthrough => self.read_raw(pos, buf)?,
            CipherMode::Ecb { key } => self.read_blocks(pos, buf, &key, None)?,
            CipherMode::Cbc { key, iv } => self.read_blocks(pos, buf, &key, Some(iv))?,
        }
        self.pos += size as u64;
        Ok(size)
    }

    /// Seeks to a logical position, clamped to the region length.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn seek_to(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.inner.is_none() {
            return Err(Error::Closed);
        }
        let new_pos = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(p) => self.length.checked_add_signed(p),
            SeekFrom::Current(p) => self.pos.checked_add_signed(p),
        }
        .ok_or_else(|| Error::InvalidArgument("seek to a negative position".to_string()))?;
        self.pos = new_pos.min(self.length);
        Ok(self.pos)
    }

    fn source(&mut self) -> Result<&mut R> { self.inner.as_mut().ok_or(Error::Closed) }

    /// Reads ciphertext at `pos` within the region.
    ///
    /// The source is only seeked when it is not already at the requested offset.
    fn read_raw(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset + pos;
        let seek = self.source_pos != Some(offset);
        // Unknown until the read below succeeds.
        self.source_pos = None;
        let inner = self.source()?;
        if seek {
            inner
                .seek(SeekFrom::Start(offset))
                .with_context(|| format!("Seeking to offset {:#X}", offset))?;
        }
        inner.read_exact(buf).with_context(|| {
            format!("Reading {:#X} bytes at offset {:#X}", buf.len(), offset)
        })?;
        self.source_pos = Some(offset + buf.len() as u64);
        if let Some(block) = buf.rchunks_exact(BLOCK_SIZE).next() {
            let block_pos = pos + (buf.len() - BLOCK_SIZE) as u64;
            self.last_block = Some((block_pos, *array_ref![block, 0, BLOCK_SIZE]));
        }
        Ok(())
    }

    /// Chaining value for the block starting at `block_pos`.
    fn chain_iv(&mut self, block_pos: u64, iv: KeyBytes) -> Result<KeyBytes> {
        if block_pos == 0 {
            return Ok(iv);
        }
        let prev_pos = block_pos - BLOCK_SIZE as u64;
        if let Some((pos, block)) = self.last_block {
            if pos == prev_pos {
                return Ok(block);
            }
        }
        let mut prev = [0u8; BLOCK_SIZE];
        self.read_raw(prev_pos, &mut prev)?;
        Ok(prev)
    }

    /// Decrypts the single block starting at `block_pos`.
    fn read_block(
        &mut self,
        block_pos: u64,
        key: &KeyBytes,
        iv: Option<KeyBytes>,
    ) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        self.read_raw(block_pos, &mut block)?;
        decrypt(key, self.chain(block_pos, iv)?, &mut block)?;
        Ok(block)
    }

    fn chain(&mut self, block_pos: u64, iv: Option<KeyBytes>) -> Result<Option<KeyBytes>> {
        match iv {
            Some(iv) => self.chain_iv(block_pos, iv).map(Some),
            None => Ok(None),
        }
    }

    fn read_blocks(
        &mut self,
        pos: u64,
        buf: &mut [u8],
        key: &KeyBytes,
        iv: Option<KeyBytes>,
    ) -> Result<()> {
        let mut pos = pos;
        let mut out = 0usize;

        // Leading partial block
        let head = (pos % BLOCK_SIZE as u64) as usize;
        if head != 0 {
            let block_pos = pos - head as u64;
            let block = self.read_block(block_pos, key, iv)?;
            let len = (BLOCK_SIZE - head).min(buf.len());
            buf[..len].copy_from_slice(&block[head..head + len]);
            out += len;
            pos += len as u64;
        }

        // Aligned full blocks, decrypted in place
        let full = (buf.len() - out) & !(BLOCK_SIZE - 1);
        if full != 0 {
            let chain = self.chain(pos, iv)?;
            let data = &mut buf[out..out + full];
            self.read_raw(pos, data)?;
            decrypt(key, chain, data)?;
            out += full;
            pos += full as u64;
        }

        // Trailing partial block
        let tail = buf.len() - out;
        if tail != 0 {
            let block = self.read_block(pos, key, iv)?;
            buf[out..].copy_from_slice(&block[..tail]);
        }
        Ok(())
    }
}

#[inline]
fn decrypt(key: &KeyBytes, iv: Option<KeyBytes>, data: &mut [u8]) -> Result<()> {
    match iv {
        Some(iv) => crypto::decrypt_cbc(key, iv, data),
        None => crypto::decrypt_ecb(key, data),
    }
}

impl<R> Read for BlockCipherReader<R>
where R: Read + Seek
{
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { Ok(self.read_decrypted(buf)?) }
}

impl<R> Seek for BlockCipherReader<R>
where R: Read + Seek
{
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> { Ok(self.seek_to(pos)?) }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.pos) }
}

impl<R> ReadStream for BlockCipherReader<R>
where R: Read + Seek
{
    #[inline]
    fn size(&self) -> u64 { self.length }

    #[inline]
    fn tell(&self) -> u64 { self.pos }
}
