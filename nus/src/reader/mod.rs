//! Content read streams.

use std::{
    fs::File,
    io,
    io::{BufReader, Read, Seek, SeekFrom},
};

use crate::streams::ReadStream;

pub(crate) mod cbc;
pub(crate) mod h3;

use cbc::BlockCipherReader;
use h3::SectorHashReader;

/// A decrypting read stream over one content file.
pub enum ContentReader<R = BufReader<File>> {
    /// Plain, ECB or CBC content.
    Cipher(BlockCipherReader<R>),
    /// Sector-hashed content.
    Hashed(SectorHashReader<R>),
}

impl<R> ContentReader<R>
where R: Read + Seek
{
    /// Whether the content is sector-hashed.
    #[inline]
    pub fn is_hashed(&self) -> bool { matches!(self, ContentReader::Hashed(_)) }
}

impl<R> Read for ContentReader<R>
where R: Read + Seek
{
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ContentReader::Cipher(r) => r.read(buf),
            ContentReader::Hashed(r) => r.read(buf),
        }
    }
}

impl<R> Seek for ContentReader<R>
where R: Read + Seek
{
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ContentReader::Cipher(r) => r.seek(pos),
            ContentReader::Hashed(r) => r.seek(pos),
        }
    }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.tell()) }
}

impl<R> ReadStream for ContentReader<R>
where R: Read + Seek
{
    #[inline]
    fn size(&self) -> u64 {
        match self {
            ContentReader::Cipher(r) => r.size(),
            ContentReader::Hashed(r) => r.size(),
        }
    }

    #[inline]
    fn tell(&self) -> u64 {
        match self {
            ContentReader::Cipher(r) => r.tell(),
            ContentReader::Hashed(r) => r.tell(),
        }
    }
}
