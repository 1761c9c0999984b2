//! Common stream types.

use std::{
    io,
    io::{Read, Seek, SeekFrom},
};

/// A random-access read stream with a known logical size.
pub trait ReadStream: Read + Seek {
    /// Logical size of the stream in bytes.
    fn size(&self) -> u64;

    /// Current logical position.
    fn tell(&self) -> u64;

    /// Creates a windowed read sub-stream with offset and size.
    ///
    /// Seeks underlying stream immediately.
    #[inline]
    fn new_window(&mut self, offset: u64, size: u64) -> io::Result<WindowedStream<&mut Self>>
    where Self: Sized {
        WindowedStream::new(self, offset, size)
    }
}

impl<T> ReadStream for &mut T
where T: ReadStream + ?Sized
{
    #[inline]
    fn size(&self) -> u64 { (**self).size() }

    #[inline]
    fn tell(&self) -> u64 { (**self).tell() }
}

/// A read stream with a fixed window.
#[derive(Clone)]
pub struct WindowedStream<T>
where T: Read + Seek
{
    base: T,
    pos: u64,
    begin: u64,
    end: u64,
}

impl<T> WindowedStream<T>
where T: Read + Seek
{
    /// Creates a new windowed stream with offset and size.
    ///
    /// Seeks underlying stream immediately.
    #[inline]
    pub fn new(mut base: T, offset: u64, size: u64) -> io::Result<Self> {
        base.seek(SeekFrom::Start(offset))?;
        Ok(Self { base, pos: offset, begin: offset, end: offset.saturating_add(size) })
    }
}

impl<T> Read for WindowedStream<T>
where T: Read + Seek
{
    #[inline]
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let limit = self.end.saturating_sub(self.pos);
        if limit == 0 {
            return Ok(0);
        }
        let len = (out.len() as u64).min(limit) as usize;
        let read = self.base.read(&mut out[..len])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<T> Seek for WindowedStream<T>
where T: Read + Seek
{
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut pos = match pos {
            SeekFrom::Start(p) => self.begin.saturating_add(p),
            SeekFrom::End(p) => self.end.saturating_add_signed(p),
            SeekFrom::Current(p) => self.pos.saturating_add_signed(p),
        };
        if pos < self.begin {
            pos = self.begin;
        } else if pos > self.end {
            pos = self.end;
        }
        let result = self.base.seek(SeekFrom::Start(pos))?;
        self.pos = result;
        Ok(result - self.begin)
    }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.pos - self.begin) }
}

impl<T> ReadStream for WindowedStream<T>
where T: Read + Seek
{
    #[inline]
    fn size(&self) -> u64 { self.end - self.begin }

    #[inline]
    fn tell(&self) -> u64 { self.pos - self.begin }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_window_bounds() {
        let data: Vec<u8> = (0..32u8).collect();
        let mut stream = WindowedStream::new(Cursor::new(data), 8, 8).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.size(), 8);

        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 6);
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[14, 15]);

        // Seeks clamp to the window.
        assert_eq!(stream.seek(SeekFrom::Current(-100)).unwrap(), 0);
        assert_eq!(stream.seek(SeekFrom::Start(100)).unwrap(), 8);
        assert_eq!(stream.tell(), 8);
    }
}
