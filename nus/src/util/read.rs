use std::{fs::File, io, io::Read, path::Path};

use zerocopy::{FromBytes, FromZeros, IntoBytes};

#[inline(always)]
pub(crate) fn read_box_slice<T, R>(reader: &mut R, count: usize) -> io::Result<Box<[T]>>
where
    T: FromBytes + IntoBytes,
    R: Read + ?Sized,
{
    let mut ret = <[T]>::new_box_zeroed_with_elems(count)
        .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    reader.read_exact(ret.as_mut().as_mut_bytes())?;
    Ok(ret)
}

/// Reads a whole file into memory, refusing files larger than `limit` bytes.
pub(crate) fn read_file_limited(path: &Path, limit: u64) -> io::Result<Box<[u8]>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file is too large ({} bytes, limit {})", len, limit),
        ));
    }
    read_box_slice(&mut file, len as usize)
}
