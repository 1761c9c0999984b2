#![warn(missing_docs, clippy::missing_inline_in_public_items)]
//! Library for reading Wii U titles stored as NUS packages.
//!
//! A NUS package is a directory holding a ticket (`title.tik`), a title metadata file
//! (`title.tmd`), a certificate chain (`title.cert`) and one `.app` file per content.
//! Contents are encrypted with the title key, which is itself encrypted in the ticket
//! with a console common key. Some contents are additionally split into hashed sectors.
//!
//! Extracted title directories (`code/`, `content/`, `meta/`) are supported as well and
//! are read directly from the filesystem.
//!
//! # Examples
//!
//! Opening a package and reading a file:
//!
//! ```no_run
//! use std::io::Read;
//!
//! let keys = nus::KeyStore::load("keys.conf").expect("Failed to load keys");
//! let mut package = nus::Package::new("path/to/title", &keys)
//!     .expect("Failed to open package");
//! println!("Status: {}", package.status());
//!
//! let mut s = String::new();
//! package
//!     .open("/meta/meta.xml")
//!     .expect("Failed to open file stream")
//!     .read_to_string(&mut s)
//!     .expect("Failed to read file");
//! println!("{}", s);
//! ```

use std::io;

pub use fst::{
    DirEntry, Fst, FstHeader, FstIter, Node, NodeKind, ReadDir, SecondaryHeader, FST_MAGIC,
};
pub use icon::IconTex;
pub use keys::{CommonKey, KeyError, KeyProvider, KeyStore};
pub use package::{Degradation, Layout, Package, PackageFile, PackageStatus};
pub use reader::{
    cbc::{BlockCipherReader, CipherMode},
    h3::{SectorHashReader, H3_HASHES_SIZE, H3_SECTOR_DATA_SIZE, H3_SECTOR_SIZE},
    ContentReader,
};
pub use streams::{ReadStream, WindowedStream};
pub use title::{
    ticket::{
        Ticket, TicketFormat, TicketHeader, TicketTimeLimit, TicketV1Header, TicketV1Section,
    },
    tmd::{
        CmdGroupHeader, ContentEntry, ContentInfo, Tmd, TmdFormat, TmdHeader, CONTENT_ENCRYPTED,
        CONTENT_HASHED,
    },
    SignedHeader, TitleId,
};

pub mod crypto;
mod fst;
mod icon;
mod keys;
mod package;
mod reader;
mod streams;
mod title;
mod util;

/// AES-128 key bytes.
pub type KeyBytes = [u8; 16];

/// SHA-1 hash bytes.
pub type HashBytes = [u8; 20];

/// POSIX error numbers used by [`Error::errno`].
pub mod errno {
    /// No such file or directory.
    pub const ENOENT: i32 = 2;
    /// I/O error.
    pub const EIO: i32 = 5;
    /// Bad file descriptor.
    pub const EBADF: i32 = 9;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Operation not supported.
    pub const ENOTSUP: i32 = 95;
}

/// Error types for nus.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller passed an invalid parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A common key could not be provided or verified.
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    /// The stream was closed.
    #[error("stream is closed")]
    Closed,
    /// An error for package format related issues.
    #[error("package format error: {0}")]
    Format(String),
    /// A decryption failure, or a title key that is not available.
    #[error("decryption error: {0}")]
    Crypto(String),
    /// A path or content that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The operation needs a capability this build lacks.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A general I/O error.
    #[error("I/O error: {0}")]
    Io(String, #[source] io::Error),
    /// An unknown error.
    #[error("error: {0}")]
    Other(String),
}

impl Error {
    /// Returns the negative POSIX error code for this error.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::Key(_) => -errno::EINVAL,
            Error::Closed => -errno::EBADF,
            Error::NotFound(_) => -errno::ENOENT,
            Error::Unsupported(_) => -errno::ENOTSUP,
            Error::Io(_, e) => errno_of(e),
            Error::Format(_) | Error::Crypto(_) | Error::Other(_) => -errno::EIO,
        }
    }
}

/// Returns the negative POSIX error code for an I/O error produced by this crate's streams.
///
/// Errors raised by the readers carry an [`Error`], which is mapped directly. Other errors
/// are mapped by kind.
#[allow(clippy::missing_inline_in_public_items)]
pub fn errno_of(e: &io::Error) -> i32 {
    if let Some(inner) = e.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
        return inner.errno();
    }
    match e.kind() {
        io::ErrorKind::NotFound => -errno::ENOENT,
        io::ErrorKind::InvalidInput => -errno::EINVAL,
        io::ErrorKind::Unsupported => -errno::ENOTSUP,
        _ => -errno::EIO,
    }
}

impl From<Error> for io::Error {
    #[inline]
    fn from(e: Error) -> io::Error {
        let kind = match &e {
            Error::Io(_, inner) => inner.kind(),
            Error::InvalidArgument(_) | Error::Key(_) => io::ErrorKind::InvalidInput,
            Error::NotFound(_) => io::ErrorKind::NotFound,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            Error::Format(_) | Error::Crypto(_) => io::ErrorKind::InvalidData,
            Error::Closed | Error::Other(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(s: &str) -> Error { Error::Other(s.to_string()) }
}

impl From<String> for Error {
    #[inline]
    fn from(s: String) -> Error { Error::Other(s) }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for io::Error {
    #[inline]
    fn context(self, context: impl Into<String>) -> Error { Error::Io(context.into(), self) }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}

/// Options for opening a package.
#[derive(Default, Debug, Clone)]
pub struct OpenOptions {
    /// Validate H0/H1/H2 (and H3, when the `.h3` table is present) hashes of sector-hashed
    /// contents while reading.
    pub validate_hashes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), -errno::ENOENT);
        assert_eq!(Error::Closed.errno(), -errno::EBADF);
        assert_eq!(Error::Crypto("x".into()).errno(), -errno::EIO);
        assert_eq!(Error::Unsupported("x".into()).errno(), -errno::ENOTSUP);
        assert_eq!(Error::InvalidArgument("x".into()).errno(), -errno::EINVAL);
    }

    #[test]
    fn test_errno_through_io_error() {
        let e: io::Error = Error::NotFound("/nonexistent".into()).into();
        assert_eq!(e.kind(), io::ErrorKind::NotFound);
        assert_eq!(errno_of(&e), -errno::ENOENT);

        let e: io::Error = Error::Closed.into();
        assert_eq!(errno_of(&e), -errno::EBADF);

        let e = io::Error::from(io::ErrorKind::UnexpectedEof).context("Reading sector");
        assert_eq!(e.errno(), -errno::EIO);
    }
}
