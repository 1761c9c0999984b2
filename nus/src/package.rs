//! NUS package and extracted title access.

use std::{
    fmt,
    fs::File,
    io,
    io::{BufReader, Read, Seek, SeekFrom},
    path::{Component, Path, PathBuf},
};

use crate::{
    fst::Fst,
    icon::IconTex,
    keys::KeyProvider,
    reader::{
        cbc::{BlockCipherReader, CipherMode},
        h3::SectorHashReader,
        ContentReader,
    },
    streams::{ReadStream, WindowedStream},
    title::{
        ticket::Ticket,
        tmd::{ContentEntry, Tmd},
    },
    util::read::read_file_limited,
    Error, KeyBytes, OpenOptions, Result, ResultContext,
};

const TICKET_NAME: &str = "title.tik";
const TMD_NAME: &str = "title.tmd";
const CERT_NAME: &str = "title.cert";
const ICON_PATH: &str = "/meta/iconTex.tga";

const NUS_FILES: [&str; 3] = [TICKET_NAME, TMD_NAME, CERT_NAME];
const EXTRACTED_FILES: [&str; 3] = ["code/app.xml", "code/cos.xml", "meta/meta.xml"];

const MAX_FST_SIZE: u64 = 0x100000;
// 20 bytes per 256 MiB of content (64 GiB).
const MAX_H3_SIZE: u64 = 0x1400;

/// How a title is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Encrypted NUS package: ticket, TMD, certificates and `.app` contents.
    Nus,
    /// Extracted title with `code/`, `content/` and `meta/` directories.
    Extracted,
}

impl fmt::Display for Layout {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Nus => write!(f, "NUS package"),
            Layout::Extracted => write!(f, "Extracted title"),
        }
    }
}

/// Why a package could only be partially loaded.
#[derive(Debug)]
pub enum Degradation {
    /// The title key could not be decrypted.
    TitleKey(Error),
    /// The TMD has no usable content table. (vWii titles, or an empty group 0)
    NoContentTable,
    /// The file system table could not be loaded.
    Index(Error),
}

/// Result of loading a package.
///
/// Structurally invalid packages fail to open, so only the valid and degraded states are
/// represented here.
#[derive(Debug)]
pub enum PackageStatus {
    /// Every component was loaded.
    Valid,
    /// The ticket and TMD are available, but files cannot be read.
    Degraded(Degradation),
}

impl PackageStatus {
    /// Whether the package was fully loaded.
    #[inline]
    pub fn is_valid(&self) -> bool { matches!(self, PackageStatus::Valid) }
}

impl fmt::Display for PackageStatus {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageStatus::Valid => write!(f, "Valid"),
            PackageStatus::Degraded(Degradation::TitleKey(e)) => {
                write!(f, "Degraded (title key unavailable: {})", e)
            }
            PackageStatus::Degraded(Degradation::NoContentTable) => {
                write!(f, "Degraded (no content table)")
            }
            PackageStatus::Degraded(Degradation::Index(e)) => {
                write!(f, "Degraded (file system table unavailable: {})", e)
            }
        }
    }
}

/// An open title.
///
/// This is the primary entry point for reading packages.
pub struct Package {
    path: PathBuf,
    layout: Layout,
    ticket: Option<Ticket>,
    tmd: Option<Tmd>,
    title_key: Option<KeyBytes>,
    contents: Vec<ContentEntry>,
    readers: Vec<Option<ContentReader>>,
    fst: Option<Fst>,
    status: PackageStatus,
    options: OpenOptions,
}

impl Package {
    /// Detects the layout of a title directory.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn detect<P: AsRef<Path>>(path: P) -> Option<Layout> {
        let path = path.as_ref();
        if NUS_FILES.iter().all(|name| path.join(name).is_file()) {
            Some(Layout::Nus)
        } else if EXTRACTED_FILES.iter().all(|name| path.join(name).is_file()) {
            Some(Layout::Extracted)
        } else {
            None
        }
    }

    /// Opens a title directory.
    #[inline]
    pub fn new<P: AsRef<Path>>(path: P, keys: &dyn KeyProvider) -> Result<Package> {
        Package::new_with_options(path, keys, &OpenOptions::default())
    }

    /// Opens a title directory with custom options.
    ///
    /// A NUS package with a missing or invalid ticket or TMD fails to open. Later failures
    /// (title key, content table, file system table) leave the package in a
    /// [`PackageStatus::Degraded`] state where the ticket and TMD remain accessible.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn new_with_options<P: AsRef<Path>>(
        path: P,
        keys: &dyn KeyProvider,
        options: &OpenOptions,
    ) -> Result<Package> {
        let path = path.as_ref().to_path_buf();
        let layout = Package::detect(&path).ok_or_else(|| {
            Error::NotFound(format!("{}: not a NUS package or extracted title", path.display()))
        })?;
        log::debug!("Detected {} at {}", layout, path.display());

        let (ticket, tmd) = match layout {
            Layout::Nus => {
                let ticket = Ticket::load(&path.join(TICKET_NAME))?;
                let tmd = Tmd::load(&path.join(TMD_NAME))?;
                (Some(ticket), Some(tmd))
            }
            Layout::Extracted => {
                let code = path.join("code");
                (
                    load_optional(&code.join(TICKET_NAME), Ticket::load),
                    load_optional(&code.join(TMD_NAME), Tmd::load),
                )
            }
        };

        let mut package = Package {
            path,
            layout,
            ticket,
            tmd,
            title_key: None,
            contents: Vec::new(),
            readers: Vec::new(),
            fst: None,
            status: PackageStatus::Valid,
            options: options.clone(),
        };
        if layout == Layout::Nus {
            package.status = package.load_nus(keys);
            if let PackageStatus::Degraded(_) = &package.status {
                log::warn!("{}: {}", package.path.display(), package.status);
            }
        }
        Ok(package)
    }

    fn load_nus(&mut self, keys: &dyn KeyProvider) -> PackageStatus {
        let (Some(ticket), Some(tmd)) = (&self.ticket, &self.tmd) else {
            return PackageStatus::Degraded(Degradation::NoContentTable);
        };
        match ticket.decrypt_title_key(keys) {
            Ok(key) => self.title_key = Some(key),
            Err(e) => return PackageStatus::Degraded(Degradation::TitleKey(e)),
        }
        log::debug!("Decrypted title key for {}", ticket.title_id());

        if tmd.format_version() == 0 {
            return PackageStatus::Degraded(Degradation::NoContentTable);
        }
        let contents = tmd.contents_v1(0).to_vec();
        if contents.is_empty() {
            return PackageStatus::Degraded(Degradation::NoContentTable);
        }
        log::debug!("Loaded {} content entries", contents.len());
        self.readers = contents.iter().map(|_| None).collect();
        self.contents = contents;

        match self.load_fst() {
            Ok(fst) => {
                log::debug!("Loaded file system table with {} nodes", fst.node_count());
                self.fst = Some(fst);
                PackageStatus::Valid
            }
            Err(e) => PackageStatus::Degraded(Degradation::Index(e)),
        }
    }

    fn load_fst(&mut self) -> Result<Fst> {
        // The FST lives in the content with index 0, regardless of the boot index.
        let idx = self
            .contents
            .iter()
            .position(|c| c.index == 0)
            .ok_or_else(|| Error::Format("no content with index 0".to_string()))?;
        let reader = self.open_content_file(idx)?;
        let size = reader.size();
        if size == 0 || size > MAX_FST_SIZE {
            return Err(Error::Format(format!("invalid file system table size {:#X}", size)));
        }
        let mut buf = vec![0u8; size as usize];
        reader.seek(SeekFrom::Start(0)).context("Seeking to file system table")?;
        reader.read_exact(&mut buf).context("Reading file system table")?;
        Fst::new(buf.into_boxed_slice())
    }

    /// Returns the read stream for a content, by its position in [`Package::contents`].
    ///
    /// Streams are opened on first use and cached.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn open_content_file(&mut self, idx: usize) -> Result<&mut ContentReader> {
        if idx >= self.contents.len() {
            return Err(Error::NotFound(format!("content {} not in content table", idx)));
        }
        let reader = match self.readers[idx].take() {
            Some(reader) => reader,
            None => self.create_reader(idx)?,
        };
        Ok(self.readers[idx].insert(reader))
    }

    fn create_reader(&self, idx: usize) -> Result<ContentReader> {
        let entry = &self.contents[idx];
        let path = self.content_path(entry.content_id, "app").ok_or_else(|| {
            Error::NotFound(format!(
                "{:08x}.app not found in {}",
                entry.content_id,
                self.path.display()
            ))
        })?;
        log::debug!("Opening content {} ({})", entry.index, path.display());
        let mut file = BufReader::new(
            File::open(&path).with_context(|| format!("Opening {}", path.display()))?,
        );

        let key = if entry.is_hashed() || entry.is_encrypted() {
            Some(self.title_key.ok_or_else(|| {
                Error::Crypto(format!(
                    "content {} is encrypted and no title key is available",
                    entry.index
                ))
            })?)
        } else {
            None
        };

        let reader = match key {
            Some(key) if entry.is_hashed() => {
                let mut reader = SectorHashReader::new(file, key, &self.options)?;
                if self.options.validate_hashes {
                    if let Some(h3_path) = self.content_path(entry.content_id, "h3") {
                        let table = read_file_limited(&h3_path, MAX_H3_SIZE)
                            .with_context(|| format!("Reading {}", h3_path.display()))?;
                        reader = reader.with_h3_table(table);
                    }
                }
                ContentReader::Hashed(reader)
            }
            Some(key) => {
                let len = file.seek(SeekFrom::End(0)).context("Determining content size")?;
                let mut iv: KeyBytes = [0; 16];
                iv[..2].copy_from_slice(&entry.index.to_be_bytes());
                ContentReader::Cipher(BlockCipherReader::new(
                    file,
                    0,
                    len,
                    CipherMode::Cbc { key, iv },
                )?)
            }
            None => {
                let len = file.seek(SeekFrom::End(0)).context("Determining content size")?;
                let reader = BlockCipherReader::new(file, 0, len, CipherMode::Passthrough)?;
                ContentReader::Cipher(reader)
            }
        };
        Ok(reader)
    }

    /// Finds `{id:08x}.{ext}`, falling back to the upper-case name.
    fn content_path(&self, content_id: u32, ext: &str) -> Option<PathBuf> {
        [format!("{:08x}.{}", content_id, ext), format!("{:08X}.{}", content_id, ext)]
            .into_iter()
            .map(|name| self.path.join(name))
            .find(|path| path.is_file())
    }

    /// Opens a file by path.
    ///
    /// Paths are absolute within the title, e.g. `/meta/meta.xml`.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn open(&mut self, path: &str) -> Result<PackageFile<'_>> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("empty path".to_string()));
        }
        match self.layout {
            Layout::Extracted => self.open_extracted(path),
            Layout::Nus => self.open_nus(path),
        }
    }

    fn open_extracted(&self, path: &str) -> Result<PackageFile<'static>> {
        let relative = Path::new(path.trim_start_matches(['/', '\\']));
        if relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
            return Err(Error::InvalidArgument(format!("invalid path {}", path)));
        }
        let full_path = self.path.join(relative);
        let file =
            File::open(&full_path).with_context(|| format!("Opening {}", full_path.display()))?;
        let metadata =
            file.metadata().with_context(|| format!("Reading {}", full_path.display()))?;
        if metadata.is_dir() {
            return Err(Error::InvalidArgument(format!("{} is a directory", path)));
        }
        let stream = WindowedStream::new(BufReader::new(file), 0, metadata.len())
            .with_context(|| format!("Opening {}", full_path.display()))?;
        Ok(PackageFile::Extracted(stream))
    }

    fn open_nus(&mut self, path: &str) -> Result<PackageFile<'_>> {
        let entry = match &self.fst {
            Some(fst) => fst.find_file(path)?,
            None if self.title_key.is_none() => {
                return Err(Error::Crypto("title key is not available".to_string()))
            }
            None if self.contents.is_empty() => {
                return Err(Error::NotFound("package has no content table".to_string()))
            }
            None => return Err(Error::Format("file system table is not loaded".to_string())),
        };
        if entry.is_dir() {
            return Err(Error::InvalidArgument(format!("{} is a directory", path)));
        }
        let reader = self.open_content_file(entry.content_index as usize)?;
        if entry.offset.saturating_add(entry.size) > reader.size() {
            return Err(Error::Format(format!(
                "{} extends past the end of content {}",
                path, entry.content_index
            )));
        }
        let stream = reader
            .new_window(entry.offset, entry.size)
            .with_context(|| format!("Opening {}", path))?;
        Ok(PackageFile::Content(stream))
    }

    /// Reads a whole file by path. See [`Package::open`].
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path)?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf).with_context(|| format!("Reading {}", path))?;
        Ok(buf)
    }

    /// Loads the title icon from `/meta/iconTex.tga`.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn load_icon(&mut self) -> Result<IconTex> {
        if self.tmd.as_ref().is_some_and(|tmd| tmd.format_version() == 0) {
            return Err(Error::NotFound("vWii titles have no icon".to_string()));
        }
        IconTex::parse(self.read_file(ICON_PATH)?)
    }

    /// How the title is stored.
    #[inline]
    pub fn layout(&self) -> Layout { self.layout }

    /// The title directory.
    #[inline]
    pub fn path(&self) -> &Path { &self.path }

    /// Load status.
    #[inline]
    pub fn status(&self) -> &PackageStatus { &self.status }

    /// The ticket, if loaded.
    #[inline]
    pub fn ticket(&self) -> Option<&Ticket> { self.ticket.as_ref() }

    /// The TMD, if loaded.
    #[inline]
    pub fn tmd(&self) -> Option<&Tmd> { self.tmd.as_ref() }

    /// Content entries of content group 0. Empty for extracted titles.
    #[inline]
    pub fn contents(&self) -> &[ContentEntry] { &self.contents }

    /// The file system table, if loaded.
    #[inline]
    pub fn fst(&self) -> Option<&Fst> { self.fst.as_ref() }

    /// Whether the title key was decrypted.
    #[inline]
    pub fn has_title_key(&self) -> bool { self.title_key.is_some() }
}

fn load_optional<T>(path: &Path, load: fn(&Path) -> Result<T>) -> Option<T> {
    if !path.is_file() {
        log::debug!("{} not present", path.display());
        return None;
    }
    match load(path) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {}: {}", path.display(), e);
            None
        }
    }
}

/// A read stream over one file of a package.
pub enum PackageFile<'a> {
    /// A file within a content, borrowing the package's reader.
    Content(WindowedStream<&'a mut ContentReader>),
    /// A file of an extracted title.
    Extracted(WindowedStream<BufReader<File>>),
}

impl Read for PackageFile<'_> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PackageFile::Content(s) => s.read(buf),
            PackageFile::Extracted(s) => s.read(buf),
        }
    }
}

impl Seek for PackageFile<'_> {
    #[inline]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            PackageFile::Content(s) => s.seek(pos),
            PackageFile::Extracted(s) => s.seek(pos),
        }
    }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.tell()) }
}

impl ReadStream for PackageFile<'_> {
    #[inline]
    fn size(&self) -> u64 {
        match self {
            PackageFile::Content(s) => s.size(),
            PackageFile::Extracted(s) => s.size(),
        }
    }

    #[inline]
    fn tell(&self) -> u64 {
        match self {
            PackageFile::Content(s) => s.tell(),
            PackageFile::Extracted(s) => s.tell(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{errno, keys::KeyStore};

    fn extracted_title() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("code")).unwrap();
        fs::create_dir_all(dir.path().join("meta")).unwrap();
        fs::create_dir_all(dir.path().join("content/sub")).unwrap();
        fs::write(dir.path().join("code/app.xml"), b"<app/>").unwrap();
        fs::write(dir.path().join("code/cos.xml"), b"<app/>").unwrap();
        fs::write(dir.path().join("meta/meta.xml"), b"<menu/>").unwrap();
        fs::write(dir.path().join("content/sub/data.bin"), b"0123456789").unwrap();
        dir
    }

    fn error_code(result: Result<PackageFile<'_>>) -> Option<i32> {
        result.err().map(|e| e.errno())
    }

    #[test]
    fn test_detect() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Package::detect(dir.path()), None);
        for name in NUS_FILES {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(Package::detect(dir.path()), Some(Layout::Nus));
        assert_eq!(Package::detect(extracted_title().path()), Some(Layout::Extracted));
    }

    #[test]
    fn test_not_a_package() {
        let dir = tempfile::tempdir().unwrap();
        let err = Package::new(dir.path(), &KeyStore::new()).err().unwrap();
        assert_eq!(err.errno(), -errno::ENOENT);
    }

    #[test]
    fn test_extracted() {
        let dir = extracted_title();
        let mut package = Package::new(dir.path(), &KeyStore::new()).unwrap();
        assert_eq!(package.layout(), Layout::Extracted);
        assert!(package.status().is_valid());
        assert!(package.ticket().is_none());
        assert!(package.tmd().is_none());
        assert!(package.contents().is_empty());

        assert_eq!(package.read_file("/content/sub/data.bin").unwrap(), b"0123456789");
        assert_eq!(package.read_file("content/sub/data.bin").unwrap(), b"0123456789");

        let mut file = package.open("/content/sub/data.bin").unwrap();
        assert_eq!(file.size(), 10);
        file.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");
    }

    #[test]
    fn test_extracted_invalid_paths() {
        let dir = extracted_title();
        let mut package = Package::new(dir.path(), &KeyStore::new()).unwrap();
        assert_eq!(error_code(package.open("")), Some(-errno::EINVAL));
        assert_eq!(error_code(package.open("/content/../code/app.xml")), Some(-errno::EINVAL));
        assert_eq!(error_code(package.open("/content/sub")), Some(-errno::EINVAL));
        assert_eq!(error_code(package.open("/nonexistent")), Some(-errno::ENOENT));
    }

    #[test]
    fn test_extracted_invalid_ticket_ignored() {
        let dir = extracted_title();
        fs::write(dir.path().join("code/title.tik"), b"garbage").unwrap();
        let package = Package::new(dir.path(), &KeyStore::new()).unwrap();
        assert!(package.ticket().is_none());
        assert!(package.status().is_valid());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(PackageStatus::Valid.to_string(), "Valid");
        let status = PackageStatus::Degraded(Degradation::NoContentTable);
        assert!(!status.is_valid());
        assert_eq!(status.to_string(), "Degraded (no content table)");
    }
}
