//! Wii U file system table (FST)

use std::{borrow::Cow, ffi::CStr, mem::size_of};

use encoding_rs::{SHIFT_JIS, WINDOWS_1252};
use zerocopy::{big_endian::*, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{static_assert, Error, Result};

/// FST magic, `"FST\0"`.
pub const FST_MAGIC: [u8; 4] = *b"FST\0";

/// FST header.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FstHeader {
    pub magic: [u8; 4],
    pub file_offset_factor: U32,
    pub secondary_header_count: U32,
    pub hash_disabled: u8,
    _pad: [u8; 19],
}

static_assert!(size_of::<FstHeader>() == 0x20);

/// Per-content secondary header.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SecondaryHeader {
    pub offset: U32,
    pub size: U32,
    pub owner_title_id: U64,
    pub group_id: U32,
    pub hash_mode: u8,
    _pad: [u8; 11],
}

static_assert!(size_of::<SecondaryHeader>() == 0x20);

/// File system node kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Node is a file.
    File,
    /// Node is a directory.
    Directory,
}

/// An individual file system node.
#[derive(Copy, Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Node {
    kind: u8,
    // u24 big-endian
    name_offset: [u8; 3],
    offset: U32,
    length: U32,
    _flags: U16,
    content_index: U16,
}

static_assert!(size_of::<Node>() == 0x10);

impl Node {
    /// Creates a file node. `offset` is in units of the FST's file offset factor.
    #[inline]
    pub fn file(name_offset: u32, offset: u32, length: u32, content_index: u16) -> Node {
        Node::new(0, name_offset, offset, length, content_index)
    }

    /// Creates a directory node. `parent` and `next` are node indexes.
    #[inline]
    pub fn directory(name_offset: u32, parent: u32, next: u32) -> Node {
        Node::new(1, name_offset, parent, next, 0)
    }

    fn new(kind: u8, name_offset: u32, offset: u32, length: u32, content_index: u16) -> Node {
        let [_, a, b, c] = name_offset.to_be_bytes();
        Node {
            kind,
            name_offset: [a, b, c],
            offset: U32::new(offset),
            length: U32::new(length),
            _flags: U16::new(0),
            content_index: U16::new(content_index),
        }
    }

    /// File system node kind.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        if self.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }

    /// Whether the node is a file.
    #[inline]
    pub fn is_file(&self) -> bool { !self.is_dir() }

    /// Whether the node is a directory.
    #[inline]
    pub fn is_dir(&self) -> bool { self.kind & 1 != 0 }

    /// Offset in the string table to the filename.
    #[inline]
    pub fn name_offset(&self) -> u32 {
        u32::from_be_bytes([0, self.name_offset[0], self.name_offset[1], self.name_offset[2]])
    }

    /// For files, the data offset divided by the file offset factor.
    ///
    /// For directories, this is the parent node index in the FST.
    #[inline]
    pub fn offset(&self) -> u32 { self.offset.get() }

    /// For files, this is the byte size of the file.
    ///
    /// For directories, this is the child end index in the FST.
    #[inline]
    pub fn length(&self) -> u64 { self.length.get() as u64 }

    /// Index of the content holding the file data.
    #[inline]
    pub fn content_index(&self) -> u16 { self.content_index.get() }
}

/// A resolved directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Node index in the FST.
    pub index: usize,
    /// Entry name. Empty for the root.
    pub name: String,
    /// File or directory.
    pub kind: NodeKind,
    /// Index of the content holding the file data.
    pub content_index: u16,
    /// Byte offset of the file data within the content.
    pub offset: u64,
    /// File size in bytes. Zero for directories.
    pub size: u64,
}

impl DirEntry {
    /// Whether the entry is a directory.
    #[inline]
    pub fn is_dir(&self) -> bool { self.kind == NodeKind::Directory }
}

/// A parsed Wii U file system table.
#[derive(Clone)]
pub struct Fst {
    data: Box<[u8]>,
    header: FstHeader,
    nodes_offset: usize,
    node_count: usize,
    string_table_offset: usize,
}

impl Fst {
    /// Parses and validates an FST.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn new(data: Box<[u8]>) -> Result<Self> {
        const MIN_SIZE: usize =
            size_of::<FstHeader>() + size_of::<SecondaryHeader>() + size_of::<Node>();
        if data.len() < MIN_SIZE {
            return Err(Error::Format(format!("FST is too small ({} bytes)", data.len())));
        }
        let Ok((header, _)) = FstHeader::read_from_prefix(data.as_ref()) else {
            return Err(Error::Format("FST header is truncated".to_string()));
        };
        if header.magic != FST_MAGIC {
            return Err(Error::Format("FST magic is invalid".to_string()));
        }

        let nodes_offset = (header.secondary_header_count.get() as usize)
            .checked_mul(size_of::<SecondaryHeader>())
            .and_then(|n| n.checked_add(size_of::<FstHeader>()))
            .filter(|&n| n < data.len())
            .ok_or_else(|| Error::Format("FST node table out of bounds".to_string()))?;
        let Ok((root, _)) = Node::read_from_prefix(&data[nodes_offset..]) else {
            return Err(Error::Format("FST root node not found".to_string()));
        };
        let node_count = root.length() as usize;
        if node_count <= 1 {
            return Err(Error::Format("FST has no entries".to_string()));
        }
        // String table starts after the last node
        let string_table_offset = node_count
            .checked_mul(size_of::<Node>())
            .and_then(|n| n.checked_add(nodes_offset))
            .filter(|&n| n < data.len())
            .ok_or_else(|| Error::Format("FST string table out of bounds".to_string()))?;
        if data[string_table_offset..].contains(&b'/') {
            return Err(Error::Format("FST string table contains '/'".to_string()));
        }
        Ok(Self { data, header, nodes_offset, node_count, string_table_offset })
    }

    /// The FST header.
    #[inline]
    pub fn header(&self) -> &FstHeader { &self.header }

    /// Secondary headers, one per content.
    #[inline]
    pub fn secondary_headers(&self) -> &[SecondaryHeader] {
        let buf = &self.data[size_of::<FstHeader>()..self.nodes_offset];
        <[SecondaryHeader]>::ref_from_bytes(buf).unwrap_or(&[])
    }

    /// The nodes in the FST.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        let buf = &self.data[self.nodes_offset..self.string_table_offset];
        <[Node]>::ref_from_bytes(buf).unwrap_or(&[])
    }

    /// The string table containing all file and directory names.
    #[inline]
    pub fn string_table(&self) -> &[u8] { &self.data[self.string_table_offset..] }

    /// Number of nodes, including the root.
    #[inline]
    pub fn node_count(&self) -> usize { self.node_count }

    /// Byte offset of a file node's data within its content.
    #[inline]
    pub fn file_offset(&self, node: &Node) -> u64 {
        node.offset() as u64 * self.header.file_offset_factor.get() as u64
    }

    /// Iterate over the nodes in the FST.
    #[inline]
    pub fn iter(&self) -> FstIter<'_> { FstIter { fst: self, idx: 1 } }

    /// Get the name of a node.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn get_name(&self, node: &Node) -> Result<Cow<'_, str>, String> {
        let string_table = self.string_table();
        let name_buf = string_table.get(node.name_offset() as usize..).ok_or_else(|| {
            format!(
                "FST: name offset {} out of bounds (string table size: {})",
                node.name_offset(),
                string_table.len()
            )
        })?;
        let c_string = CStr::from_bytes_until_nul(name_buf).map_err(|_| {
            format!("FST: name at offset {} not null-terminated", node.name_offset())
        })?;
        let bytes = c_string.to_bytes();
        let (decoded, _, errors) = SHIFT_JIS.decode(bytes);
        if !errors {
            return Ok(decoded);
        }
        Ok(WINDOWS_1252.decode(bytes).0)
    }

    /// Finds a particular file or directory by path.
    ///
    /// Names are compared case-sensitively. Empty path components are ignored, so `""` and
    /// `"/"` both name the root.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn find(&self, path: &str) -> Option<(usize, Node)> {
        let nodes = self.nodes();
        let mut components = path.split('/').filter(|s| !s.is_empty()).peekable();
        if components.peek().is_none() {
            return Some((0, nodes[0]));
        }

        let mut idx = 1;
        let mut last = self.node_count;
        while let Some(component) = components.next() {
            let is_last = components.peek().is_none();
            let mut found = None;
            while idx < last {
                let node = nodes[idx];
                if self.get_name(&node).is_ok_and(|name| name == component) {
                    found = Some((idx, node));
                    break;
                }
                if node.is_dir() {
                    // Skip directory
                    let next = node.length() as usize;
                    if next <= idx {
                        log::warn!("FST: directory {} has invalid end index {}", idx, next);
                        return None;
                    }
                    idx = next;
                } else {
                    idx += 1;
                }
            }
            let (found_idx, node) = found?;
            if is_last {
                return Some((found_idx, node));
            }
            if !node.is_dir() {
                return None;
            }
            // Descend into directory
            idx = found_idx + 1;
            last = (node.length() as usize).min(self.node_count);
        }
        None
    }

    /// Finds a file or directory by path.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn find_file(&self, path: &str) -> Result<DirEntry> {
        let (idx, node) = self.find(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
        self.entry(idx, &node)
    }

    /// Lists the immediate children of a directory.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn read_dir(&self, path: &str) -> Result<ReadDir<'_>> {
        let (idx, node) = self.find(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !node.is_dir() {
            return Err(Error::InvalidArgument(format!("{} is not a directory", path)));
        }
        let end = (node.length() as usize).min(self.node_count);
        Ok(ReadDir { fst: self, idx: idx + 1, end })
    }

    /// Sum of the sizes of all files.
    #[allow(clippy::missing_inline_in_public_items)]
    pub fn total_used_size(&self) -> u64 {
        self.nodes().iter().skip(1).filter(|n| n.is_file()).map(|n| n.length()).sum()
    }

    fn entry(&self, index: usize, node: &Node) -> Result<DirEntry> {
        let name = if index == 0 {
            String::new()
        } else {
            self.get_name(node).map_err(Error::Format)?.into_owned()
        };
        let (offset, size) =
            if node.is_dir() { (0, 0) } else { (self.file_offset(node), node.length()) };
        Ok(DirEntry {
            index,
            name,
            kind: node.kind(),
            content_index: node.content_index(),
            offset,
            size,
        })
    }
}

/// Iterator over the nodes in an FST.
pub struct FstIter<'a> {
    fst: &'a Fst,
    idx: usize,
}

impl<'a> Iterator for FstIter<'a> {
    type Item = (usize, Node, Result<Cow<'a, str>, String>);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.idx;
        let node = self.fst.nodes().get(idx).copied()?;
        let name = self.fst.get_name(&node);
        self.idx += 1;
        Some((idx, node, name))
    }
}

/// Iterator over the entries of one directory.
pub struct ReadDir<'a> {
    fst: &'a Fst,
    idx: usize,
    end: usize,
}

impl Iterator for ReadDir<'_> {
    type Item = Result<DirEntry>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.end {
            return None;
        }
        let idx = self.idx;
        let node = self.fst.nodes().get(idx).copied()?;
        self.idx = if node.is_dir() && node.length() as usize > idx {
            node.length() as usize
        } else {
            idx + 1
        };
        Some(self.fst.entry(idx, &node))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use zerocopy::FromZeros;

    use super::*;

    /// Builds an FST image from `(path, content_index, offset, size)` entries, where a path
    /// ending in `/` is a directory. Parents must precede their children.
    pub(crate) fn build_fst(entries: &[(&str, u16, u32, u32)], factor: u32) -> Vec<u8> {
        let mut strings = vec![0u8];
        let mut nodes = vec![Node::directory(0, 0, 0)];
        // Index of the directory node for each path prefix
        let mut dirs: Vec<(String, usize)> = vec![(String::new(), 0)];
        for &(path, content_index, offset, size) in entries {
            let is_dir = path.ends_with('/');
            let trimmed = path.trim_matches('/');
            let (parent_path, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
            let parent = dirs.iter().find(|(p, _)| p == parent_path).map(|(_, i)| *i).unwrap();
            let name_offset = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            if is_dir {
                dirs.push((trimmed.to_string(), nodes.len()));
                nodes.push(Node::directory(name_offset, parent as u32, 0));
            } else {
                nodes.push(Node::file(name_offset, offset / factor, size, content_index));
            }
        }
        // Directory end indexes: the first following node that is not a descendant.
        for (path, idx) in &dirs {
            let prefix = if path.is_empty() { String::new() } else { format!("{}/", path) };
            let mut end = *idx + 1;
            for (i, &(p, ..)) in entries.iter().enumerate().skip(*idx) {
                if !p.trim_start_matches('/').starts_with(&prefix) {
                    break;
                }
                end = i + 2;
            }
            nodes[*idx].length.set(end as u32);
        }
        let count = nodes.len() as u32;
        nodes[0].length.set(count);

        let mut header = FstHeader::new_zeroed();
        header.magic = FST_MAGIC;
        header.file_offset_factor.set(factor);
        header.secondary_header_count.set(1);
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(SecondaryHeader::new_zeroed().as_bytes());
        for node in &nodes {
            out.extend_from_slice(node.as_bytes());
        }
        out.extend_from_slice(&strings);
        out
    }

    fn sample() -> Fst {
        let data = build_fst(
            &[
                ("/code/", 0, 0, 0),
                ("/code/app.xml", 1, 0x20, 10),
                ("/code/cos.xml", 1, 0x40, 20),
                ("/content/", 0, 0, 0),
                ("/content/Common/", 0, 0, 0),
                ("/content/Common/a.bin", 2, 0x100, 30),
                ("/content/b.bin", 2, 0x200, 40),
                ("/meta/", 0, 0, 0),
                ("/meta/iconTex.tga", 3, 0, 50),
            ],
            0x20,
        );
        Fst::new(data.into_boxed_slice()).unwrap()
    }

    #[test]
    fn test_find() {
        let fst = sample();
        assert_eq!(fst.find("/").map(|(i, _)| i), Some(0));
        assert_eq!(fst.find("").map(|(i, _)| i), Some(0));

        let entry = fst.find_file("/content/Common/a.bin").unwrap();
        assert_eq!(entry.name, "a.bin");
        assert_eq!(entry.content_index, 2);
        assert_eq!(entry.offset, 0x100);
        assert_eq!(entry.size, 30);

        let entry = fst.find_file("meta//iconTex.tga").unwrap();
        assert_eq!(entry.content_index, 3);
        assert_eq!(entry.size, 50);

        assert!(fst.find_file("/content/b.bin").is_ok());
        assert!(fst.find_file("/content/Common/").unwrap().is_dir());
    }

    #[test]
    fn test_find_misses() {
        let fst = sample();
        assert_eq!(fst.find_file("/nonexistent").unwrap_err().errno(), -crate::errno::ENOENT);
        // Case-sensitive
        assert!(fst.find("/META/iconTex.tga").is_none());
        // A file cannot have children
        assert!(fst.find("/code/app.xml/x").is_none());
        // a.bin is not a direct child of content
        assert!(fst.find("/content/a.bin").is_none());
        assert!(fst.find("/meta/app.xml").is_none());
    }

    #[test]
    fn test_read_dir() {
        let fst = sample();
        let names: Vec<String> =
            fst.read_dir("/").unwrap().map(|e| e.unwrap().name).collect();
        assert_eq!(names, ["code", "content", "meta"]);
        let names: Vec<String> =
            fst.read_dir("/content").unwrap().map(|e| e.unwrap().name).collect();
        assert_eq!(names, ["Common", "b.bin"]);
        assert!(fst.read_dir("/code/app.xml").is_err());
        assert!(fst.read_dir("/missing").is_err());
    }

    #[test]
    fn test_iter_and_size() {
        let fst = sample();
        assert_eq!(fst.iter().count(), 9);
        assert_eq!(fst.total_used_size(), 10 + 20 + 30 + 40 + 50);
        assert_eq!(fst.secondary_headers().len(), 1);
    }

    #[test]
    fn test_invalid() {
        let good = build_fst(&[("/a", 0, 0, 1)], 1);
        assert!(Fst::new(good.clone().into_boxed_slice()).is_ok());

        let mut bad = good.clone();
        bad[0] = b'X';
        assert!(Fst::new(bad.into_boxed_slice()).is_err());

        // Slash in string table
        let mut bad = good.clone();
        let last = bad.len() - 2;
        bad[last] = b'/';
        assert!(Fst::new(bad.into_boxed_slice()).is_err());

        // Root with no entries
        let mut bad = good.clone();
        bad[0x40 + 8..0x40 + 12].copy_from_slice(&1u32.to_be_bytes());
        assert!(Fst::new(bad.into_boxed_slice()).is_err());

        // Node count past the end of the buffer
        let mut bad = good;
        bad[0x40 + 8..0x40 + 12].copy_from_slice(&1000u32.to_be_bytes());
        assert!(Fst::new(bad.into_boxed_slice()).is_err());

        assert!(Fst::new(vec![0u8; 0x30].into_boxed_slice()).is_err());
    }

    #[test]
    fn test_directory_loop() {
        let mut data = build_fst(&[("/a/", 0, 0, 0), ("/a/b", 0, 0, 1)], 1);
        // Point /a's end index back at itself.
        let node_a = 0x40 + 0x10;
        data[node_a + 8..node_a + 12].copy_from_slice(&1u32.to_be_bytes());
        let fst = Fst::new(data.into_boxed_slice()).unwrap();
        assert!(fst.find("/x").is_none());
    }
}
