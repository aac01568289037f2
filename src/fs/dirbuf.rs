//! Directory buffers in the kernel's `fuse_dirent` layout.
//!
//! Each entry is `ino: u64, off: u64, namelen: u32, type: u32, name`, padded
//! with zeroes to an 8-byte boundary, all in native byte order. `off` is the
//! buffer length just after the entry, so it is also the offset at which the
//! kernel resumes the next `readdir`.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use crate::tree::EntryKind;

const HEADER_LEN: usize = 24;
const ALIGN: usize = 8;

const DT_DIR: u32 = 4;
const DT_REG: u32 = 8;

fn dirent_type(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Directory => DT_DIR,
        EntryKind::File => DT_REG,
    }
}

fn kind_of(dtype: u32) -> EntryKind {
    if dtype == DT_DIR {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

/// Serialized size of one entry with a name of `name_len` bytes.
pub fn entry_size(name_len: usize) -> usize {
    (HEADER_LEN + name_len + ALIGN - 1) & !(ALIGN - 1)
}

/// Append-only directory listing buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirBuffer {
    bytes: Vec<u8>,
}

impl DirBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry and return the new buffer end, which is the entry's
    /// resume offset.
    pub fn push(&mut self, name: &str, ino: u64, kind: EntryKind) -> u64 {
        let name = name.as_bytes();
        let start = self.bytes.len();
        let size = entry_size(name.len());
        let end = (start + size) as u64;

        self.bytes.resize(start + size, 0);
        let entry = &mut self.bytes[start..];
        entry[0..8].copy_from_slice(&ino.to_ne_bytes());
        entry[8..16].copy_from_slice(&end.to_ne_bytes());
        entry[16..20].copy_from_slice(&(name.len() as u32).to_ne_bytes());
        entry[20..24].copy_from_slice(&dirent_type(kind).to_ne_bytes());
        entry[HEADER_LEN..HEADER_LEN + name.len()].copy_from_slice(name);
        end
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes `[offset, offset + size)`, clipped to the buffer. Empty once
    /// `offset` reaches the end.
    pub fn slice(&self, offset: u64, size: usize) -> &[u8] {
        let len = self.bytes.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size).min(len);
        &self.bytes[start..end]
    }

    /// Decode entries starting at entry boundary `offset`.
    pub fn entries_from(&self, offset: u64) -> DirEntries<'_> {
        let pos = usize::try_from(offset).unwrap_or(usize::MAX);
        DirEntries {
            bytes: &self.bytes,
            pos: pos.min(self.bytes.len()),
        }
    }
}

/// One decoded directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub ino: u64,
    /// Offset of the entry after this one.
    pub next_offset: u64,
    pub kind: EntryKind,
    pub name: &'a OsStr,
}

pub struct DirEntries<'a> {
    bytes: &'a [u8],
    pos: usize,
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_ne_bytes(raw)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_ne_bytes(raw)
}

impl<'a> Iterator for DirEntries<'a> {
    type Item = DirEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.bytes.get(self.pos..)?;
        if rest.len() < HEADER_LEN {
            return None;
        }
        let name_len = read_u32(&rest[16..]) as usize;
        let size = entry_size(name_len);
        if rest.len() < size {
            return None;
        }
        let entry = DirEntry {
            ino: read_u64(rest),
            next_offset: read_u64(&rest[8..]),
            kind: kind_of(read_u32(&rest[20..])),
            name: OsStr::from_bytes(&rest[HEADER_LEN..HEADER_LEN + name_len]),
        };
        self.pos += size;
        Some(entry)
    }
}
