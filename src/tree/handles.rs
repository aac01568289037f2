use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::{Result, S3ffsError};

#[derive(Debug)]
pub struct OpenFile {
    /// The file handle ID handed to the kernel.
    pub fh: u64,
    pub ino: u64,
    /// Open flags.
    pub flags: i32,
    /// Local copy of the object for handles opened for writing.
    pub writeback: Option<File>,
    /// Whether the local copy differs from the remote object.
    pub dirty: bool,
}

impl OpenFile {
    pub fn is_writable(&self) -> bool {
        self.writeback.is_some()
    }

    /// Whole contents of the write-back file.
    pub fn contents(&self) -> Result<Option<Vec<u8>>> {
        let Some(mut file) = self.writeback.as_ref() else {
            return Ok(None);
        };
        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }
}

pub struct HandleTable {
    handles: DashMap<u64, OpenFile>,
    next_fh: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, ino: u64, flags: i32, writeback: Option<File>, dirty: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(
            fh,
            OpenFile {
                fh,
                ino,
                flags,
                writeback,
                dirty,
            },
        );
        fh
    }

    pub fn remove(&self, fh: u64) -> Option<OpenFile> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether any handle is open on `ino`.
    pub fn is_open(&self, ino: u64) -> bool {
        self.handles.iter().any(|h| h.ino == ino)
    }

    /// Whether any open handle on `ino` holds a write-back file.
    pub fn has_writer(&self, ino: u64) -> bool {
        self.handles
            .iter()
            .any(|h| h.ino == ino && h.is_writable())
    }

    /// Read from the handle's write-back file. `Ok(None)` means the handle
    /// has no local copy and the caller must go to the bucket.
    pub fn read_local(&self, fh: u64, ino: u64, size: u32, offset: u64) -> Result<Option<Bytes>> {
        let handle = self
            .handles
            .get(&fh)
            .filter(|h| h.ino == ino)
            .ok_or(S3ffsError::BadHandle(fh))?;
        let Some(file) = handle.writeback.as_ref() else {
            return Ok(None);
        };
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Some(Bytes::new()));
        }
        let n = (size as u64).min(len - offset) as usize;
        let mut buf = vec![0u8; n];
        file.read_exact_at(&mut buf, offset)?;
        Ok(Some(Bytes::from(buf)))
    }

    pub fn write_local(&self, fh: u64, ino: u64, data: &[u8], offset: u64) -> Result<u32> {
        let mut handle = self
            .handles
            .get_mut(&fh)
            .filter(|h| h.ino == ino)
            .ok_or(S3ffsError::BadHandle(fh))?;
        let file = handle.writeback.as_ref().ok_or(S3ffsError::BadHandle(fh))?;
        file.write_all_at(data, offset)?;
        handle.dirty = true;
        Ok(data.len() as u32)
    }

    /// Resize every write-back file open on `ino`.
    pub fn truncate(&self, ino: u64, size: u64) -> Result<()> {
        for mut handle in self.handles.iter_mut().filter(|h| h.ino == ino) {
            if let Some(file) = handle.writeback.as_ref() {
                file.set_len(size)?;
                handle.dirty = true;
            }
        }
        Ok(())
    }
}
