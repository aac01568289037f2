//! Reply codec: turns directory-tree results into kernel replies.
//!
//! Every failure is reported to the kernel as `ENOENT`, except `readdir` on
//! something that is not a directory (`ENOTDIR`). The underlying cause only
//! reaches the log.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fuser::{Errno, FileAttr, FileHandle, FopenFlags, Generation, INodeNo};
use tracing::debug;

use super::dirbuf::DirBuffer;
use super::TTL;
use crate::error::{Result, S3ffsError};
use crate::tree::{EntryKind, NodeAttr};

const BLOCK_SIZE: u32 = 512;

/// Kernel-visible failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    NotDirectory,
    /// Request could not be delivered to the dispatcher.
    Io,
}

impl Fault {
    pub fn errno(self) -> Errno {
        match self {
            Fault::NotFound => Errno::ENOENT,
            Fault::NotDirectory => Errno::ENOTDIR,
            Fault::Io => Errno::EIO,
        }
    }
}

/// A pending kernel reply. Consuming `self` makes a second reply impossible.
pub trait Replier: Send + 'static {
    fn error(self: Box<Self>, fault: Fault);
}

pub trait EntrySink: Replier {
    fn entry(self: Box<Self>, ttl: &Duration, attr: &FileAttr);
}

pub trait AttrSink: Replier {
    fn attr(self: Box<Self>, ttl: &Duration, attr: &FileAttr);
}

pub trait OpenSink: Replier {
    fn opened(self: Box<Self>, fh: u64);
}

pub trait CreateSink: Replier {
    fn created(self: Box<Self>, ttl: &Duration, attr: &FileAttr, fh: u64);
}

pub trait DataSink: Replier {
    fn data(self: Box<Self>, data: &[u8]);
}

pub trait WriteSink: Replier {
    fn written(self: Box<Self>, size: u32);
}

pub trait EmptySink: Replier {
    fn ok(self: Box<Self>);
}

pub trait DirSink: Replier {
    /// Add one entry; returns `true` once the kernel buffer is full and the
    /// entry was not added.
    fn add(&mut self, ino: u64, offset: u64, kind: EntryKind, name: &OsStr) -> bool;

    fn ok(self: Box<Self>);
}

macro_rules! impl_replier {
    ($($ty:ty),* $(,)?) => {
        $(impl Replier for $ty {
            fn error(self: Box<Self>, fault: Fault) {
                // Inherent fuser method, not this trait method.
                <$ty>::error(*self, fault.errno());
            }
        })*
    };
}

impl_replier!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyOpen,
    fuser::ReplyCreate,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyDirectory,
);

impl EntrySink for fuser::ReplyEntry {
    fn entry(self: Box<Self>, ttl: &Duration, attr: &FileAttr) {
        fuser::ReplyEntry::entry(*self, ttl, attr, Generation(0));
    }
}

impl AttrSink for fuser::ReplyAttr {
    fn attr(self: Box<Self>, ttl: &Duration, attr: &FileAttr) {
        fuser::ReplyAttr::attr(*self, ttl, attr);
    }
}

impl OpenSink for fuser::ReplyOpen {
    fn opened(self: Box<Self>, fh: u64) {
        fuser::ReplyOpen::opened(*self, FileHandle(fh), FopenFlags::empty());
    }
}

impl CreateSink for fuser::ReplyCreate {
    fn created(self: Box<Self>, ttl: &Duration, attr: &FileAttr, fh: u64) {
        fuser::ReplyCreate::created(*self, ttl, attr, Generation(0), FileHandle(fh), FopenFlags::empty());
    }
}

impl DataSink for fuser::ReplyData {
    fn data(self: Box<Self>, data: &[u8]) {
        fuser::ReplyData::data(*self, data);
    }
}

impl WriteSink for fuser::ReplyWrite {
    fn written(self: Box<Self>, size: u32) {
        fuser::ReplyWrite::written(*self, size);
    }
}

impl EmptySink for fuser::ReplyEmpty {
    fn ok(self: Box<Self>) {
        fuser::ReplyEmpty::ok(*self);
    }
}

impl DirSink for fuser::ReplyDirectory {
    fn add(&mut self, ino: u64, offset: u64, kind: EntryKind, name: &OsStr) -> bool {
        fuser::ReplyDirectory::add(self, INodeNo(ino), offset, kind.into(), name)
    }

    fn ok(self: Box<Self>) {
        fuser::ReplyDirectory::ok(*self);
    }
}

fn log_failure(op: &'static str, err: &S3ffsError) {
    debug!(op, "replying error: {}", err);
}

/// Encodes tree results into replies, owning the attribute defaults that the
/// tree does not track.
#[derive(Debug, Clone, Copy)]
pub struct ReplyCodec {
    uid: u32,
    gid: u32,
}

impl ReplyCodec {
    pub fn for_current_user() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    pub fn with_owner(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
        FileAttr {
            ino: INodeNo(attr.ino),
            size: attr.size,
            blocks: attr.size.div_ceil(BLOCK_SIZE as u64),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.ctime,
            kind: attr.kind.into(),
            perm: attr.perm,
            // A directory counts its own "." besides the parent's entry.
            nlink: match attr.kind {
                EntryKind::Directory => 2,
                EntryKind::File => 1,
            },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    pub fn entry(&self, op: &'static str, result: Result<NodeAttr>, sink: Box<dyn EntrySink>) {
        match result {
            Ok(attr) => sink.entry(&TTL, &self.file_attr(&attr)),
            Err(e) => {
                log_failure(op, &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    pub fn attr(&self, op: &'static str, result: Result<NodeAttr>, sink: Box<dyn AttrSink>) {
        match result {
            Ok(attr) => sink.attr(&TTL, &self.file_attr(&attr)),
            Err(e) => {
                log_failure(op, &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    pub fn opened(&self, result: Result<u64>, sink: Box<dyn OpenSink>) {
        match result {
            Ok(fh) => sink.opened(fh),
            Err(e) => {
                log_failure("open", &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    pub fn created(&self, result: Result<(NodeAttr, u64)>, sink: Box<dyn CreateSink>) {
        match result {
            Ok((attr, fh)) => sink.created(&TTL, &self.file_attr(&attr), fh),
            Err(e) => {
                log_failure("create", &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    pub fn data(&self, result: Result<Bytes>, sink: Box<dyn DataSink>) {
        match result {
            Ok(data) => sink.data(&data),
            Err(e) => {
                log_failure("read", &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    pub fn written(&self, result: Result<u32>, sink: Box<dyn WriteSink>) {
        match result {
            Ok(size) => sink.written(size),
            Err(e) => {
                log_failure("write", &e);
                sink.error(Fault::NotFound);
            }
        }
    }

    /// Serve directory entries from `offset` until the kernel buffer fills.
    /// `offset` is always a resume offset handed out by an earlier reply.
    pub fn directory(&self, result: Result<Arc<DirBuffer>>, offset: u64, mut sink: Box<dyn DirSink>) {
        match result {
            Ok(buffer) => {
                for entry in buffer.entries_from(offset) {
                    if sink.add(entry.ino, entry.next_offset, entry.kind, entry.name) {
                        break;
                    }
                }
                sink.ok();
            }
            Err(e) => {
                log_failure("readdir", &e);
                let fault = match e {
                    S3ffsError::NotDirectory(_) => Fault::NotDirectory,
                    _ => Fault::NotFound,
                };
                sink.error(fault);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn node(kind: EntryKind, size: u64) -> NodeAttr {
        let now = SystemTime::now();
        NodeAttr {
            ino: 42,
            kind,
            perm: 0o640,
            size,
            mtime: now,
            ctime: now,
        }
    }

    #[test]
    fn file_attr_carries_owner_and_size() {
        let codec = ReplyCodec::with_owner(1000, 100);
        let attr = codec.file_attr(&node(EntryKind::File, 1025));
        assert_eq!(attr.ino.0, 42);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.nlink, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
    }

    #[test]
    fn directories_have_two_links() {
        let codec = ReplyCodec::with_owner(0, 0);
        let attr = codec.file_attr(&node(EntryKind::Directory, 0));
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.kind, fuser::FileType::Directory);
    }
}
