//! In-memory view of the bucket as a directory tree.
//!
//! Directories are populated lazily from bucket listings and re-listed once
//! their listing is older than the configured cache time. File contents are
//! never cached: reads go to the bucket by range, and files opened for
//! writing are staged in a local temporary file and uploaded on release.
//! Until its upload lands, a released body answers reads in place of the
//! remote object.

pub mod handles;
pub mod inodes;

use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use self::handles::HandleTable;
use self::inodes::{join_path, object_key, Freshness, NodeTable, UpdateWatch};
use crate::config::FilesystemSection;
use crate::error::{Result, S3ffsError};
use crate::fs::dirbuf::DirBuffer;
use crate::s3::listing::{DirListRequest, ListingSink};
use crate::s3::{object, Pools};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl From<EntryKind> for fuser::FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => fuser::FileType::RegularFile,
            EntryKind::Directory => fuser::FileType::Directory,
        }
    }
}

/// Attributes of one node, independent of the kernel's representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: EntryKind,
    pub perm: u16,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Attribute changes requested by `setattr`. Absent fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

/// The operations the dispatcher needs from the directory tree.
#[async_trait]
pub trait DirTree: Send + Sync + 'static {
    /// Resolve `name` in directory `parent`, listing the directory first if
    /// its cached listing is stale.
    async fn lookup(&self, parent: u64, name: &str) -> Result<NodeAttr>;

    async fn getattr(&self, ino: u64) -> Result<NodeAttr>;

    async fn setattr(&self, ino: u64, changes: AttrChanges) -> Result<NodeAttr>;

    async fn file_open(&self, ino: u64, flags: i32) -> Result<u64>;

    async fn file_create(&self, parent: u64, name: &str, mode: u32, flags: i32) -> Result<(NodeAttr, u64)>;

    async fn file_read(&self, ino: u64, fh: u64, size: u32, offset: u64) -> Result<Bytes>;

    async fn file_write(&self, ino: u64, fh: u64, data: Vec<u8>, offset: u64) -> Result<u32>;

    fn file_release(&self, ino: u64, fh: u64);

    fn forget(&self, ino: u64, nlookup: u64);

    async fn dir_create(&self, parent: u64, name: &str, mode: u32) -> Result<NodeAttr>;

    /// Serialized listing of directory `ino`, synchronized with the bucket
    /// first if stale.
    async fn fill_dir_buf(&self, ino: u64) -> Result<Arc<DirBuffer>>;
}

pub struct BucketTree {
    nodes: Arc<NodeTable>,
    handles: Arc<HandleTable>,
    pools: Pools,
    tmp_dir: PathBuf,
    dir_ttl: Duration,
    max_keys: u32,
    /// Bodies released for upload whose PUT has not completed yet.
    staged: Arc<DashMap<u64, Bytes>>,
    uploads: Mutex<JoinSet<()>>,
}

impl BucketTree {
    pub fn new(pools: Pools, config: &FilesystemSection) -> Self {
        Self {
            nodes: Arc::new(NodeTable::new()),
            handles: Arc::new(HandleTable::new()),
            pools,
            tmp_dir: config.tmp_dir.clone(),
            dir_ttl: config.dir_cache_ttl(),
            max_keys: config.max_keys,
            staged: Arc::new(DashMap::new()),
            uploads: Mutex::new(JoinSet::new()),
        }
    }

    pub fn nodes(&self) -> &Arc<NodeTable> {
        &self.nodes
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Number of uploads started and not yet finished.
    pub fn pending_uploads(&self) -> usize {
        let mut uploads = self.uploads.lock();
        while uploads.try_join_next().is_some() {}
        uploads.len()
    }

    /// Wait for every upload started so far, including uploads started while
    /// waiting.
    pub async fn flush(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.uploads.lock());
            if pending.is_empty() {
                return;
            }
            info!(uploads = pending.len(), "waiting for pending uploads");
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    error!("upload task failed: {}", e);
                }
            }
        }
    }

    /// Make sure directory `ino` has a listing younger than the cache time.
    /// Concurrent callers share one synchronization.
    async fn ensure_listed(&self, ino: u64) -> Result<()> {
        loop {
            let (path, mut rx) = match self.nodes.freshness(ino, self.dir_ttl)? {
                Freshness::Fresh => return Ok(()),
                Freshness::Updating(rx) => (self.nodes.path_of(ino)?, rx),
                Freshness::Stale(path) => {
                    let sink: Arc<dyn ListingSink> = self.nodes.clone();
                    match DirListRequest::start(sink, Arc::clone(&self.pools.ops), &path, self.max_keys) {
                        Ok(request) => {
                            let rx = self
                                .nodes
                                .subscribe(request.ino())
                                .ok_or_else(|| S3ffsError::ListingFailed(path.clone()))?;
                            tokio::spawn(request.run());
                            (path, rx)
                        }
                        // Someone else started between our check and our start.
                        Err(S3ffsError::Busy(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            };
            return if wait_outcome(&mut rx).await {
                Ok(())
            } else {
                Err(S3ffsError::ListingFailed(path))
            };
        }
    }

    fn key_of(&self, ino: u64) -> Result<String> {
        Ok(object_key(&self.nodes.path_of(ino)?).to_string())
    }

    fn writeback_file(&self) -> Result<std::fs::File> {
        Ok(tempfile::tempfile_in(&self.tmp_dir)?)
    }

    fn spawn_upload(&self, ino: u64, key: String, body: Bytes) {
        let pool = Arc::clone(&self.pools.writers);
        let nodes = Arc::clone(&self.nodes);
        let handles = Arc::clone(&self.handles);
        let staged = Arc::clone(&self.staged);

        let mut uploads = self.uploads.lock();
        while uploads.try_join_next().is_some() {}
        uploads.spawn(async move {
            let size = body.len();
            match object::put_object(pool.as_ref(), &key, body.clone()).await {
                Ok(()) => info!(key = %key, size, "file uploaded"),
                Err(e) => error!(key = %key, size, "upload failed: {}", e),
            }
            // A later release may have staged a newer body meanwhile.
            staged.remove_if(&ino, |_, b| b.as_ptr() == body.as_ptr() && b.len() == size);
            nodes.set_dirty(ino, handles.has_writer(ino) || staged.contains_key(&ino));
            evict_unused(&nodes, &handles, ino);
        });
    }
}

async fn wait_outcome(rx: &mut UpdateWatch) -> bool {
    loop {
        if let Some(ok) = *rx.borrow_and_update() {
            return ok;
        }
        if rx.changed().await.is_err() {
            return (*rx.borrow()).unwrap_or(false);
        }
    }
}

/// Drop `ino` from the table once neither the kernel nor an open handle
/// refers to it.
fn evict_unused(nodes: &NodeTable, handles: &HandleTable, ino: u64) {
    if !handles.is_open(ino) && nodes.evict(ino) {
        debug!(ino, "inode evicted");
    }
}

fn slice_range(body: &Bytes, size: u32, offset: u64) -> Bytes {
    let len = body.len() as u64;
    if offset >= len {
        return Bytes::new();
    }
    let end = offset + (size as u64).min(len - offset);
    body.slice(offset as usize..end as usize)
}

fn is_writable(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

#[async_trait]
impl DirTree for BucketTree {
    async fn lookup(&self, parent: u64, name: &str) -> Result<NodeAttr> {
        self.ensure_listed(parent).await?;
        self.nodes.lookup_child(parent, name)
    }

    async fn getattr(&self, ino: u64) -> Result<NodeAttr> {
        self.nodes.attr(ino)
    }

    async fn setattr(&self, ino: u64, changes: AttrChanges) -> Result<NodeAttr> {
        if let Some(size) = changes.size {
            self.handles.truncate(ino, size)?;
        }
        self.nodes.set_attrs(ino, &changes)
    }

    async fn file_open(&self, ino: u64, flags: i32) -> Result<u64> {
        let attr = self.nodes.attr(ino)?;
        if attr.kind != EntryKind::File {
            return Err(S3ffsError::NotFile(ino));
        }
        if !is_writable(flags) {
            return Ok(self.handles.alloc(ino, flags, None, false));
        }

        let file = self.writeback_file()?;
        let truncate = flags & libc::O_TRUNC != 0;
        let staged = self.staged.get(&ino).map(|b| b.value().clone());
        if truncate {
            self.nodes.set_size(ino, 0);
        } else if let Some(body) = staged {
            file.write_all_at(&body, 0)?;
        } else if attr.size > 0 {
            let body = object::get_range(self.pools.readers.as_ref(), &self.key_of(ino)?, 0, attr.size).await?;
            file.write_all_at(&body, 0)?;
        }
        self.nodes.set_dirty(ino, true);
        let fh = self.handles.alloc(ino, flags, Some(file), truncate);
        debug!(ino, fh, truncate, "file opened for writing");
        Ok(fh)
    }

    async fn file_create(&self, parent: u64, name: &str, mode: u32, flags: i32) -> Result<(NodeAttr, u64)> {
        let file = self.writeback_file()?;
        let attr = self
            .nodes
            .insert_child(parent, name, EntryKind::File, (mode & 0o7777) as u16)?;
        self.nodes.set_size(attr.ino, 0);
        self.nodes.set_dirty(attr.ino, true);
        let fh = self.handles.alloc(attr.ino, flags, Some(file), true);
        info!(parent, name, ino = attr.ino, "file created");
        Ok((self.nodes.attr(attr.ino)?, fh))
    }

    async fn file_read(&self, ino: u64, fh: u64, size: u32, offset: u64) -> Result<Bytes> {
        if let Some(data) = self.handles.read_local(fh, ino, size, offset)? {
            return Ok(data);
        }
        let staged = self.staged.get(&ino).map(|b| b.value().clone());
        if let Some(body) = staged {
            return Ok(slice_range(&body, size, offset));
        }
        let attr = self.nodes.attr(ino)?;
        if offset >= attr.size {
            return Ok(Bytes::new());
        }
        let len = (size as u64).min(attr.size - offset);
        object::get_range(self.pools.readers.as_ref(), &self.key_of(ino)?, offset, len).await
    }

    async fn file_write(&self, ino: u64, fh: u64, data: Vec<u8>, offset: u64) -> Result<u32> {
        let written = self.handles.write_local(fh, ino, &data, offset)?;
        self.nodes.grow(ino, offset + written as u64);
        Ok(written)
    }

    fn file_release(&self, ino: u64, fh: u64) {
        let Some(handle) = self.handles.remove(fh) else {
            warn!(ino, fh, "release of unknown file handle");
            return;
        };
        if !handle.dirty {
            if handle.is_writable() {
                let pending = self.staged.contains_key(&ino);
                self.nodes.set_dirty(ino, self.handles.has_writer(ino) || pending);
            }
            evict_unused(&self.nodes, &self.handles, ino);
            return;
        }

        let (body, key) = match handle.contents().and_then(|c| Ok((c, self.key_of(ino)?))) {
            Ok((Some(body), key)) => (Bytes::from(body), key),
            Ok((None, _)) => return,
            Err(e) => {
                error!(ino, fh, "cannot stage upload: {}", e);
                return;
            }
        };
        self.nodes.set_size(ino, body.len() as u64);
        self.staged.insert(ino, body.clone());
        self.spawn_upload(ino, key, body);
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        match self.nodes.forget(ino, nlookup) {
            Ok(0) => {
                debug!(ino, nlookup, left = 0, "forget");
                evict_unused(&self.nodes, &self.handles, ino);
            }
            Ok(left) => debug!(ino, nlookup, left, "forget"),
            Err(e) => debug!(ino, nlookup, "forget: {}", e),
        }
    }

    async fn dir_create(&self, parent: u64, name: &str, mode: u32) -> Result<NodeAttr> {
        if self.nodes.attr(parent)?.kind != EntryKind::Directory {
            return Err(S3ffsError::NotDirectory(parent));
        }
        let path = join_path(&self.nodes.path_of(parent)?, name);
        let placeholder = format!("{}/", object_key(&path));
        object::put_object(self.pools.ops.as_ref(), &placeholder, Bytes::new()).await?;
        let attr = self
            .nodes
            .insert_child(parent, name, EntryKind::Directory, (mode & 0o7777) as u16)?;
        info!(parent, name, ino = attr.ino, "directory created");
        Ok(attr)
    }

    async fn fill_dir_buf(&self, ino: u64) -> Result<Arc<DirBuffer>> {
        if self.nodes.attr(ino)?.kind != EntryKind::Directory {
            return Err(S3ffsError::NotDirectory(ino));
        }
        self.ensure_listed(ino).await?;
        self.nodes.dir_buffer(ino)
    }
}
