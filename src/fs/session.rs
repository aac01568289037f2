//! Bridge between fuser's session thread and the event loop.
//!
//! fuser owns `/dev/fuse` and decodes the wire protocol. [`KernelSession`]
//! only packages each callback into a [`PendingRequest`] and queues it;
//! [`SessionChannel`] is the event-loop end of that queue.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use fuser::{
    BsdFileFlags, Errno, FileHandle, Filesystem, INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    WriteFlags,
};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use super::channel::{KernelChannel, RecvError};
use super::reply::Fault;
use super::request::{Operation, PendingRequest};
use crate::error::{Result, S3ffsError};
use crate::tree::AttrChanges;

/// The fuser side of the request queue.
pub struct KernelSession {
    tx: mpsc::UnboundedSender<PendingRequest>,
    next_unique: AtomicU64,
    exited: Arc<AtomicBool>,
}

/// The event-loop side of the request queue.
pub struct SessionChannel {
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    /// Request taken off the queue while waiting for readiness.
    stash: Option<PendingRequest>,
    closed: bool,
    exited: Arc<AtomicBool>,
}

/// Connected session and channel.
pub fn pair() -> (KernelSession, SessionChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    let exited = Arc::new(AtomicBool::new(false));
    (
        KernelSession {
            tx,
            next_unique: AtomicU64::new(1),
            exited: Arc::clone(&exited),
        },
        SessionChannel {
            rx,
            stash: None,
            closed: false,
            exited,
        },
    )
}

fn utf8_name(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_string)
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl KernelSession {
    pub fn submit(&self, op: Operation) {
        let unique = self.next_unique.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(request)) = self.tx.send(PendingRequest { unique, op }) {
            warn!(unique, op = request.op.name(), "event loop is gone, failing request");
            request.op.fail(Fault::Io);
        }
    }
}

impl Filesystem for KernelSession {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        info!("s3ffs session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("s3ffs session shutting down");
        self.exited.store(true, Ordering::Release);
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        self.submit(Operation::Lookup {
            parent: u64::from(parent),
            name,
            reply: Box::new(reply),
        });
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        self.submit(Operation::Forget {
            ino: u64::from(ino),
            nlookup,
        });
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        self.submit(Operation::Getattr {
            ino: u64::from(ino),
            reply: Box::new(reply),
        });
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        self.submit(Operation::Setattr {
            ino: u64::from(ino),
            changes: AttrChanges {
                mode,
                size,
                mtime: mtime.map(resolve_time),
            },
            reply: Box::new(reply),
        });
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        self.submit(Operation::Open {
            ino: u64::from(ino),
            flags: flags.0,
            reply: Box::new(reply),
        });
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        self.submit(Operation::Create {
            parent: u64::from(parent),
            name,
            mode,
            flags,
            reply: Box::new(reply),
        });
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        self.submit(Operation::Read {
            ino: u64::from(ino),
            fh: u64::from(fh),
            size,
            offset,
            reply: Box::new(reply),
        });
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        self.submit(Operation::Write {
            ino: u64::from(ino),
            fh: u64::from(fh),
            offset,
            data: data.to_vec(),
            reply: Box::new(reply),
        });
    }

    fn release(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.submit(Operation::Release {
            ino: u64::from(ino),
            fh: u64::from(fh),
            reply: Box::new(reply),
        });
    }

    fn readdir(&self, _req: &Request, ino: INodeNo, _fh: FileHandle, offset: u64, reply: ReplyDirectory) {
        self.submit(Operation::Readdir {
            ino: u64::from(ino),
            offset,
            reply: Box::new(reply),
        });
    }

    fn mkdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        self.submit(Operation::Mkdir {
            parent: u64::from(parent),
            name,
            mode,
            reply: Box::new(reply),
        });
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        self.submit(Operation::Unlink {
            parent: u64::from(parent),
            name: name.to_string_lossy().into_owned(),
            reply: Box::new(reply),
        });
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        self.submit(Operation::Rmdir {
            parent: u64::from(parent),
            name: name.to_string_lossy().into_owned(),
            reply: Box::new(reply),
        });
    }
}

#[async_trait]
impl KernelChannel for SessionChannel {
    async fn readable(&mut self) {
        if self.stash.is_some() || self.closed {
            return;
        }
        match self.rx.recv().await {
            Some(request) => self.stash = Some(request),
            None => self.closed = true,
        }
    }

    fn try_recv(&mut self) -> std::result::Result<PendingRequest, RecvError> {
        if let Some(request) = self.stash.take() {
            return Ok(request);
        }
        if self.closed {
            return Err(RecvError::Closed);
        }
        match self.rx.try_recv() {
            Ok(request) => Ok(request),
            Err(TryRecvError::Empty) => Err(RecvError::WouldBlock),
            Err(TryRecvError::Disconnected) => Err(RecvError::Closed),
        }
    }

    fn session_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// A mounted bucket. Unmounts on [`Mount::unmount`] or drop.
pub struct Mount {
    session: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
}

impl Mount {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            info!(mountpoint = %self.mountpoint.display(), "unmounting");
            if let Err(e) = session.umount_and_join() {
                warn!(mountpoint = %self.mountpoint.display(), "unmount failed: {}", e);
            }
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Mount the filesystem at `mountpoint` and return the request channel.
pub fn mount(mountpoint: &Path, fsname: &str) -> Result<(Mount, SessionChannel)> {
    let (session, channel) = pair();
    let mut config = fuser::Config::default();
    config.mount_options = vec![
        fuser::MountOption::FSName(fsname.to_string()),
        fuser::MountOption::Subtype("s3ffs".to_string()),
        fuser::MountOption::DefaultPermissions,
    ];

    debug!(mountpoint = %mountpoint.display(), fsname, "mounting");
    let background = fuser::spawn_mount2(session, mountpoint, &config)
        .map_err(|e| S3ffsError::Mount(format!("{}: {}", mountpoint.display(), e)))?;
    info!(mountpoint = %mountpoint.display(), "mounted");
    Ok((
        Mount {
            session: Some(background),
            mountpoint: mountpoint.to_path_buf(),
        },
        channel,
    ))
}
