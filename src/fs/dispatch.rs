use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use super::channel::RequestHandler;
use super::reply::ReplyCodec;
use super::request::{Operation, PendingRequest};
use crate::tree::DirTree;

/// Routes kernel requests to the directory tree.
///
/// Operations that may touch the network run as tasks on the current runtime
/// and reply when they finish; `release`, `forget`, `unlink` and `rmdir`
/// complete before `dispatch` returns.
pub struct Dispatcher<T: DirTree> {
    tree: Arc<T>,
    codec: ReplyCodec,
}

impl<T: DirTree> Dispatcher<T> {
    pub fn new(tree: Arc<T>, codec: ReplyCodec) -> Self {
        Self { tree, codec }
    }

    pub fn tree(&self) -> &Arc<T> {
        &self.tree
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(task);
    }

    pub fn dispatch(&self, request: PendingRequest) {
        let PendingRequest { unique, op } = request;
        debug!(unique, "{:?}", op);

        let tree = Arc::clone(&self.tree);
        let codec = self.codec;
        match op {
            Operation::Lookup { parent, name, reply } => self.spawn(async move {
                codec.entry("lookup", tree.lookup(parent, &name).await, reply);
            }),
            Operation::Getattr { ino, reply } => self.spawn(async move {
                codec.attr("getattr", tree.getattr(ino).await, reply);
            }),
            Operation::Setattr { ino, changes, reply } => self.spawn(async move {
                codec.attr("setattr", tree.setattr(ino, changes).await, reply);
            }),
            Operation::Open { ino, flags, reply } => self.spawn(async move {
                codec.opened(tree.file_open(ino, flags).await, reply);
            }),
            Operation::Create {
                parent,
                name,
                mode,
                flags,
                reply,
            } => self.spawn(async move {
                codec.created(tree.file_create(parent, &name, mode, flags).await, reply);
            }),
            Operation::Read {
                ino,
                fh,
                size,
                offset,
                reply,
            } => self.spawn(async move {
                codec.data(tree.file_read(ino, fh, size, offset).await, reply);
            }),
            Operation::Write {
                ino,
                fh,
                offset,
                data,
                reply,
            } => self.spawn(async move {
                codec.written(tree.file_write(ino, fh, data, offset).await, reply);
            }),
            Operation::Release { ino, fh, reply } => {
                self.tree.file_release(ino, fh);
                reply.ok();
            }
            Operation::Forget { ino, nlookup } => self.tree.forget(ino, nlookup),
            // Removal is left to forget; nothing is deleted remotely.
            Operation::Unlink { parent, name, reply } | Operation::Rmdir { parent, name, reply } => {
                debug!(unique, parent, name = %name, "removal ignored");
                reply.ok();
            }
            Operation::Mkdir {
                parent,
                name,
                mode,
                reply,
            } => self.spawn(async move {
                codec.entry("mkdir", tree.dir_create(parent, &name, mode).await, reply);
            }),
            Operation::Readdir { ino, offset, reply } => self.spawn(async move {
                codec.directory(tree.fill_dir_buf(ino).await, offset, reply);
            }),
        }
    }
}

impl<T: DirTree> RequestHandler for Dispatcher<T> {
    fn handle(&self, request: PendingRequest) {
        self.dispatch(request);
    }
}
