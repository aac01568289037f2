//! Kernel requests waiting for a reply.
//!
//! Each variant owns the reply sink for its operation, so a request is
//! answered by moving the sink out exactly once.

use std::fmt;

use super::reply::{
    AttrSink, CreateSink, DataSink, DirSink, EmptySink, EntrySink, Fault, OpenSink, WriteSink,
};
use crate::tree::AttrChanges;

pub enum Operation {
    Lookup {
        parent: u64,
        name: String,
        reply: Box<dyn EntrySink>,
    },
    Getattr {
        ino: u64,
        reply: Box<dyn AttrSink>,
    },
    Setattr {
        ino: u64,
        changes: AttrChanges,
        reply: Box<dyn AttrSink>,
    },
    Open {
        ino: u64,
        flags: i32,
        reply: Box<dyn OpenSink>,
    },
    Create {
        parent: u64,
        name: String,
        mode: u32,
        flags: i32,
        reply: Box<dyn CreateSink>,
    },
    Read {
        ino: u64,
        fh: u64,
        size: u32,
        offset: u64,
        reply: Box<dyn DataSink>,
    },
    Write {
        ino: u64,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        reply: Box<dyn WriteSink>,
    },
    Release {
        ino: u64,
        fh: u64,
        reply: Box<dyn EmptySink>,
    },
    /// The kernel expects no reply to a forget.
    Forget {
        ino: u64,
        nlookup: u64,
    },
    Unlink {
        parent: u64,
        name: String,
        reply: Box<dyn EmptySink>,
    },
    Mkdir {
        parent: u64,
        name: String,
        mode: u32,
        reply: Box<dyn EntrySink>,
    },
    Rmdir {
        parent: u64,
        name: String,
        reply: Box<dyn EmptySink>,
    },
    Readdir {
        ino: u64,
        offset: u64,
        reply: Box<dyn DirSink>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Lookup { .. } => "lookup",
            Operation::Getattr { .. } => "getattr",
            Operation::Setattr { .. } => "setattr",
            Operation::Open { .. } => "open",
            Operation::Create { .. } => "create",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Release { .. } => "release",
            Operation::Forget { .. } => "forget",
            Operation::Unlink { .. } => "unlink",
            Operation::Mkdir { .. } => "mkdir",
            Operation::Rmdir { .. } => "rmdir",
            Operation::Readdir { .. } => "readdir",
        }
    }

    /// Answer the request with `fault` without running it.
    pub fn fail(self, fault: Fault) {
        match self {
            Operation::Lookup { reply, .. } | Operation::Mkdir { reply, .. } => reply.error(fault),
            Operation::Getattr { reply, .. } | Operation::Setattr { reply, .. } => reply.error(fault),
            Operation::Open { reply, .. } => reply.error(fault),
            Operation::Create { reply, .. } => reply.error(fault),
            Operation::Read { reply, .. } => reply.error(fault),
            Operation::Write { reply, .. } => reply.error(fault),
            Operation::Release { reply, .. }
            | Operation::Unlink { reply, .. }
            | Operation::Rmdir { reply, .. } => reply.error(fault),
            Operation::Readdir { reply, .. } => reply.error(fault),
            Operation::Forget { .. } => {}
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup { parent, name, .. } => write!(f, "lookup(parent={}, name={:?})", parent, name),
            Operation::Getattr { ino, .. } => write!(f, "getattr(ino={})", ino),
            Operation::Setattr { ino, changes, .. } => write!(f, "setattr(ino={}, {:?})", ino, changes),
            Operation::Open { ino, flags, .. } => write!(f, "open(ino={}, flags={:#o})", ino, flags),
            Operation::Create { parent, name, mode, .. } => {
                write!(f, "create(parent={}, name={:?}, mode={:#o})", parent, name, mode)
            }
            Operation::Read { ino, fh, size, offset, .. } => {
                write!(f, "read(ino={}, fh={}, size={}, offset={})", ino, fh, size, offset)
            }
            Operation::Write { ino, fh, offset, data, .. } => {
                write!(f, "write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len())
            }
            Operation::Release { ino, fh, .. } => write!(f, "release(ino={}, fh={})", ino, fh),
            Operation::Forget { ino, nlookup } => write!(f, "forget(ino={}, nlookup={})", ino, nlookup),
            Operation::Unlink { parent, name, .. } => write!(f, "unlink(parent={}, name={:?})", parent, name),
            Operation::Mkdir { parent, name, mode, .. } => {
                write!(f, "mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode)
            }
            Operation::Rmdir { parent, name, .. } => write!(f, "rmdir(parent={}, name={:?})", parent, name),
            Operation::Readdir { ino, offset, .. } => write!(f, "readdir(ino={}, offset={})", ino, offset),
        }
    }
}

/// One kernel request in flight.
#[derive(Debug)]
pub struct PendingRequest {
    /// Sequence number assigned on arrival, for log correlation.
    pub unique: u64,
    pub op: Operation,
}
