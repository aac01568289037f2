//! Kernel-facing half of the filesystem: request intake, dispatch to the
//! directory tree, and reply encoding.

pub mod channel;
pub mod dirbuf;
pub mod dispatch;
pub mod reply;
pub mod request;
pub mod session;

use std::time::Duration;

/// Inode of the bucket root.
pub const ROOT_INO: u64 = 1;

/// How long the kernel may cache entries and attributes.
pub const TTL: Duration = Duration::from_secs(1);
