//! Directory synchronization: pulls a complete, possibly paginated, bucket
//! listing for one directory prefix into the directory tree.
//!
//! A [`DirListRequest`] is created by [`DirListRequest::start`], which marks
//! the directory as updating, and consumed by [`DirListRequest::run`], which
//! walks `Acquiring -> Fetching -> Parsing -> (Fetching | Done | Failed)`.
//! Both terminal states clear the updating mark and release the connection
//! exactly once.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, error, info};
use url::form_urlencoded;

use super::pool::{Connection, ConnectionPool, Method, S3Request};
use super::xml::ListingPage;
use crate::error::{Result, S3ffsError};
use crate::tree::EntryKind;

/// One child discovered in a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub kind: EntryKind,
    pub parent_ino: u64,
    pub name: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// The directory-tree side of a synchronization.
pub trait ListingSink: Send + Sync {
    /// Mark `dir_path` as updating. Fails with [`S3ffsError::Busy`] if it
    /// already is; returns the directory's inode otherwise.
    fn start_update(&self, dir_path: &str) -> Result<u64>;

    fn update_entry(&self, dir_path: &str, entry: EntryDescriptor);

    /// Clear the updating mark and publish the outcome to waiters.
    fn stop_update(&self, ino: u64, success: bool);
}

/// Bucket prefix for a directory path: `/` lists the bucket root (`""`),
/// `/a/b` lists `a/b/`.
pub fn dir_prefix(dir_path: &str) -> String {
    let trimmed = dir_path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Query string for one listing page.
pub fn page_query(prefix: &str, max_keys: u32, marker: Option<&str>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("delimiter", "/")
        .append_pair("prefix", prefix)
        .append_pair("max-keys", &max_keys.to_string());
    if let Some(marker) = marker {
        query.append_pair("marker", marker);
    }
    query.finish()
}

enum SyncState {
    Acquiring,
    Fetching {
        conn: Box<dyn Connection>,
        marker: Option<String>,
    },
    Parsing {
        conn: Box<dyn Connection>,
        body: Bytes,
    },
    Done {
        conn: Box<dyn Connection>,
    },
    Failed {
        conn: Option<Box<dyn Connection>>,
        error: S3ffsError,
    },
}

pub struct DirListRequest {
    sink: Arc<dyn ListingSink>,
    pool: Arc<dyn ConnectionPool>,
    dir_path: String,
    prefix: String,
    ino: u64,
    max_keys: u32,
    pages: u32,
}

impl DirListRequest {
    /// Reserve `dir_path` for synchronization.
    pub fn start(
        sink: Arc<dyn ListingSink>,
        pool: Arc<dyn ConnectionPool>,
        dir_path: &str,
        max_keys: u32,
    ) -> Result<Self> {
        let ino = sink.start_update(dir_path)?;
        debug!(dir = dir_path, ino, "directory listing started");
        Ok(Self {
            sink,
            pool,
            dir_path: dir_path.to_string(),
            prefix: dir_prefix(dir_path),
            ino,
            max_keys: max_keys.max(1),
            pages: 0,
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Drive the listing to completion. Returns `true` on success.
    pub async fn run(mut self) -> bool {
        let mut state = SyncState::Acquiring;
        loop {
            state = match state {
                SyncState::Acquiring => match self.pool.acquire().await {
                    Ok(conn) => SyncState::Fetching { conn, marker: None },
                    Err(error) => SyncState::Failed { conn: None, error },
                },
                SyncState::Fetching { mut conn, marker } => {
                    self.pages += 1;
                    let request = S3Request::new(Method::Get, "").with_query(page_query(
                        &self.prefix,
                        self.max_keys,
                        marker.as_deref(),
                    ));
                    match conn.make_request(request).await {
                        Ok(body) => SyncState::Parsing { conn, body },
                        Err(error) => SyncState::Failed {
                            conn: Some(conn),
                            error,
                        },
                    }
                }
                SyncState::Parsing { conn, body } => match ListingPage::parse(&body) {
                    Ok(page) => {
                        self.inject(&page);
                        match page.continuation() {
                            Some(marker) => SyncState::Fetching {
                                conn,
                                marker: Some(marker),
                            },
                            None => SyncState::Done { conn },
                        }
                    }
                    Err(error) => SyncState::Failed {
                        conn: Some(conn),
                        error,
                    },
                },
                SyncState::Done { conn } => {
                    info!(dir = %self.dir_path, pages = self.pages, "directory listing complete");
                    self.finish(Some(conn), true);
                    return true;
                }
                SyncState::Failed { conn, error } => {
                    error!(dir = %self.dir_path, pages = self.pages, "failed to retrieve directory listing: {}", error);
                    self.finish(conn, false);
                    return false;
                }
            };
        }
    }

    fn finish(&self, conn: Option<Box<dyn Connection>>, success: bool) {
        self.sink.stop_update(self.ino, success);
        if let Some(conn) = conn {
            conn.release();
        }
    }

    fn inject(&self, page: &ListingPage) {
        for object in &page.contents {
            if object.key == self.prefix {
                continue;
            }
            let Some(name) = object.key.strip_prefix(self.prefix.as_str()) else {
                debug!(key = %object.key, prefix = %self.prefix, "key outside listed prefix, skipped");
                continue;
            };
            self.push(EntryKind::File, name, object.size, object.last_modified.map(SystemTime::from));
        }

        for common in &page.common_prefixes {
            let Some(rest) = common.strip_prefix(self.prefix.as_str()) else {
                debug!(prefix = %common, dir = %self.prefix, "common prefix outside listed prefix, skipped");
                continue;
            };
            let name = rest.strip_suffix('/').unwrap_or(rest);
            self.push(EntryKind::Directory, name, 0, None);
        }
    }

    fn push(&self, kind: EntryKind, name: &str, size: u64, mtime: Option<SystemTime>) {
        if name.is_empty() || name.contains('/') {
            debug!(dir = %self.dir_path, name, "unusable entry name, skipped");
            return;
        }
        self.sink.update_entry(
            &self.dir_path,
            EntryDescriptor {
                kind,
                parent_ino: self.ino,
                name: name.to_string(),
                size,
                mtime,
            },
        );
    }
}
