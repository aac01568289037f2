#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fuser::FileAttr;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::form_urlencoded;

use s3ffs::config::FilesystemSection;
use s3ffs::error::{Result, S3ffsError};
use s3ffs::fs::reply::{
    AttrSink, CreateSink, DataSink, DirSink, EmptySink, EntrySink, Fault, OpenSink, Replier, WriteSink,
};
use s3ffs::s3::listing::{EntryDescriptor, ListingSink};
use s3ffs::s3::pool::{Connection, ConnectionPool, Method, S3Request};
use s3ffs::tree::EntryKind;

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

type Handler = dyn Fn(&S3Request) -> Result<Bytes> + Send + Sync;

struct PoolState {
    handler: Box<Handler>,
    requests: Mutex<Vec<S3Request>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail_acquire: AtomicBool,
    /// When set, every request waits for one permit before it is answered.
    gate: Option<Arc<Semaphore>>,
}

/// Connection pool answering requests from a closure and recording them.
#[derive(Clone)]
pub struct ScriptedPool(Arc<PoolState>);

impl ScriptedPool {
    pub fn new(handler: impl Fn(&S3Request) -> Result<Bytes> + Send + Sync + 'static) -> Self {
        Self::build(Box::new(handler), None)
    }

    pub fn gated(
        handler: impl Fn(&S3Request) -> Result<Bytes> + Send + Sync + 'static,
        gate: Arc<Semaphore>,
    ) -> Self {
        Self::build(Box::new(handler), Some(gate))
    }

    fn build(handler: Box<Handler>, gate: Option<Arc<Semaphore>>) -> Self {
        Self(Arc::new(PoolState {
            handler,
            requests: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            fail_acquire: AtomicBool::new(false),
            gate,
        }))
    }

    pub fn shared(&self) -> Arc<dyn ConnectionPool> {
        Arc::new(self.clone())
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.0.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<S3Request> {
        self.0.requests.lock().clone()
    }

    /// Listing page requests seen so far.
    pub fn listings(&self) -> Vec<S3Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Get && r.query.is_some())
            .collect()
    }

    pub fn puts(&self) -> Vec<S3Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Put)
            .collect()
    }

    pub fn acquired(&self) -> usize {
        self.0.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.0.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionPool for ScriptedPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        if self.0.fail_acquire.load(Ordering::SeqCst) {
            return Err(S3ffsError::Dispatch("pool exhausted".to_string()));
        }
        self.0.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection(Arc::clone(&self.0))))
    }
}

struct ScriptedConnection(Arc<PoolState>);

#[async_trait]
impl Connection for ScriptedConnection {
    async fn make_request(&mut self, request: S3Request) -> Result<Bytes> {
        if let Some(gate) = &self.0.gate {
            gate.acquire()
                .await
                .map_err(|_| S3ffsError::Dispatch("gate closed".to_string()))?
                .forget();
        }
        self.0.requests.lock().push(request.clone());
        (self.0.handler)(&request)
    }

    fn release(self: Box<Self>) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn server_error(resource: &str) -> S3ffsError {
    S3ffsError::Status {
        status: 500,
        resource: resource.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Listing documents and an in-memory bucket
// ---------------------------------------------------------------------------

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Render one `ListBucketResult` page.
pub fn listing_xml(objects: &[(&str, u64)], prefixes: &[&str], truncated: bool, next_marker: Option<&str>) -> Bytes {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\n<Name>test</Name>\n",
    );
    xml.push_str(&format!("<IsTruncated>{}</IsTruncated>\n", truncated));
    if let Some(marker) = next_marker {
        xml.push_str(&format!("<NextMarker>{}</NextMarker>\n", escape(marker)));
    }
    for (key, size) in objects {
        xml.push_str(&format!(
            "<Contents><Key>{}</Key><LastModified>2012-06-01T10:00:00.000Z</LastModified>\
             <ETag>&quot;d41d8cd98f00b204e9800998ecf8427e&quot;</ETag><Size>{}</Size>\
             <StorageClass>STANDARD</StorageClass></Contents>\n",
            escape(key),
            size
        ));
    }
    for prefix in prefixes {
        xml.push_str(&format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>\n", escape(prefix)));
    }
    xml.push_str("</ListBucketResult>\n");
    Bytes::from(xml)
}

/// Objects keyed by name, answering listings with delimiter, prefix,
/// max-keys and marker the way the bucket service does.
#[derive(Default)]
pub struct FakeBucket {
    objects: Mutex<BTreeMap<String, Bytes>>,
    failing: AtomicBool,
}

impl FakeBucket {
    pub fn with_objects(objects: &[(&str, &str)]) -> Arc<Self> {
        let bucket = Self::default();
        {
            let mut map = bucket.objects.lock();
            for (key, body) in objects {
                map.insert(key.to_string(), Bytes::from(body.to_string()));
            }
        }
        Arc::new(bucket)
    }

    pub fn put(&self, key: &str, body: &str) {
        self.objects.lock().insert(key.to_string(), Bytes::from(body.to_string()));
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    /// Make every request fail with a server error until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn pool(self: &Arc<Self>) -> ScriptedPool {
        let bucket = Arc::clone(self);
        ScriptedPool::new(move |request| bucket.answer(request))
    }

    pub fn gated_pool(self: &Arc<Self>, gate: Arc<Semaphore>) -> ScriptedPool {
        let bucket = Arc::clone(self);
        ScriptedPool::gated(move |request| bucket.answer(request), gate)
    }

    pub fn answer(&self, request: &S3Request) -> Result<Bytes> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(server_error(&request.key));
        }
        match (request.method, &request.query) {
            (Method::Get, Some(query)) => Ok(self.list(query)),
            (Method::Get, None) => {
                let body = self.get(&request.key).ok_or_else(|| S3ffsError::Status {
                    status: 404,
                    resource: request.key.clone(),
                })?;
                Ok(match request.range {
                    Some((first, last)) => {
                        let end = (last as usize + 1).min(body.len());
                        body.slice((first as usize).min(end)..end)
                    }
                    None => body,
                })
            }
            (Method::Put, _) => {
                let body = request.body.clone().unwrap_or_default();
                self.objects.lock().insert(request.key.clone(), body);
                Ok(Bytes::new())
            }
            (Method::Head, _) => Ok(Bytes::new()),
        }
    }

    fn list(&self, query: &str) -> Bytes {
        let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        let prefix = params.get("prefix").cloned().unwrap_or_default();
        let max_keys: usize = params.get("max-keys").and_then(|v| v.parse().ok()).unwrap_or(1000);
        let marker = params.get("marker").cloned().unwrap_or_default();

        let objects = self.objects.lock();
        let mut seen = BTreeSet::new();
        // (name, size, is_prefix) in key order
        let mut items: Vec<(String, u64, bool)> = Vec::new();
        for (key, body) in objects.iter() {
            let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let item = match rest.find('/') {
                Some(i) => (format!("{}{}", prefix, &rest[..=i]), 0, true),
                None => (key.clone(), body.len() as u64, false),
            };
            if item.0 <= marker || (item.2 && !seen.insert(item.0.clone())) {
                continue;
            }
            items.push(item);
        }

        let truncated = items.len() > max_keys;
        items.truncate(max_keys);
        let next_marker = if truncated { items.last().map(|i| i.0.clone()) } else { None };
        let files: Vec<(&str, u64)> = items
            .iter()
            .filter(|i| !i.2)
            .map(|i| (i.0.as_str(), i.1))
            .collect();
        let dirs: Vec<&str> = items.iter().filter(|i| i.2).map(|i| i.0.as_str()).collect();
        listing_xml(&files, &dirs, truncated, next_marker.as_deref())
    }
}

pub fn fs_config(tmp_dir: &Path, dir_cache_max_time: u64) -> FilesystemSection {
    FilesystemSection {
        dir_cache_max_time,
        tmp_dir: tmp_dir.to_path_buf(),
        ..FilesystemSection::default()
    }
}

// ---------------------------------------------------------------------------
// Listing sink
// ---------------------------------------------------------------------------

/// Directory side of a synchronization that only records what it is told.
#[derive(Default)]
pub struct RecordingSink {
    updating: Mutex<BTreeSet<String>>,
    pub entries: Mutex<Vec<EntryDescriptor>>,
    pub stops: Mutex<Vec<(u64, bool)>>,
}

pub const RECORDED_DIR_INO: u64 = 7;

impl RecordingSink {
    pub fn entries(&self) -> Vec<(EntryKind, String, u64)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.kind, e.name.clone(), e.size))
            .collect()
    }

    pub fn stops(&self) -> Vec<(u64, bool)> {
        self.stops.lock().clone()
    }

    pub fn is_updating(&self, dir_path: &str) -> bool {
        self.updating.lock().contains(dir_path)
    }
}

impl ListingSink for RecordingSink {
    fn start_update(&self, dir_path: &str) -> Result<u64> {
        if !self.updating.lock().insert(dir_path.to_string()) {
            return Err(S3ffsError::Busy(dir_path.to_string()));
        }
        Ok(RECORDED_DIR_INO)
    }

    fn update_entry(&self, _dir_path: &str, entry: EntryDescriptor) {
        self.entries.lock().push(entry);
    }

    fn stop_update(&self, ino: u64, success: bool) {
        self.updating.lock().clear();
        self.stops.lock().push((ino, success));
    }
}

// ---------------------------------------------------------------------------
// Reply sinks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Replied {
    Entry { ino: u64, kind: fuser::FileType, size: u64, nlink: u32 },
    Attr { ino: u64, kind: fuser::FileType, size: u64, perm: u16 },
    Opened(u64),
    Created { ino: u64, fh: u64 },
    Data(Vec<u8>),
    Written(u32),
    Ok,
    /// `(ino, next offset, name)` per entry.
    Dir(Vec<(u64, u64, String)>),
    Error(Fault),
}

/// Shared log of every reply sent through sinks it handed out.
#[derive(Clone, Default)]
pub struct Replies(Arc<Mutex<Vec<(u64, Replied)>>>);

impl Replies {
    pub fn sink(&self, tag: u64) -> Box<RecordingReply> {
        self.dir_sink(tag, usize::MAX)
    }

    /// Sink whose directory buffer holds at most `capacity` entries.
    pub fn dir_sink(&self, tag: u64, capacity: usize) -> Box<RecordingReply> {
        Box::new(RecordingReply {
            tag,
            log: Arc::clone(&self.0),
            entries: Vec::new(),
            capacity,
        })
    }

    pub fn all(&self) -> Vec<(u64, Replied)> {
        self.0.lock().clone()
    }

    pub fn for_tag(&self, tag: u64) -> Vec<Replied> {
        self.0
            .lock()
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Wait until at least `count` replies have been recorded.
    pub async fn wait_for(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.0.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "expected {} replies, got {:?}",
            count,
            self.all()
        );
    }
}

pub struct RecordingReply {
    tag: u64,
    log: Arc<Mutex<Vec<(u64, Replied)>>>,
    entries: Vec<(u64, u64, String)>,
    capacity: usize,
}

impl RecordingReply {
    fn record(&self, replied: Replied) {
        self.log.lock().push((self.tag, replied));
    }
}

impl Replier for RecordingReply {
    fn error(self: Box<Self>, fault: Fault) {
        self.record(Replied::Error(fault));
    }
}

impl EntrySink for RecordingReply {
    fn entry(self: Box<Self>, _ttl: &Duration, attr: &FileAttr) {
        self.record(Replied::Entry {
            ino: attr.ino.0,
            kind: attr.kind,
            size: attr.size,
            nlink: attr.nlink,
        });
    }
}

impl AttrSink for RecordingReply {
    fn attr(self: Box<Self>, _ttl: &Duration, attr: &FileAttr) {
        self.record(Replied::Attr {
            ino: attr.ino.0,
            kind: attr.kind,
            size: attr.size,
            perm: attr.perm,
        });
    }
}

impl OpenSink for RecordingReply {
    fn opened(self: Box<Self>, fh: u64) {
        self.record(Replied::Opened(fh));
    }
}

impl CreateSink for RecordingReply {
    fn created(self: Box<Self>, _ttl: &Duration, attr: &FileAttr, fh: u64) {
        self.record(Replied::Created { ino: attr.ino.0, fh });
    }
}

impl DataSink for RecordingReply {
    fn data(self: Box<Self>, data: &[u8]) {
        self.record(Replied::Data(data.to_vec()));
    }
}

impl WriteSink for RecordingReply {
    fn written(self: Box<Self>, size: u32) {
        self.record(Replied::Written(size));
    }
}

impl EmptySink for RecordingReply {
    fn ok(self: Box<Self>) {
        self.record(Replied::Ok);
    }
}

impl DirSink for RecordingReply {
    fn add(&mut self, ino: u64, offset: u64, _kind: EntryKind, name: &OsStr) -> bool {
        if self.entries.len() >= self.capacity {
            return true;
        }
        self.entries.push((ino, offset, name.to_string_lossy().into_owned()));
        false
    }

    fn ok(self: Box<Self>) {
        let entries = self.entries.clone();
        self.record(Replied::Dir(entries));
    }
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

pub fn s3ffs_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_s3ffs"))
}
