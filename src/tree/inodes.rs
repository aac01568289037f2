use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{AttrChanges, EntryKind, NodeAttr};
use crate::error::{Result, S3ffsError};
use crate::fs::dirbuf::DirBuffer;
use crate::fs::ROOT_INO;
use crate::s3::listing::{EntryDescriptor, ListingSink};

const DEFAULT_DIR_PERM: u16 = 0o755;
const DEFAULT_FILE_PERM: u16 = 0o644;

/// Outcome of a directory update as seen by waiters: `None` while running.
pub type UpdateWatch = watch::Receiver<Option<bool>>;

#[derive(Debug, Default)]
struct DirState {
    /// Children in discovery order.
    children: Vec<u64>,
    by_name: HashMap<String, u64>,
    buffer: Option<Arc<DirBuffer>>,
    listed_at: Option<Instant>,
    updating: Option<watch::Sender<Option<bool>>>,
    /// Bumped by every update; children not stamped with it by the time a
    /// successful update stops are gone from the bucket.
    generation: u64,
}

#[derive(Debug)]
struct Node {
    ino: u64,
    parent: u64,
    name: String,
    path: String,
    kind: EntryKind,
    perm: u16,
    size: u64,
    mtime: SystemTime,
    ctime: SystemTime,
    /// Outstanding kernel references (lookup count).
    lookups: u64,
    /// Local writes not yet uploaded; listings must not clobber the size.
    dirty: bool,
    /// Generation of the parent's last update that reported this node.
    seen: u64,
    dir: Option<DirState>,
}

impl Node {
    fn new(ino: u64, parent: u64, name: &str, path: String, kind: EntryKind) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            parent,
            name: name.to_string(),
            path,
            kind,
            perm: match kind {
                EntryKind::Directory => DEFAULT_DIR_PERM,
                EntryKind::File => DEFAULT_FILE_PERM,
            },
            size: 0,
            mtime: now,
            ctime: now,
            lookups: 0,
            dirty: false,
            seen: 0,
            dir: (kind == EntryKind::Directory).then(DirState::default),
        }
    }

    fn attr(&self) -> NodeAttr {
        NodeAttr {
            ino: self.ino,
            kind: self.kind,
            perm: self.perm,
            size: self.size,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    fn set_kind(&mut self, kind: EntryKind) {
        if self.kind != kind {
            self.kind = kind;
            self.dir = (kind == EntryKind::Directory).then(DirState::default);
        }
    }
}

/// Where a directory stands relative to its listing.
pub enum Freshness {
    Fresh,
    Updating(UpdateWatch),
    Stale(String),
}

#[derive(Default)]
struct Nodes {
    by_ino: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
}

impl Nodes {
    fn get(&self, ino: u64) -> Result<&Node> {
        self.by_ino
            .get(&ino)
            .ok_or_else(|| S3ffsError::NotFound(format!("inode {}", ino)))
    }

    fn get_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.by_ino
            .get_mut(&ino)
            .ok_or_else(|| S3ffsError::NotFound(format!("inode {}", ino)))
    }

    fn dir_mut(&mut self, ino: u64) -> Result<&mut DirState> {
        self.get_mut(ino)?
            .dir
            .as_mut()
            .ok_or(S3ffsError::NotDirectory(ino))
    }

    fn child_of(&self, parent: u64, name: &str) -> Result<Option<u64>> {
        let node = self.get(parent)?;
        let dir = node.dir.as_ref().ok_or(S3ffsError::NotDirectory(parent))?;
        Ok(dir.by_name.get(name).copied())
    }

    /// Attach a new node under `parent`. The caller has checked that `parent`
    /// is a directory without a child called `name`.
    fn attach(&mut self, ino: u64, parent: u64, name: &str, kind: EntryKind) -> Result<&mut Node> {
        let parent_path = self.get(parent)?.path.clone();
        let path = join_path(&parent_path, name);
        let dir = self.dir_mut(parent)?;
        dir.children.push(ino);
        dir.by_name.insert(name.to_string(), ino);
        dir.buffer = None;
        self.by_path.insert(path.clone(), ino);
        Ok(self
            .by_ino
            .entry(ino)
            .or_insert_with(|| Node::new(ino, parent, name, path, kind)))
    }

    fn generation_of(&self, dir: u64) -> u64 {
        self.by_ino
            .get(&dir)
            .and_then(|n| n.dir.as_ref())
            .map_or(0, |d| d.generation)
    }

    /// Detach a node from its parent and from the path index. The node
    /// itself stays addressable by inode.
    fn unlink(&mut self, ino: u64) {
        let Some(node) = self.by_ino.get(&ino) else {
            return;
        };
        let (parent, name, path) = (node.parent, node.name.clone(), node.path.clone());
        if let Some(dir) = self.by_ino.get_mut(&parent).and_then(|p| p.dir.as_mut()) {
            if dir.by_name.get(&name) == Some(&ino) {
                dir.by_name.remove(&name);
                dir.children.retain(|c| *c != ino);
                dir.buffer = None;
            }
        }
        if self.by_path.get(&path) == Some(&ino) {
            self.by_path.remove(&path);
        }
    }

    /// Whether nothing holds on to `ino` or anything below it.
    fn unreferenced(&self, ino: u64) -> bool {
        let Some(node) = self.by_ino.get(&ino) else {
            return true;
        };
        if ino == ROOT_INO || node.lookups > 0 || node.dirty {
            return false;
        }
        match &node.dir {
            Some(dir) => dir.updating.is_none() && dir.children.iter().all(|c| self.unreferenced(*c)),
            None => true,
        }
    }

    fn remove_subtree(&mut self, ino: u64) {
        self.unlink(ino);
        if let Some(node) = self.by_ino.remove(&ino) {
            for child in node.dir.map(|d| d.children).unwrap_or_default() {
                self.remove_subtree(child);
            }
        }
    }
}

/// Path of `name` inside the directory at `parent_path`.
pub fn join_path(parent_path: &str, name: &str) -> String {
    if parent_path == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent_path, name)
    }
}

/// Object key for a tree path.
pub fn object_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Inode table of the bucket tree. Inode 1 is the bucket root, `/`.
pub struct NodeTable {
    state: Mutex<Nodes>,
    next_ino: AtomicU64,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        let mut nodes = Nodes::default();
        let mut root = Node::new(ROOT_INO, ROOT_INO, "", "/".to_string(), EntryKind::Directory);
        // The root is pinned for the life of the mount.
        root.lookups = 1;
        nodes.by_ino.insert(ROOT_INO, root);
        nodes.by_path.insert("/".to_string(), ROOT_INO);
        Self {
            state: Mutex::new(nodes),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    pub fn attr(&self, ino: u64) -> Result<NodeAttr> {
        Ok(self.state.lock().get(ino)?.attr())
    }

    pub fn path_of(&self, ino: u64) -> Result<String> {
        Ok(self.state.lock().get(ino)?.path.clone())
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        self.state.lock().by_path.get(path).copied()
    }

    pub fn lookups(&self, ino: u64) -> Result<u64> {
        Ok(self.state.lock().get(ino)?.lookups)
    }

    pub fn freshness(&self, ino: u64, ttl: Duration) -> Result<Freshness> {
        let state = self.state.lock();
        let node = state.get(ino)?;
        let dir = node.dir.as_ref().ok_or(S3ffsError::NotDirectory(ino))?;
        if let Some(tx) = &dir.updating {
            return Ok(Freshness::Updating(tx.subscribe()));
        }
        match dir.listed_at {
            Some(at) if at.elapsed() < ttl => Ok(Freshness::Fresh),
            _ => Ok(Freshness::Stale(node.path.clone())),
        }
    }

    pub fn subscribe(&self, ino: u64) -> Option<UpdateWatch> {
        let state = self.state.lock();
        let dir = state.by_ino.get(&ino)?.dir.as_ref()?;
        dir.updating.as_ref().map(|tx| tx.subscribe())
    }

    /// Resolve `name` under `parent` and count one kernel reference to it.
    pub fn lookup_child(&self, parent: u64, name: &str) -> Result<NodeAttr> {
        let mut state = self.state.lock();
        let ino = state
            .child_of(parent, name)?
            .ok_or_else(|| S3ffsError::NotFound(name.to_string()))?;
        let node = state.get_mut(ino)?;
        node.lookups += 1;
        Ok(node.attr())
    }

    /// Register a locally created entry and count one kernel reference to it.
    /// A directory created this way counts as already listed.
    pub fn insert_child(&self, parent: u64, name: &str, kind: EntryKind, perm: u16) -> Result<NodeAttr> {
        let mut state = self.state.lock();
        let ino = match state.child_of(parent, name)? {
            Some(existing) => existing,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                state.attach(ino, parent, name, kind)?;
                ino
            }
        };
        let generation = state.generation_of(parent);
        let node = state.get_mut(ino)?;
        node.seen = generation;
        node.set_kind(kind);
        node.perm = perm;
        node.lookups += 1;
        if let Some(dir) = node.dir.as_mut() {
            dir.listed_at.get_or_insert_with(Instant::now);
        }
        debug!(parent, name, ino, ?kind, "entry created");
        Ok(node.attr())
    }

    pub fn set_attrs(&self, ino: u64, changes: &AttrChanges) -> Result<NodeAttr> {
        let mut state = self.state.lock();
        let node = state.get_mut(ino)?;
        if let Some(mode) = changes.mode {
            node.perm = (mode & 0o7777) as u16;
        }
        if let Some(size) = changes.size {
            node.size = size;
        }
        if let Some(mtime) = changes.mtime {
            node.mtime = mtime;
        }
        node.ctime = SystemTime::now();
        Ok(node.attr())
    }

    pub fn set_size(&self, ino: u64, size: u64) {
        if let Some(node) = self.state.lock().by_ino.get_mut(&ino) {
            node.size = size;
            node.mtime = SystemTime::now();
        }
    }

    /// Extend the recorded size to at least `end`.
    pub fn grow(&self, ino: u64, end: u64) {
        if let Some(node) = self.state.lock().by_ino.get_mut(&ino) {
            node.size = node.size.max(end);
            node.mtime = SystemTime::now();
        }
    }

    pub fn set_dirty(&self, ino: u64, dirty: bool) {
        if let Some(node) = self.state.lock().by_ino.get_mut(&ino) {
            node.dirty = dirty;
        }
    }

    /// Drop `count` kernel references. Returns the references left.
    pub fn forget(&self, ino: u64, count: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let node = state.get_mut(ino)?;
        node.lookups = node.lookups.saturating_sub(count);
        if ino == ROOT_INO {
            node.lookups = node.lookups.max(1);
        }
        Ok(node.lookups)
    }

    /// Remove `ino` and its subtree if neither the kernel nor a pending
    /// write refers to any of it. The parent is marked stale so the name
    /// can be listed again. Returns whether anything was removed.
    pub fn evict(&self, ino: u64) -> bool {
        let mut state = self.state.lock();
        if !state.by_ino.contains_key(&ino) || !state.unreferenced(ino) {
            return false;
        }
        let parent = state.by_ino.get(&ino).map(|n| n.parent);
        state.remove_subtree(ino);
        if let Some(dir) = parent.and_then(|p| state.dir_mut(p).ok()) {
            dir.listed_at = None;
        }
        true
    }

    /// Number of inodes currently known, the root included.
    pub fn len(&self) -> usize {
        self.state.lock().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized listing of a directory: `.`, `..`, then children in
    /// discovery order. Cached until the children change.
    pub fn dir_buffer(&self, ino: u64) -> Result<Arc<DirBuffer>> {
        let mut state = self.state.lock();
        let node = state.get(ino)?;
        let dir = node.dir.as_ref().ok_or(S3ffsError::NotDirectory(ino))?;
        if let Some(buffer) = &dir.buffer {
            return Ok(Arc::clone(buffer));
        }

        let mut buffer = DirBuffer::new();
        buffer.push(".", ino, EntryKind::Directory);
        buffer.push("..", node.parent, EntryKind::Directory);
        for child in &dir.children {
            if let Some(c) = state.by_ino.get(child) {
                buffer.push(&c.name, c.ino, c.kind);
            }
        }
        let buffer = Arc::new(buffer);
        state.dir_mut(ino)?.buffer = Some(Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Names of a directory's children in discovery order.
    pub fn child_names(&self, ino: u64) -> Result<Vec<String>> {
        let state = self.state.lock();
        let dir = state
            .get(ino)?
            .dir
            .as_ref()
            .ok_or(S3ffsError::NotDirectory(ino))?;
        Ok(dir
            .children
            .iter()
            .filter_map(|c| state.by_ino.get(c).map(|n| n.name.clone()))
            .collect())
    }
}

impl ListingSink for NodeTable {
    fn start_update(&self, dir_path: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let ino = *state
            .by_path
            .get(dir_path)
            .ok_or_else(|| S3ffsError::NotFound(dir_path.to_string()))?;
        let dir = state.dir_mut(ino)?;
        if dir.updating.is_some() {
            return Err(S3ffsError::Busy(dir_path.to_string()));
        }
        let (tx, _) = watch::channel(None);
        dir.updating = Some(tx);
        dir.generation += 1;
        Ok(ino)
    }

    fn update_entry(&self, dir_path: &str, entry: EntryDescriptor) {
        let mut state = self.state.lock();
        let existing = match state.child_of(entry.parent_ino, &entry.name) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(dir = dir_path, name = %entry.name, "cannot update entry: {}", e);
                return;
            }
        };
        let ino = match existing {
            Some(ino) => ino,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = state.attach(ino, entry.parent_ino, &entry.name, entry.kind) {
                    warn!(dir = dir_path, name = %entry.name, "cannot add entry: {}", e);
                    return;
                }
                ino
            }
        };

        let generation = state.generation_of(entry.parent_ino);
        let Ok(node) = state.get_mut(ino) else {
            return;
        };
        node.seen = generation;
        let kind_changed = node.kind != entry.kind;
        node.set_kind(entry.kind);
        if !node.dirty {
            node.size = entry.size;
            if let Some(mtime) = entry.mtime {
                node.mtime = mtime;
                node.ctime = mtime;
            }
        }
        if kind_changed {
            if let Ok(dir) = state.dir_mut(entry.parent_ino) {
                dir.buffer = None;
            }
        }
    }

    fn stop_update(&self, ino: u64, success: bool) {
        let tx = {
            let mut state = self.state.lock();
            if success {
                prune_unseen(&mut state, ino);
            }
            let Ok(dir) = state.dir_mut(ino) else {
                warn!(ino, "update finished for unknown directory");
                return;
            };
            if success {
                dir.listed_at = Some(Instant::now());
            }
            dir.buffer = None;
            dir.updating.take()
        };
        if let Some(tx) = tx {
            // No receivers simply means nobody was waiting.
            let _ = tx.send(Some(success));
        }
    }
}

/// Drop the children of `dir` that its last update did not report. Local
/// writes survive, and nodes the kernel still refers to only leave the
/// directory.
fn prune_unseen(state: &mut Nodes, dir: u64) {
    let generation = state.generation_of(dir);
    let Some(children) = state
        .by_ino
        .get(&dir)
        .and_then(|n| n.dir.as_ref())
        .map(|d| d.children.clone())
    else {
        return;
    };
    for child in children {
        let gone = state
            .by_ino
            .get(&child)
            .map_or(false, |n| n.seen != generation && !n.dirty);
        if !gone {
            continue;
        }
        debug!(dir, child, "entry no longer listed");
        if state.unreferenced(child) {
            state.remove_subtree(child);
        } else {
            state.unlink(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: EntryKind, name: &str, size: u64) -> EntryDescriptor {
        EntryDescriptor {
            kind,
            parent_ino: ROOT_INO,
            name: name.to_string(),
            size,
            mtime: None,
        }
    }

    #[test]
    fn root_exists_and_is_stale() {
        let table = NodeTable::new();
        let attr = table.attr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, EntryKind::Directory);
        assert!(matches!(
            table.freshness(ROOT_INO, Duration::from_secs(5)).unwrap(),
            Freshness::Stale(path) if path == "/"
        ));
    }

    #[test]
    fn second_start_update_is_rejected() {
        let table = NodeTable::new();
        assert_eq!(table.start_update("/").unwrap(), ROOT_INO);
        assert!(matches!(table.start_update("/"), Err(S3ffsError::Busy(_))));
        table.stop_update(ROOT_INO, true);
        assert!(table.start_update("/").is_ok());
    }

    #[test]
    fn successful_update_makes_directory_fresh() {
        let table = NodeTable::new();
        table.start_update("/").unwrap();
        assert!(matches!(
            table.freshness(ROOT_INO, Duration::from_secs(5)).unwrap(),
            Freshness::Updating(_)
        ));
        table.stop_update(ROOT_INO, true);
        assert!(matches!(
            table.freshness(ROOT_INO, Duration::from_secs(5)).unwrap(),
            Freshness::Fresh
        ));
    }

    #[test]
    fn failed_update_leaves_directory_stale() {
        let table = NodeTable::new();
        table.start_update("/").unwrap();
        let mut rx = table.subscribe(ROOT_INO).unwrap();
        table.stop_update(ROOT_INO, false);
        assert_eq!(*rx.borrow_and_update(), Some(false));
        assert!(matches!(
            table.freshness(ROOT_INO, Duration::from_secs(5)).unwrap(),
            Freshness::Stale(_)
        ));
    }

    #[test]
    fn update_entry_is_idempotent() {
        let table = NodeTable::new();
        table.update_entry("/", descriptor(EntryKind::File, "a.txt", 10));
        table.update_entry("/", descriptor(EntryKind::Directory, "sub", 0));
        let first = table.child_names(ROOT_INO).unwrap();
        let a = table.lookup_child(ROOT_INO, "a.txt").unwrap();

        table.update_entry("/", descriptor(EntryKind::File, "a.txt", 12));
        table.update_entry("/", descriptor(EntryKind::Directory, "sub", 0));
        assert_eq!(table.child_names(ROOT_INO).unwrap(), first);
        let again = table.attr(a.ino).unwrap();
        assert_eq!(again.size, 12);
        assert_eq!(table.ino_of("/sub").is_some(), true);
    }

    #[test]
    fn listing_does_not_clobber_dirty_size() {
        let table = NodeTable::new();
        let attr = table
            .insert_child(ROOT_INO, "new.bin", EntryKind::File, 0o644)
            .unwrap();
        table.set_dirty(attr.ino, true);
        table.grow(attr.ino, 4096);
        table.update_entry("/", descriptor(EntryKind::File, "new.bin", 0));
        assert_eq!(table.attr(attr.ino).unwrap().size, 4096);
    }

    #[test]
    fn dir_buffer_lists_dot_entries_then_children() {
        let table = NodeTable::new();
        table.update_entry("/", descriptor(EntryKind::File, "b", 1));
        table.update_entry("/", descriptor(EntryKind::File, "a", 1));
        let buffer = table.dir_buffer(ROOT_INO).unwrap();
        let names: Vec<_> = buffer
            .entries_from(0)
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".", "..", "b", "a"]);
    }

    #[test]
    fn forget_counts_down_but_pins_root() {
        let table = NodeTable::new();
        table.update_entry("/", descriptor(EntryKind::File, "a", 1));
        let attr = table.lookup_child(ROOT_INO, "a").unwrap();
        table.lookup_child(ROOT_INO, "a").unwrap();
        assert_eq!(table.forget(attr.ino, 1).unwrap(), 1);
        assert_eq!(table.forget(attr.ino, 5).unwrap(), 0);
        assert_eq!(table.forget(ROOT_INO, 10).unwrap(), 1);
    }

    #[test]
    fn forgotten_entry_is_evicted_and_parent_relisted() {
        let table = NodeTable::new();
        table.start_update("/").unwrap();
        table.update_entry("/", descriptor(EntryKind::File, "a", 1));
        table.stop_update(ROOT_INO, true);
        let attr = table.lookup_child(ROOT_INO, "a").unwrap();

        assert!(!table.evict(attr.ino));
        table.forget(attr.ino, 1).unwrap();
        assert!(table.evict(attr.ino));
        assert!(table.attr(attr.ino).is_err());
        assert!(table.ino_of("/a").is_none());
        assert!(table.child_names(ROOT_INO).unwrap().is_empty());
        assert!(matches!(
            table.freshness(ROOT_INO, Duration::from_secs(60)).unwrap(),
            Freshness::Stale(_)
        ));
        assert!(!table.evict(ROOT_INO));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn dirty_entries_and_their_directories_are_not_evicted() {
        let table = NodeTable::new();
        let dir = table
            .insert_child(ROOT_INO, "d", EntryKind::Directory, 0o755)
            .unwrap();
        let file = table.insert_child(dir.ino, "f", EntryKind::File, 0o644).unwrap();
        table.set_dirty(file.ino, true);
        table.forget(file.ino, 1).unwrap();
        table.forget(dir.ino, 1).unwrap();

        assert!(!table.evict(file.ino));
        assert!(!table.evict(dir.ino));
        table.set_dirty(file.ino, false);
        assert!(table.evict(dir.ino));
        assert!(table.attr(file.ino).is_err());
        assert!(table.ino_of("/d/f").is_none());
    }

    #[test]
    fn relisting_drops_entries_the_bucket_no_longer_reports() {
        let table = NodeTable::new();
        table.start_update("/").unwrap();
        for name in ["keep", "gone", "held", "pending"] {
            table.update_entry("/", descriptor(EntryKind::File, name, 1));
        }
        table.stop_update(ROOT_INO, true);
        let held = table.lookup_child(ROOT_INO, "held").unwrap();
        let pending = table.ino_of("/pending").unwrap();
        table.set_dirty(pending, true);
        let gone = table.ino_of("/gone").unwrap();

        table.start_update("/").unwrap();
        table.update_entry("/", descriptor(EntryKind::File, "keep", 2));
        table.stop_update(ROOT_INO, true);

        assert_eq!(table.child_names(ROOT_INO).unwrap(), vec!["keep", "pending"]);
        assert!(table.attr(gone).is_err());
        // Still referenced by the kernel: out of the directory, not the table.
        assert!(table.attr(held.ino).is_ok());
        assert!(table.ino_of("/held").is_none());
        table.forget(held.ino, 1).unwrap();
        assert!(table.evict(held.ino));
    }

    #[test]
    fn failed_relisting_keeps_every_entry() {
        let table = NodeTable::new();
        table.start_update("/").unwrap();
        table.update_entry("/", descriptor(EntryKind::File, "a", 1));
        table.stop_update(ROOT_INO, true);

        table.start_update("/").unwrap();
        table.stop_update(ROOT_INO, false);
        assert_eq!(table.child_names(ROOT_INO).unwrap(), vec!["a"]);
    }

    #[test]
    fn paths_join_under_root_and_nested() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(object_key("/a/b"), "a/b");
    }
}
