//! Node table: stable identities for device paths.
//!
//! Every other component refers to a file by [`NodeId`]. The path is stored only
//! here and rewritten in place on rename, so cached pages and open handles keep
//! working without being told about it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{BridgeError, Result};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The mount root. Matches the kernel's root inode number.
    pub const ROOT: NodeId = NodeId(1);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Other,
}

impl NodeKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => NodeKind::File,
            m if m == libc::S_IFDIR as u32 => NodeKind::Directory,
            _ => NodeKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub size: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attr {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    /// Attributes for an entry created locally before the device has been asked.
    pub fn fresh(mode: u32, now: SystemTime) -> Self {
        Self {
            size: 0,
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Directory contents as the device last reported them. Entries are names, not
/// nodes: a child may be forgotten and rebuilt while the listing stays valid.
#[derive(Debug, Clone)]
pub struct Listing {
    pub fetched_at: Instant,
    pub entries: Vec<(OsString, Attr)>,
}

impl Listing {
    fn is_fresh(&self, ttl: Duration) -> bool {
        Instant::now().saturating_duration_since(self.fetched_at) < ttl
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub path: PathBuf,
    pub kind: NodeKind,
    pub attr: Attr,
    pub attr_fetched_at: Option<Instant>,
    pub open_count: u32,
    /// Outstanding kernel lookups (each entry reply adds one, forget subtracts).
    pub lookups: u64,
    pub unlinked: bool,
    pub listing: Option<Listing>,
}

impl Node {
    fn attr_is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        match self.attr_fetched_at {
            Some(at) => now.saturating_duration_since(at) < ttl,
            None => false,
        }
    }
}

struct Inner {
    nodes: HashMap<NodeId, Node>,
    paths: HashMap<PathBuf, NodeId>,
    next_id: u64,
}

impl Inner {
    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| BridgeError::InvalidState(format!("node {id} no longer exists")))
    }

    fn patch_listing(&mut self, path: &Path, attr: Attr) {
        let (parent, name) = path::split_dir_file(path);
        let Some(dir) = self.paths.get(&parent).copied() else {
            return;
        };
        let entry = self
            .nodes
            .get_mut(&dir)
            .and_then(|d| d.listing.as_mut())
            .and_then(|l| l.entries.iter_mut().find(|(n, _)| *n == name));
        if let Some((_, listed)) = entry {
            *listed = attr;
        }
    }
}

pub struct NodeTable {
    inner: RwLock<Inner>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    pub fn new() -> Self {
        let now = SystemTime::now();
        let root = Node {
            id: NodeId::ROOT,
            path: path::root(),
            kind: NodeKind::Directory,
            attr: Attr::fresh(libc::S_IFDIR as u32 | 0o755, now),
            attr_fetched_at: None,
            open_count: 0,
            lookups: 0,
            unlinked: false,
            listing: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, root);
        let mut paths = HashMap::new();
        paths.insert(path::root(), NodeId::ROOT);
        Self {
            inner: RwLock::new(Inner {
                nodes,
                paths,
                next_id: NodeId::ROOT.0 + 1,
            }),
        }
    }

    /// Return the node at `path`, creating it on first sight.
    pub fn resolve(&self, path: &Path, kind: NodeKind) -> NodeId {
        if let Some(id) = self.lookup(path) {
            return id;
        }
        let mut g = self.inner.write();
        if let Some(&id) = g.paths.get(path) {
            return id;
        }
        let id = NodeId(g.next_id);
        g.next_id += 1;
        let mode = match kind {
            NodeKind::Directory => libc::S_IFDIR as u32 | 0o755,
            NodeKind::File => libc::S_IFREG as u32 | 0o644,
            NodeKind::Other => 0o644,
        };
        g.nodes.insert(
            id,
            Node {
                id,
                path: path.to_path_buf(),
                kind,
                attr: Attr::fresh(mode, SystemTime::now()),
                attr_fetched_at: None,
                open_count: 0,
                lookups: 0,
                unlinked: false,
                listing: None,
            },
        );
        g.paths.insert(path.to_path_buf(), id);
        id
    }

    /// Resolve `path` and record a device attribute snapshot for it.
    /// With `keep_size` the locally known size survives the refresh.
    pub fn observe(&self, path: &Path, attr: Attr, keep_size: impl Fn(NodeId) -> bool) -> NodeId {
        let id = self.resolve(path, attr.kind());
        self.update_attr(id, attr, keep_size(id));
        id
    }

    /// Like [`observe`](Self::observe), but only for a path that already has a node.
    pub fn refresh(
        &self,
        path: &Path,
        attr: Attr,
        keep_size: impl Fn(NodeId) -> bool,
    ) -> Option<NodeId> {
        let id = self.lookup(path)?;
        self.update_attr(id, attr, keep_size(id));
        Some(id)
    }

    fn update_attr(&self, id: NodeId, attr: Attr, keep_size: bool) {
        let mut g = self.inner.write();
        if let Some(node) = g.nodes.get_mut(&id) {
            let size = node.attr.size;
            node.kind = attr.kind();
            node.attr = attr;
            if keep_size {
                node.attr.size = size;
            }
            node.attr_fetched_at = Some(Instant::now());
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<NodeId> {
        self.inner.read().paths.get(path).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.inner.read().nodes.get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.read().nodes.contains_key(&id)
    }

    pub fn path_of(&self, id: NodeId) -> Option<PathBuf> {
        self.inner.read().nodes.get(&id).map(|n| n.path.clone())
    }

    pub fn size(&self, id: NodeId) -> Result<u64> {
        self.inner
            .read()
            .nodes
            .get(&id)
            .map(|n| n.attr.size)
            .ok_or_else(|| BridgeError::InvalidState(format!("node {id} no longer exists")))
    }

    pub fn fresh_attr(&self, id: NodeId, ttl: Duration) -> Option<Attr> {
        let now = Instant::now();
        let g = self.inner.read();
        let node = g.nodes.get(&id)?;
        node.attr_is_fresh(ttl, now).then(|| node.attr.clone())
    }

    /// Move `id` (and everything below it) to `new_path`. A different node that
    /// occupied `new_path` is detached from the namespace and returned.
    pub fn rename(&self, id: NodeId, new_path: &Path) -> Result<Option<NodeId>> {
        let mut g = self.inner.write();
        let old_path = g.node_mut(id)?.path.clone();
        if old_path == new_path {
            return Ok(None);
        }

        let displaced = match g.paths.get(new_path).copied() {
            Some(other) if other != id => {
                g.paths.remove(new_path);
                if let Some(n) = g.nodes.get_mut(&other) {
                    n.unlinked = true;
                }
                Some(other)
            }
            _ => None,
        };

        let moved: Vec<(NodeId, PathBuf)> = g
            .nodes
            .values()
            .filter(|n| !n.unlinked && path::is_within(&n.path, &old_path))
            .map(|n| (n.id, n.path.clone()))
            .collect();
        for (nid, p) in moved {
            let rebased = path::rebase(&p, &old_path, new_path);
            if g.paths.get(&p) == Some(&nid) {
                g.paths.remove(&p);
            }
            g.paths.insert(rebased.clone(), nid);
            if let Some(n) = g.nodes.get_mut(&nid) {
                n.path = rebased;
            }
        }
        Ok(displaced)
    }

    /// Detach `id` from its path. The node stays addressable by id.
    pub fn mark_unlinked(&self, id: NodeId) -> Result<()> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        node.unlinked = true;
        node.attr.nlink = 0;
        let p = node.path.clone();
        if g.paths.get(&p) == Some(&id) {
            g.paths.remove(&p);
        }
        Ok(())
    }

    pub fn retain(&self, id: NodeId) -> Result<u32> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        node.open_count += 1;
        Ok(node.open_count)
    }

    pub fn release(&self, id: NodeId) -> Result<u32> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        if node.open_count == 0 {
            return Err(BridgeError::InvalidState(format!(
                "node {id} released more times than opened"
            )));
        }
        node.open_count -= 1;
        Ok(node.open_count)
    }

    pub fn remember(&self, id: NodeId, n: u64) {
        if let Some(node) = self.inner.write().nodes.get_mut(&id) {
            node.lookups += n;
        }
    }

    pub fn forget(&self, id: NodeId, n: u64) -> u64 {
        match self.inner.write().nodes.get_mut(&id) {
            Some(node) => {
                node.lookups = node.lookups.saturating_sub(n);
                node.lookups
            }
            None => 0,
        }
    }

    /// Drop the node if nothing references it any more. The caller makes sure the
    /// page cache holds nothing for it.
    pub fn destroy_if_orphaned(&self, id: NodeId) -> bool {
        if id == NodeId::ROOT {
            return false;
        }
        let mut g = self.inner.write();
        let Some(node) = g.nodes.get(&id) else {
            return false;
        };
        let orphaned = node.open_count == 0 && (node.unlinked || node.lookups == 0);
        if !orphaned {
            return false;
        }
        let p = node.path.clone();
        let last = (!node.unlinked).then(|| node.attr.clone());
        g.nodes.remove(&id);
        if g.paths.get(&p) == Some(&id) {
            g.paths.remove(&p);
        }
        // the parent listing now answers for this name
        if let Some(attr) = last {
            g.patch_listing(&p, attr);
        }
        true
    }

    pub fn set_size(&self, id: NodeId, size: u64) -> Result<()> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        node.attr.size = size;
        Ok(())
    }

    /// Grow the size to at least `end` and stamp mtime.
    pub fn extend_size(&self, id: NodeId, end: u64) -> Result<u64> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        node.attr.size = node.attr.size.max(end);
        node.attr.mtime = SystemTime::now();
        Ok(node.attr.size)
    }

    pub fn set_times(
        &self,
        id: NodeId,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let mut g = self.inner.write();
        let node = g.node_mut(id)?;
        if let Some(t) = atime {
            node.attr.atime = t;
        }
        if let Some(t) = mtime {
            node.attr.mtime = t;
        }
        node.attr.ctime = SystemTime::now();
        Ok(())
    }

    pub fn listing(&self, id: NodeId, ttl: Duration) -> Option<Vec<(OsString, Attr)>> {
        let g = self.inner.read();
        let listing = g.nodes.get(&id)?.listing.as_ref()?;
        listing.is_fresh(ttl).then(|| listing.entries.clone())
    }

    pub fn set_listing(&self, id: NodeId, entries: Vec<(OsString, Attr)>) {
        if let Some(node) = self.inner.write().nodes.get_mut(&id) {
            node.listing = Some(Listing {
                fetched_at: Instant::now(),
                entries,
            });
        }
    }

    /// Attributes of `path` from its parent's listing, if that listing is fresh.
    pub fn listed_attr(&self, path: &Path, ttl: Duration) -> Option<Attr> {
        let (parent, name) = path::split_dir_file(path);
        let g = self.inner.read();
        let dir = g.paths.get(&parent)?;
        let listing = g.nodes.get(dir)?.listing.as_ref()?;
        if !listing.is_fresh(ttl) {
            return None;
        }
        listing
            .entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, attr)| attr.clone())
    }

    pub fn invalidate_listing(&self, id: NodeId) {
        if let Some(node) = self.inner.write().nodes.get_mut(&id) {
            node.listing = None;
        }
    }

    /// Forget the cached attributes so the next getattr asks the device.
    pub fn invalidate_attr(&self, id: NodeId) {
        if let Some(node) = self.inner.write().nodes.get_mut(&id) {
            node.attr_fetched_at = None;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    fn file_attr(size: u64) -> Attr {
        Attr {
            size,
            ..Attr::fresh(libc::S_IFREG as u32 | 0o644, SystemTime::UNIX_EPOCH)
        }
    }

    #[test]
    fn resolve_is_stable_and_ids_are_not_reused() {
        let t = NodeTable::new();
        let a = t.resolve(p("/sdcard/a"), NodeKind::File);
        assert_eq!(t.resolve(p("/sdcard/a"), NodeKind::File), a);
        assert!(t.destroy_if_orphaned(a));
        let b = t.resolve(p("/sdcard/a"), NodeKind::File);
        assert_ne!(a, b);
    }

    #[test]
    fn rename_moves_path_and_descendants() {
        let t = NodeTable::new();
        let dir = t.resolve(p("/d"), NodeKind::Directory);
        let child = t.resolve(p("/d/f"), NodeKind::File);
        let sibling = t.resolve(p("/dx"), NodeKind::File);
        assert_eq!(t.rename(dir, p("/e")).unwrap(), None);
        assert_eq!(t.path_of(dir).unwrap(), p("/e"));
        assert_eq!(t.path_of(child).unwrap(), p("/e/f"));
        assert_eq!(t.path_of(sibling).unwrap(), p("/dx"));
        assert_eq!(t.lookup(p("/e/f")), Some(child));
        assert_eq!(t.lookup(p("/d/f")), None);
    }

    #[test]
    fn rename_over_existing_detaches_target() {
        let t = NodeTable::new();
        let a = t.resolve(p("/a"), NodeKind::File);
        let b = t.resolve(p("/b"), NodeKind::File);
        assert_eq!(t.rename(a, p("/b")).unwrap(), Some(b));
        assert_eq!(t.lookup(p("/b")), Some(a));
        assert!(t.get(b).unwrap().unlinked);
    }

    #[test]
    fn unlinked_node_survives_until_last_release() {
        let t = NodeTable::new();
        let a = t.resolve(p("/a"), NodeKind::File);
        t.retain(a).unwrap();
        t.mark_unlinked(a).unwrap();
        assert_eq!(t.lookup(p("/a")), None);
        assert!(!t.destroy_if_orphaned(a));
        assert_eq!(t.release(a).unwrap(), 0);
        assert!(t.destroy_if_orphaned(a));
        assert!(t.get(a).is_none());
        assert!(t.release(a).is_err());
    }

    #[test]
    fn kernel_lookups_keep_node_alive() {
        let t = NodeTable::new();
        let a = t.resolve(p("/a"), NodeKind::File);
        t.remember(a, 2);
        assert!(!t.destroy_if_orphaned(a));
        assert_eq!(t.forget(a, 2), 0);
        assert!(t.destroy_if_orphaned(a));
        assert!(!t.destroy_if_orphaned(NodeId::ROOT));
    }

    #[test]
    fn observe_can_keep_local_size() {
        let t = NodeTable::new();
        let a = t.observe(p("/a"), file_attr(10), |_| false);
        assert_eq!(t.size(a).unwrap(), 10);
        t.extend_size(a, 50).unwrap();
        t.observe(p("/a"), file_attr(10), |_| true);
        assert_eq!(t.size(a).unwrap(), 50);
        assert!(t.fresh_attr(a, Duration::from_secs(30)).is_some());
        assert!(t.fresh_attr(a, Duration::ZERO).is_none());
    }

    #[test]
    fn refresh_never_creates_nodes() {
        let t = NodeTable::new();
        assert_eq!(t.refresh(p("/a"), file_attr(3), |_| false), None);
        assert_eq!(t.len(), 1);
        let a = t.resolve(p("/a"), NodeKind::File);
        assert_eq!(t.refresh(p("/a"), file_attr(3), |_| false), Some(a));
        assert_eq!(t.size(a).unwrap(), 3);
    }

    #[test]
    fn listing_answers_for_children_by_name() {
        let t = NodeTable::new();
        t.set_listing(
            NodeId::ROOT,
            vec![(OsString::from("a"), file_attr(7)), (OsString::from("b"), file_attr(1))],
        );
        let ttl = Duration::from_secs(30);
        assert_eq!(t.listed_attr(p("/a"), ttl).map(|a| a.size), Some(7));
        assert_eq!(t.listed_attr(p("/c"), ttl), None);
        assert_eq!(t.listed_attr(p("/a"), Duration::ZERO), None);
        assert_eq!(t.listing(NodeId::ROOT, ttl).map(|l| l.len()), Some(2));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn forgotten_child_leaves_its_attributes_in_the_listing() {
        let t = NodeTable::new();
        t.set_listing(NodeId::ROOT, vec![(OsString::from("a"), file_attr(7))]);
        let a = t.observe(p("/a"), file_attr(7), |_| false);
        t.remember(a, 1);
        t.set_size(a, 20).unwrap();
        t.forget(a, 1);
        assert!(t.destroy_if_orphaned(a));
        let ttl = Duration::from_secs(30);
        assert_eq!(t.listed_attr(p("/a"), ttl).map(|a| a.size), Some(20));
        assert_eq!(t.listing(NodeId::ROOT, ttl).map(|l| l.len()), Some(1));
    }
}
