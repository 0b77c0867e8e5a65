//! Bridge engine: the filesystem operations the kernel glue calls.
//!
//! Resolves paths to nodes, routes data through the page cache and everything
//! else to the transport, and applies the POSIX policy the device cannot
//! express on its own (holes, truncation, unlink and rename while open).
//!
//! Every public operation captures one configuration snapshot at its start and
//! holds the reconfiguration guard in shared mode for its whole duration, so a
//! page-size change never overlaps a running operation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::{PageCache, PageIo};
use crate::config::{self, Config, ConfigRegistry};
use crate::error::{BridgeError, Result};
use crate::node::{Attr, NodeId, NodeKind, NodeTable};
use crate::path;
use crate::remote::{TimeSpec, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const STATFS_BLOCK_SIZE: u32 = 4096;
const STATFS_NAME_LEN: u32 = 255;

/// Page I/O against the node's current path on the device.
struct DeviceIo {
    nodes: Arc<NodeTable>,
    transport: Arc<dyn Transport>,
}

impl DeviceIo {
    /// Path of `node` right now. An unlinked node has no device copy left.
    fn live_path(&self, node: NodeId) -> Result<PathBuf> {
        match self.nodes.get(node) {
            Some(n) if !n.unlinked => Ok(n.path),
            Some(_) => Err(BridgeError::InvalidState(format!("node {node} is unlinked"))),
            None => Err(BridgeError::InvalidState(format!("node {node} no longer exists"))),
        }
    }
}

#[async_trait]
impl PageIo for DeviceIo {
    async fn read_page(&self, node: NodeId, index: u64, page_size: usize) -> Result<Bytes> {
        let p = self.live_path(node)?;
        self.transport
            .read_range(&p, index * page_size as u64, page_size)
            .await
    }

    async fn write_page(
        &self,
        node: NodeId,
        index: u64,
        page_size: usize,
        data: Bytes,
    ) -> Result<()> {
        let p = self.live_path(node)?;
        let len = data.len();
        let written = self
            .transport
            .write_range(&p, index * page_size as u64, data)
            .await?;
        if written != len {
            return Err(BridgeError::remote(
                libc::EIO,
                format!("short write to {}: {written} of {len} bytes", p.display()),
            ));
        }
        Ok(())
    }

    async fn commit_size(&self, node: NodeId, size: u64) -> Result<()> {
        let p = self.live_path(node)?;
        self.transport.truncate(&p, size).await
    }
}

/// One listed child. `node` is set only when the child already has a node;
/// listing never creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub node: Option<NodeId>,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// Snapshot reported by the `info` control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub transport: &'static str,
    pub log_level: String,
    pub ttl: Duration,
    pub rpc_timeout: Option<Duration>,
    pub page_size: usize,
    pub cache_budget: u64,
    pub cache_used: u64,
}

pub struct Bridge {
    config: Arc<ConfigRegistry>,
    nodes: Arc<NodeTable>,
    cache: PageCache,
    transport: Arc<dyn Transport>,
    reconfigure: RwLock<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Build the engine and start its background flusher. Needs a tokio runtime.
    pub fn new(config: Arc<ConfigRegistry>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let nodes = Arc::new(NodeTable::new());
        let io = Arc::new(DeviceIo {
            nodes: nodes.clone(),
            transport: transport.clone(),
        });
        let bridge = Arc::new(Self {
            config,
            cache: PageCache::new(nodes.clone(), io),
            nodes,
            transport,
            reconfigure: RwLock::new(()),
            flusher: Mutex::new(None),
        });
        bridge.spawn_flusher();
        bridge
    }

    /// Flush nodes the cache reports as holding it over budget.
    fn spawn_flusher(self: &Arc<Self>) {
        let Some(mut pressure) = self.cache.take_pressure() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(node) = pressure.recv().await {
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                let _guard = bridge.reconfigure.read().await;
                let cfg = bridge.config.snapshot();
                if bridge.nodes.get(node).is_none_or(|n| n.unlinked) {
                    continue;
                }
                match bridge.cache.flush(node, &cfg).await {
                    Ok(()) => debug!(%node, "flushed under cache pressure"),
                    Err(e) => warn!(%node, error = %e, "background flush failed"),
                }
                bridge.cache.evict(&cfg);
            }
        });
        *self.flusher.lock() = Some(handle);
    }

    pub fn config(&self) -> &Arc<ConfigRegistry> {
        &self.config
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    fn node(&self, id: NodeId) -> Result<crate::node::Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| BridgeError::InvalidState(format!("node {id} no longer exists")))
    }

    fn attr_of(&self, id: NodeId) -> Result<Attr> {
        self.node(id).map(|n| n.attr)
    }

    /// Record a device stat for `path`. Local size wins while changes are pending.
    fn observe(&self, path: &Path, attr: Attr) -> NodeId {
        let size = attr.size;
        let id = self
            .nodes
            .observe(path, attr, |id| self.cache.has_pending(id));
        self.cache.sync_extent(id, size);
        id
    }

    /// Like [`observe`](Self::observe) for a path that may have no node; none is created.
    fn refresh(&self, path: &Path, attr: Attr) -> Option<NodeId> {
        let size = attr.size;
        let id = self
            .nodes
            .refresh(path, attr, |id| self.cache.has_pending(id))?;
        self.cache.sync_extent(id, size);
        Some(id)
    }

    async fn stat_path(&self, path: &Path, cfg: &Config) -> Result<(NodeId, Attr)> {
        match self.nodes.lookup(path) {
            Some(id) => {
                if let Some(attr) = self.nodes.fresh_attr(id, cfg.ttl) {
                    return Ok((id, attr));
                }
            }
            None => {
                if let Some(attr) = self.nodes.listed_attr(path, cfg.ttl) {
                    let id = self.observe(path, attr);
                    return Ok((id, self.attr_of(id)?));
                }
            }
        }
        let attr = self.transport.stat(path).await?;
        let id = self.observe(path, attr);
        Ok((id, self.attr_of(id)?))
    }

    fn invalidate_parent(&self, p: &Path) {
        if let Some(parent) = self.nodes.lookup(&path::parent_of(p)) {
            self.nodes.invalidate_listing(parent);
        }
    }

    /// Resolve `path` and take one kernel lookup reference on it.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn lookup(&self, path: impl AsRef<Path>) -> Result<(NodeId, Attr)> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let (id, attr) = self.stat_path(&path::norm_path(path.as_ref()), &cfg).await?;
        self.nodes.remember(id, 1);
        Ok((id, attr))
    }

    pub async fn getattr(&self, id: NodeId) -> Result<Attr> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let node = self.node(id)?;
        if node.unlinked {
            return Ok(node.attr);
        }
        if let Some(attr) = self.nodes.fresh_attr(id, cfg.ttl) {
            return Ok(attr);
        }
        let attr = self.transport.stat(&node.path).await?;
        let seen = self.observe(&node.path, attr);
        if seen != id {
            return Err(BridgeError::InvalidState(format!(
                "node {id} was replaced at {}",
                node.path.display()
            )));
        }
        self.attr_of(id)
    }

    /// List a directory. The names and attributes are cached on the directory
    /// node for one TTL; children that have no node yet do not get one.
    #[instrument(level = "debug", skip(self))]
    pub async fn readdir(&self, id: NodeId) -> Result<Vec<DirEntry>> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let dir = self.node(id)?;
        if dir.kind != NodeKind::Directory {
            return Err(BridgeError::NotADirectory {
                path: dir.path.into(),
            });
        }

        let listed = match self.nodes.listing(id, cfg.ttl) {
            Some(entries) => entries,
            None => {
                let mut stream = self.transport.list(&dir.path).await?;
                let mut entries = Vec::new();
                while let Some(entry) = stream.next().await {
                    let entry = entry?;
                    self.refresh(&path::join(&dir.path, &entry.name), entry.attr.clone());
                    entries.push((entry.name, entry.attr));
                }
                self.nodes.set_listing(id, entries.clone());
                debug!(dir = %dir.path.display(), entries = entries.len(), "listed");
                entries
            }
        };
        Ok(listed
            .into_iter()
            .map(|(name, attr)| self.dir_entry(&dir.path, name, attr))
            .collect())
    }

    /// A live child's own attributes win over the listed ones.
    fn dir_entry(&self, dir: &Path, name: OsString, listed: Attr) -> DirEntry {
        let live = self
            .nodes
            .lookup(&path::join(dir, &name))
            .and_then(|c| self.nodes.get(c))
            .filter(|n| !n.unlinked);
        match live {
            Some(n) => DirEntry {
                name,
                node: Some(n.id),
                attr: n.attr,
            },
            None => DirEntry {
                name,
                node: None,
                attr: listed,
            },
        }
    }

    /// Node for an entry returned by [`readdir`](Self::readdir), taking one kernel
    /// lookup reference on it.
    pub async fn lookup_entry(&self, dir: NodeId, entry: &DirEntry) -> Result<(NodeId, Attr)> {
        let _guard = self.reconfigure.read().await;
        let id = match entry.node.filter(|&n| self.nodes.contains(n)) {
            Some(n) => n,
            None => {
                let p = path::join(&self.node(dir)?.path, &entry.name);
                self.observe(&p, entry.attr.clone())
            }
        };
        self.nodes.remember(id, 1);
        Ok((id, self.attr_of(id)?))
    }

    pub async fn open(&self, id: NodeId) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let count = self.nodes.retain(id)?;
        debug!(node = %id, count, "open");
        Ok(())
    }

    pub async fn read(&self, id: NodeId, offset: u64, len: usize) -> Result<Bytes> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        self.cache.read(id, offset, len, &cfg).await
    }

    pub async fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let node = self.node(id)?;
        if node.kind == NodeKind::Directory {
            return Err(BridgeError::IsADirectory {
                path: node.path.into(),
            });
        }
        self.cache.write(id, offset, data, &cfg).await
    }

    /// Create and open a regular file. Fails if the path already exists.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn create(&self, path: impl AsRef<Path>, mode: u32) -> Result<(NodeId, Attr)> {
        let _guard = self.reconfigure.read().await;
        let path = path::norm_path(path.as_ref());
        match self.transport.stat(&path).await {
            Ok(_) => return Err(BridgeError::already_exists(path)),
            Err(BridgeError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.transport.create(&path, mode).await?;

        if let Some(stale) = self.nodes.lookup(&path) {
            self.cache.discard(stale);
        }
        let attr = Attr::fresh(libc::S_IFREG as u32 | (mode & 0o7777), SystemTime::now());
        let id = self.nodes.observe(&path, attr, |_| false);
        self.nodes.retain(id)?;
        self.nodes.remember(id, 1);
        self.invalidate_parent(&path);
        Ok((id, self.attr_of(id)?))
    }

    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn mkdir(&self, path: impl AsRef<Path>, mode: u32) -> Result<(NodeId, Attr)> {
        let _guard = self.reconfigure.read().await;
        let path = path::norm_path(path.as_ref());
        self.transport.mkdir(&path, mode).await?;
        let attr = Attr::fresh(libc::S_IFDIR as u32 | (mode & 0o7777), SystemTime::now());
        let id = self.nodes.observe(&path, attr, |_| false);
        self.nodes.remember(id, 1);
        self.invalidate_parent(&path);
        Ok((id, self.attr_of(id)?))
    }

    /// Remove a file. An open file keeps serving its cached contents until the
    /// last handle is released.
    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn unlink(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let path = path::norm_path(path.as_ref());
        let known = self.nodes.lookup(&path).and_then(|id| self.nodes.get(id));

        match known {
            Some(node) if node.open_count > 0 => {
                let id = node.id;
                let lock = self.cache.flush_lock(id);
                let _flush = lock.lock().await;
                self.cache.pin(id)?;
                let removed = async {
                    let kept = self.preserve(id, &path, &cfg).await?;
                    self.transport.remove(&path).await?;
                    Ok::<_, BridgeError>(kept)
                }
                .await;
                let kept = match removed {
                    Ok(kept) => kept,
                    Err(e) => {
                        self.cache.unpin(id);
                        return Err(e);
                    }
                };
                self.nodes.mark_unlinked(id)?;
                self.cache.detach(id)?;
                self.keep_preserved(id, kept)?;
                info!(node = %id, path = %path.display(), "unlinked while open");
            }
            Some(node) => {
                self.transport.remove(&path).await?;
                self.nodes.mark_unlinked(node.id)?;
                self.cache.discard(node.id);
                self.nodes.destroy_if_orphaned(node.id);
            }
            None => self.transport.remove(&path).await?,
        }
        self.invalidate_parent(&path);
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn rmdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let path = path::norm_path(path.as_ref());
        if path == Path::new(path::ROOT) {
            return Err(BridgeError::remote(libc::EBUSY, "cannot remove the mount root"));
        }
        self.transport.rmdir(&path).await?;
        if let Some(id) = self.nodes.lookup(&path) {
            self.nodes.mark_unlinked(id)?;
            self.nodes.invalidate_listing(id);
            self.cache.discard(id);
            self.nodes.destroy_if_orphaned(id);
        }
        self.invalidate_parent(&path);
        Ok(())
    }

    /// Rename with replace semantics. Only the node's path changes.
    #[instrument(
        level = "debug",
        skip_all,
        fields(from = %from.as_ref().display(), to = %to.as_ref().display())
    )]
    pub async fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let from = path::norm_path(from.as_ref());
        let to = path::norm_path(to.as_ref());
        if from == to {
            return Ok(());
        }
        if path::is_within(&to, &from) {
            return Err(BridgeError::InvalidArgument(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }
        let id = match self.nodes.lookup(&from) {
            Some(id) => id,
            None => self.stat_path(&from, &cfg).await?.0,
        };

        // an open target must stay readable after the device drops it
        let target = self
            .nodes
            .lookup(&to)
            .and_then(|t| self.nodes.get(t))
            .filter(|t| t.id != id);
        let open_target = target.as_ref().filter(|t| t.open_count > 0).map(|t| t.id);
        let mut kept = None;
        if let Some(t) = open_target {
            self.cache.pin(t)?;
            match self.preserve(t, &to, &cfg).await {
                Ok(k) => kept = Some(k),
                Err(e) => {
                    self.cache.unpin(t);
                    return Err(e);
                }
            }
        }

        let lock = self.cache.flush_lock(id);
        let _flush = lock.lock().await;
        if let Err(e) = self.transport.rename(&from, &to).await {
            if let Some(t) = open_target {
                self.cache.unpin(t);
            }
            return Err(e);
        }
        if let Some(old) = self.nodes.rename(id, &to)? {
            if open_target == Some(old) {
                self.cache.detach(old)?;
                if let Some(k) = kept {
                    self.keep_preserved(old, k)?;
                }
            } else {
                self.cache.discard(old);
                self.nodes.destroy_if_orphaned(old);
            }
        }
        self.invalidate_parent(&from);
        self.invalidate_parent(&to);
        debug!(node = %id, from = %from.display(), to = %to.display(), "renamed");
        Ok(())
    }

    /// Pull an open file into pinned pages before its device copy goes away.
    /// At most one cache budget is kept; returns how many bytes survive.
    async fn preserve(&self, id: NodeId, path: &Path, cfg: &Config) -> Result<u64> {
        let size = self.nodes.size(id)?;
        let kept = size.min(cfg.cache_budget);
        if kept < size {
            warn!(
                node = %id,
                path = %path.display(),
                size,
                budget = cfg.cache_budget,
                "open file is larger than the cache budget, only its head stays readable"
            );
        }
        self.cache.preload(id, kept, cfg).await?;
        Ok(kept)
    }

    /// Cut a detached node down to what [`preserve`](Self::preserve) kept.
    fn keep_preserved(&self, id: NodeId, kept: u64) -> Result<()> {
        if self.nodes.size(id)? > kept {
            self.nodes.set_size(id, kept)?;
        }
        Ok(())
    }

    /// Copy `len` bytes between two files on the device without moving the data
    /// through the host. Both files are written back first, the target's cached
    /// pages are dropped and its attributes re-read afterwards.
    pub async fn copy_range(
        &self,
        from: NodeId,
        from_offset: u64,
        to: NodeId,
        to_offset: u64,
        len: u64,
    ) -> Result<u64> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let src = self.node(from)?;
        let dst = self.node(to)?;
        for n in [&src, &dst] {
            if n.kind == NodeKind::Directory {
                return Err(BridgeError::IsADirectory {
                    path: n.path.clone().into(),
                });
            }
            if n.unlinked {
                // the kernel falls back to copying through read and write
                return Err(BridgeError::remote(
                    libc::EOPNOTSUPP,
                    format!("node {} has no device copy", n.id),
                ));
            }
        }
        if len == 0 {
            return Ok(0);
        }
        self.cache.flush(from, &cfg).await?;
        if to != from {
            self.cache.flush(to, &cfg).await?;
        }
        let copied = self
            .transport
            .copy_range(&src.path, from_offset, &dst.path, to_offset, len)
            .await?;
        self.cache.invalidate(Some(to), &cfg).await?;
        let attr = self.transport.stat(&dst.path).await?;
        self.observe(&dst.path, attr);
        self.invalidate_parent(&dst.path);
        debug!(%from, %to, copied, "copied on device");
        Ok(copied)
    }

    /// Change the size. Committed to the device at once unless the file is open.
    pub async fn truncate(&self, id: NodeId, size: u64) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let node = self.node(id)?;
        if node.kind == NodeKind::Directory {
            return Err(BridgeError::IsADirectory {
                path: node.path.into(),
            });
        }
        self.cache.truncate(id, size, &cfg).await?;
        if node.open_count == 0 && !node.unlinked {
            self.cache.flush(id, &cfg).await?;
        }
        Ok(())
    }

    pub async fn set_times(&self, id: NodeId, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let node = self.node(id)?;
        let now = SystemTime::now();
        if !node.unlinked {
            // a later write-back would stamp its own mtime
            if self.cache.has_pending(id) {
                self.cache.flush(id, &cfg).await?;
            }
            self.transport.set_times(&node.path, atime, mtime).await?;
        }
        self.nodes
            .set_times(id, atime.resolve(now), mtime.resolve(now))
    }

    /// Drop one open reference. The last release of an unlinked node destroys
    /// it; otherwise pending changes are written back.
    pub async fn release(&self, id: NodeId) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let remaining = self.nodes.release(id)?;
        let node = self.node(id)?;
        if node.unlinked {
            if remaining == 0 {
                let dropped = self.cache.discard(id);
                self.nodes.destroy_if_orphaned(id);
                debug!(node = %id, dropped, "unlinked node closed");
            }
            return Ok(());
        }
        if self.cache.has_pending(id) {
            self.cache.flush(id, &cfg).await?;
        }
        if remaining == 0 && !self.cache.has_state(id) {
            self.nodes.destroy_if_orphaned(id);
        }
        Ok(())
    }

    /// Write back pending changes of `id` now.
    pub async fn flush(&self, id: NodeId) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        if self.node(id)?.unlinked {
            return Ok(());
        }
        self.cache.flush(id, &cfg).await
    }

    /// Drop `n` kernel lookup references.
    pub fn forget(&self, id: NodeId, n: u64) {
        if self.nodes.forget(id, n) == 0 && !self.cache.has_state(id) {
            self.nodes.destroy_if_orphaned(id);
        }
    }

    pub async fn readlink(&self, id: NodeId) -> Result<PathBuf> {
        let _guard = self.reconfigure.read().await;
        let node = self.node(id)?;
        self.transport.readlink(&node.path).await
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.nodes.len() as u64,
            ffree: u64::MAX / 2,
            bsize: STATFS_BLOCK_SIZE,
            namelen: STATFS_NAME_LEN,
        }
    }

    pub fn symlink(&self, _path: &Path, _target: &Path) -> Result<(NodeId, Attr)> {
        Err(BridgeError::NotSupported { op: "symlink" })
    }

    pub fn link(&self, _id: NodeId, _new_path: &Path) -> Result<(NodeId, Attr)> {
        Err(BridgeError::NotSupported { op: "link" })
    }

    pub fn chown(&self, _id: NodeId, _uid: Option<u32>, _gid: Option<u32>) -> Result<Attr> {
        Err(BridgeError::NotSupported { op: "chown" })
    }

    /// Flush every node with pending changes. Returns the first failure after
    /// trying them all.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        let mut first_err = None;
        for id in self.cache.dirty_nodes() {
            if let Err(e) = self.cache.flush(id, &cfg).await {
                warn!(node = %id, error = %e, "flush on shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(h) = self.flusher.lock().take() {
            h.abort();
        }
        info!("bridge shut down");
        first_err.map_or(Ok(()), Err)
    }

    /// Drop every clean page; dirty pages are flushed first. Returns bytes reclaimed.
    pub async fn invalidate_cache(&self) -> Result<u64> {
        let _guard = self.reconfigure.read().await;
        let cfg = self.config.snapshot();
        self.cache.invalidate(None, &cfg).await
    }

    pub fn page_size(&self) -> usize {
        self.config.snapshot().page_size
    }

    /// Switch to a new page size (rounded and clamped). Cached pages are
    /// invalidated first; the change is refused if any page must stay resident.
    pub async fn set_page_size(&self, bytes: u64) -> Result<(usize, usize)> {
        let _guard = self.reconfigure.write().await;
        let cfg = self.config.snapshot();
        let new = config::normalize_page_size(bytes);
        if new == cfg.page_size {
            return Ok((new, new));
        }
        self.cache.invalidate(None, &cfg).await?;
        if self.cache.page_count() > 0 {
            return Err(BridgeError::InvalidState(
                "pages of open unlinked files are still resident".into(),
            ));
        }
        let (old, next) = self.config.update(|c| {
            c.page_size = new;
            c.cache_budget = config::normalize_cache_budget(c.cache_budget, new);
        })?;
        info!(old = old.page_size, new = next.page_size, "page size changed");
        Ok((old.page_size, next.page_size))
    }

    pub fn cache_budget(&self) -> u64 {
        self.config.snapshot().cache_budget
    }

    pub fn set_cache_budget(&self, bytes: u64) -> Result<(u64, u64)> {
        let (old, next) = self.config.update(|c| {
            c.cache_budget = config::normalize_cache_budget(bytes, c.page_size);
        })?;
        self.cache.evict(&next);
        info!(old = old.cache_budget, new = next.cache_budget, "cache budget changed");
        Ok((old.cache_budget, next.cache_budget))
    }

    pub fn set_ttl(&self, ttl: Duration) -> Result<(Duration, Duration)> {
        let (old, next) = self.config.update(|c| c.ttl = ttl)?;
        Ok((old.ttl, next.ttl))
    }

    /// Change the per-request deadline. `None` when the transport has none.
    pub fn set_rpc_timeout(&self, timeout: Duration) -> Result<Option<(Duration, Duration)>> {
        if self.transport.rpc_timeout().is_none() {
            return Ok(None);
        }
        let (old, next) = self.config.update(|c| c.rpc_timeout = timeout)?;
        Ok(Some((old.rpc_timeout, next.rpc_timeout)))
    }

    pub fn set_log_level(&self, level: &str) -> Result<String> {
        let (old, _) = self.config.update(|c| c.log_level = level.to_string())?;
        Ok(old.log_level.clone())
    }

    pub fn info(&self) -> BridgeInfo {
        let cfg = self.config.snapshot();
        BridgeInfo {
            transport: self.transport.name(),
            log_level: cfg.log_level.clone(),
            ttl: cfg.ttl,
            rpc_timeout: self.transport.rpc_timeout(),
            page_size: cfg.page_size,
            cache_budget: cfg.cache_budget,
            cache_used: self.cache.used_bytes(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(h) = self.flusher.lock().take() {
            h.abort();
        }
    }
}
