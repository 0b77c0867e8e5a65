//! Page cache.
//!
//! Pages are keyed by `(NodeId, index)` and never by path, so a rename leaves
//! every cached byte where it is. Clean pages expire after the configured TTL
//! and are evicted least-recently-touched first once the byte budget is
//! exceeded. Dirty pages stay until they are flushed; when only dirty pages are
//! left over budget the owning node is reported on the pressure channel.
//!
//! Each node also tracks how far its data actually extends on the device. Pages
//! at or past that extent are holes: they read as zeros and are never fetched.

pub mod page;
pub mod singleflight;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use self::page::{Page, PageSpan, split_range};
use self::singleflight::SingleFlight;
use crate::config::Config;
use crate::error::Result;
use crate::node::{NodeId, NodeTable};

/// Device-side page I/O used by the cache on miss and write-back.
#[async_trait]
pub trait PageIo: Send + Sync {
    async fn read_page(&self, node: NodeId, index: u64, page_size: usize) -> Result<Bytes>;

    async fn write_page(&self, node: NodeId, index: u64, page_size: usize, data: Bytes)
    -> Result<()>;

    /// Set the device-side length of the node's file.
    async fn commit_size(&self, node: NodeId, size: u64) -> Result<()>;
}

struct FileState {
    pages: BTreeMap<u64, Page>,
    /// Bytes of this file that exist on the device.
    device_extent: u64,
    /// Local size differs from the device and must be committed on flush.
    size_dirty: bool,
    /// The device copy is longer than `device_extent` and must be cut first.
    shrunk: bool,
    /// Bumped when cached content is invalidated; fetches started under an older
    /// epoch are not inserted.
    epoch: u64,
    /// Never evicted or invalidated.
    pinned: bool,
    /// The device copy is gone; missing pages read as zeros.
    detached: bool,
}

impl FileState {
    fn new(device_extent: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            device_extent,
            size_dirty: false,
            shrunk: false,
            epoch: 0,
            pinned: false,
            detached: false,
        }
    }

    fn has_pending(&self) -> bool {
        self.size_dirty || self.shrunk || self.pages.values().any(|p| p.dirty)
    }

    fn is_idle(&self) -> bool {
        self.pages.is_empty() && !self.size_dirty && !self.shrunk && !self.pinned
    }
}

#[derive(Default)]
struct State {
    files: HashMap<NodeId, FileState>,
    /// touched clock -> page; ascending order is eviction order.
    lru: BTreeMap<u64, (NodeId, u64)>,
    clock: u64,
    used: u64,
    /// Nodes already reported on the pressure channel and not flushed since.
    pressured: HashSet<NodeId>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn file_mut(&mut self, node: NodeId, nodes: &NodeTable) -> Result<&mut FileState> {
        use std::collections::hash_map::Entry;
        match self.files.entry(node) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let size = nodes.size(node)?;
                Ok(e.insert(FileState::new(size)))
            }
        }
    }

    fn page(&self, node: NodeId, index: u64) -> Option<&Page> {
        self.files.get(&node)?.pages.get(&index)
    }

    fn page_mut(&mut self, node: NodeId, index: u64) -> Option<&mut Page> {
        self.files.get_mut(&node)?.pages.get_mut(&index)
    }

    fn touch(&mut self, node: NodeId, index: u64) {
        let t = self.tick();
        if let Some(p) = self.page_mut(node, index) {
            let old = std::mem::replace(&mut p.touched, t);
            self.lru.remove(&old);
            self.lru.insert(t, (node, index));
        }
    }

    /// Insert `page`, replacing any page at the same index. The file must exist.
    fn insert_page(&mut self, node: NodeId, index: u64, mut page: Page) {
        self.remove_page(node, index);
        let t = self.tick();
        page.touched = t;
        let charge = page.charge;
        if let Some(fs) = self.files.get_mut(&node) {
            fs.pages.insert(index, page);
            self.lru.insert(t, (node, index));
            self.used += charge;
        }
    }

    fn remove_page(&mut self, node: NodeId, index: u64) -> Option<Page> {
        let page = self.files.get_mut(&node)?.pages.remove(&index)?;
        self.lru.remove(&page.touched);
        self.used -= page.charge;
        Some(page)
    }

    /// Forget the file's state if nothing in it is worth keeping. Returns
    /// whether the cache now holds nothing for `node`.
    fn drop_if_idle(&mut self, node: NodeId) -> bool {
        match self.files.get(&node) {
            Some(fs) if fs.is_idle() => {
                self.files.remove(&node);
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

/// Whether a write covering `span` must first fetch the page's device bytes.
fn needs_base(fs: &FileState, span: &PageSpan, ps: usize, cfg: &Config, now: Instant) -> bool {
    if span.covers_whole_page(ps) || fs.detached || span.index * ps as u64 >= fs.device_extent {
        return false;
    }
    match fs.pages.get(&span.index) {
        Some(p) => !p.dirty && !p.is_fresh(cfg.ttl, now),
        None => true,
    }
}

pub struct PageCache {
    nodes: Arc<NodeTable>,
    io: Arc<dyn PageIo>,
    state: Mutex<State>,
    inflight: SingleFlight<(NodeId, u64, u64), Bytes>,
    flush_locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
    pressure_tx: mpsc::UnboundedSender<NodeId>,
    pressure_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeId>>>,
}

impl PageCache {
    pub fn new(nodes: Arc<NodeTable>, io: Arc<dyn PageIo>) -> Self {
        let (pressure_tx, pressure_rx) = mpsc::unbounded_channel();
        Self {
            nodes,
            io,
            state: Mutex::new(State::default()),
            inflight: SingleFlight::new(),
            flush_locks: Mutex::new(HashMap::new()),
            pressure_tx,
            pressure_rx: Mutex::new(Some(pressure_rx)),
        }
    }

    /// Receiver of nodes whose dirty pages keep the cache over budget.
    /// Can be taken once.
    pub fn take_pressure(&self) -> Option<mpsc::UnboundedReceiver<NodeId>> {
        self.pressure_rx.lock().take()
    }

    /// Per-node lock serializing write-back, truncation and rename.
    pub fn flush_lock(&self, node: NodeId) -> Arc<tokio::sync::Mutex<()>> {
        self.flush_locks.lock().entry(node).or_default().clone()
    }

    /// Read up to `len` bytes at `offset`, clamped to the node's current size.
    pub async fn read(&self, node: NodeId, offset: u64, len: usize, cfg: &Config) -> Result<Bytes> {
        let size = self.nodes.size(node)?;
        if offset >= size || len == 0 {
            return Ok(Bytes::new());
        }
        let len = (size - offset).min(len as u64) as usize;
        let spans = split_range(cfg.page_size, offset, len);
        let pages = try_join_all(spans.iter().map(|s| self.load_page(node, s.index, cfg))).await?;

        let mut out = BytesMut::with_capacity(len);
        for (span, data) in spans.iter().zip(pages) {
            let start = span.offset_in_page.min(data.len());
            let end = span.end_in_page().min(data.len());
            out.extend_from_slice(&data[start..end]);
            // past the valid prefix: hole or end of device data
            out.resize(out.len() + span.len - (end - start), 0);
        }
        self.evict(cfg);
        Ok(out.freeze())
    }

    /// Return the valid prefix of a page, fetching it if it is missing or stale.
    async fn load_page(&self, node: NodeId, index: u64, cfg: &Config) -> Result<Bytes> {
        let ps = cfg.page_size;
        let epoch = {
            let mut st = self.state.lock();
            let now = Instant::now();
            let fs = st.file_mut(node, &self.nodes)?;
            let detached = fs.detached;
            let hole = index * ps as u64 >= fs.device_extent;
            let epoch = fs.epoch;
            let cached = fs
                .pages
                .get(&index)
                .filter(|p| p.dirty || detached || p.is_fresh(cfg.ttl, now))
                .map(|p| Bytes::copy_from_slice(&p.data));
            if let Some(data) = cached {
                st.touch(node, index);
                return Ok(data);
            }
            if detached || hole {
                return Ok(Bytes::new());
            }
            epoch
        };

        let data = self
            .inflight
            .execute((node, index, epoch), || self.io.read_page(node, index, ps))
            .await?;
        trace!(%node, index, len = data.len(), "page fetched");

        let mut st = self.state.lock();
        let Some(fs) = st.files.get(&node) else {
            return Ok(data);
        };
        if fs.epoch != epoch {
            return Ok(data);
        }
        // the device may still hold bytes we have already truncated away
        let valid = fs
            .device_extent
            .saturating_sub(index * ps as u64)
            .min(ps as u64) as usize;
        let data = data.slice(..data.len().min(valid));
        if let Some(p) = st.page(node, index).filter(|p| p.dirty) {
            let local = Bytes::copy_from_slice(&p.data);
            st.touch(node, index);
            return Ok(local);
        }
        st.insert_page(node, index, Page::clean(data.to_vec(), 0, ps as u64));
        Ok(data)
    }

    /// Absorb a write into dirty pages and grow the node if it ends past EOF.
    pub async fn write(&self, node: NodeId, offset: u64, data: &[u8], cfg: &Config) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let ps = cfg.page_size;
        let spans = split_range(ps, offset, data.len());

        // Partial pages with device data under them need a base copy. Fetching
        // drops the lock, and a page that looked usable may be evicted or expire
        // meanwhile, so the check is repeated until it holds under the lock.
        let mut bases: HashMap<u64, Bytes> = HashMap::new();
        loop {
            let missing: Vec<u64> = {
                let mut st = self.state.lock();
                let now = Instant::now();
                let fs = st.file_mut(node, &self.nodes)?;
                let missing: Vec<u64> = spans
                    .iter()
                    .filter(|s| needs_base(fs, s, ps, cfg, now) && !bases.contains_key(&s.index))
                    .map(|s| s.index)
                    .collect();
                if missing.is_empty() {
                    Self::apply_write(&mut *st, node, &spans, data, &bases, cfg, now);
                    break;
                }
                missing
            };
            let fetched = try_join_all(missing.iter().map(|&i| self.load_page(node, i, cfg))).await?;
            bases.extend(missing.into_iter().zip(fetched));
        }

        self.nodes.extend_size(node, offset + data.len() as u64)?;
        self.evict(cfg);
        Ok(data.len())
    }

    /// Overlay `data` onto the pages of `spans`. Every page that needs a base has
    /// one in `bases`; the file state exists.
    fn apply_write(
        st: &mut State,
        node: NodeId,
        spans: &[PageSpan],
        data: &[u8],
        bases: &HashMap<u64, Bytes>,
        cfg: &Config,
        now: Instant,
    ) {
        let ps = cfg.page_size;
        let (extent, detached) = st
            .files
            .get(&node)
            .map_or((0, false), |fs| (fs.device_extent, fs.detached));
        let mut cursor = 0;
        for span in spans {
            let chunk = &data[cursor..cursor + span.len];
            cursor += span.len;
            let usable = st
                .page(node, span.index)
                .is_some_and(|p| p.dirty || detached || p.is_fresh(cfg.ttl, now));
            if !usable {
                let valid = extent.saturating_sub(span.index * ps as u64).min(ps as u64) as usize;
                let base = bases
                    .get(&span.index)
                    .map(|b| b[..b.len().min(valid)].to_vec())
                    .unwrap_or_default();
                st.insert_page(node, span.index, Page::clean(base, 0, ps as u64));
            }
            if let Some(p) = st.page_mut(node, span.index) {
                p.overlay(span.offset_in_page, chunk);
            }
            st.touch(node, span.index);
        }
    }

    /// Change the node's size locally. The device is updated on the next flush.
    pub async fn truncate(&self, node: NodeId, new_size: u64, cfg: &Config) -> Result<()> {
        let lock = self.flush_lock(node);
        let _guard = lock.lock().await;
        let ps = cfg.page_size as u64;
        {
            let mut st = self.state.lock();
            let fs = st.file_mut(node, &self.nodes)?;
            let doomed: Vec<u64> = fs
                .pages
                .range(new_size.div_ceil(ps)..)
                .map(|(&i, _)| i)
                .collect();
            let cut = (new_size % ps) as usize;
            if cut > 0 {
                if let Some(p) = fs.pages.get_mut(&(new_size / ps)) {
                    if p.data.len() > cut {
                        p.data.truncate(cut);
                        p.dirty = true;
                        p.version += 1;
                    }
                }
            }
            if new_size < fs.device_extent {
                fs.device_extent = new_size;
                fs.shrunk = true;
            }
            fs.size_dirty = true;
            fs.epoch += 1;
            for i in doomed {
                st.remove_page(node, i);
            }
        }
        self.nodes.set_size(node, new_size)?;
        debug!(%node, new_size, "truncated in cache");
        Ok(())
    }

    /// Write back every dirty page of `node` in ascending order, then commit the
    /// size. A failed page stays dirty; pages written before it are clean.
    pub async fn flush(&self, node: NodeId, cfg: &Config) -> Result<()> {
        let lock = self.flush_lock(node);
        let _guard = lock.lock().await;
        self.flush_locked(node, cfg).await
    }

    /// Like [`flush`](Self::flush) for a caller already holding the node's flush lock.
    pub async fn flush_locked(&self, node: NodeId, cfg: &Config) -> Result<()> {
        let ps = cfg.page_size;
        let (shrunk, extent, size_dirty, dirty) = {
            let st = self.state.lock();
            let Some(fs) = st.files.get(&node) else {
                return Ok(());
            };
            let dirty: Vec<(u64, Bytes, u64)> = fs
                .pages
                .iter()
                .filter(|(_, p)| p.dirty)
                .map(|(&i, p)| (i, Bytes::copy_from_slice(&p.data), p.version))
                .collect();
            (fs.shrunk, fs.device_extent, fs.size_dirty, dirty)
        };
        if !shrunk && !size_dirty && dirty.is_empty() {
            return Ok(());
        }
        debug!(%node, pages = dirty.len(), shrunk, size_dirty, "flushing");

        let mut device_size = None;
        if shrunk {
            self.io.commit_size(node, extent).await?;
            if let Some(fs) = self.state.lock().files.get_mut(&node) {
                fs.shrunk = false;
            }
            device_size = Some(extent);
        }

        for (index, data, version) in dirty {
            let end = index * ps as u64 + data.len() as u64;
            if let Err(e) = self.io.write_page(node, index, ps, data).await {
                warn!(%node, index, error = %e, "page write-back failed");
                return Err(e);
            }
            let mut st = self.state.lock();
            if let Some(fs) = st.files.get_mut(&node) {
                fs.device_extent = fs.device_extent.max(end);
                if let Some(p) = fs.pages.get_mut(&index) {
                    if p.version == version {
                        p.dirty = false;
                        p.fetched_at = Instant::now();
                    }
                }
            }
            device_size = device_size.map(|s: u64| s.max(end));
        }

        if size_dirty {
            let size = self.nodes.size(node)?;
            if device_size != Some(size) {
                self.io.commit_size(node, size).await?;
            }
            if let Some(fs) = self.state.lock().files.get_mut(&node) {
                fs.size_dirty = false;
                fs.device_extent = size;
            }
        }
        self.state.lock().pressured.remove(&node);
        Ok(())
    }

    /// Drop clean pages of `target` (or of every node), flushing dirty ones
    /// first. Pinned and unlinked nodes are left alone. Returns bytes reclaimed.
    pub async fn invalidate(&self, target: Option<NodeId>, cfg: &Config) -> Result<u64> {
        let targets: Vec<NodeId> = match target {
            Some(n) => vec![n],
            None => self.state.lock().files.keys().copied().collect(),
        };
        let mut reclaimed = 0;
        for node in targets {
            let unlinked = self.nodes.get(node).is_none_or(|n| n.unlinked);
            let (pinned, pending) = match self.state.lock().files.get(&node) {
                Some(fs) => (fs.pinned, fs.has_pending()),
                None => continue,
            };
            if pinned || unlinked {
                continue;
            }
            if pending {
                self.flush(node, cfg).await?;
            }
            {
                let mut st = self.state.lock();
                let clean: Vec<u64> = match st.files.get_mut(&node) {
                    Some(fs) => {
                        fs.epoch += 1;
                        fs.pages
                            .iter()
                            .filter(|(_, p)| !p.dirty)
                            .map(|(&i, _)| i)
                            .collect()
                    }
                    None => continue,
                };
                for i in clean {
                    if let Some(p) = st.remove_page(node, i) {
                        reclaimed += p.charge;
                    }
                }
            }
            self.nodes.invalidate_attr(node);
            self.reap(node);
        }
        debug!(reclaimed, "cache invalidated");
        Ok(reclaimed)
    }

    /// Evict clean pages, least recently touched first, until under budget.
    pub fn evict(&self, cfg: &Config) {
        let budget = cfg.cache_budget;
        let mut emptied = Vec::new();
        let mut pressured = Vec::new();
        {
            let mut st = self.state.lock();
            if st.used <= budget {
                return;
            }
            let mut excess = st.used - budget;
            let mut victims = Vec::new();
            for &(n, i) in st.lru.values() {
                if excess == 0 {
                    break;
                }
                let Some(fs) = st.files.get(&n) else {
                    continue;
                };
                if fs.pinned {
                    continue;
                }
                if let Some(p) = fs.pages.get(&i).filter(|p| !p.dirty) {
                    excess = excess.saturating_sub(p.charge);
                    victims.push((n, i));
                }
            }
            for (n, i) in victims {
                st.remove_page(n, i);
                if !emptied.contains(&n) {
                    emptied.push(n);
                }
            }
            if st.used > budget {
                let dirty: Vec<NodeId> = st
                    .files
                    .iter()
                    .filter(|(_, fs)| !fs.detached && fs.pages.values().any(|p| p.dirty))
                    .map(|(&n, _)| n)
                    .collect();
                for n in dirty {
                    if st.pressured.insert(n) {
                        pressured.push(n);
                    }
                }
            }
        }
        for n in pressured {
            debug!(node = %n, "cache over budget with dirty pages");
            let _ = self.pressure_tx.send(n);
        }
        for n in emptied {
            self.reap(n);
        }
    }

    /// Destroy `node` if the cache holds nothing for it and nothing else refers to it.
    fn reap(&self, node: NodeId) {
        let idle = self.state.lock().drop_if_idle(node);
        if idle && self.nodes.destroy_if_orphaned(node) {
            self.flush_locks.lock().remove(&node);
            trace!(%node, "node destroyed");
        }
    }

    /// Forget everything cached for `node`, dirty pages included. Returns bytes freed.
    pub fn discard(&self, node: NodeId) -> u64 {
        let mut st = self.state.lock();
        let Some(fs) = st.files.remove(&node) else {
            return 0;
        };
        let mut freed = 0;
        for p in fs.pages.values() {
            st.lru.remove(&p.touched);
            freed += p.charge;
        }
        st.used -= freed;
        st.pressured.remove(&node);
        drop(st);
        self.flush_locks.lock().remove(&node);
        freed
    }

    /// Keep every page of `node` resident regardless of budget and invalidation.
    pub fn pin(&self, node: NodeId) -> Result<()> {
        self.state.lock().file_mut(node, &self.nodes)?.pinned = true;
        Ok(())
    }

    pub fn unpin(&self, node: NodeId) {
        if let Some(fs) = self.state.lock().files.get_mut(&node) {
            fs.pinned = false;
        }
    }

    /// Fetch the pages covering the first `limit` bytes of `node` that are not
    /// cached or are stale.
    pub async fn preload(&self, node: NodeId, limit: u64, cfg: &Config) -> Result<()> {
        let size = self.nodes.size(node)?.min(limit);
        let pages = size.div_ceil(cfg.page_size as u64);
        try_join_all((0..pages).map(|i| self.load_page(node, i, cfg))).await?;
        Ok(())
    }

    /// Mark the device copy of `node` as gone. Cached pages become the only copy.
    pub fn detach(&self, node: NodeId) -> Result<()> {
        let mut st = self.state.lock();
        let fs = st.file_mut(node, &self.nodes)?;
        fs.detached = true;
        fs.device_extent = 0;
        Ok(())
    }

    /// Record a device size observed by a fresh stat, unless local changes are pending.
    pub fn sync_extent(&self, node: NodeId, size: u64) {
        if let Some(fs) = self.state.lock().files.get_mut(&node) {
            if !fs.has_pending() && !fs.detached {
                fs.device_extent = size;
            }
        }
    }

    pub fn has_pending(&self, node: NodeId) -> bool {
        self.state
            .lock()
            .files
            .get(&node)
            .is_some_and(FileState::has_pending)
    }

    pub fn has_state(&self, node: NodeId) -> bool {
        self.state.lock().files.contains_key(&node)
    }

    /// Nodes with unflushed changes, detached ones excluded.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .state
            .lock()
            .files
            .iter()
            .filter(|(_, fs)| !fs.detached && fs.has_pending())
            .map(|(&n, _)| n)
            .collect();
        out.sort();
        out
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    pub fn page_count(&self) -> usize {
        self.state.lock().lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::node::NodeKind;
    use crate::remote::Transport;
    use crate::remote::memory::{MemoryDevice, RemoteOp};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// Page I/O straight against a memory device, with one page index that can
    /// be made to fail on write and one that can be made slow to read.
    struct DevIo {
        nodes: Arc<NodeTable>,
        dev: Arc<MemoryDevice>,
        fail_write: Mutex<Option<u64>>,
        slow_read: Mutex<Option<(u64, Duration)>>,
    }

    impl DevIo {
        fn path(&self, node: NodeId) -> Result<PathBuf> {
            self.nodes
                .path_of(node)
                .ok_or_else(|| BridgeError::InvalidState("gone".into()))
        }
    }

    #[async_trait]
    impl PageIo for DevIo {
        async fn read_page(&self, node: NodeId, index: u64, ps: usize) -> Result<Bytes> {
            let delay = (*self.slow_read.lock()).filter(|(i, _)| *i == index);
            if let Some((_, d)) = delay {
                tokio::time::sleep(d).await;
            }
            self.dev.read_range(&self.path(node)?, index * ps as u64, ps).await
        }

        async fn write_page(&self, node: NodeId, index: u64, ps: usize, data: Bytes) -> Result<()> {
            if *self.fail_write.lock() == Some(index) {
                return Err(BridgeError::remote(libc::ENOSPC, "full"));
            }
            self.dev
                .write_range(&self.path(node)?, index * ps as u64, data)
                .await
                .map(|_| ())
        }

        async fn commit_size(&self, node: NodeId, size: u64) -> Result<()> {
            self.dev.truncate(&self.path(node)?, size).await
        }
    }

    const PS: usize = 4096;

    struct Fixture {
        dev: Arc<MemoryDevice>,
        io: Arc<DevIo>,
        cache: PageCache,
        node: NodeId,
        cfg: Config,
    }

    fn fixture(dev: MemoryDevice, content: &[u8], budget_pages: u64) -> Fixture {
        let dev = Arc::new(dev);
        dev.put_file("/f", content);
        let nodes = Arc::new(NodeTable::new());
        let node = nodes.resolve(Path::new("/f"), NodeKind::File);
        nodes.set_size(node, content.len() as u64).unwrap();
        nodes.retain(node).unwrap();
        let io = Arc::new(DevIo {
            nodes: nodes.clone(),
            dev: dev.clone(),
            fail_write: Mutex::new(None),
            slow_read: Mutex::new(None),
        });
        let cache = PageCache::new(nodes, io.clone());
        let cfg = Config::default()
            .with_page_size(PS)
            .with_cache_budget(budget_pages * PS as u64);
        Fixture {
            dev,
            io,
            cache,
            node,
            cfg,
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn read_fetches_only_overlapped_pages() {
        let data = pattern(3 * PS);
        let f = fixture(MemoryDevice::new(), &data, 16);
        let got = f.cache.read(f.node, PS as u64 + 10, 100, &f.cfg).await.unwrap();
        assert_eq!(&got[..], &data[PS + 10..PS + 110]);
        assert_eq!(f.dev.calls(RemoteOp::Read), 1);

        f.cache.read(f.node, PS as u64, 5, &f.cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_on_one_page_fetch_once() {
        let data = pattern(PS);
        let f = fixture(MemoryDevice::new().with_latency(Duration::from_millis(30)), &data, 16);
        let reads = (0..6).map(|i| f.cache.read(f.node, i * 10, 10, &f.cfg));
        let results = try_join_all(reads).await.unwrap();
        assert_eq!(&results[3][..], &data[30..40]);
        assert_eq!(f.dev.calls(RemoteOp::Read), 1);
    }

    #[tokio::test]
    async fn zero_ttl_refetches_every_time() {
        let f = fixture(MemoryDevice::new(), b"abc", 16);
        let cfg = f.cfg.clone().with_ttl(Duration::ZERO);
        f.cache.read(f.node, 0, 3, &cfg).await.unwrap();
        f.cache.read(f.node, 0, 3, &cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), 2);
    }

    #[tokio::test]
    async fn evicts_least_recently_touched_clean_page() {
        let data = pattern(3 * PS);
        let f = fixture(MemoryDevice::new(), &data, 2);
        for i in 0..3u64 {
            f.cache.read(f.node, i * PS as u64, 1, &f.cfg).await.unwrap();
        }
        assert_eq!(f.cache.used_bytes(), 2 * PS as u64);
        // pages 1 and 2 remain
        f.cache.read(f.node, 2 * PS as u64, 1, &f.cfg).await.unwrap();
        f.cache.read(f.node, PS as u64, 1, &f.cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), 3);
        f.cache.read(f.node, 0, 1, &f.cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), 4);
    }

    #[tokio::test]
    async fn dirty_pages_exceed_budget_and_signal_pressure() {
        let f = fixture(MemoryDevice::new(), b"", 1);
        let mut pressure = f.cache.take_pressure().unwrap();
        f.cache.write(f.node, 0, &pattern(3 * PS), &f.cfg).await.unwrap();
        assert_eq!(f.cache.used_bytes(), 3 * PS as u64);
        assert_eq!(pressure.recv().await, Some(f.node));

        f.cache.flush(f.node, &f.cfg).await.unwrap();
        assert_eq!(f.dev.contents("/f").unwrap(), pattern(3 * PS));
        f.cache.read(f.node, 0, 1, &f.cfg).await.unwrap();
        assert!(f.cache.used_bytes() <= PS as u64);
    }

    #[tokio::test]
    async fn failed_page_stays_dirty_and_earlier_pages_are_clean() {
        let f = fixture(MemoryDevice::new(), b"", 16);
        f.cache.write(f.node, 0, &pattern(3 * PS), &f.cfg).await.unwrap();
        *f.io.fail_write.lock() = Some(1);
        let err = f.cache.flush(f.node, &f.cfg).await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        assert_eq!(f.dev.contents("/f").unwrap(), pattern(PS));
        assert!(f.cache.has_pending(f.node));

        *f.io.fail_write.lock() = None;
        f.cache.flush(f.node, &f.cfg).await.unwrap();
        assert_eq!(f.dev.contents("/f").unwrap(), pattern(3 * PS));
        assert_eq!(f.dev.calls(RemoteOp::Write), 3);
        assert!(!f.cache.has_pending(f.node));
    }

    #[tokio::test]
    async fn partial_write_merges_with_device_page() {
        let f = fixture(MemoryDevice::new(), b"hello world", 16);
        f.cache.write(f.node, 6, b"there", &f.cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), 1);
        f.cache.flush(f.node, &f.cfg).await.unwrap();
        assert_eq!(f.dev.contents("/f").unwrap(), b"hello there");
    }

    #[tokio::test]
    async fn shrink_is_committed_before_pages() {
        let data = pattern(2 * PS);
        let f = fixture(MemoryDevice::new(), &data, 16);
        f.cache.truncate(f.node, 10, &f.cfg).await.unwrap();
        assert_eq!(f.cache.read(f.node, 0, 100, &f.cfg).await.unwrap(), &data[..10]);
        f.cache.truncate(f.node, 20, &f.cfg).await.unwrap();
        let got = f.cache.read(f.node, 0, 100, &f.cfg).await.unwrap();
        assert_eq!(&got[..10], &data[..10]);
        assert_eq!(&got[10..], &[0u8; 10]);

        f.cache.flush(f.node, &f.cfg).await.unwrap();
        let mut want = data[..10].to_vec();
        want.resize(20, 0);
        assert_eq!(f.dev.contents("/f").unwrap(), want);
        assert_eq!(f.dev.calls(RemoteOp::Truncate), 2);
    }

    #[tokio::test]
    async fn invalidate_reports_reclaimed_bytes_and_refetches() {
        let data = pattern(2 * PS);
        let f = fixture(MemoryDevice::new(), &data, 16);
        f.cache.read(f.node, 0, 2 * PS, &f.cfg).await.unwrap();
        f.cache.write(f.node, 0, b"x", &f.cfg).await.unwrap();
        let reclaimed = f.cache.invalidate(None, &f.cfg).await.unwrap();
        assert!(reclaimed >= 2 * PS as u64);
        assert_eq!(f.cache.used_bytes(), 0);
        assert_eq!(f.dev.contents("/f").unwrap()[0], b'x');

        let before = f.dev.calls(RemoteOp::Read);
        f.cache.read(f.node, 0, 1, &f.cfg).await.unwrap();
        assert_eq!(f.dev.calls(RemoteOp::Read), before + 1);
    }

    #[tokio::test]
    async fn detached_node_serves_preloaded_pages() {
        let data = pattern(2 * PS + 7);
        let f = fixture(MemoryDevice::new(), &data, 1);
        f.cache.pin(f.node).unwrap();
        f.cache.preload(f.node, u64::MAX, &f.cfg).await.unwrap();
        f.dev.remove(Path::new("/f")).await.unwrap();
        f.cache.detach(f.node).unwrap();
        let cfg = f.cfg.clone().with_ttl(Duration::ZERO);
        let got = f.cache.read(f.node, 0, data.len(), &cfg).await.unwrap();
        assert_eq!(&got[..], &data[..]);
        assert!(f.cache.dirty_nodes().is_empty());
    }

    #[tokio::test]
    async fn preload_stops_at_the_limit() {
        let data = pattern(4 * PS);
        let f = fixture(MemoryDevice::new(), &data, 1);
        f.cache.preload(f.node, 2 * PS as u64, &f.cfg).await.unwrap();
        assert_eq!(f.cache.page_count(), 2);
        assert_eq!(f.dev.calls(RemoteOp::Read), 2);
    }

    #[tokio::test]
    async fn write_refetches_a_base_evicted_while_waiting() {
        let content = pattern(4 * PS);
        let f = fixture(MemoryDevice::new(), &content, 2);
        f.cache.read(f.node, 0, PS, &f.cfg).await.unwrap();
        *f.io.slow_read.lock() = Some((1, Duration::from_millis(200)));

        // page 0 is cached and fresh, page 1 must be fetched slowly; meanwhile
        // reading pages 2 and 3 pushes page 0 out of the two-page budget
        let patch = vec![b'w'; PS];
        let write = f.cache.write(f.node, 10, &patch, &f.cfg);
        let read = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.cache.read(f.node, 2 * PS as u64, 2 * PS, &f.cfg).await
        };
        let (written, tail) = tokio::join!(write, read);
        assert_eq!(written.unwrap(), PS);
        assert_eq!(tail.unwrap(), &content[2 * PS..]);

        f.cache.flush(f.node, &f.cfg).await.unwrap();
        let mut want = content.clone();
        want[10..10 + PS].copy_from_slice(&patch);
        let on_device = f.dev.contents("/f").unwrap();
        assert_eq!(&on_device[..10], &content[..10]);
        assert_eq!(on_device, want);
    }
}
