//! In-process stand-in for a device, used by tests and local experiments.
//!
//! Counts every call per operation and can be told to fail the next N calls of an
//! operation with a chosen error, which is how retry and write-back behaviour is
//! exercised without hardware.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::{EntryStream, RemoteEntry, TimeSpec, Transport};
use crate::error::{BridgeError, Result};
use crate::node::{Attr, NodeKind};
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Stat,
    List,
    Read,
    Write,
    Create,
    Mkdir,
    Remove,
    Rmdir,
    Rename,
    Truncate,
    SetTimes,
    Readlink,
    CopyRange,
}

struct Entry {
    attr: Attr,
    data: Vec<u8>,
    target: Option<PathBuf>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<PathBuf, Entry>,
    faults: HashMap<RemoteOp, VecDeque<BridgeError>>,
    calls: HashMap<RemoteOp, u64>,
}

impl State {
    fn get(&self, p: &Path) -> Result<&Entry> {
        self.entries.get(p).ok_or_else(|| BridgeError::not_found(p))
    }

    fn get_mut(&mut self, p: &Path) -> Result<&mut Entry> {
        self.entries.get_mut(p).ok_or_else(|| BridgeError::not_found(p))
    }

    fn file_mut(&mut self, p: &Path) -> Result<&mut Entry> {
        let e = self.get_mut(p)?;
        if e.attr.kind() == NodeKind::Directory {
            return Err(BridgeError::IsADirectory { path: p.into() });
        }
        Ok(e)
    }

    fn require_parent_dir(&self, p: &Path) -> Result<()> {
        let parent = path::parent_of(p);
        match self.entries.get(&parent) {
            Some(e) if e.attr.kind() == NodeKind::Directory => Ok(()),
            Some(_) => Err(BridgeError::NotADirectory {
                path: parent.into(),
            }),
            None => Err(BridgeError::not_found(parent)),
        }
    }

    fn has_children(&self, p: &Path) -> bool {
        self.entries
            .keys()
            .any(|k| k != p && path::is_within(k, p))
    }
}

fn entry(mode: u32, data: Vec<u8>) -> Entry {
    let now = SystemTime::now();
    let mut attr = Attr::fresh(mode, now);
    attr.size = data.len() as u64;
    Entry {
        attr,
        data,
        target: None,
    }
}

fn write_at(e: &mut Entry, offset: u64, data: &[u8]) {
    let start = offset as usize;
    let end = start + data.len();
    if e.data.len() < end {
        e.data.resize(end, 0);
    }
    e.data[start..end].copy_from_slice(data);
    e.attr.size = e.data.len() as u64;
    e.attr.mtime = SystemTime::now();
}

pub struct MemoryDevice {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .entries
            .insert(path::root(), entry(libc::S_IFDIR as u32 | 0o755, Vec::new()));
        Self {
            state: Mutex::new(state),
            latency: None,
        }
    }

    /// Delay every call, so concurrent callers actually overlap.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..self
        }
    }

    pub fn put_dir(&self, p: impl AsRef<Path>) {
        self.state.lock().entries.insert(
            p.as_ref().to_path_buf(),
            entry(libc::S_IFDIR as u32 | 0o755, Vec::new()),
        );
    }

    pub fn put_file(&self, p: impl AsRef<Path>, data: &[u8]) {
        self.state.lock().entries.insert(
            p.as_ref().to_path_buf(),
            entry(libc::S_IFREG as u32 | 0o644, data.to_vec()),
        );
    }

    pub fn put_symlink(&self, p: impl AsRef<Path>, target: impl AsRef<Path>) {
        let target = target.as_ref();
        let mut e = entry(libc::S_IFLNK as u32 | 0o777, Vec::new());
        e.attr.size = path::as_bytes(target).len() as u64;
        e.target = Some(target.to_path_buf());
        self.state.lock().entries.insert(p.as_ref().to_path_buf(), e);
    }

    pub fn contents(&self, p: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state.lock().entries.get(p.as_ref()).map(|e| e.data.clone())
    }

    pub fn exists(&self, p: impl AsRef<Path>) -> bool {
        self.state.lock().entries.contains_key(p.as_ref())
    }

    pub fn calls(&self, op: RemoteOp) -> u64 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Fail the next call of `op` with `err`.
    pub fn inject(&self, op: RemoteOp, err: BridgeError) {
        self.inject_n(op, err, 1);
    }

    pub fn inject_n(&self, op: RemoteOp, err: BridgeError, n: usize) {
        let mut st = self.state.lock();
        let queue = st.faults.entry(op).or_default();
        for _ in 0..n {
            queue.push_back(err.clone());
        }
    }

    async fn enter(&self, op: RemoteOp) -> Result<()> {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state.lock();
        *st.calls.entry(op).or_default() += 1;
        match st.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryDevice {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn rpc_timeout(&self) -> Option<Duration> {
        None
    }

    async fn stat(&self, p: &Path) -> Result<Attr> {
        self.enter(RemoteOp::Stat).await?;
        Ok(self.state.lock().get(p)?.attr.clone())
    }

    async fn list(&self, dir: &Path) -> Result<EntryStream> {
        self.enter(RemoteOp::List).await?;
        let st = self.state.lock();
        let d = st.get(dir)?;
        if d.attr.kind() != NodeKind::Directory {
            return Err(BridgeError::NotADirectory { path: dir.into() });
        }
        let entries: Vec<Result<RemoteEntry>> = st
            .entries
            .iter()
            .filter(|(k, _)| k.as_path() != dir && path::parent_of(k) == dir)
            .map(|(k, e)| {
                Ok(RemoteEntry {
                    name: path::file_name(k).to_owned(),
                    attr: e.attr.clone(),
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(entries)))
    }

    async fn read_range(&self, p: &Path, offset: u64, len: usize) -> Result<Bytes> {
        self.enter(RemoteOp::Read).await?;
        let st = self.state.lock();
        let e = st.get(p)?;
        if e.attr.kind() == NodeKind::Directory {
            return Err(BridgeError::IsADirectory { path: p.into() });
        }
        let start = (offset as usize).min(e.data.len());
        let end = start.saturating_add(len).min(e.data.len());
        Ok(Bytes::copy_from_slice(&e.data[start..end]))
    }

    async fn write_range(&self, p: &Path, offset: u64, data: Bytes) -> Result<usize> {
        self.enter(RemoteOp::Write).await?;
        let mut st = self.state.lock();
        write_at(st.file_mut(p)?, offset, &data);
        Ok(data.len())
    }

    async fn create(&self, p: &Path, mode: u32) -> Result<()> {
        self.enter(RemoteOp::Create).await?;
        let mut st = self.state.lock();
        st.require_parent_dir(p)?;
        match st.entries.get(p) {
            Some(e) if e.attr.kind() == NodeKind::Directory => {
                Err(BridgeError::IsADirectory { path: p.into() })
            }
            Some(_) => Ok(()),
            None => {
                st.entries.insert(
                    p.to_path_buf(),
                    entry(libc::S_IFREG as u32 | (mode & 0o7777), Vec::new()),
                );
                Ok(())
            }
        }
    }

    async fn mkdir(&self, p: &Path, mode: u32) -> Result<()> {
        self.enter(RemoteOp::Mkdir).await?;
        let mut st = self.state.lock();
        st.require_parent_dir(p)?;
        if st.entries.contains_key(p) {
            return Err(BridgeError::already_exists(p));
        }
        st.entries.insert(
            p.to_path_buf(),
            entry(libc::S_IFDIR as u32 | (mode & 0o7777), Vec::new()),
        );
        Ok(())
    }

    async fn remove(&self, p: &Path) -> Result<()> {
        self.enter(RemoteOp::Remove).await?;
        let mut st = self.state.lock();
        if st.get(p)?.attr.kind() == NodeKind::Directory {
            return Err(BridgeError::IsADirectory { path: p.into() });
        }
        st.entries.remove(p);
        Ok(())
    }

    async fn rmdir(&self, p: &Path) -> Result<()> {
        self.enter(RemoteOp::Rmdir).await?;
        let mut st = self.state.lock();
        if st.get(p)?.attr.kind() != NodeKind::Directory {
            return Err(BridgeError::NotADirectory { path: p.into() });
        }
        if st.has_children(p) {
            return Err(BridgeError::DirectoryNotEmpty { path: p.into() });
        }
        st.entries.remove(p);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.enter(RemoteOp::Rename).await?;
        let mut st = self.state.lock();
        st.get(from)?;
        st.require_parent_dir(to)?;
        if from == to {
            return Ok(());
        }
        if let Some(existing) = st.entries.get(to) {
            if existing.attr.kind() == NodeKind::Directory && st.has_children(to) {
                return Err(BridgeError::DirectoryNotEmpty { path: to.into() });
            }
            st.entries.remove(to);
        }
        let moved: Vec<PathBuf> = st
            .entries
            .keys()
            .filter(|k| path::is_within(k, from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(e) = st.entries.remove(&old) {
                st.entries.insert(path::rebase(&old, from, to), e);
            }
        }
        Ok(())
    }

    async fn truncate(&self, p: &Path, size: u64) -> Result<()> {
        self.enter(RemoteOp::Truncate).await?;
        let mut st = self.state.lock();
        let e = st.file_mut(p)?;
        e.data.resize(size as usize, 0);
        e.attr.size = size;
        Ok(())
    }

    async fn set_times(&self, p: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        self.enter(RemoteOp::SetTimes).await?;
        let now = SystemTime::now();
        let mut st = self.state.lock();
        let e = st.get_mut(p)?;
        if let Some(t) = atime.resolve(now) {
            e.attr.atime = t;
        }
        if let Some(t) = mtime.resolve(now) {
            e.attr.mtime = t;
        }
        Ok(())
    }

    async fn readlink(&self, p: &Path) -> Result<PathBuf> {
        self.enter(RemoteOp::Readlink).await?;
        let st = self.state.lock();
        st.get(p)?.target.clone().ok_or_else(|| BridgeError::remote(libc::EINVAL, "not a link"))
    }

    async fn copy_range(
        &self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: u64,
        len: u64,
    ) -> Result<u64> {
        self.enter(RemoteOp::CopyRange).await?;
        let mut st = self.state.lock();
        let src = &st.file_mut(from)?.data;
        let start = (from_offset as usize).min(src.len());
        let end = start.saturating_add(len as usize).min(src.len());
        let chunk = src[start..end].to_vec();
        if !chunk.is_empty() {
            write_at(st.file_mut(to)?, to_offset, &chunk);
        } else {
            st.file_mut(to)?;
        }
        Ok(chunk.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[tokio::test]
    async fn listing_returns_direct_children_only() {
        let dev = MemoryDevice::new();
        dev.put_dir("/sdcard");
        dev.put_file("/sdcard/a", b"1");
        dev.put_dir("/sdcard/d");
        dev.put_file("/sdcard/d/nested", b"2");
        let names: Vec<_> = dev
            .list(p("/sdcard"))
            .await
            .unwrap()
            .map_ok(|e| e.name)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let dev = MemoryDevice::new();
        dev.put_file("/f", b"abc");
        dev.inject(RemoteOp::Read, BridgeError::Timeout);
        assert_eq!(dev.read_range(p("/f"), 0, 3).await, Err(BridgeError::Timeout));
        assert_eq!(dev.read_range(p("/f"), 1, 10).await.unwrap(), Bytes::from_static(b"bc"));
        assert_eq!(dev.calls(RemoteOp::Read), 2);
    }

    #[tokio::test]
    async fn rename_replaces_target_and_moves_children() {
        let dev = MemoryDevice::new();
        dev.put_dir("/d");
        dev.put_file("/d/x", b"x");
        dev.put_file("/e", b"old");
        dev.put_file("/f", b"new");
        dev.rename(p("/f"), p("/e")).await.unwrap();
        assert_eq!(dev.contents("/e").unwrap(), b"new");
        dev.rename(p("/d"), p("/d2")).await.unwrap();
        assert!(dev.exists("/d2/x"));
        assert!(!dev.exists("/d/x"));
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty() {
        let dev = MemoryDevice::new();
        dev.put_dir("/d");
        dev.put_file("/d/x", b"x");
        assert!(matches!(
            dev.rmdir(p("/d")).await,
            Err(BridgeError::DirectoryNotEmpty { .. })
        ));
    }

    #[tokio::test]
    async fn copy_range_stops_at_source_end() {
        let dev = MemoryDevice::new();
        dev.put_file("/src", b"0123456789");
        dev.put_file("/dst", b"abc");
        assert_eq!(dev.copy_range(p("/src"), 6, p("/dst"), 1, 100).await.unwrap(), 4);
        assert_eq!(dev.contents("/dst").unwrap(), b"a6789");
        assert_eq!(dev.copy_range(p("/src"), 20, p("/dst"), 0, 5).await.unwrap(), 0);
        assert!(matches!(
            dev.copy_range(p("/src"), 0, p("/nope"), 0, 1).await,
            Err(BridgeError::NotFound { .. })
        ));
    }
}
