use async_trait::async_trait;
use bytes::Bytes;
use rand::{RngCore, rng};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{EntryStream, TimeSpec, Transport};
use crate::config::ConfigRegistry;
use crate::error::Result;
use crate::node::Attr;

/// Delay before attempt `c + 1`.
pub(crate) fn backoff_delay(c: u32) -> Duration {
    let random_delta = rng().next_u64() % 20;
    Duration::from_millis(20 + (1u64 << c.min(16)) + random_delta)
}

/// Run `f` until it succeeds, fails with a non-transient error, or `max_retries`
/// extra attempts have been spent.
pub(crate) async fn backoff<F, Fut, R>(max_retries: u32, op: &str, mut f: F) -> Result<R>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut c = 0;
    loop {
        match f().await {
            Ok(r) => return Ok(r),
            Err(e) if e.is_transient() && c < max_retries => {
                warn!(op, attempt = c + 1, error = %e, "transient failure, retrying");
                tokio::time::sleep(backoff_delay(c)).await;
                c += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reissues idempotent calls (`stat`, `list`, `read_range`, `readlink`) after
/// transient failures. Everything that mutates the device goes through once.
pub struct Retrying {
    inner: Arc<dyn Transport>,
    config: Arc<ConfigRegistry>,
}

impl Retrying {
    pub fn new(inner: Arc<dyn Transport>, config: Arc<ConfigRegistry>) -> Self {
        Self { inner, config }
    }

    fn max_retries(&self) -> u32 {
        self.config.snapshot().max_retries
    }
}

#[async_trait]
impl Transport for Retrying {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn rpc_timeout(&self) -> Option<Duration> {
        self.inner.rpc_timeout()
    }

    async fn stat(&self, path: &Path) -> Result<Attr> {
        backoff(self.max_retries(), "stat", || self.inner.stat(path)).await
    }

    async fn list(&self, dir: &Path) -> Result<EntryStream> {
        backoff(self.max_retries(), "list", || self.inner.list(dir)).await
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes> {
        backoff(self.max_retries(), "read", || {
            self.inner.read_range(path, offset, len)
        })
        .await
    }

    async fn write_range(&self, path: &Path, offset: u64, data: Bytes) -> Result<usize> {
        self.inner.write_range(path, offset, data).await
    }

    async fn create(&self, path: &Path, mode: u32) -> Result<()> {
        self.inner.create(path, mode).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.inner.mkdir(path, mode).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.inner.remove(path).await
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        self.inner.rmdir(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        self.inner.truncate(path, size).await
    }

    async fn set_times(&self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        self.inner.set_times(path, atime, mtime).await
    }

    async fn readlink(&self, path: &Path) -> Result<PathBuf> {
        backoff(self.max_retries(), "readlink", || self.inner.readlink(path)).await
    }

    async fn copy_range(
        &self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: u64,
        len: u64,
    ) -> Result<u64> {
        self.inner
            .copy_range(from, from_offset, to, to_offset, len)
            .await
    }
}
