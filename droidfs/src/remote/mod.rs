//! Remote operation layer: everything the engine can ask of the device.
//!
//! Two transports implement [`Transport`]: [`channel::ChannelTransport`] talks to a
//! companion process over one pipelined stream, [`command::CommandTransport`] runs
//! one bridge-tool invocation per call. [`retry::Retrying`] wraps either one and
//! reissues idempotent calls after transient failures.

pub mod channel;
pub mod command;
pub mod memory;
pub mod retry;
pub mod wire;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::companion::{AdbConnector, CompanionConfig};
use crate::config::{ConfigRegistry, TransportMode};
use crate::device::Adb;
use crate::error::Result;
use crate::node::Attr;

/// How a timestamp should change in `set_times`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Omit,
    Now,
    At(SystemTime),
}

impl TimeSpec {
    pub fn resolve(self, now: SystemTime) -> Option<SystemTime> {
        match self {
            TimeSpec::Omit => None,
            TimeSpec::Now => Some(now),
            TimeSpec::At(t) => Some(t),
        }
    }
}

/// One child of a listed directory. The name is kept as the device's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: OsString,
    pub attr: Attr,
}

pub type EntryStream = BoxStream<'static, Result<RemoteEntry>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name reported by the control channel.
    fn name(&self) -> &'static str;

    /// Per-request deadline, or `None` when the transport has no such concept.
    fn rpc_timeout(&self) -> Option<Duration>;

    async fn stat(&self, path: &Path) -> Result<Attr>;

    async fn list(&self, dir: &Path) -> Result<EntryStream>;

    /// Read up to `len` bytes at `offset`. Short only at end of file.
    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes>;

    async fn write_range(&self, path: &Path, offset: u64, data: Bytes) -> Result<usize>;

    async fn create(&self, path: &Path, mode: u32) -> Result<()>;

    async fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;

    async fn remove(&self, path: &Path) -> Result<()>;

    async fn rmdir(&self, path: &Path) -> Result<()>;

    /// Rename with replace semantics.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn truncate(&self, path: &Path, size: u64) -> Result<()>;

    async fn set_times(&self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()>;

    async fn readlink(&self, path: &Path) -> Result<PathBuf>;

    /// Copy `len` bytes between two device files without moving them through the host.
    /// Returns the number of bytes copied, which is short only at the source's end.
    async fn copy_range(
        &self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: u64,
        len: u64,
    ) -> Result<u64>;
}

/// Pick the transport for a mount. The choice is made once here and never revisited.
///
/// With `fallback`, a channel transport that cannot be brought up degrades to the
/// command transport and the registry is updated to say so.
pub async fn establish(
    adb: Adb,
    companion: CompanionConfig,
    fallback: bool,
    config: Arc<ConfigRegistry>,
) -> Result<Arc<dyn Transport>> {
    let mode = config.snapshot().transport_mode;
    let inner: Arc<dyn Transport> = match mode {
        TransportMode::Command => Arc::new(command::CommandTransport::new(adb)),
        TransportMode::Channel => {
            let connector = Arc::new(AdbConnector::new(adb.clone(), companion));
            match channel::ChannelTransport::connect(connector, config.clone()).await {
                Ok(t) => {
                    info!("connected to companion process");
                    Arc::new(t)
                }
                Err(e) if fallback => {
                    warn!(error = %e, "companion unavailable, falling back to command transport");
                    config.update(|c| c.transport_mode = TransportMode::Command)?;
                    Arc::new(command::CommandTransport::new(adb))
                }
                Err(e) => return Err(e),
            }
        }
    };
    Ok(Arc::new(retry::Retrying::new(inner, config)))
}
