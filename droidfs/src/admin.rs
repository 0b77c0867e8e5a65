//! Control channel: a Unix socket speaking length-prefixed JSON.
//!
//! One request per connection, `{"op": <name>, "value": <optional>}`, answered
//! with `{"status": "success"|"error", "value": <payload>}`.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::config::{KIB, MIB};
use crate::engine::{Bridge, VERSION};
use crate::error::{BridgeError, Result};
use crate::logging::LogControl;

pub const MAX_FRAME: usize = 4096;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    Help,
    Version,
    Info,
    InvalidateCache,
    GetPageSize,
    SetPageSize,
    GetCacheSize,
    SetCacheSize,
    SetTtl,
    SetTimeout,
    SetLogLevel,
}

impl AdminOp {
    pub const ALL: [AdminOp; 11] = [
        AdminOp::Help,
        AdminOp::Version,
        AdminOp::Info,
        AdminOp::InvalidateCache,
        AdminOp::GetPageSize,
        AdminOp::SetPageSize,
        AdminOp::GetCacheSize,
        AdminOp::SetCacheSize,
        AdminOp::SetTtl,
        AdminOp::SetTimeout,
        AdminOp::SetLogLevel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AdminOp::Help => "help",
            AdminOp::Version => "version",
            AdminOp::Info => "info",
            AdminOp::InvalidateCache => "invalidate_cache",
            AdminOp::GetPageSize => "get_page_size",
            AdminOp::SetPageSize => "set_page_size",
            AdminOp::GetCacheSize => "get_cache_size",
            AdminOp::SetCacheSize => "set_cache_size",
            AdminOp::SetTtl => "set_ttl",
            AdminOp::SetTimeout => "set_timeout",
            AdminOp::SetLogLevel => "set_log_level",
        }
    }

    fn usage(self) -> &'static str {
        match self {
            AdminOp::Help => "list supported operations",
            AdminOp::Version => "engine version",
            AdminOp::Info => "connection, cache and timing settings",
            AdminOp::InvalidateCache => "drop cached pages, returns bytes reclaimed",
            AdminOp::GetPageSize => "page size in KiB",
            AdminOp::SetPageSize => "set page size in KiB (power of two, 64..4096)",
            AdminOp::GetCacheSize => "cache budget in MiB",
            AdminOp::SetCacheSize => "set cache budget in MiB",
            AdminOp::SetTtl => "set page/attribute TTL in seconds",
            AdminOp::SetTimeout => "set request timeout in seconds",
            AdminOp::SetLogLevel => "set log level or filter",
        }
    }
}

impl fmt::Display for AdminOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AdminOp {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        AdminOp::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("unknown operation '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResponse {
    pub status: Status,
    pub value: Value,
}

impl AdminResponse {
    fn success(value: Value) -> Self {
        Self {
            status: Status::Success,
            value,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            value: Value::String(message.into()),
        }
    }
}

fn number(value: Option<&Value>, op: AdminOp) -> Result<u64> {
    let v = value.ok_or_else(|| BridgeError::InvalidArgument(format!("{op} needs a value")))?;
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| BridgeError::InvalidArgument(format!("{op} expects a non-negative integer")))
}

fn text(value: Option<&Value>, op: AdminOp) -> Result<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(BridgeError::InvalidArgument(format!("{op} expects a string"))),
    }
}

pub struct AdminService {
    bridge: Arc<Bridge>,
    log: Option<Arc<dyn LogControl>>,
}

impl AdminService {
    pub fn new(bridge: Arc<Bridge>, log: Option<Arc<dyn LogControl>>) -> Self {
        Self { bridge, log }
    }

    pub async fn handle(&self, req: &AdminRequest) -> AdminResponse {
        let op = match req.op.parse::<AdminOp>() {
            Ok(op) => op,
            Err(e) => return AdminResponse::error(e.to_string()),
        };
        match self.dispatch(op, req.value.as_ref()).await {
            Ok(value) => AdminResponse::success(value),
            Err(e) => {
                debug!(%op, error = %e, "control operation failed");
                AdminResponse::error(e.to_string())
            }
        }
    }

    async fn dispatch(&self, op: AdminOp, value: Option<&Value>) -> Result<Value> {
        let b = &self.bridge;
        let v = match op {
            AdminOp::Help => {
                let ops: serde_json::Map<String, Value> = AdminOp::ALL
                    .iter()
                    .map(|op| (op.name().to_string(), Value::from(op.usage())))
                    .collect();
                Value::Object(ops)
            }
            AdminOp::Version => json!(format!("droidfs {VERSION}")),
            AdminOp::Info => {
                let i = b.info();
                json!({
                    "connection": i.transport,
                    "log_level": self.log.as_ref().map_or(i.log_level, |l| l.current()),
                    "ttl": i.ttl.as_secs(),
                    "timeout": i.rpc_timeout.map_or(0, |t| t.as_secs()),
                    "page_size": i.page_size as u64 / KIB,
                    "cache_size": {
                        "max": i.cache_budget / MIB,
                        "current": i.cache_used as f64 / MIB as f64,
                    },
                })
            }
            AdminOp::InvalidateCache => {
                let reclaimed = b.invalidate_cache().await?;
                info!(reclaimed, "cache invalidated on request");
                json!(reclaimed)
            }
            AdminOp::GetPageSize => json!(b.page_size() as u64 / KIB),
            AdminOp::SetPageSize => {
                let kib = number(value, op)?;
                let (old, new) = b.set_page_size(kib.saturating_mul(KIB)).await?;
                json!({ "old": old as u64 / KIB, "new": new as u64 / KIB })
            }
            AdminOp::GetCacheSize => json!(b.cache_budget() / MIB),
            AdminOp::SetCacheSize => {
                let mib = number(value, op)?;
                let (old, new) = b.set_cache_budget(mib.saturating_mul(MIB))?;
                json!({ "old": old / MIB, "new": new / MIB })
            }
            AdminOp::SetTtl => {
                let secs = number(value, op)?;
                let (old, new) = b.set_ttl(Duration::from_secs(secs))?;
                json!({ "old": old.as_secs(), "new": new.as_secs() })
            }
            AdminOp::SetTimeout => {
                let secs = number(value, op)?;
                match b.set_rpc_timeout(Duration::from_secs(secs))? {
                    Some((old, new)) => json!({ "old": old.as_secs(), "new": new.as_secs() }),
                    None => json!({ "old": 0, "new": 0 }),
                }
            }
            AdminOp::SetLogLevel => {
                let level = text(value, op)?;
                let old = match &self.log {
                    Some(log) => log.set_level(&level)?,
                    None => b.config().snapshot().log_level.clone(),
                };
                b.set_log_level(&level)?;
                json!({ "old": old, "new": level })
            }
        };
        Ok(v)
    }

    /// Serve one request on `stream`.
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let mut framed = Framed::new(stream, codec());
        let Some(frame) = framed.next().await else {
            return Ok(());
        };
        let frame = frame?;
        let resp = match serde_json::from_slice::<AdminRequest>(&frame) {
            Ok(req) => self.handle(&req).await,
            Err(e) => AdminResponse::error(format!("invalid request: {e}")),
        };
        let out = serde_json::to_vec(&resp)
            .map_err(|e| BridgeError::Protocol(format!("cannot encode response: {e}")))?;
        framed.send(Bytes::from(out)).await?;
        Ok(())
    }

    /// Accept connections until the listener fails or the task is cancelled.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            debug!(error = %e, "control connection error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                    return;
                }
            }
        }
    }
}

/// Bind the control socket, replacing a stale one.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "control socket listening");
    Ok(listener)
}

/// `<runtime dir>/droidfs@<serial>.sock`, falling back to the temp dir.
pub fn default_socket_path(serial: &str) -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("droidfs@{serial}.sock"))
}

/// Send one request to a running mount and wait for its answer.
pub async fn request(socket: &Path, op: &str, value: Option<Value>) -> Result<AdminResponse> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        BridgeError::ConnectionLost(format!("cannot reach {}: {e}", socket.display()))
    })?;
    let mut framed = Framed::new(stream, codec());
    let req = AdminRequest {
        op: op.to_string(),
        value,
    };
    let body = serde_json::to_vec(&req)
        .map_err(|e| BridgeError::Protocol(format!("cannot encode request: {e}")))?;
    framed.send(Bytes::from(body)).await?;
    let frame = framed
        .next()
        .await
        .ok_or_else(|| BridgeError::ConnectionLost("control socket closed".into()))??;
    serde_json::from_slice(&frame).map_err(|e| BridgeError::Protocol(format!("bad response: {e}")))
}
