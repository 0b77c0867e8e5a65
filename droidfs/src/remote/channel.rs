//! Transport over a persistent, pipelined stream to the companion process.
//!
//! One writer task drains an mpsc queue of encoded frames into the stream; one
//! reader task decodes responses and completes the [`PendingRequest`] with the
//! matching sequence id. Callers wait on their own oneshot with a deadline, so a
//! slow request never holds up the others.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::retry::backoff;
use super::wire::{self, Opcode, Reply, Request, Response};
use super::{EntryStream, TimeSpec, Transport};
use crate::config::ConfigRegistry;
use crate::error::{BridgeError, Result};
use crate::node::Attr;

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Produces a fresh stream to the companion, (re)starting it if needed.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// One outstanding request on the channel.
struct PendingRequest {
    opcode: Opcode,
    deadline: Option<Instant>,
    slot: oneshot::Sender<Result<Response>>,
}

type PendingTable = Arc<Mutex<HashMap<u32, PendingRequest>>>;

fn fail_all(pending: &PendingTable, reason: &str) {
    let drained: Vec<(u32, PendingRequest)> = pending.lock().drain().collect();
    for (seq, p) in drained {
        let overdue = p.deadline.is_some_and(|d| d <= Instant::now());
        debug!(seq, opcode = ?p.opcode, overdue, "failing pending request");
        let _ = p.slot.send(Err(BridgeError::ConnectionLost(reason.to_string())));
    }
}

/// Removes a pending entry when its caller stops waiting (timeout or cancellation).
struct PendingGuard {
    pending: PendingTable,
    seq: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.seq);
    }
}

struct Session {
    id: u64,
    frames: mpsc::Sender<Bytes>,
    pending: PendingTable,
    next_seq: AtomicU32,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn start(id: u64, stream: BoxedStream) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        let mut sink = FramedWrite::new(wr, wire::codec());
        let mut source = FramedRead::new(rd, wire::codec());
        let (frames, mut queue) = mpsc::channel::<Bytes>(256);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(frame) = queue.recv().await {
                    if let Err(e) = sink.send(frame).await {
                        warn!(session = id, error = %e, "channel write failed");
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
                fail_all(&pending, "channel writer stopped");
            })
        };

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(session = id, error = %e, "channel read failed");
                            break;
                        }
                    };
                    let (seq, decoded) = match Response::route(frame.freeze()) {
                        Ok(routed) => routed,
                        Err(e) => {
                            warn!(session = id, error = %e, "response without a sequence id, dropping channel");
                            break;
                        }
                    };
                    let Some(p) = pending.lock().remove(&seq) else {
                        debug!(session = id, seq, "dropping late answer");
                        continue;
                    };
                    let answer = decoded.map_err(|e| {
                        warn!(session = id, seq, opcode = ?p.opcode, error = %e, "malformed response body");
                        BridgeError::remote(libc::EIO, format!("malformed response: {e}"))
                    });
                    let _ = p.slot.send(answer);
                }
                closed.store(true, Ordering::SeqCst);
                fail_all(&pending, "companion closed the channel");
            })
        };

        Self {
            id,
            frames,
            pending,
            next_seq: AtomicU32::new(1),
            closed,
            tasks: vec![writer, reader],
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    async fn call(&self, req: Request, timeout: Duration) -> Result<Response> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionLost("channel is closed".into()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self.pending.lock().insert(
            seq,
            PendingRequest {
                opcode: req.opcode(),
                deadline,
                slot: tx,
            },
        );
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            seq,
        };
        if self.is_closed() {
            return Err(BridgeError::ConnectionLost("channel is closed".into()));
        }

        let mut buf = BytesMut::new();
        req.encode(seq, &mut buf);
        self.frames
            .send(buf.freeze())
            .await
            .map_err(|_| BridgeError::ConnectionLost("channel writer is gone".into()))?;

        let answer = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), rx).await {
                    Ok(answer) => answer,
                    Err(_) => {
                        debug!(session = self.id, seq, opcode = ?req.opcode(), "request timed out");
                        return Err(BridgeError::Timeout);
                    }
                }
            }
            None => rx.await,
        };
        answer.map_err(|_| BridgeError::ConnectionLost("request dropped".into()))?
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for t in &self.tasks {
            t.abort();
        }
        fail_all(&self.pending, "channel reset");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct ChannelTransport {
    connector: Arc<dyn Connector>,
    config: Arc<ConfigRegistry>,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
    next_session: AtomicU64,
    timeouts: AtomicU32,
}

impl ChannelTransport {
    /// Build a transport that connects lazily on first use.
    pub fn new(connector: Arc<dyn Connector>, config: Arc<ConfigRegistry>) -> Self {
        Self {
            connector,
            config,
            session: tokio::sync::Mutex::new(None),
            next_session: AtomicU64::new(1),
            timeouts: AtomicU32::new(0),
        }
    }

    /// Build a transport and bring the first session up before returning.
    pub async fn connect(connector: Arc<dyn Connector>, config: Arc<ConfigRegistry>) -> Result<Self> {
        let t = Self::new(connector, config);
        t.session().await?;
        Ok(t)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref() {
            if !s.is_closed() {
                return Ok(s.clone());
            }
            warn!(session = s.id, "channel closed, reconnecting");
        }
        *guard = None;

        let max = self.config.snapshot().max_reconnects;
        let stream = backoff(max, "connect", || self.connector.connect())
            .await
            .map_err(|e| {
                BridgeError::ConnectionLost(format!("giving up after {max} reconnect attempts: {e}"))
            })?;
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        info!(session = id, "channel established");
        let session = Arc::new(Session::start(id, stream));
        *guard = Some(session.clone());
        self.timeouts.store(0, Ordering::Relaxed);
        Ok(session)
    }

    /// Drop the session `id` if it is still current; the next call reconnects.
    async fn reset(&self, id: u64) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().map(|s| s.id) == Some(id) {
            if let Some(s) = guard.take() {
                s.shutdown();
            }
        }
    }

    /// Number of requests currently waiting for an answer.
    pub async fn in_flight(&self) -> usize {
        match self.session.lock().await.as_ref() {
            Some(s) => s.in_flight(),
            None => 0,
        }
    }

    async fn call(&self, req: Request) -> Result<Reply> {
        let cfg = self.config.snapshot();
        let session = self.session().await?;
        let path = req.path().to_path_buf();
        match session.call(req, cfg.rpc_timeout).await {
            Ok(resp) => {
                self.timeouts.store(0, Ordering::Relaxed);
                resp.result.map_err(|(errno, message)| status_error(errno, message, &path))
            }
            Err(BridgeError::Timeout) => {
                let streak = self.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                let threshold = cfg.timeout_reset_threshold;
                if threshold > 0 && streak >= threshold {
                    warn!(session = session.id, streak, "too many consecutive timeouts, resetting channel");
                    self.reset(session.id).await;
                    self.timeouts.store(0, Ordering::Relaxed);
                }
                Err(BridgeError::Timeout)
            }
            Err(e @ BridgeError::ConnectionLost(_)) => {
                self.reset(session.id).await;
                Err(e)
            }
            Err(e) => {
                self.timeouts.store(0, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

fn status_error(errno: i32, message: String, path: &Path) -> BridgeError {
    match BridgeError::from_errno(errno, path) {
        BridgeError::Remote { errno, .. } if !message.is_empty() => {
            BridgeError::Remote { errno, message }
        }
        other => other,
    }
}

fn unexpected(op: &str, reply: Reply) -> BridgeError {
    BridgeError::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn rpc_timeout(&self) -> Option<Duration> {
        Some(self.config.snapshot().rpc_timeout)
    }

    async fn stat(&self, path: &Path) -> Result<Attr> {
        match self.call(Request::Stat { path: path.into() }).await? {
            Reply::Stat(attr) => Ok(attr),
            other => Err(unexpected("stat", other)),
        }
    }

    async fn list(&self, dir: &Path) -> Result<EntryStream> {
        match self.call(Request::List { path: dir.into() }).await? {
            Reply::List(entries) => Ok(Box::pin(stream::iter(entries.into_iter().map(Ok)))),
            other => Err(unexpected("list", other)),
        }
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> Result<Bytes> {
        let req = Request::Read {
            path: path.into(),
            offset,
            len: len as u32,
        };
        match self.call(req).await? {
            Reply::Data(data) => Ok(data),
            other => Err(unexpected("read", other)),
        }
    }

    async fn write_range(&self, path: &Path, offset: u64, data: Bytes) -> Result<usize> {
        let req = Request::Write {
            path: path.into(),
            offset,
            data,
        };
        match self.call(req).await? {
            Reply::Written(n) => Ok(n as usize),
            other => Err(unexpected("write", other)),
        }
    }

    async fn create(&self, path: &Path, mode: u32) -> Result<()> {
        self.call(Request::Create {
            path: path.into(),
            mode,
        })
        .await
        .map(|_| ())
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.call(Request::Mkdir {
            path: path.into(),
            mode,
        })
        .await
        .map(|_| ())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.call(Request::Remove { path: path.into() }).await.map(|_| ())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        self.call(Request::Rmdir { path: path.into() }).await.map(|_| ())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.call(Request::Rename {
            from: from.into(),
            to: to.into(),
        })
        .await
        .map(|_| ())
    }

    async fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        self.call(Request::Truncate {
            path: path.into(),
            size,
        })
        .await
        .map(|_| ())
    }

    async fn set_times(&self, path: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        self.call(Request::SetTimes {
            path: path.into(),
            atime,
            mtime,
        })
        .await
        .map(|_| ())
    }

    async fn readlink(&self, path: &Path) -> Result<PathBuf> {
        match self.call(Request::Readlink { path: path.into() }).await? {
            Reply::Link(target) => Ok(target),
            other => Err(unexpected("readlink", other)),
        }
    }

    async fn copy_range(
        &self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: u64,
        len: u64,
    ) -> Result<u64> {
        let req = Request::CopyRange {
            from: from.into(),
            from_offset,
            to: to.into(),
            to_offset,
            len,
        };
        match self.call(req).await? {
            Reply::Copied(n) => Ok(n),
            other => Err(unexpected("copy_file_range", other)),
        }
    }
}
