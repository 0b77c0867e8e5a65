//! Deployment and supervision of the companion process that serves the channel
//! transport on the device.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_PORT;
use crate::device::{Adb, Script};
use crate::error::{BridgeError, Result};
use crate::remote::channel::{BoxedStream, Connector};

/// Line the companion prints on stdout once it accepts connections.
pub const READY_LINE: &str = "SERVER_IS_READY";
/// Where the companion binary lives on the device.
pub const REMOTE_PATH: &str = "/data/local/tmp/droidfs-server";

#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Local companion binary to push. `None` assumes it is already deployed.
    pub binary: Option<PathBuf>,
    pub port: u16,
    pub ready_timeout: Duration,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            binary: None,
            port: DEFAULT_PORT,
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Connector that keeps a companion process alive behind an `adb forward`.
pub struct AdbConnector {
    adb: Adb,
    config: CompanionConfig,
    child: Mutex<Option<Child>>,
    forwarded: Mutex<bool>,
    deployed: Mutex<bool>,
}

impl AdbConnector {
    pub fn new(adb: Adb, config: CompanionConfig) -> Self {
        Self {
            adb,
            config,
            child: Mutex::new(None),
            forwarded: Mutex::new(false),
            deployed: Mutex::new(false),
        }
    }

    async fn deploy(&self) -> Result<()> {
        let mut deployed = self.deployed.lock().await;
        if *deployed {
            return Ok(());
        }
        if let Some(binary) = &self.config.binary {
            info!(binary = %binary.display(), remote = REMOTE_PATH, "pushing companion");
            let remote = Path::new(REMOTE_PATH);
            self.adb.push(binary, remote).await?;
            self.adb
                .shell(&Script::new("chmod 755").path(remote), remote)
                .await?;
        }
        *deployed = true;
        Ok(())
    }

    async fn forward(&self) -> Result<()> {
        let mut forwarded = self.forwarded.lock().await;
        if !*forwarded {
            self.adb.forward(self.config.port).await?;
            *forwarded = true;
        }
        Ok(())
    }

    /// Start the companion and wait for its ready line.
    async fn launch(&self) -> Result<Child> {
        let cmd = Script::default()
            .path(REMOTE_PATH)
            .arg(format!("--port {}", self.config.port));
        let mut child = self.adb.spawn_shell(&cmd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ConnectionLost("companion stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_ready = async {
            while let Some(line) = lines.next_line().await? {
                if line.trim() == READY_LINE {
                    return Ok(true);
                }
                debug!(line, "companion");
            }
            Ok::<_, std::io::Error>(false)
        };
        match tokio::time::timeout(self.config.ready_timeout, wait_ready).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(BridgeError::ConnectionLost(
                    "companion exited before becoming ready".into(),
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(BridgeError::ConnectionLost(format!(
                    "companion not ready after {:?}",
                    self.config.ready_timeout
                )));
            }
        }

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line, "companion");
            }
        });
        info!(port = self.config.port, "companion is ready");
        Ok(child)
    }

    /// Make sure a live companion is running, relaunching it if it exited.
    async fn ensure_running(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(c) = child.as_mut() {
            match c.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!(%status, "companion exited, relaunching"),
                Err(e) => warn!(error = %e, "cannot poll companion, relaunching"),
            }
        }
        *child = None;
        self.deploy().await?;
        self.forward().await?;
        *child = Some(self.launch().await?);
        Ok(())
    }
}

#[async_trait]
impl Connector for AdbConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        self.ensure_running().await?;
        let stream = TcpStream::connect(("127.0.0.1", self.config.port))
            .await
            .map_err(|e| BridgeError::ConnectionLost(format!("connect to companion: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
