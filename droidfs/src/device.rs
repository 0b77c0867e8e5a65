//! Wrapper around the `adb` executable.
//!
//! The bridge tool is treated as an opaque process: we run it, feed stdin, collect
//! stdout/stderr and classify failures from the stderr text.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{BridgeError, PathHint, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
}

#[derive(Debug, Clone)]
pub struct Adb {
    program: PathBuf,
    serial: Option<String>,
}

impl Default for Adb {
    fn default() -> Self {
        Self::new("adb")
    }
}

impl Adb {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            serial: None,
        }
    }

    pub fn with_serial(self, serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..self
        }
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn command<S: AsRef<OsStr>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_failed(&self, err: std::io::Error) -> BridgeError {
        BridgeError::ConnectionLost(format!(
            "failed to run {}: {err}",
            self.program.display()
        ))
    }

    /// Run adb with `args` and return its raw output, whatever the exit status.
    pub async fn run<S: AsRef<OsStr> + fmt::Debug>(&self, args: &[S]) -> Result<Output> {
        debug!(?args, "adb");
        self.command(args)
            .output()
            .await
            .map_err(|e| self.spawn_failed(e))
    }

    pub async fn run_with_input<S: AsRef<OsStr> + fmt::Debug>(
        &self,
        args: &[S],
        input: &[u8],
    ) -> Result<Output> {
        debug!(?args, input = input.len(), "adb");
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_failed(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| self.spawn_failed(e))
    }

    /// Run `cmd` through the device shell and return its raw output.
    ///
    /// The shell protocol keeps stdout binary-safe and stderr on its own stream.
    pub async fn shell_output(&self, cmd: &Script) -> Result<Output> {
        self.run(&[OsStr::new("shell"), cmd.as_ref()]).await
    }

    /// Run `cmd` through the device shell; non-zero exit is classified from stderr.
    pub async fn shell(&self, cmd: &Script, path: &Path) -> Result<Vec<u8>> {
        let out = self.shell_output(cmd).await?;
        check(out, path)
    }

    pub async fn shell_with_input(&self, cmd: &Script, input: &[u8], path: &Path) -> Result<Vec<u8>> {
        let out = self
            .run_with_input(&[OsStr::new("shell"), cmd.as_ref()], input)
            .await?;
        check(out, path)
    }

    /// Start a long-running shell command with its stdout piped back.
    pub fn spawn_shell(&self, cmd: &Script) -> Result<Child> {
        debug!(cmd = %cmd, "adb shell (spawn)");
        self.command(&[OsStr::new("shell"), cmd.as_ref()])
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_failed(e))
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let out = Adb::new(&self.program).run(&["devices"]).await?;
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(parse_devices(&text))
    }

    pub async fn forward(&self, port: u16) -> Result<()> {
        let spec = format!("tcp:{port}");
        let out = self.run(&["forward", spec.as_str(), spec.as_str()]).await?;
        check(out, PathHint::none()).map(|_| ())
    }

    pub async fn push(&self, local: &Path, remote: &Path) -> Result<()> {
        let args = [OsStr::new("push"), local.as_os_str(), remote.as_os_str()];
        let out = self.run(&args).await?;
        check(out, remote).map(|_| ())
    }
}

/// Turn a finished adb invocation into its stdout or a classified error.
pub fn check(out: Output, path: impl Into<PathHint>) -> Result<Vec<u8>> {
    if out.status.success() {
        return Ok(out.stdout);
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    let stderr = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&out.stdout)
    } else {
        stderr
    };
    Err(classify_stderr(&stderr, path))
}

/// Map a bridge-tool or device shell error message onto the error taxonomy.
pub fn classify_stderr(stderr: &str, path: impl Into<PathHint>) -> BridgeError {
    let path = path.into();
    let hint = || path.clone();
    let msg = stderr.trim();
    if msg.contains("no devices/emulators found")
        || msg.contains("device offline")
        || (msg.contains("device '") && msg.contains("not found"))
        || msg.contains("more than one device")
    {
        return BridgeError::ConnectionLost(msg.to_string());
    }
    if msg.contains("No such file or directory") {
        BridgeError::NotFound { path: hint() }
    } else if msg.contains("File exists") {
        BridgeError::AlreadyExists { path: hint() }
    } else if msg.contains("Not a directory") {
        BridgeError::NotADirectory { path: hint() }
    } else if msg.contains("Is a directory") {
        BridgeError::IsADirectory { path: hint() }
    } else if msg.contains("Directory not empty") {
        BridgeError::DirectoryNotEmpty { path: hint() }
    } else if msg.contains("Permission denied") {
        BridgeError::remote(libc::EACCES, msg)
    } else if msg.contains("Read-only file system") {
        BridgeError::remote(libc::EROFS, msg)
    } else if msg.contains("No space left on device") {
        BridgeError::remote(libc::ENOSPC, msg)
    } else if msg.contains("Operation not permitted") {
        BridgeError::remote(libc::EPERM, msg)
    } else {
        BridgeError::remote(libc::EIO, msg)
    }
}

pub fn parse_devices(out: &str) -> Vec<DeviceInfo> {
    out.lines()
        .filter(|l| !l.starts_with("List of devices") && !l.starts_with('*'))
        .filter_map(|l| {
            let mut it = l.split_whitespace();
            let serial = it.next()?;
            let state = match it.next()? {
                "device" => DeviceState::Device,
                "offline" => DeviceState::Offline,
                "unauthorized" => DeviceState::Unauthorized,
                other => DeviceState::Other(other.to_string()),
            };
            Some(DeviceInfo {
                serial: serial.to_string(),
                state,
            })
        })
        .collect()
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Device => f.write_str("device"),
            DeviceState::Offline => f.write_str("offline"),
            DeviceState::Unauthorized => f.write_str("unauthorized"),
            DeviceState::Other(s) => f.write_str(s),
        }
    }
}

/// The only attached device that is ready for use.
pub fn select_device(devices: &[DeviceInfo]) -> Result<String> {
    let mut ready = devices.iter().filter(|d| d.state == DeviceState::Device);
    match (ready.next(), ready.next()) {
        (Some(d), None) => Ok(d.serial.clone()),
        (None, _) => Err(BridgeError::ConnectionLost(
            "no device is attached and authorized".into(),
        )),
        (Some(_), Some(_)) => Err(BridgeError::InvalidArgument(
            "more than one device is attached, pick one with --serial".into(),
        )),
    }
}

/// Quote `s` for the device's `sh`. Works on raw bytes, so any file name survives.
pub fn shell_quote(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 2);
    out.push(b'\'');
    for &c in s {
        if c == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(c);
        }
    }
    out.push(b'\'');
    out
}

/// A device shell command line built from plain words and quoted paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new(program: &str) -> Self {
        Self(program.as_bytes().to_vec())
    }

    /// Append a word verbatim.
    pub fn arg(mut self, word: impl AsRef<str>) -> Self {
        self.space();
        self.0.extend_from_slice(word.as_ref().as_bytes());
        self
    }

    /// Append a quoted path.
    pub fn path(self, p: impl AsRef<Path>) -> Self {
        self.keyed_path("", p)
    }

    /// Append `key` immediately followed by a quoted path, e.g. `if='/sdcard/a b'`.
    pub fn keyed_path(mut self, key: &str, p: impl AsRef<Path>) -> Self {
        self.space();
        self.0.extend_from_slice(key.as_bytes());
        self.0.extend(shell_quote(p.as_ref().as_os_str().as_bytes()));
        self
    }

    fn space(&mut self) {
        if !self.0.is_empty() {
            self.0.push(b' ');
        }
    }

    pub fn into_os_string(self) -> OsString {
        OsString::from_vec(self.0)
    }
}

impl AsRef<OsStr> for Script {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(&self.0)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_list() {
        let out = "* daemon started successfully\nList of devices attached\n\
                   emulator-5554\tdevice\nR58M123\tunauthorized\n0123\toffline\n\n";
        let devs = parse_devices(out);
        assert_eq!(devs.len(), 3);
        assert_eq!(devs[0].serial, "emulator-5554");
        assert_eq!(devs[0].state, DeviceState::Device);
        assert_eq!(devs[1].state, DeviceState::Unauthorized);
        assert_eq!(devs[2].state, DeviceState::Offline);
    }

    #[test]
    fn selects_the_single_ready_device() {
        let devs = parse_devices("List of devices attached\nA\tdevice\nB\toffline\n");
        assert_eq!(select_device(&devs).unwrap(), "A");
        let devs = parse_devices("A\tdevice\nB\tdevice\n");
        assert!(matches!(
            select_device(&devs),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(select_device(&[]).is_err());
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("stat: '/x': No such file or directory", "/x"),
            BridgeError::NotFound { .. }
        ));
        assert!(matches!(
            classify_stderr("adb: no devices/emulators found", "/x"),
            BridgeError::ConnectionLost(_)
        ));
        assert!(matches!(
            classify_stderr("error: device 'abc' not found", "/x"),
            BridgeError::ConnectionLost(_)
        ));
        assert_eq!(
            classify_stderr("rm: /system/x: Read-only file system", "/system/x").errno(),
            libc::EROFS
        );
        assert_eq!(classify_stderr("weird", "/x").errno(), libc::EIO);
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote(b"/sdcard/a b"), b"'/sdcard/a b'");
        assert_eq!(shell_quote(b"it's"), b"'it'\\''s'");
        assert_eq!(shell_quote(b"\xff"), b"'\xff'");
    }

    #[test]
    fn scripts_quote_paths_but_not_words() {
        let name = OsStr::from_bytes(b"/sdcard/it's \xfe");
        let cmd = Script::new("dd")
            .keyed_path("if=", name)
            .arg("skip=4")
            .arg("status=none");
        assert_eq!(
            cmd.as_ref().as_bytes(),
            b"dd if='/sdcard/it'\\''s \xfe' skip=4 status=none"
        );
        assert_eq!(
            Script::new("rm").path("/a b").into_os_string(),
            OsString::from("rm '/a b'")
        );
    }
}
