//! Transport that shells out to the bridge tool once per operation.
//!
//! No session and no pipelining: each call lives exactly as long as its adb
//! process, so there is no request deadline to report.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{EntryStream, RemoteEntry, TimeSpec, Transport};
use crate::device::{self, Adb, Script};
use crate::error::{BridgeError, Result};
use crate::node::Attr;
use crate::path;

const STAT_FORMAT: &str = "%f|%h|%s|%u|%g|%X|%Y|%Z|%n";

pub struct CommandTransport {
    adb: Adb,
}

impl CommandTransport {
    pub fn new(adb: Adb) -> Self {
        Self { adb }
    }

    async fn run(&self, cmd: Script, path: &Path) -> Result<Vec<u8>> {
        self.adb.shell(&cmd, path).await
    }
}

fn stat_script(target: &Path) -> Script {
    Script::new("stat")
        .arg(format!("-c '{STAT_FORMAT}'"))
        .path(target)
}

/// `dd` over the shell so stderr never mixes into the data and the exit status is kept.
fn read_script(p: &Path, offset: u64, len: usize) -> Script {
    Script::new("dd")
        .keyed_path("if=", p)
        .arg("iflag=skip_bytes,count_bytes")
        .arg(format!("skip={offset} count={len}"))
        .arg("bs=65536 status=none")
}

fn lines(out: &[u8]) -> impl Iterator<Item = &[u8]> {
    out.split(|&c| c == b'\n').filter(|l| !l.is_empty())
}

fn epoch_secs(field: &str) -> Result<SystemTime> {
    let secs: i64 = field
        .parse()
        .map_err(|_| BridgeError::Protocol(format!("bad timestamp '{field}'")))?;
    Ok(if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    })
}

/// Parse one line of `stat -c STAT_FORMAT` output into (full path, attributes).
///
/// The numeric fields are ASCII; the trailing name is kept byte for byte.
pub fn parse_stat_line(line: &[u8]) -> Result<(PathBuf, Attr)> {
    let bad = || {
        BridgeError::Protocol(format!(
            "unexpected stat output '{}'",
            String::from_utf8_lossy(line)
        ))
    };
    let fields: Vec<&[u8]> = line.splitn(9, |&c| c == b'|').collect();
    if fields.len() != 9 {
        return Err(bad());
    }
    let text = |i: usize| std::str::from_utf8(fields[i]).map_err(|_| bad());
    let num = |i: usize| text(i)?.parse::<u64>().map_err(|_| bad());
    let attr = Attr {
        mode: u32::from_str_radix(text(0)?, 16).map_err(|_| bad())?,
        nlink: num(1)?,
        size: num(2)?,
        uid: num(3)? as u32,
        gid: num(4)? as u32,
        atime: epoch_secs(text(5)?)?,
        mtime: epoch_secs(text(6)?)?,
        ctime: epoch_secs(text(7)?)?,
    };
    Ok((path::from_bytes(fields[8].to_vec()), attr))
}

/// Byte count from the summary `dd` prints on stderr (`N bytes (...) copied, ...`).
pub fn parse_dd_copied(stderr: &[u8]) -> Option<u64> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .find(|l| l.contains(" bytes") && l.contains("copied"))
        .and_then(|l| l.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

fn touch_arg(t: SystemTime) -> String {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => format!("@{}.{:09}", d.as_secs(), d.subsec_nanos()),
        Err(_) => "@0".to_string(),
    }
}

#[async_trait]
impl Transport for CommandTransport {
    fn name(&self) -> &'static str {
        "command"
    }

    fn rpc_timeout(&self) -> Option<Duration> {
        None
    }

    async fn stat(&self, p: &Path) -> Result<Attr> {
        let out = self.run(stat_script(p), p).await?;
        let line = lines(&out).next().unwrap_or_default();
        parse_stat_line(line).map(|(_, attr)| attr)
    }

    async fn list(&self, dir: &Path) -> Result<EntryStream> {
        let cmd = Script::new("find")
            .path(dir)
            .arg(format!("-mindepth 1 -maxdepth 1 -exec stat -c '{STAT_FORMAT}' {{}} +"));
        let out = self.adb.shell_output(&cmd).await?;
        if !out.status.success() {
            if out.stdout.is_empty() {
                device::check(out, dir)?;
                return Ok(Box::pin(stream::empty()));
            }
            warn!(dir = %dir.display(), "listing partially failed, serving what the device returned");
        }
        let entries: Vec<Result<RemoteEntry>> = lines(&out.stdout)
            .map(|line| {
                let (full, attr) = parse_stat_line(line)?;
                Ok(RemoteEntry {
                    name: path::file_name(&full).to_owned(),
                    attr,
                })
            })
            .collect();
        Ok(Box::pin(stream::iter(entries)))
    }

    async fn read_range(&self, p: &Path, offset: u64, len: usize) -> Result<Bytes> {
        self.run(read_script(p, offset, len), p)
            .await
            .map(Bytes::from)
    }

    async fn write_range(&self, p: &Path, offset: u64, data: Bytes) -> Result<usize> {
        let cmd = Script::new("dd")
            .keyed_path("of=", p)
            .arg(format!("oflag=seek_bytes conv=notrunc seek={offset}"))
            .arg("bs=65536 status=none");
        self.adb.shell_with_input(&cmd, &data, p).await?;
        Ok(data.len())
    }

    async fn create(&self, p: &Path, _mode: u32) -> Result<()> {
        self.run(Script::new("touch").path(p), p).await.map(|_| ())
    }

    async fn mkdir(&self, p: &Path, _mode: u32) -> Result<()> {
        self.run(Script::new("mkdir").path(p), p).await.map(|_| ())
    }

    async fn remove(&self, p: &Path) -> Result<()> {
        self.run(Script::new("rm").path(p), p).await.map(|_| ())
    }

    async fn rmdir(&self, p: &Path) -> Result<()> {
        self.run(Script::new("rmdir").path(p), p).await.map(|_| ())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.run(Script::new("mv").path(from).path(to), from)
            .await
            .map(|_| ())
    }

    async fn truncate(&self, p: &Path, size: u64) -> Result<()> {
        let cmd = Script::new("truncate").arg(format!("-s {size}")).path(p);
        self.run(cmd, p).await.map(|_| ())
    }

    async fn set_times(&self, p: &Path, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        for (flag, spec) in [("-a", atime), ("-m", mtime)] {
            let cmd = match spec {
                TimeSpec::Omit => continue,
                TimeSpec::Now => Script::new("touch -c").arg(flag).path(p),
                TimeSpec::At(t) => Script::new("touch -c")
                    .arg(flag)
                    .arg(format!("-d {}", touch_arg(t)))
                    .path(p),
            };
            self.run(cmd, p).await?;
        }
        Ok(())
    }

    async fn readlink(&self, p: &Path) -> Result<PathBuf> {
        let mut out = self.run(Script::new("readlink").path(p), p).await?;
        if out.last() == Some(&b'\n') {
            out.pop();
        }
        Ok(path::from_bytes(out))
    }

    async fn copy_range(
        &self,
        from: &Path,
        from_offset: u64,
        to: &Path,
        to_offset: u64,
        len: u64,
    ) -> Result<u64> {
        let cmd = Script::new("dd")
            .keyed_path("if=", from)
            .keyed_path("of=", to)
            .arg("iflag=skip_bytes,count_bytes oflag=seek_bytes conv=notrunc")
            .arg(format!("skip={from_offset} count={len} seek={to_offset}"))
            .arg("bs=65536");
        let out = self.adb.shell_output(&cmd).await?;
        let copied = parse_dd_copied(&out.stderr);
        device::check(out, from)?;
        match copied {
            Some(n) => Ok(n.min(len)),
            None => {
                debug!(from = %from.display(), "dd printed no summary, counting from stat");
                let size = self.stat(from).await?.size;
                Ok(size.saturating_sub(from_offset).min(len))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn parses_stat_output() {
        let (name, attr) = parse_stat_line(
            b"81a4|1|1234|10123|1015|1700000000|1700000100|1700000200|/sdcard/a|b.txt",
        )
        .unwrap();
        assert_eq!(name, Path::new("/sdcard/a|b.txt"));
        assert_eq!(attr.kind(), NodeKind::File);
        assert_eq!(attr.mode & 0o777, 0o644);
        assert_eq!(attr.size, 1234);
        assert_eq!(attr.uid, 10123);
        assert_eq!(
            attr.mtime,
            UNIX_EPOCH + Duration::from_secs(1_700_000_100)
        );
    }

    #[test]
    fn stat_names_keep_raw_bytes() {
        let (name, _) = parse_stat_line(b"81a4|1|0|0|0|0|0|0|/sdcard/\xff\xfe").unwrap();
        assert_eq!(name.as_os_str().as_bytes(), b"/sdcard/\xff\xfe");
        assert_eq!(path::file_name(&name).as_bytes(), b"\xff\xfe");
    }

    #[test]
    fn directory_mode_in_hex() {
        let (_, attr) = parse_stat_line(b"41f9|3|4096|0|1015|0|0|0|/sdcard").unwrap();
        assert_eq!(attr.kind(), NodeKind::Directory);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_stat_line(b"stat: bad").is_err());
        assert!(parse_stat_line(b"zz|1|1|1|1|1|1|1|/x").is_err());
        assert!(parse_stat_line(b"81a4|\xff|1|1|1|1|1|1|/x").is_err());
    }

    #[test]
    fn reads_keep_stderr_out_of_the_data() {
        let cmd = read_script(Path::new("/sdcard/a b"), 4, 8);
        assert_eq!(
            cmd.to_string(),
            "dd if='/sdcard/a b' iflag=skip_bytes,count_bytes skip=4 count=8 bs=65536 status=none"
        );
    }

    #[test]
    fn dd_summary_gives_copied_bytes() {
        let stderr = b"2+1 records in\n2+1 records out\n140000 bytes (137 K) copied, 0.01 s, 13 M/s\n";
        assert_eq!(parse_dd_copied(stderr), Some(140_000));
        assert_eq!(parse_dd_copied(b"0+0 records in\n0+0 records out\n0 bytes copied, 0 s\n"), Some(0));
        assert_eq!(parse_dd_copied(b""), None);
    }

    #[test]
    fn touch_argument_keeps_nanoseconds() {
        let t = UNIX_EPOCH + Duration::new(5, 7);
        assert_eq!(touch_arg(t), "@5.000000007");
    }
}
