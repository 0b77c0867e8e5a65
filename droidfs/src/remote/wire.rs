//! Companion-process wire format.
//!
//! Every message travels inside a 4-byte big-endian length prefix (see [`codec`]).
//! Request body: `[u8 opcode][u32 seq][payload]`.
//! Response body: `[u8 opcode][u32 seq][i32 status][payload]`; a non-zero status
//! is an errno and the payload is then a UTF-8 message.
//!
//! Integers are big-endian. Paths, names, messages and byte ranges are a `u32`
//! length followed by the raw bytes; paths are not required to be UTF-8.
//! Timestamps are `i64` seconds and `u32` nanoseconds from the epoch.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::codec::LengthDelimitedCodec;

use super::{RemoteEntry, TimeSpec};
use crate::error::{BridgeError, Result};
use crate::node::Attr;

/// Largest frame accepted in either direction.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Stat = 1,
    List = 2,
    Read = 3,
    Write = 4,
    Create = 5,
    Mkdir = 6,
    Remove = 7,
    Rmdir = 8,
    Rename = 9,
    Truncate = 10,
    SetTimes = 11,
    Readlink = 12,
    CopyRange = 13,
}

impl TryFrom<u8> for Opcode {
    type Error = BridgeError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Opcode::Stat,
            2 => Opcode::List,
            3 => Opcode::Read,
            4 => Opcode::Write,
            5 => Opcode::Create,
            6 => Opcode::Mkdir,
            7 => Opcode::Remove,
            8 => Opcode::Rmdir,
            9 => Opcode::Rename,
            10 => Opcode::Truncate,
            11 => Opcode::SetTimes,
            12 => Opcode::Readlink,
            13 => Opcode::CopyRange,
            other => return Err(BridgeError::Protocol(format!("unknown opcode {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Stat { path: PathBuf },
    List { path: PathBuf },
    Read { path: PathBuf, offset: u64, len: u32 },
    Write { path: PathBuf, offset: u64, data: Bytes },
    Create { path: PathBuf, mode: u32 },
    Mkdir { path: PathBuf, mode: u32 },
    Remove { path: PathBuf },
    Rmdir { path: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Truncate { path: PathBuf, size: u64 },
    SetTimes { path: PathBuf, atime: TimeSpec, mtime: TimeSpec },
    Readlink { path: PathBuf },
    CopyRange {
        from: PathBuf,
        from_offset: u64,
        to: PathBuf,
        to_offset: u64,
        len: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done,
    Stat(Attr),
    List(Vec<RemoteEntry>),
    Data(Bytes),
    Written(u32),
    Link(PathBuf),
    Copied(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub seq: u32,
    pub opcode: Opcode,
    pub result: std::result::Result<Reply, (i32, String)>,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Stat { .. } => Opcode::Stat,
            Request::List { .. } => Opcode::List,
            Request::Read { .. } => Opcode::Read,
            Request::Write { .. } => Opcode::Write,
            Request::Create { .. } => Opcode::Create,
            Request::Mkdir { .. } => Opcode::Mkdir,
            Request::Remove { .. } => Opcode::Remove,
            Request::Rmdir { .. } => Opcode::Rmdir,
            Request::Rename { .. } => Opcode::Rename,
            Request::Truncate { .. } => Opcode::Truncate,
            Request::SetTimes { .. } => Opcode::SetTimes,
            Request::Readlink { .. } => Opcode::Readlink,
            Request::CopyRange { .. } => Opcode::CopyRange,
        }
    }

    /// Path the request operates on (the source for renames and copies).
    pub fn path(&self) -> &Path {
        match self {
            Request::Stat { path }
            | Request::List { path }
            | Request::Read { path, .. }
            | Request::Write { path, .. }
            | Request::Create { path, .. }
            | Request::Mkdir { path, .. }
            | Request::Remove { path }
            | Request::Rmdir { path }
            | Request::Truncate { path, .. }
            | Request::SetTimes { path, .. }
            | Request::Readlink { path } => path,
            Request::Rename { from, .. } | Request::CopyRange { from, .. } => from,
        }
    }

    pub fn encode(&self, seq: u32, dst: &mut BytesMut) {
        dst.put_u8(self.opcode() as u8);
        dst.put_u32(seq);
        match self {
            Request::Stat { path }
            | Request::List { path }
            | Request::Remove { path }
            | Request::Rmdir { path }
            | Request::Readlink { path } => put_path(dst, path),
            Request::Read { path, offset, len } => {
                put_path(dst, path);
                dst.put_u64(*offset);
                dst.put_u32(*len);
            }
            Request::Write { path, offset, data } => {
                put_path(dst, path);
                dst.put_u64(*offset);
                put_bytes(dst, data);
            }
            Request::Create { path, mode } | Request::Mkdir { path, mode } => {
                put_path(dst, path);
                dst.put_u32(*mode);
            }
            Request::Rename { from, to } => {
                put_path(dst, from);
                put_path(dst, to);
            }
            Request::Truncate { path, size } => {
                put_path(dst, path);
                dst.put_u64(*size);
            }
            Request::SetTimes { path, atime, mtime } => {
                put_path(dst, path);
                put_timespec(dst, *atime);
                put_timespec(dst, *mtime);
            }
            Request::CopyRange {
                from,
                from_offset,
                to,
                to_offset,
                len,
            } => {
                put_path(dst, from);
                dst.put_u64(*from_offset);
                put_path(dst, to);
                dst.put_u64(*to_offset);
                dst.put_u64(*len);
            }
        }
    }

    pub fn decode(mut src: Bytes) -> Result<(u32, Request)> {
        let opcode = Opcode::try_from(get_u8(&mut src)?)?;
        let seq = get_u32(&mut src)?;
        let req = match opcode {
            Opcode::Stat => Request::Stat {
                path: get_path(&mut src)?,
            },
            Opcode::List => Request::List {
                path: get_path(&mut src)?,
            },
            Opcode::Read => Request::Read {
                path: get_path(&mut src)?,
                offset: get_u64(&mut src)?,
                len: get_u32(&mut src)?,
            },
            Opcode::Write => Request::Write {
                path: get_path(&mut src)?,
                offset: get_u64(&mut src)?,
                data: get_bytes(&mut src)?,
            },
            Opcode::Create => Request::Create {
                path: get_path(&mut src)?,
                mode: get_u32(&mut src)?,
            },
            Opcode::Mkdir => Request::Mkdir {
                path: get_path(&mut src)?,
                mode: get_u32(&mut src)?,
            },
            Opcode::Remove => Request::Remove {
                path: get_path(&mut src)?,
            },
            Opcode::Rmdir => Request::Rmdir {
                path: get_path(&mut src)?,
            },
            Opcode::Rename => Request::Rename {
                from: get_path(&mut src)?,
                to: get_path(&mut src)?,
            },
            Opcode::Truncate => Request::Truncate {
                path: get_path(&mut src)?,
                size: get_u64(&mut src)?,
            },
            Opcode::SetTimes => Request::SetTimes {
                path: get_path(&mut src)?,
                atime: get_timespec(&mut src)?,
                mtime: get_timespec(&mut src)?,
            },
            Opcode::Readlink => Request::Readlink {
                path: get_path(&mut src)?,
            },
            Opcode::CopyRange => Request::CopyRange {
                from: get_path(&mut src)?,
                from_offset: get_u64(&mut src)?,
                to: get_path(&mut src)?,
                to_offset: get_u64(&mut src)?,
                len: get_u64(&mut src)?,
            },
        };
        Ok((seq, req))
    }
}

impl Response {
    pub fn ok(seq: u32, opcode: Opcode, reply: Reply) -> Self {
        Self {
            seq,
            opcode,
            result: Ok(reply),
        }
    }

    pub fn err(seq: u32, opcode: Opcode, errno: i32, message: impl Into<String>) -> Self {
        Self {
            seq,
            opcode,
            result: Err((errno, message.into())),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.opcode as u8);
        dst.put_u32(self.seq);
        match &self.result {
            Err((errno, message)) => {
                dst.put_i32(*errno);
                put_bytes(dst, message.as_bytes());
            }
            Ok(reply) => {
                dst.put_i32(0);
                match reply {
                    Reply::Done => {}
                    Reply::Stat(attr) => put_attr(dst, attr),
                    Reply::List(entries) => {
                        dst.put_u32(entries.len() as u32);
                        for e in entries {
                            put_bytes(dst, e.name.as_bytes());
                            put_attr(dst, &e.attr);
                        }
                    }
                    Reply::Data(data) => put_bytes(dst, data),
                    Reply::Written(n) => dst.put_u32(*n),
                    Reply::Link(target) => put_path(dst, target),
                    Reply::Copied(n) => dst.put_u64(*n),
                }
            }
        }
    }

    pub fn decode(mut src: Bytes) -> Result<Response> {
        let opcode = Opcode::try_from(get_u8(&mut src)?)?;
        let seq = get_u32(&mut src)?;
        let status = get_i32(&mut src)?;
        if status != 0 {
            let message = get_bytes(&mut src)
                .map(|m| String::from_utf8_lossy(&m).into_owned())
                .unwrap_or_default();
            return Ok(Response::err(seq, opcode, status, message));
        }
        let reply = match opcode {
            Opcode::Stat => Reply::Stat(get_attr(&mut src)?),
            Opcode::List => {
                let count = get_u32(&mut src)? as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let name = OsString::from_vec(get_bytes(&mut src)?.to_vec());
                    let attr = get_attr(&mut src)?;
                    entries.push(RemoteEntry { name, attr });
                }
                Reply::List(entries)
            }
            Opcode::Read => Reply::Data(get_bytes(&mut src)?),
            Opcode::Write => Reply::Written(get_u32(&mut src)?),
            Opcode::Readlink => Reply::Link(get_path(&mut src)?),
            Opcode::CopyRange => Reply::Copied(get_u64(&mut src)?),
            _ => Reply::Done,
        };
        Ok(Response::ok(seq, opcode, reply))
    }

    /// Read the sequence id of a response frame, then decode the rest.
    ///
    /// Only a frame too short to carry a sequence id is an error here; a malformed
    /// body comes back as the inner error so the caller can fail that one request.
    pub fn route(src: Bytes) -> Result<(u32, Result<Response>)> {
        need(&src, 5, "response header")?;
        let seq = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        Ok((seq, Response::decode(src)))
    }
}

fn short(what: &str) -> BridgeError {
    BridgeError::Protocol(format!("frame too short while reading {what}"))
}

fn need(src: &Bytes, n: usize, what: &str) -> Result<()> {
    if src.remaining() < n {
        return Err(short(what));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    need(src, 1, "u8")?;
    Ok(src.get_u8())
}

fn get_u32(src: &mut Bytes) -> Result<u32> {
    need(src, 4, "u32")?;
    Ok(src.get_u32())
}

fn get_i32(src: &mut Bytes) -> Result<i32> {
    need(src, 4, "i32")?;
    Ok(src.get_i32())
}

fn get_u64(src: &mut Bytes) -> Result<u64> {
    need(src, 8, "u64")?;
    Ok(src.get_u64())
}

fn get_i64(src: &mut Bytes) -> Result<i64> {
    need(src, 8, "i64")?;
    Ok(src.get_i64())
}

fn put_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

fn get_bytes(src: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(src)? as usize;
    need(src, len, "byte range")?;
    Ok(src.split_to(len))
}

fn put_path(dst: &mut BytesMut, p: &Path) {
    put_bytes(dst, p.as_os_str().as_bytes());
}

fn get_path(src: &mut Bytes) -> Result<PathBuf> {
    Ok(PathBuf::from(OsString::from_vec(get_bytes(src)?.to_vec())))
}

fn put_time(dst: &mut BytesMut, t: SystemTime) {
    let (secs, nanos) = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                (-(d.as_secs() as i64), 0)
            } else {
                (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
            }
        }
    };
    dst.put_i64(secs);
    dst.put_u32(nanos);
}

fn get_time(src: &mut Bytes) -> Result<SystemTime> {
    let secs = get_i64(src)?;
    let nanos = get_u32(src)?;
    if nanos >= 1_000_000_000 {
        return Err(BridgeError::Protocol(format!("nanoseconds out of range: {nanos}")));
    }
    Ok(if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nanos as u64)
    })
}

fn put_timespec(dst: &mut BytesMut, t: TimeSpec) {
    match t {
        TimeSpec::Omit => dst.put_u8(0),
        TimeSpec::Now => dst.put_u8(1),
        TimeSpec::At(t) => {
            dst.put_u8(2);
            put_time(dst, t);
        }
    }
}

fn get_timespec(src: &mut Bytes) -> Result<TimeSpec> {
    match get_u8(src)? {
        0 => Ok(TimeSpec::Omit),
        1 => Ok(TimeSpec::Now),
        2 => Ok(TimeSpec::At(get_time(src)?)),
        other => Err(BridgeError::Protocol(format!("bad timespec tag {other}"))),
    }
}

fn put_attr(dst: &mut BytesMut, a: &Attr) {
    dst.put_u64(a.size);
    dst.put_u64(a.nlink);
    put_time(dst, a.atime);
    put_time(dst, a.mtime);
    put_time(dst, a.ctime);
    dst.put_u32(a.mode);
    dst.put_u32(a.uid);
    dst.put_u32(a.gid);
}

fn get_attr(src: &mut Bytes) -> Result<Attr> {
    Ok(Attr {
        size: get_u64(src)?,
        nlink: get_u64(src)?,
        atime: get_time(src)?,
        mtime: get_time(src)?,
        ctime: get_time(src)?,
        mode: get_u32(src)?,
        uid: get_u32(src)?,
        gid: get_u32(src)?,
    })
}
