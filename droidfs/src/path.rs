//! Device path helpers. Paths are absolute, `/`-separated and never end with `/`
//! except for the root itself.
//!
//! Everything here works on the raw bytes of the path: names on the device are
//! not guaranteed to be UTF-8 and must come back exactly as they were listed.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

pub const ROOT: &str = "/";

pub fn root() -> PathBuf {
    PathBuf::from(ROOT)
}

pub fn as_bytes(p: &Path) -> &[u8] {
    p.as_os_str().as_bytes()
}

pub fn from_bytes(b: Vec<u8>) -> PathBuf {
    PathBuf::from(OsString::from_vec(b))
}

pub fn norm_path(p: &Path) -> PathBuf {
    let mut out = vec![b'/'];
    for part in as_bytes(p)
        .split(|&c| c == b'/')
        .filter(|s| !s.is_empty() && *s != b".")
    {
        if out.len() > 1 {
            out.push(b'/');
        }
        out.extend_from_slice(part);
    }
    from_bytes(out)
}

pub fn join(parent: &Path, name: &OsStr) -> PathBuf {
    let mut p = as_bytes(parent).to_vec();
    if p != b"/" {
        p.push(b'/');
    }
    p.extend_from_slice(name.as_bytes());
    from_bytes(p)
}

/// Split `/a/b/c` into (`/a/b`, `c`). The root splits into (`/`, ``).
pub fn split_dir_file(path: &Path) -> (PathBuf, OsString) {
    let b = as_bytes(path);
    let n = b.iter().rposition(|&c| c == b'/').unwrap_or(0);
    if n == 0 {
        let name = b.get(1..).unwrap_or_default();
        (root(), OsStr::from_bytes(name).to_owned())
    } else {
        (from_bytes(b[..n].to_vec()), OsStr::from_bytes(&b[n + 1..]).to_owned())
    }
}

pub fn parent_of(path: &Path) -> PathBuf {
    split_dir_file(path).0
}

pub fn file_name(path: &Path) -> &OsStr {
    let b = as_bytes(path);
    match b.iter().rposition(|&c| c == b'/') {
        Some(n) => OsStr::from_bytes(&b[n + 1..]),
        None => path.as_os_str(),
    }
}

/// True when `path` equals `ancestor` or lies underneath it.
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    let (p, a) = (as_bytes(path), as_bytes(ancestor));
    if a == b"/" {
        return true;
    }
    p == a || (p.starts_with(a) && p.get(a.len()) == Some(&b'/'))
}

/// Rewrite the `from` prefix of `path` to `to`. Callers check [`is_within`] first.
pub fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    let (p, f, t) = (as_bytes(path), as_bytes(from), as_bytes(to));
    if p == f {
        return to.to_path_buf();
    }
    let mut out = if t == b"/" { Vec::new() } else { t.to_vec() };
    out.extend_from_slice(&p[f.len()..]);
    from_bytes(out)
}
