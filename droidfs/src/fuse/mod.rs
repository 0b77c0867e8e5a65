//! Kernel-call glue: translates FUSE requests into [`Bridge`] operations.
//!
//! Inode numbers are node ids. Path-based engine calls get their path by joining
//! the parent node's current path with the entry name, so a rename that happened
//! since the kernel cached the parent is picked up automatically.

pub mod mount;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCopyFileRange, ReplyCreated,
    ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, Result as FuseResult, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::engine::Bridge;
use crate::node::{Attr, NodeId, NodeKind};
use crate::path;
use crate::remote::TimeSpec;

/// How long the kernel may cache entries and attributes.
const KERNEL_TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;
/// Inode reported for listed children the engine holds no node for.
const UNKNOWN_INO: u64 = 0xffff_ffff;

pub struct DroidFs {
    bridge: Arc<Bridge>,
}

impl DroidFs {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    fn path_of(&self, ino: u64) -> FuseResult<PathBuf> {
        self.bridge
            .nodes()
            .path_of(NodeId(ino))
            .ok_or_else(|| libc::ENOENT.into())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<PathBuf> {
        Ok(path::join(&self.path_of(parent)?, name))
    }

    fn parent_ino(&self, ino: u64) -> u64 {
        if NodeId(ino) == NodeId::ROOT {
            return ino;
        }
        self.bridge
            .nodes()
            .path_of(NodeId(ino))
            .and_then(|p| self.bridge.nodes().lookup(&path::parent_of(&p)))
            .unwrap_or(NodeId::ROOT)
            .0
    }

    fn entry(id: NodeId, attr: &Attr) -> ReplyEntry {
        ReplyEntry {
            ttl: KERNEL_TTL,
            attr: to_fuse_attr(id, attr),
            generation: 0,
        }
    }
}

impl Filesystem for DroidFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or(libc::EINVAL)?;
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        if let Err(e) = self.bridge.shutdown().await {
            warn!(error = %e, "pending writes lost on unmount");
        }
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let p = self.child_path(parent, name)?;
        let (id, attr) = self.bridge.lookup(&p).await.map_err(|e| e.errno())?;
        Ok(Self::entry(id, &attr))
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.bridge.forget(NodeId(inode), nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.bridge.forget(NodeId(inode), nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = self
            .bridge
            .getattr(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: KERNEL_TTL,
            attr: to_fuse_attr(NodeId(ino), &attr),
        })
    }

    // size, atime and mtime are honored; mode changes are accepted and ignored
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let id = NodeId(ino);
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.bridge
                .chown(id, set_attr.uid, set_attr.gid)
                .map_err(|e| e.errno())?;
        }
        if let Some(size) = set_attr.size {
            self.bridge
                .truncate(id, size)
                .await
                .map_err(|e| e.errno())?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let atime = set_attr.atime.map_or(TimeSpec::Omit, to_time_spec);
            let mtime = set_attr.mtime.map_or(TimeSpec::Omit, to_time_spec);
            self.bridge
                .set_times(id, atime, mtime)
                .await
                .map_err(|e| e.errno())?;
        }
        let attr = self.bridge.getattr(id).await.map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: KERNEL_TTL,
            attr: to_fuse_attr(id, &attr),
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let target = self
            .bridge
            .readlink(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyData {
            data: Bytes::from(target.into_os_string().into_vec()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let p = self.child_path(parent, name)?;
        let (id, attr) = self
            .bridge
            .symlink(&p, Path::new(link))
            .map_err(|e| e.errno())?;
        Ok(Self::entry(id, &attr))
    }

    async fn link(
        &self,
        _req: Request,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let p = self.child_path(new_parent, new_name)?;
        let (id, attr) = self
            .bridge
            .link(NodeId(ino), &p)
            .map_err(|e| e.errno())?;
        Ok(Self::entry(id, &attr))
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let p = self.child_path(parent, name)?;
        let (id, attr) = self
            .bridge
            .mkdir(&p, mode & !umask)
            .await
            .map_err(|e| e.errno())?;
        Ok(Self::entry(id, &attr))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let p = self.child_path(parent, name)?;
        self.bridge.unlink(&p).await.map_err(|e| e.errno().into())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let p = self.child_path(parent, name)?;
        self.bridge.rmdir(&p).await.map_err(|e| e.errno().into())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(new_parent, new_name)?;
        self.bridge
            .rename(&from, &to)
            .await
            .map_err(|e| e.errno().into())
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let attr = self
            .bridge
            .getattr(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;
        if attr.kind() == NodeKind::Directory {
            return Err(libc::EISDIR.into());
        }
        self.bridge
            .open(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self
            .bridge
            .read(NodeId(ino), offset, size as usize)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let n = self
            .bridge
            .write(NodeId(ino), offset, data)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let s = self.bridge.statfs();
        Ok(ReplyStatFs {
            blocks: s.blocks,
            bfree: s.bfree,
            bavail: s.bavail,
            files: s.files,
            ffree: s.ffree,
            bsize: s.bsize,
            namelen: s.namelen,
            frsize: s.bsize,
        })
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.bridge
            .release(NodeId(inode))
            .await
            .map_err(|e| e.errno().into())
    }

    async fn fsync(&self, _req: Request, inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        self.bridge
            .flush(NodeId(inode))
            .await
            .map_err(|e| e.errno().into())
    }

    async fn flush(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        self.bridge
            .flush(NodeId(inode))
            .await
            .map_err(|e| e.errno().into())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let attr = self
            .bridge
            .getattr(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;
        if attr.kind() != NodeKind::Directory {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let entries = self
            .bridge
            .readdir(NodeId(ino))
            .await
            .map_err(|e| e.errno())?;

        // offset is that of the last entry the kernel already has
        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(ino),
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, e) in entries.into_iter().enumerate() {
            all.push(DirectoryEntry {
                inode: e.node.map_or(UNKNOWN_INO, |n| n.0),
                kind: file_type(e.attr.mode),
                name: e.name,
                offset: i as i64 + 3,
            });
        }
        let start = offset.max(0) as usize;
        let rest: Vec<FuseResult<DirectoryEntry>> = all.into_iter().skip(start).map(Ok).collect();
        Ok(ReplyDirectory {
            entries: Box::pin(stream::iter(rest)),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir = NodeId(ino);
        let entries = self.bridge.readdir(dir).await.map_err(|e| e.errno())?;
        let dir_attr = self.bridge.getattr(dir).await.map_err(|e| e.errno())?;
        let parent = NodeId(self.parent_ino(ino));
        let parent_attr = self.bridge.getattr(parent).await.unwrap_or(dir_attr.clone());

        let plus = |id: NodeId, attr: &Attr, name: OsString, offset: i64| DirectoryEntryPlus {
            inode: id.0,
            generation: 0,
            kind: file_type(attr.mode),
            name,
            offset,
            attr: to_fuse_attr(id, attr),
            entry_ttl: KERNEL_TTL,
            attr_ttl: KERNEL_TTL,
        };

        let mut rest = Vec::with_capacity(entries.len() + 2);
        if offset < 1 {
            rest.push(plus(dir, &dir_attr, OsString::from("."), 1));
        }
        if offset < 2 {
            rest.push(plus(parent, &parent_attr, OsString::from(".."), 2));
        }
        // every child handed out here counts as a kernel lookup, so only the
        // ones actually returned get a node
        let skip = (offset as usize).saturating_sub(2);
        for (i, e) in entries.iter().enumerate().skip(skip) {
            let (id, attr) = self
                .bridge
                .lookup_entry(dir, e)
                .await
                .map_err(|err| err.errno())?;
            rest.push(plus(id, &attr, e.name.clone(), i as i64 + 3));
        }
        debug!(dir = ino, offset, returned = rest.len(), "readdirplus");
        Ok(ReplyDirectoryPlus {
            entries: Box::pin(stream::iter(
                rest.into_iter().map(Ok::<_, rfuse3::Errno>),
            )),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let p = self.child_path(parent, name)?;
        let (id, attr) = self
            .bridge
            .create(&p, mode)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyCreated {
            ttl: KERNEL_TTL,
            attr: to_fuse_attr(id, &attr),
            generation: 0,
            fh: 0,
            flags: 0,
        })
    }

    async fn copy_file_range(
        &self,
        _req: Request,
        inode: u64,
        _fh_in: u64,
        off_in: u64,
        inode_out: u64,
        _fh_out: u64,
        off_out: u64,
        length: u64,
        _flags: u64,
    ) -> FuseResult<ReplyCopyFileRange> {
        let copied = self
            .bridge
            .copy_range(NodeId(inode), off_in, NodeId(inode_out), off_out, length)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyCopyFileRange { copied })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn to_time_spec(ts: Timestamp) -> TimeSpec {
    let secs = u64::try_from(ts.sec).unwrap_or(0);
    TimeSpec::At(UNIX_EPOCH + Duration::new(secs, ts.nsec))
}

fn timestamp(t: SystemTime) -> Timestamp {
    Timestamp::from(t)
}

fn to_fuse_attr(id: NodeId, a: &Attr) -> FileAttr {
    FileAttr {
        ino: id.0,
        size: a.size,
        blocks: a.size.div_ceil(512),
        atime: timestamp(a.atime),
        mtime: timestamp(a.mtime),
        ctime: timestamp(a.ctime),
        #[cfg(target_os = "macos")]
        crtime: timestamp(a.ctime),
        kind: file_type(a.mode),
        perm: (a.mode & 0o7777) as u16,
        nlink: a.nlink as u32,
        uid: a.uid,
        gid: a.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_conversion_keeps_identity_and_mode() {
        let now = SystemTime::now();
        let mut a = Attr::fresh(libc::S_IFREG as u32 | 0o640, now);
        a.size = 1000;
        let f = to_fuse_attr(NodeId(42), &a);
        assert_eq!(f.ino, 42);
        assert_eq!(f.perm, 0o640);
        assert_eq!(f.blocks, 2);
        assert_eq!(f.kind, FileType::RegularFile);
        assert_eq!(file_type(libc::S_IFLNK as u32 | 0o777), FileType::Symlink);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::config::{Config, ConfigRegistry};
    use crate::engine::Bridge;
    use crate::fuse::mount::mount_bridge_unprivileged;
    use crate::remote::memory::MemoryDevice;
    use std::fs;
    use std::io::Write;

    // runs only with DROIDFS_FUSE_TEST=1 and fusermount3 available
    #[tokio::test]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("DROIDFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set DROIDFS_FUSE_TEST=1 to enable");
            return;
        }

        let dev = Arc::new(MemoryDevice::new());
        dev.put_dir("/sdcard");
        let bridge = Bridge::new(Arc::new(ConfigRegistry::new(Config::default())), dev.clone());

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_bridge_unprivileged(DroidFs::new(bridge), &mnt_path).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {}", e);
                return;
            }
        };
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let mnt_path_clone = mnt_path.clone();
        tokio::task::spawn_blocking(move || {
            let file_path = mnt_path_clone.join("sdcard").join("hello.txt");
            let mut f = fs::File::create(&file_path).expect("create file");
            f.write_all(b"abc").expect("write");
            drop(f);
            assert_eq!(fs::read(&file_path).expect("read back"), b"abc");
            let names: Vec<_> = fs::read_dir(mnt_path_clone.join("sdcard"))
                .expect("readdir")
                .filter_map(|e| e.ok())
                .map(|e| e.file_name())
                .collect();
            assert!(names.iter().any(|n| n.to_string_lossy() == "hello.txt"));
            fs::remove_file(&file_path).expect("unlink");
        })
        .await
        .expect("blocking ops");

        assert!(!dev.exists("/sdcard/hello.txt"));
        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {}", e);
        }
    }
}
