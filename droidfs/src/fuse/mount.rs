//! Mount helpers for starting/stopping FUSE
//!
//! Only Linux is supported; the mount goes through fusermount3 so no privileges
//! are needed.

use std::path::Path;

use rfuse3::MountOptions;

use super::DroidFs;

fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("droidfs");
    mo
}

/// Mount `fs` on the given empty directory.
#[cfg(target_os = "linux")]
pub async fn mount_bridge_unprivileged(
    fs: DroidFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_bridge_unprivileged(
    _fs: DroidFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let _ = default_mount_options();
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
