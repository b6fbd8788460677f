//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux the unprivileged path via
//!   fusermount3 is used.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use crate::cadapter::ObjectBackend;
use crate::vfs::BucketFs;

fn mount_options(allow_other: bool) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("bucketfs");
    if allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mounts `fs` at `mount_point`; the returned handle unmounts it.
#[cfg(target_os = "linux")]
pub async fn mount_bucket<B>(
    fs: BucketFs<B>,
    mount_point: impl AsRef<Path>,
    allow_other: bool,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: ObjectBackend + ?Sized + 'static,
{
    let session = rfuse3::raw::Session::new(mount_options(allow_other));
    tracing::info!(
        mount_point = %mount_point.as_ref().display(),
        allow_other,
        "mounting bucket"
    );
    session.mount_with_unprivileged(fs, mount_point).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_bucket<B>(
    _fs: BucketFs<B>,
    _mount_point: impl AsRef<Path>,
    _allow_other: bool,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    B: ObjectBackend + ?Sized + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
