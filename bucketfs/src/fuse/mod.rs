//! FUSE adapter and request handling
//!
//! Implements `rfuse3::raw::Filesystem` for [`BucketFs`]: every kernel request
//! is forwarded to the matching inode-keyed operation and `FsError`s become
//! errno values. Attribute presentation (owner, permission bits, link count,
//! block count) is decided here from the mount configuration.
//!
//! Submodules:
//! - `mount`: mount/unmount helpers over the raw session API.
pub mod mount;

use crate::cadapter::ObjectBackend;
use crate::vfs::{BucketFs, FsError, FsResult, InodeAttr, InodeKind};
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;

/// Largest write the kernel may send in one request.
const MAX_WRITE: u32 = 1024 * 1024;

/// Reported for entries whose inode has not been looked up yet.
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Entries produced per readdir reply; the kernel resumes from the last
/// offset it consumed.
const READDIR_BATCH: usize = 512;

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        tracing::debug!(error = %err, errno = err.errno(), "request failed");
        err.errno().into()
    }
}

fn name_str(name: &OsStr) -> FuseResult<&str> {
    name.to_str().ok_or_else(|| libc::EINVAL.into())
}

fn fuse_kind(kind: InodeKind) -> FuseFileType {
    match kind {
        InodeKind::Directory => FuseFileType::Directory,
        InodeKind::File => FuseFileType::RegularFile,
    }
}

impl<B: ObjectBackend + ?Sized> BucketFs<B> {
    fn fuse_attr(&self, attr: &InodeAttr, req: &Request) -> FileAttr {
        let config = self.config();
        let mtime = Timestamp::from(attr.mtime);
        let (perm, nlink) = match attr.kind {
            InodeKind::Directory => (config.dir_mode, 2),
            InodeKind::File => (config.file_mode, 1),
        };
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            #[cfg(target_os = "macos")]
            crtime: mtime,
            kind: fuse_kind(attr.kind),
            perm,
            nlink,
            uid: config.uid.unwrap_or(req.uid),
            gid: config.gid.unwrap_or(req.gid),
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: 4096,
        }
    }

    // The kernel marks an inode stale when its generation changes, so the
    // internal refresh counter is never exposed here.
    fn entry(&self, attr: &InodeAttr, req: &Request) -> ReplyEntry {
        ReplyEntry {
            ttl: self.config().attr_ttl(),
            attr: self.fuse_attr(attr, req),
            generation: 0,
        }
    }

    // Offsets: "." is 1, ".." is 2 and listing entry i is i + 3. The kernel
    // passes back the offset of the last entry it consumed.
    async fn directory_entries(
        &self,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FsResult<Vec<DirectoryEntry>> {
        let start = offset.max(0) as usize;
        let mut entries = Vec::new();
        if start < 1 {
            entries.push(DirectoryEntry {
                inode: ino,
                kind: FuseFileType::Directory,
                name: OsString::from("."),
                offset: 1,
            });
        }
        if start < 2 {
            let parent = self.inodes().parent_of(ino)?;
            entries.push(DirectoryEntry {
                inode: parent,
                kind: FuseFileType::Directory,
                name: OsString::from(".."),
                offset: 2,
            });
        }
        let mut index = start.saturating_sub(2);
        while entries.len() < READDIR_BATCH {
            let Some((entry, live)) = BucketFs::read_dir(self, fh, index).await? else {
                break;
            };
            entries.push(DirectoryEntry {
                inode: live.unwrap_or(UNKNOWN_INO),
                kind: fuse_kind(entry.kind),
                name: OsString::from(entry.name),
                offset: index as i64 + 3,
            });
            index += 1;
        }
        Ok(entries)
    }
}

impl<B> Filesystem for BucketFs<B>
where
    B: ObjectBackend + ?Sized + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    // readdirplus is not negotiated; the type is still required by the trait.
    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or_else(|| Errno::from(libc::EINVAL))?;
        tracing::info!(max_write = MAX_WRITE, "fuse session initialised");
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        self.flush_all().await;
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let attr = BucketFs::lookup(self, parent, name_str(name)?).await?;
        Ok(self.entry(&attr, &req))
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        BucketFs::forget(self, inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            BucketFs::forget(self, inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = self.get_attributes(ino).await?;
        Ok(ReplyAttr {
            ttl: self.config().attr_ttl(),
            attr: self.fuse_attr(&attr, &req),
        })
    }

    // Only the size is honoured; mode, owner and times are accepted and dropped.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let attr = match set_attr.size {
            Some(size) => self.set_size(ino, fh, size).await?,
            None => self.get_attributes(ino).await?,
        };
        Ok(ReplyAttr {
            ttl: self.config().attr_ttl(),
            attr: self.fuse_attr(&attr, &req),
        })
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let attr = BucketFs::mkdir(self, parent, name_str(name)?).await?;
        Ok(self.entry(&attr, &req))
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        BucketFs::unlink(self, parent, name_str(name)?).await?;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        BucketFs::rmdir(self, parent, name_str(name)?).await?;
        Ok(())
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let fh = BucketFs::open(self, ino).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = BucketFs::read(self, fh, offset, size).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = BucketFs::write(self, fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let stats = BucketFs::statfs(self);
        Ok(ReplyStatFs {
            blocks: stats.blocks,
            bfree: stats.blocks_free,
            bavail: stats.blocks_free,
            files: stats.files,
            ffree: stats.files_free,
            bsize: stats.block_size,
            namelen: stats.name_max,
            frsize: stats.block_size,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        BucketFs::release(self, fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        BucketFs::flush(self, fh).await?;
        Ok(())
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        BucketFs::flush(self, fh).await?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let fh = BucketFs::opendir(self, ino).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let entries = self.directory_entries(ino, fh, offset).await?;
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, fh: u64, _flags: u32) -> FuseResult<()> {
        BucketFs::releasedir(self, fh).await?;
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let (attr, fh) = BucketFs::create(self, parent, name_str(name)?).await?;
        Ok(ReplyCreated {
            ttl: self.config().attr_ttl(),
            attr: self.fuse_attr(&attr, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}


#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::cadapter::MemoryBackend;
    use crate::config::FsConfig;
    use crate::fuse::mount::mount_bucket;
    use bytes::Bytes;
    use std::fs;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    // Mount smoke test on Linux, gated by BUCKETFS_FUSE_TEST=1.
    #[tokio::test(flavor = "multi_thread")]
    async fn smoke_mount_and_basic_ops() {
        if std::env::var("BUCKETFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set BUCKETFS_FUSE_TEST=1 to enable");
            return;
        }

        let backend = Arc::new(MemoryBackend::new());
        backend.insert("dir1/file3", Bytes::from_static(b"dir1/file3")).await;
        let fs = BucketFs::new(backend.clone(), FsConfig::default());

        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();
        let handle = match mount_bucket(fs, &mnt_path, false).await {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let root = mnt_path.clone();
        let listed = tokio::task::spawn_blocking(move || {
            fs::create_dir(root.join("a")).expect("mkdir");
            let file_path = root.join("a").join("hello.txt");
            {
                let mut f = fs::File::create(&file_path).expect("create file");
                f.write_all(b"abc").expect("write");
            }
            assert_eq!(fs::read(&file_path).expect("read back"), b"abc");
            assert_eq!(
                fs::read(root.join("dir1/file3")).expect("read seeded"),
                b"dir1/file3"
            );
            let mut names = fs::read_dir(&root)
                .expect("readdir")
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            names.sort();
            fs::remove_file(&file_path).expect("unlink");
            names
        })
        .await
        .expect("blocking ops");
        assert_eq!(listed, vec!["a", "dir1"]);
        assert!(backend.get("a/hello.txt").await.is_none());

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
