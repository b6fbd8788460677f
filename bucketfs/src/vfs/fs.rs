//! Filesystem root: binds a bucket to the inode table and the handle tables,
//! and exposes the inode-keyed operations the FUSE layer dispatches to.

use super::dir::{DirEntry, DirHandle};
use super::error::{FsError, FsResult};
use super::file::FileHandle;
use super::inode::{InodeAttr, InodeKind, ROOT_ID, child_key};
use super::table::{InodeTable, Observed, validate_name};
use crate::cadapter::ObjectBackend;
use crate::config::FsConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

type HandleMap<H> = Mutex<HashMap<u64, Arc<AsyncMutex<H>>>>;

fn lock_map<H>(map: &HandleMap<H>) -> MutexGuard<'_, HashMap<u64, Arc<AsyncMutex<H>>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Values reported by `statfs`. Buckets have no real capacity limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

pub struct BucketFs<B: ObjectBackend + ?Sized> {
    backend: Arc<B>,
    config: FsConfig,
    table: InodeTable,
    files: HandleMap<FileHandle>,
    dirs: HandleMap<DirHandle>,
    next_fh: AtomicU64,
}

impl<B: ObjectBackend + ?Sized> BucketFs<B> {
    pub fn new(backend: Arc<B>, config: FsConfig) -> Self {
        let table = InodeTable::new(config.attr_ttl(), SystemTime::now());
        Self {
            backend,
            config,
            table,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn root_id(&self) -> u64 {
        ROOT_ID
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.table
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn file_handle(&self, fh: u64) -> FsResult<Arc<AsyncMutex<FileHandle>>> {
        lock_map(&self.files)
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle(fh))
    }

    fn dir_handle(&self, fh: u64) -> FsResult<Arc<AsyncMutex<DirHandle>>> {
        lock_map(&self.dirs)
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle(fh))
    }

    fn install_file(&self, handle: FileHandle) -> u64 {
        let fh = self.alloc_fh();
        lock_map(&self.files).insert(fh, Arc::new(AsyncMutex::new(handle)));
        fh
    }

    pub async fn get_attributes(&self, ino: u64) -> FsResult<InodeAttr> {
        self.table.get_attributes(&*self.backend, ino).await
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> FsResult<InodeAttr> {
        let attr = self
            .table
            .lookup_child(&*self.backend, parent, name)
            .await?;
        debug!(parent, name, ino = attr.ino, "lookup");
        Ok(attr)
    }

    /// Registers a new file and opens it dirty; nothing reaches the bucket
    /// until the handle is flushed.
    pub async fn create(&self, parent: u64, name: &str) -> FsResult<(InodeAttr, u64)> {
        validate_name(name)?;
        let observed = Observed {
            kind: InodeKind::File,
            size: 0,
            mtime: SystemTime::now(),
        };
        let attr = self.table.register(parent, name, observed, true)?;
        let (key, _) = self.table.key_of(attr.ino)?;
        self.table.open_handle(attr.ino)?;
        let fh = self.install_file(FileHandle::create(attr.ino, key, self.config.part_size));
        debug!(parent, name, ino = attr.ino, fh, "create");
        Ok((attr, fh))
    }

    /// Deletes the object named `name`. Whatever the backend answers for a
    /// missing key is returned unchanged.
    pub async fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        validate_name(name)?;
        let parent_key = self.table.directory_key(parent)?;
        let key = child_key(&parent_key, name, InodeKind::File);
        self.backend.delete_object(&key).await?;
        if let Some(ino) = self.table.detach(&key) {
            self.orphan_handles(ino).await;
        }
        debug!(parent, key = %key, "unlink");
        Ok(())
    }

    /// Open handles on an unlinked inode must not write its old key back.
    async fn orphan_handles(&self, ino: u64) {
        let handles: Vec<_> = lock_map(&self.files).values().cloned().collect();
        for handle in handles {
            let mut handle = handle.lock().await;
            if handle.ino() == ino {
                handle.orphan(&*self.backend).await;
                debug!(ino, key = handle.key(), "orphaned open handle");
            }
        }
    }

    /// Creates a directory by storing an empty `name/` marker.
    pub async fn mkdir(&self, parent: u64, name: &str) -> FsResult<InodeAttr> {
        validate_name(name)?;
        match self.table.lookup_child(&*self.backend, parent, name).await {
            Ok(existing) => {
                self.table.forget(existing.ino, 1);
                return Err(FsError::AlreadyExists(name.to_string()));
            }
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let parent_key = self.table.directory_key(parent)?;
        let key = child_key(&parent_key, name, InodeKind::Directory);
        self.backend.put_object(&key, Bytes::new()).await?;
        let observed = Observed {
            kind: InodeKind::Directory,
            size: 0,
            mtime: SystemTime::now(),
        };
        let attr = self.table.register(parent, name, observed, false)?;
        debug!(parent, key = %key, ino = attr.ino, "mkdir");
        Ok(attr)
    }

    /// Removes an empty directory's marker.
    pub async fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        validate_name(name)?;
        let parent_key = self.table.directory_key(parent)?;
        let key = child_key(&parent_key, name, InodeKind::Directory);
        // the marker plus one more entry is enough to decide
        let page = self
            .backend
            .list_objects(&key, Some("/"), None, 2)
            .await?;
        let has_marker = page.objects.iter().any(|o| o.key == key);
        let has_children =
            !page.common_prefixes.is_empty() || page.objects.iter().any(|o| o.key != key);
        if has_children {
            return Err(FsError::NotEmpty(key));
        }
        if !has_marker {
            return Err(FsError::NotFound(key));
        }
        self.backend.delete_object(&key).await?;
        self.table.detach(&key);
        debug!(parent, key = %key, "rmdir");
        Ok(())
    }

    pub async fn opendir(&self, ino: u64) -> FsResult<u64> {
        let prefix = self.table.directory_key(ino)?;
        self.table.open_handle(ino)?;
        let fh = self.alloc_fh();
        lock_map(&self.dirs).insert(fh, Arc::new(AsyncMutex::new(DirHandle::new(ino, prefix))));
        Ok(fh)
    }

    /// Entry at `offset` with the identity of its live inode, if any.
    pub async fn read_dir(&self, fh: u64, offset: usize) -> FsResult<Option<(DirEntry, Option<u64>)>> {
        let handle = self.dir_handle(fh)?;
        let mut handle = handle.lock().await;
        let entry = handle
            .read_dir(
                &*self.backend,
                &self.table,
                self.config.list_page_size,
                offset,
            )
            .await?;
        Ok(entry.map(|entry| {
            let ino = self.table.id_for_key(&entry.key);
            (entry, ino)
        }))
    }

    pub async fn releasedir(&self, fh: u64) -> FsResult<()> {
        let handle = lock_map(&self.dirs)
            .remove(&fh)
            .ok_or(FsError::BadHandle(fh))?;
        let mut handle = handle.lock().await;
        handle.close();
        self.table.close_handle(handle.ino());
        Ok(())
    }

    pub async fn open(&self, ino: u64) -> FsResult<u64> {
        let (key, kind) = self.table.key_of(ino)?;
        if kind == InodeKind::Directory {
            return Err(FsError::IsADirectory(ino));
        }
        self.table.open_handle(ino)?;
        let fh = self.install_file(FileHandle::open(ino, key, self.config.part_size));
        debug!(ino, fh, "open");
        Ok(fh)
    }

    pub async fn read(&self, fh: u64, offset: u64, len: u32) -> FsResult<Bytes> {
        let handle = self.file_handle(fh)?;
        let handle = handle.lock().await;
        handle.read(&*self.backend, offset, u64::from(len)).await
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let handle = self.file_handle(fh)?;
        let mut handle = handle.lock().await;
        let written = handle.write(&*self.backend, offset, data).await?;
        if !data.is_empty() {
            self.table.pin(handle.ino(), written);
        }
        Ok(data.len() as u32)
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        let handle = self.file_handle(fh)?;
        let mut handle = handle.lock().await;
        self.flush_locked(&mut handle).await
    }

    async fn flush_locked(&self, handle: &mut FileHandle) -> FsResult<()> {
        match handle.flush(&*self.backend).await {
            Ok(Some(size)) => {
                self.table.record_upload(handle.ino(), size, SystemTime::now());
                debug!(ino = handle.ino(), key = handle.key(), size, "flushed");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.table.invalidate(handle.ino());
                Err(e)
            }
        }
    }

    /// Closes a file handle, flushing pending writes first.
    pub async fn release(&self, fh: u64) -> FsResult<()> {
        let handle = lock_map(&self.files)
            .remove(&fh)
            .ok_or(FsError::BadHandle(fh))?;
        let mut handle = handle.lock().await;
        let result = self.flush_locked(&mut handle).await;
        self.table.close_handle(handle.ino());
        result
    }

    /// Only truncation to zero and no-op resizes are possible on objects.
    pub async fn set_size(&self, ino: u64, fh: Option<u64>, size: u64) -> FsResult<InodeAttr> {
        let attr = self.get_attributes(ino).await?;
        if attr.kind == InodeKind::Directory {
            return Err(FsError::IsADirectory(ino));
        }
        if size == attr.size {
            return Ok(attr);
        }
        if size != 0 {
            return Err(FsError::Unsupported(format!(
                "resize of inode {ino} from {} to {size}",
                attr.size
            )));
        }

        let handle = fh.and_then(|fh| self.file_handle(fh).ok());
        match handle {
            Some(handle) => {
                let mut handle = handle.lock().await;
                handle.truncate(&*self.backend).await;
                self.table.pin(ino, 0);
            }
            None => {
                let (key, _) = self.table.key_of(ino)?;
                self.backend.put_object(&key, Bytes::new()).await?;
                self.table.record_upload(ino, 0, SystemTime::now());
            }
        }
        debug!(ino, "truncated");
        self.table.cached_attr(ino)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.table.forget(ino, nlookup);
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: 4096,
            blocks: 1 << 40,
            blocks_free: 1 << 40,
            files: 1 << 40,
            files_free: 1 << 40,
            name_max: 1024,
        }
    }

    /// Flushes every open file; used on unmount.
    pub async fn flush_all(&self) {
        let handles: Vec<_> = lock_map(&self.files).values().cloned().collect();
        for handle in handles {
            let mut handle = handle.lock().await;
            if handle.is_dirty() {
                let _ = self.flush_locked(&mut handle).await;
            }
        }
        info!(inodes = self.table.len(), "flushed open handles");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::MemoryBackend;

    async fn mounted() -> (Arc<MemoryBackend>, BucketFs<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        for key in ["file1", "file2", "dir1/file3", "dir2/dir3/file4", "empty_dir/"] {
            backend.insert(key, Bytes::from(key.to_string())).await;
        }
        let fs = BucketFs::new(backend.clone(), FsConfig::default());
        (backend, fs)
    }

    #[tokio::test]
    async fn open_rejects_directories() {
        let (_backend, fs) = mounted().await;
        let dir = fs.lookup(fs.root_id(), "dir1").await.unwrap();
        assert!(matches!(fs.open(dir.ino).await, Err(FsError::IsADirectory(_))));
        let file = fs.lookup(fs.root_id(), "file1").await.unwrap();
        assert!(matches!(fs.opendir(file.ino).await, Err(FsError::NotADirectory(_))));
    }

    #[tokio::test]
    async fn unknown_handles_are_bad() {
        let (_backend, fs) = mounted().await;
        assert!(matches!(fs.read(99, 0, 1).await, Err(FsError::BadHandle(99))));
        assert!(matches!(fs.release(99).await, Err(FsError::BadHandle(99))));
        assert!(matches!(fs.releasedir(99).await, Err(FsError::BadHandle(99))));
    }

    #[tokio::test]
    async fn write_pins_local_size_until_flush() {
        let (backend, fs) = mounted().await;
        let (attr, fh) = fs.create(fs.root_id(), "notes").await.unwrap();
        fs.write(fh, 0, b"hello").await.unwrap();
        assert_eq!(fs.get_attributes(attr.ino).await.unwrap().size, 5);
        assert!(backend.get("notes").await.is_none());
        fs.release(fh).await.unwrap();
        assert_eq!(&backend.get("notes").await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn empty_write_keeps_existing_object() {
        let (backend, fs) = mounted().await;
        let file = fs.lookup(fs.root_id(), "file1").await.unwrap();
        let fh = fs.open(file.ino).await.unwrap();
        assert_eq!(fs.write(fh, 0, b"").await.unwrap(), 0);
        fs.release(fh).await.unwrap();
        assert_eq!(&backend.get("file1").await.unwrap()[..], b"file1");
        assert_eq!(fs.get_attributes(file.ino).await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn set_size_truncates_or_refuses() {
        let (backend, fs) = mounted().await;
        let file = fs.lookup(fs.root_id(), "file1").await.unwrap();
        assert_eq!(fs.set_size(file.ino, None, 5).await.unwrap().size, 5);
        assert!(matches!(
            fs.set_size(file.ino, None, 3).await,
            Err(FsError::Unsupported(_))
        ));
        let attr = fs.set_size(file.ino, None, 0).await.unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(backend.get("file1").await.unwrap().len(), 0);

        let fh = fs.open(file.ino).await.unwrap();
        fs.write(fh, 0, b"abc").await.unwrap();
        fs.set_size(file.ino, Some(fh), 0).await.unwrap();
        fs.write(fh, 0, b"z").await.unwrap();
        fs.release(fh).await.unwrap();
        assert_eq!(&backend.get("file1").await.unwrap()[..], b"z");
    }

    #[tokio::test]
    async fn mkdir_and_rmdir_manage_markers() {
        let (backend, fs) = mounted().await;
        let root = fs.root_id();
        let dir = fs.mkdir(root, "photos").await.unwrap();
        assert_eq!(dir.kind, InodeKind::Directory);
        assert!(backend.get("photos/").await.is_some());
        assert!(matches!(
            fs.mkdir(root, "photos").await,
            Err(FsError::AlreadyExists(_))
        ));

        assert!(matches!(fs.rmdir(root, "dir1").await, Err(FsError::NotEmpty(_))));
        assert!(matches!(fs.rmdir(root, "nothing").await, Err(FsError::NotFound(_))));
        fs.rmdir(root, "photos").await.unwrap();
        fs.rmdir(root, "empty_dir").await.unwrap();
        assert!(backend.get("photos/").await.is_none());
        assert!(backend.get("empty_dir/").await.is_none());
    }

    #[tokio::test]
    async fn statfs_is_constant() {
        let (_backend, fs) = mounted().await;
        assert_eq!(fs.statfs().block_size, 4096);
        assert_eq!(fs.statfs(), fs.statfs());
    }
}
