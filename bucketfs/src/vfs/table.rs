//! Inode arena: identity allocation, key deduplication and reference counting.
//!
//! The arena lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`; backend probes run first and their results are registered after.

use super::error::{FsError, FsResult};
use super::inode::{Inode, InodeAttr, InodeKind, ROOT_ID, child_key};
use crate::cadapter::{BackendError, ObjectBackend};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// What the backend told us about an entry.
#[derive(Clone, Copy, Debug)]
pub struct Observed {
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: SystemTime,
}

struct Arena {
    inodes: HashMap<u64, Inode>,
    by_key: HashMap<String, u64>,
    next_id: u64,
}

impl Arena {
    fn inode(&self, id: u64) -> FsResult<&Inode> {
        self.inodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))
    }

    fn directory_key(&self, id: u64) -> FsResult<String> {
        let inode = self.inode(id)?;
        if inode.kind != InodeKind::Directory {
            return Err(FsError::NotADirectory(id));
        }
        Ok(inode.key.clone())
    }

    /// Removes `id` if nothing references it, then walks up the parents.
    fn evict_if_unused(&mut self, mut id: u64) {
        loop {
            let Some(inode) = self.inodes.get(&id) else {
                return;
            };
            if !inode.is_evictable() {
                return;
            }
            let Some(inode) = self.inodes.remove(&id) else {
                return;
            };
            if self.by_key.get(&inode.key) == Some(&id) {
                self.by_key.remove(&inode.key);
            }
            debug!(ino = id, name = %inode.name, key = %inode.key, "evicted inode");
            match self.inodes.get_mut(&inode.parent) {
                Some(parent) => {
                    parent.children = parent.children.saturating_sub(1);
                    id = parent.id;
                }
                None => return,
            }
        }
    }
}

/// What the table alone can say about a child name.
enum Known {
    Resolved(InodeAttr),
    /// A fresh file entry that still needs the directory check.
    File(u64),
    Unknown,
}

pub struct InodeTable {
    arena: Mutex<Arena>,
    attr_ttl: Duration,
    dir_mtime: SystemTime,
}

impl InodeTable {
    /// `dir_mtime` is reported for every directory, which has no object of its own.
    pub fn new(attr_ttl: Duration, dir_mtime: SystemTime) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(ROOT_ID, Inode::root(dir_mtime));
        let mut by_key = HashMap::new();
        by_key.insert(String::new(), ROOT_ID);
        Self {
            arena: Mutex::new(Arena {
                inodes,
                by_key,
                next_id: ROOT_ID + 1,
            }),
            attr_ttl,
            dir_mtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry(&self, kind: InodeKind, pin: bool) -> Option<Instant> {
        if pin || kind == InodeKind::Directory {
            None
        } else {
            Some(Instant::now() + self.attr_ttl)
        }
    }

    pub fn len(&self) -> usize {
        self.lock().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().inodes.contains_key(&id)
    }

    /// Cached attributes regardless of freshness.
    pub fn cached_attr(&self, id: u64) -> FsResult<InodeAttr> {
        Ok(self.lock().inode(id)?.attr())
    }

    pub fn key_of(&self, id: u64) -> FsResult<(String, InodeKind)> {
        let arena = self.lock();
        let inode = arena.inode(id)?;
        Ok((inode.key.clone(), inode.kind))
    }

    pub fn directory_key(&self, id: u64) -> FsResult<String> {
        self.lock().directory_key(id)
    }

    pub fn parent_of(&self, id: u64) -> FsResult<u64> {
        Ok(self.lock().inode(id)?.parent)
    }

    /// Live identity currently mapped to `key`, if any.
    pub fn id_for_key(&self, key: &str) -> Option<u64> {
        self.lock().by_key.get(key).copied()
    }

    /// Answers `name` from the table when it holds a fresh entry. A cached
    /// file is only a candidate: a directory of the same name may exist in
    /// the bucket without being live here.
    fn lookup_known(&self, parent: u64, name: &str) -> FsResult<Known> {
        let mut arena = self.lock();
        let parent_key = arena.directory_key(parent)?;
        let now = Instant::now();

        let dir_key = child_key(&parent_key, name, InodeKind::Directory);
        if let Some(&id) = arena.by_key.get(&dir_key) {
            if let Some(inode) = arena.inodes.get_mut(&id) {
                if inode.is_fresh(now) {
                    inode.lookups += 1;
                    return Ok(Known::Resolved(inode.attr()));
                }
                return Ok(Known::Unknown);
            }
        }

        let file_key = child_key(&parent_key, name, InodeKind::File);
        match arena.by_key.get(&file_key) {
            Some(&id) if arena.inodes.get(&id).is_some_and(|i| i.is_fresh(now)) => {
                Ok(Known::File(id))
            }
            _ => Ok(Known::Unknown),
        }
    }

    /// Counts one lookup against a live inode.
    fn count_lookup(&self, id: u64) -> Option<InodeAttr> {
        let mut arena = self.lock();
        let inode = arena.inodes.get_mut(&id)?;
        inode.lookups += 1;
        Some(inode.attr())
    }

    /// Registers (or refreshes) the child `name` of `parent` and counts one
    /// lookup against it. Entries are deduplicated by key.
    pub fn register(
        &self,
        parent: u64,
        name: &str,
        observed: Observed,
        pin: bool,
    ) -> FsResult<InodeAttr> {
        let expires = self.expiry(observed.kind, pin);
        let mtime = match observed.kind {
            InodeKind::Directory => self.dir_mtime,
            InodeKind::File => observed.mtime,
        };
        let mut arena = self.lock();
        let parent_key = arena.directory_key(parent)?;
        let key = child_key(&parent_key, name, observed.kind);

        if let Some(&id) = arena.by_key.get(&key) {
            if let Some(inode) = arena.inodes.get_mut(&id) {
                // local writes win over what the backend reports
                if pin || !inode.is_pinned() {
                    inode.refresh(observed.size, mtime, expires);
                }
                inode.lookups += 1;
                return Ok(inode.attr());
            }
        }

        let id = arena.next_id;
        arena.next_id += 1;
        let inode = Inode {
            id,
            parent,
            name: name.to_string(),
            key: key.clone(),
            kind: observed.kind,
            size: observed.size,
            mtime,
            generation: 1,
            expires,
            lookups: 1,
            open_handles: 0,
            children: 0,
        };
        let attr = inode.attr();
        arena.inodes.insert(id, inode);
        arena.by_key.insert(key.clone(), id);
        if let Some(p) = arena.inodes.get_mut(&parent) {
            p.children += 1;
        }
        debug!(ino = id, parent, key = %key, "registered inode");
        Ok(attr)
    }

    /// Resolves `name` under `parent`, probing the backend when the table has
    /// no valid answer. A name that is both a directory prefix and an object
    /// resolves as the directory.
    pub async fn lookup_child<B>(&self, backend: &B, parent: u64, name: &str) -> FsResult<InodeAttr>
    where
        B: ObjectBackend + ?Sized,
    {
        validate_name(name)?;
        let cached_file = match self.lookup_known(parent, name)? {
            Known::Resolved(attr) => return Ok(attr),
            Known::File(id) => Some(id),
            Known::Unknown => None,
        };

        let parent_key = self.directory_key(parent)?;
        let file_key = child_key(&parent_key, name, InodeKind::File);
        let dir_key = child_key(&parent_key, name, InodeKind::Directory);
        let directory = Observed {
            kind: InodeKind::Directory,
            size: 0,
            mtime: self.dir_mtime,
        };

        if let Some(id) = cached_file {
            let page = backend.list_objects(&dir_key, Some("/"), None, 1).await?;
            if !page.is_empty() {
                return self.register(parent, name, directory, false);
            }
            if let Some(attr) = self.count_lookup(id) {
                return Ok(attr);
            }
        }

        let (head, listing) = tokio::join!(
            backend.head_object(&file_key),
            backend.list_objects(&dir_key, Some("/"), None, 1)
        );

        let observed = match (head, listing) {
            (_, Ok(page)) if !page.is_empty() => directory,
            (Ok(info), _) => Observed {
                kind: InodeKind::File,
                size: info.size,
                mtime: info.last_modified,
            },
            (Err(BackendError::NotFound(_)), Ok(_)) => {
                self.detach(&file_key);
                return Err(FsError::NotFound(file_key));
            }
            (Err(e), Ok(_)) | (_, Err(e)) => return Err(e.into()),
        };
        self.register(parent, name, observed, false)
    }

    /// Returns attributes, re-validating an expired file with a head request.
    pub async fn get_attributes<B>(&self, backend: &B, id: u64) -> FsResult<InodeAttr>
    where
        B: ObjectBackend + ?Sized,
    {
        let key = {
            let arena = self.lock();
            let inode = arena.inode(id)?;
            if inode.is_fresh(Instant::now()) {
                return Ok(inode.attr());
            }
            inode.key.clone()
        };
        let info = backend.head_object(&key).await?;
        self.refresh_unpinned(id, info.size, info.last_modified);
        self.cached_attr(id)
    }

    /// Updates a live inode's attributes unless local writes pin them.
    pub fn refresh_unpinned(&self, id: u64, size: u64, mtime: SystemTime) {
        let expires = Some(Instant::now() + self.attr_ttl);
        let mut arena = self.lock();
        if let Some(inode) = arena.inodes.get_mut(&id) {
            if !inode.is_pinned() {
                inode.refresh(size, mtime, expires);
            }
        }
    }

    /// Listing results refresh inodes already live for `key`.
    pub fn observe_listed(&self, key: &str, size: u64, mtime: SystemTime) {
        let Some(id) = self.id_for_key(key) else {
            return;
        };
        self.refresh_unpinned(id, size, mtime);
    }

    /// Pins attributes while a handle holds unflushed data.
    pub fn pin(&self, id: u64, size: u64) {
        let mut arena = self.lock();
        if let Some(inode) = arena.inodes.get_mut(&id) {
            inode.refresh(size, SystemTime::now(), None);
        }
    }

    /// Records a completed upload and lets the attributes expire normally.
    pub fn record_upload(&self, id: u64, size: u64, mtime: SystemTime) {
        let expires = Some(Instant::now() + self.attr_ttl);
        let mut arena = self.lock();
        if let Some(inode) = arena.inodes.get_mut(&id) {
            inode.refresh(size, mtime, expires);
        }
    }

    /// Forces the next attribute request to ask the backend.
    pub fn invalidate(&self, id: u64) {
        let mut arena = self.lock();
        if let Some(inode) = arena.inodes.get_mut(&id) {
            if inode.kind == InodeKind::File {
                inode.expires = Some(Instant::now());
            }
        }
    }

    pub fn open_handle(&self, id: u64) -> FsResult<()> {
        let mut arena = self.lock();
        let inode = arena
            .inodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))?;
        inode.open_handles += 1;
        Ok(())
    }

    pub fn close_handle(&self, id: u64) {
        let mut arena = self.lock();
        if let Some(inode) = arena.inodes.get_mut(&id) {
            inode.open_handles = inode.open_handles.saturating_sub(1);
        }
        arena.evict_if_unused(id);
    }

    /// Drops `n` kernel references. Unknown identities and the root are ignored.
    pub fn forget(&self, id: u64, n: u64) {
        if id == ROOT_ID {
            return;
        }
        let mut arena = self.lock();
        let Some(inode) = arena.inodes.get_mut(&id) else {
            return;
        };
        inode.lookups = inode.lookups.saturating_sub(n);
        arena.evict_if_unused(id);
    }

    /// Unmaps `key` and returns the identity it pointed to. A live inode
    /// stays reachable by identity until forgotten.
    pub fn detach(&self, key: &str) -> Option<u64> {
        let id = self.lock().by_key.remove(key)?;
        debug!(ino = id, key, "detached key");
        Some(id)
    }
}

pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::MemoryBackend;
    use bytes::Bytes;

    fn file(size: u64) -> Observed {
        Observed {
            kind: InodeKind::File,
            size,
            mtime: SystemTime::now(),
        }
    }

    fn dir() -> Observed {
        Observed {
            kind: InodeKind::Directory,
            size: 0,
            mtime: SystemTime::now(),
        }
    }

    #[test]
    fn register_dedups_by_key() {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let a = table.register(ROOT_ID, "file1", file(5), false).unwrap();
        let b = table.register(ROOT_ID, "file1", file(6), false).unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(b.size, 6);
        assert!(b.generation > a.generation);
        // a directory of the same name is a different key
        let d = table.register(ROOT_ID, "file1", dir(), false).unwrap();
        assert_ne!(d.ino, a.ino);
    }

    #[test]
    fn forget_evicts_at_zero_and_cascades() {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let d = table.register(ROOT_ID, "dir1", dir(), false).unwrap();
        let f = table.register(d.ino, "file3", file(5), false).unwrap();
        table.register(d.ino, "file3", file(5), false).unwrap();

        table.forget(d.ino, 1);
        assert!(table.contains(d.ino), "child keeps parent alive");

        table.forget(f.ino, 1);
        assert!(table.contains(f.ino));
        table.forget(f.ino, 1);
        assert!(!table.contains(f.ino));
        assert!(!table.contains(d.ino));
        assert_eq!(table.id_for_key("dir1/"), None);

        table.forget(f.ino, 3);
        table.forget(ROOT_ID, 100);
        assert!(table.contains(ROOT_ID));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn open_handle_keeps_inode() {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let f = table.register(ROOT_ID, "file1", file(5), false).unwrap();
        table.open_handle(f.ino).unwrap();
        table.forget(f.ino, 1);
        assert!(table.contains(f.ino));
        table.close_handle(f.ino);
        assert!(!table.contains(f.ino));
    }

    #[test]
    fn pinned_attrs_ignore_observations() {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let f = table.register(ROOT_ID, "new", file(0), true).unwrap();
        table.pin(f.ino, 42);
        table.observe_listed("new", 7, SystemTime::now());
        assert_eq!(table.cached_attr(f.ino).unwrap().size, 42);
        table.record_upload(f.ino, 42, SystemTime::now());
        table.observe_listed("new", 7, SystemTime::now());
        assert_eq!(table.cached_attr(f.ino).unwrap().size, 7);
    }

    #[tokio::test]
    async fn lookup_child_prefers_directory() {
        let backend = MemoryBackend::new();
        backend.insert("dup", Bytes::from_static(b"file")).await;
        backend.insert("dup/inner", Bytes::from_static(b"x")).await;
        backend.insert("file1", Bytes::from_static(b"file1")).await;
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());

        let dup = table.lookup_child(&backend, ROOT_ID, "dup").await.unwrap();
        assert_eq!(dup.kind, InodeKind::Directory);
        let f = table.lookup_child(&backend, ROOT_ID, "file1").await.unwrap();
        assert_eq!(f.kind, InodeKind::File);
        assert_eq!(f.size, 5);
        assert!(matches!(
            table.lookup_child(&backend, ROOT_ID, "nope").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            table.lookup_child(&backend, f.ino, "x").await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn cached_file_yields_to_directory_prefix() {
        let backend = MemoryBackend::new();
        let table = InodeTable::new(Duration::from_secs(60), SystemTime::now());
        let local = table.register(ROOT_ID, "x", file(0), true).unwrap();

        let again = table.lookup_child(&backend, ROOT_ID, "x").await.unwrap();
        assert_eq!(again.ino, local.ino);
        assert_eq!(again.kind, InodeKind::File);

        backend.insert("x/inner", Bytes::from_static(b"x")).await;
        let resolved = table.lookup_child(&backend, ROOT_ID, "x").await.unwrap();
        assert_eq!(resolved.kind, InodeKind::Directory);
        assert_ne!(resolved.ino, local.ino);
        // the directory is now live and answers without a backend call
        backend.delete_object("x/inner").await.unwrap();
        let cached = table.lookup_child(&backend, ROOT_ID, "x").await.unwrap();
        assert_eq!(cached.ino, resolved.ino);
    }

    #[test]
    fn detach_returns_unmapped_identity() {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let f = table.register(ROOT_ID, "file1", file(5), false).unwrap();
        assert_eq!(table.detach("file1"), Some(f.ino));
        assert_eq!(table.detach("file1"), None);
        assert!(table.contains(f.ino));
    }

    #[tokio::test]
    async fn expired_attributes_are_refreshed() {
        let backend = MemoryBackend::new();
        backend.insert("file1", Bytes::from_static(b"file1")).await;
        let table = InodeTable::new(Duration::ZERO, SystemTime::now());
        let f = table.lookup_child(&backend, ROOT_ID, "file1").await.unwrap();

        backend.insert("file1", Bytes::from_static(b"longer content")).await;
        let attr = table.get_attributes(&backend, f.ino).await.unwrap();
        assert_eq!(attr.size, 14);

        backend.delete_object("file1").await.unwrap();
        assert!(matches!(
            table.get_attributes(&backend, f.ino).await,
            Err(FsError::NotFound(_))
        ));
        let root = table.get_attributes(&backend, ROOT_ID).await.unwrap();
        assert_eq!(root.kind, InodeKind::Directory);
    }
}
