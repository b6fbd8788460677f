//! Directory enumeration over delimited listings.
//!
//! Common prefixes become subdirectories and objects directly under the
//! prefix become files. The merged snapshot is taken on the first read and
//! served by offset afterwards.

use super::error::FsResult;
use super::inode::InodeKind;
use super::table::InodeTable;
use crate::cadapter::ObjectBackend;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::SystemTime;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Full object key, with a trailing `/` for directories.
    pub key: String,
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: SystemTime,
}

pub struct DirHandle {
    ino: u64,
    prefix: String,
    entries: Option<Vec<DirEntry>>,
}

impl DirHandle {
    pub fn new(ino: u64, prefix: String) -> Self {
        Self {
            ino,
            prefix,
            entries: None,
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Entry at zero-based `offset` in name order, `None` past the end.
    pub async fn read_dir<B>(
        &mut self,
        backend: &B,
        table: &InodeTable,
        page_size: i32,
        offset: usize,
    ) -> FsResult<Option<DirEntry>>
    where
        B: ObjectBackend + ?Sized,
    {
        if self.entries.is_none() {
            let listing = self.fetch(backend, table, page_size).await?;
            self.entries = Some(listing);
        }
        Ok(self
            .entries
            .as_ref()
            .and_then(|entries| entries.get(offset))
            .cloned())
    }

    /// Releases the buffered listing.
    pub fn close(&mut self) {
        self.entries = None;
    }

    async fn fetch<B>(
        &self,
        backend: &B,
        table: &InodeTable,
        page_size: i32,
    ) -> FsResult<Vec<DirEntry>>
    where
        B: ObjectBackend + ?Sized,
    {
        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = backend
                .list_objects(&self.prefix, Some("/"), token.as_deref(), page_size)
                .await?;
            pages += 1;

            for common in page.common_prefixes {
                let Some(name) = common
                    .strip_prefix(self.prefix.as_str())
                    .and_then(|rest| rest.strip_suffix('/'))
                else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                // a directory shadows a file of the same name
                merged.insert(
                    name.to_string(),
                    DirEntry {
                        name: name.to_string(),
                        key: common.clone(),
                        kind: InodeKind::Directory,
                        size: 0,
                        mtime: SystemTime::UNIX_EPOCH,
                    },
                );
            }

            for object in page.objects {
                let Some(name) = object.key.strip_prefix(self.prefix.as_str()) else {
                    continue;
                };
                if name.is_empty() || name.contains('/') {
                    continue;
                }
                table.observe_listed(&object.key, object.size, object.last_modified);
                if let Entry::Vacant(slot) = merged.entry(name.to_string()) {
                    slot.insert(DirEntry {
                        name: name.to_string(),
                        key: object.key.clone(),
                        kind: InodeKind::File,
                        size: object.size,
                        mtime: object.last_modified,
                    });
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        debug!(
            ino = self.ino,
            prefix = %self.prefix,
            pages,
            entries = merged.len(),
            "listed directory"
        );
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::MemoryBackend;
    use crate::vfs::inode::ROOT_ID;
    use bytes::Bytes;
    use std::time::Duration;

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for key in ["file1", "file2", "dir1/file3", "dir2/dir3/file4", "empty_dir/"] {
            backend.insert(key, Bytes::from(key.to_string())).await;
        }
        backend
    }

    async fn names(backend: &MemoryBackend, prefix: &str, page_size: i32) -> Vec<String> {
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let mut handle = DirHandle::new(ROOT_ID, prefix.to_string());
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(entry) = handle
            .read_dir(backend, &table, page_size, offset)
            .await
            .unwrap()
        {
            out.push(entry.name);
            offset += 1;
        }
        out
    }

    #[tokio::test]
    async fn merges_prefixes_and_objects_in_order() {
        let backend = seeded().await;
        assert_eq!(
            names(&backend, "", 1000).await,
            vec!["dir1", "dir2", "empty_dir", "file1", "file2"]
        );
        assert_eq!(names(&backend, "dir1/", 1000).await, vec!["file3"]);
        assert_eq!(names(&backend, "dir2/", 1000).await, vec!["dir3"]);
        assert_eq!(names(&backend, "dir2/dir3/", 1000).await, vec!["file4"]);
        assert!(names(&backend, "empty_dir/", 1000).await.is_empty());
    }

    #[tokio::test]
    async fn small_pages_give_the_same_listing() {
        let backend = seeded().await;
        assert_eq!(
            names(&backend, "", 1).await,
            vec!["dir1", "dir2", "empty_dir", "file1", "file2"]
        );
    }

    #[tokio::test]
    async fn directory_wins_name_collision_and_sorts_bytewise() {
        let backend = MemoryBackend::new();
        backend.insert("a", Bytes::from_static(b"file")).await;
        backend.insert("a/x", Bytes::from_static(b"x")).await;
        backend.insert("a-", Bytes::from_static(b"y")).await;
        backend.insert("B", Bytes::from_static(b"z")).await;

        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let mut handle = DirHandle::new(ROOT_ID, String::new());
        let mut entries = Vec::new();
        let mut offset = 0;
        while let Some(entry) = handle.read_dir(&backend, &table, 1000, offset).await.unwrap() {
            entries.push((entry.name, entry.kind));
            offset += 1;
        }
        assert_eq!(
            entries,
            vec![
                ("B".to_string(), InodeKind::File),
                ("a".to_string(), InodeKind::Directory),
                ("a-".to_string(), InodeKind::File),
            ]
        );
    }

    #[tokio::test]
    async fn offsets_are_stable_within_a_session() {
        let backend = seeded().await;
        let table = InodeTable::new(Duration::from_secs(1), SystemTime::now());
        let mut handle = DirHandle::new(ROOT_ID, String::new());
        let first = handle.read_dir(&backend, &table, 1000, 3).await.unwrap();
        // mutations after the snapshot are not visible
        backend.insert("file0", Bytes::from_static(b"new")).await;
        let again = handle.read_dir(&backend, &table, 1000, 3).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.unwrap().name, "file1");
        assert!(handle.read_dir(&backend, &table, 1000, 5).await.unwrap().is_none());

        handle.close();
        handle.close();
        let fresh = handle.read_dir(&backend, &table, 1000, 3).await.unwrap();
        assert_eq!(fresh.unwrap().name, "file0");
    }
}
