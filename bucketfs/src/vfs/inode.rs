//! Inode records kept in the [`InodeTable`](super::table::InodeTable) arena.

use std::time::{Instant, SystemTime};

pub const ROOT_ID: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

/// Snapshot of an inode's cached attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: u64,
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: SystemTime,
    /// Bumped on every attribute refresh.
    pub generation: u64,
}

/// Object key of `name` inside the directory whose key is `parent_key`.
pub fn child_key(parent_key: &str, name: &str, kind: InodeKind) -> String {
    match kind {
        InodeKind::File => format!("{parent_key}{name}"),
        InodeKind::Directory => format!("{parent_key}{name}/"),
    }
}

#[derive(Debug)]
pub(crate) struct Inode {
    pub id: u64,
    /// Identity of the containing directory; the root points at itself.
    pub parent: u64,
    pub name: String,
    /// Full object key, the concatenation of the parent's key and this leaf.
    pub key: String,
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub generation: u64,
    /// `None` pins the attributes: directories and files with local writes.
    pub expires: Option<Instant>,
    pub lookups: u64,
    pub open_handles: u64,
    pub children: u64,
}

impl Inode {
    pub fn root(mtime: SystemTime) -> Self {
        Self {
            id: ROOT_ID,
            parent: ROOT_ID,
            name: String::new(),
            key: String::new(),
            kind: InodeKind::Directory,
            size: 0,
            mtime,
            generation: 0,
            expires: None,
            lookups: 1,
            open_handles: 0,
            children: 0,
        }
    }

    pub fn attr(&self) -> InodeAttr {
        InodeAttr {
            ino: self.id,
            kind: self.kind,
            size: self.size,
            mtime: self.mtime,
            generation: self.generation,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires.is_none_or(|deadline| now < deadline)
    }

    pub fn is_pinned(&self) -> bool {
        self.expires.is_none()
    }

    /// Replaces the cached attributes; `expires == None` pins them.
    pub fn refresh(&mut self, size: u64, mtime: SystemTime, expires: Option<Instant>) {
        self.size = size;
        self.mtime = mtime;
        self.expires = expires;
        self.generation += 1;
    }

    pub fn is_evictable(&self) -> bool {
        self.id != ROOT_ID && self.lookups == 0 && self.open_handles == 0 && self.children == 0
    }
}
