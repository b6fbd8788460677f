//! VFS layer (virtual filesystem)
//!
//! Maps the hierarchical, inode-addressed view the kernel expects onto the
//! flat key space of a bucket.
//!
//! Submodules:
//! - `inode`: inode records and the key convention
//! - `table`: the inode arena (identity, dedup by key, reference counts)
//! - `dir`: directory handles merging prefixes and objects
//! - `file`: file handles with write buffering and multipart uploads
//! - `fs`: `BucketFs`, the entry points used by the FUSE adapter
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod inode;
pub mod table;

pub use dir::DirEntry;
pub use error::{FsError, FsResult};
pub use fs::{BucketFs, FsStats};
pub use inode::{InodeAttr, InodeKind, ROOT_ID};
