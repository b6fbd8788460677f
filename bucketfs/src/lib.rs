//! bucketfs: expose an S3-compatible bucket as a filesystem over FUSE.
//!
//! Layers, leaf first: `cadapter` talks to the object store, `vfs` holds the
//! inode table and file/directory handles, `fuse` adapts kernel requests.

pub mod cadapter;
pub mod config;
pub mod fuse;
pub mod vfs;
