//! Object store adapters (cAdapter)
//!
//! Submodules:
//! - `client`: the `ObjectBackend` contract and shared types
//! - `memory`: in-process store for tests and local experiments
//! - `s3`: S3-compatible adapter on top of aws-sdk-s3
//!
//! Backends retry transient failures themselves; callers only see the final
//! outcome as a `BackendError`.
pub mod client;
pub mod memory;
pub mod s3;

pub use client::{
    BackendError, BackendResult, CompletedPart, ListPage, ObjectBackend, ObjectInfo,
};
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Config};
