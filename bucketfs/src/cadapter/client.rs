//! Object store client contract shared by every backend.
//!
//! The filesystem core only talks to the bucket through [`ObjectBackend`]. Each
//! call resolves once the store has answered; implementations retry transient
//! failures internally and report everything else through [`BackendError`].

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use std::time::SystemTime;
use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("no such key: {0}")]
    NotFound(String),

    #[error("requested range not satisfiable for {0}")]
    InvalidRange(String),

    #[error("operation not supported by backend: {0}")]
    Unsupported(String),

    /// Network or 5xx class failures; safe to re-issue.
    #[error("{op} failed transiently: {message}")]
    Transient { op: &'static str, message: String },

    #[error("{op} rejected by backend: {message}")]
    Service { op: &'static str, message: String },
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient { .. })
    }
}

/// Metadata of a single stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// One page of a delimited listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Full prefixes including the trailing delimiter, e.g. `dir1/`.
    pub common_prefixes: Vec<String>,
    pub objects: Vec<ObjectInfo>,
    /// Opaque token for the next page, `None` when the listing is exhausted.
    pub next_token: Option<String>,
}

impl ListPage {
    pub fn is_empty(&self) -> bool {
        self.common_prefixes.is_empty() && self.objects.is_empty()
    }
}

/// Receipt for an uploaded part, echoed back on completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: i32,
    ) -> BackendResult<ListPage>;

    async fn head_object(&self, key: &str) -> BackendResult<ObjectInfo>;

    /// Reads `[offset, offset + len)`; may return fewer bytes at end of object.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Bytes>;

    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()>;

    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<CompletedPart>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;
}

/// Base64 Content-MD5 header value for a request body.
pub fn content_md5(data: &[u8]) -> String {
    let sum = md5::compute(data);
    B64.encode(sum.0)
}
