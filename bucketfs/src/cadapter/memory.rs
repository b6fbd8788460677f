//! In-memory object store used by tests and `--backend memory` mounts.
//!
//! Mirrors the S3 behaviours the filesystem relies on: delimited listing with
//! continuation, 416 on out-of-range reads and ordered multipart completion.
//! Deleting a missing key is rejected, like stores without idempotent delete.

use super::client::{BackendError, BackendResult, CompletedPart, ListPage, ObjectBackend, ObjectInfo};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::SystemTime;
use tokio::sync::Mutex;

struct StoredObject {
    data: Bytes,
    last_modified: SystemTime,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    min_part_size: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject completion when a non-final part is smaller than `size`.
    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size;
        self
    }

    pub async fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let mut state = self.state.lock().await;
        state.objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                last_modified: SystemTime::now(),
            },
        );
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let state = self.state.lock().await;
        state.objects.get(key).map(|o| o.data.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.objects.keys().cloned().collect()
    }

    pub async fn pending_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    fn e_tag(data: &[u8]) -> String {
        format!("\"{:x}\"", md5::compute(data))
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: i32,
    ) -> BackendResult<ListPage> {
        let state = self.state.lock().await;
        let delimiter = delimiter.filter(|d| !d.is_empty());
        let max = max_keys.max(1) as usize;
        let start = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut page = ListPage::default();
        let mut count = 0usize;
        let mut last: Option<String> = None;
        for (key, obj) in state.objects.range::<String, _>((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let folded = delimiter
                .and_then(|d| rest.find(d).map(|idx| format!("{prefix}{}", &rest[..idx + d.len()])));
            match folded {
                Some(common) => {
                    // keys under an already returned prefix fold into it
                    if last.as_deref() == Some(common.as_str())
                        || continuation == Some(common.as_str())
                    {
                        continue;
                    }
                    if count == max {
                        page.next_token = last;
                        return Ok(page);
                    }
                    page.common_prefixes.push(common.clone());
                    last = Some(common);
                }
                None => {
                    if count == max {
                        page.next_token = last;
                        return Ok(page);
                    }
                    page.objects.push(ObjectInfo {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: obj.last_modified,
                    });
                    last = Some(key.clone());
                }
            }
            count += 1;
        }
        Ok(page)
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectInfo> {
        let state = self.state.lock().await;
        let obj = state
            .objects
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: obj.data.len() as u64,
            last_modified: obj.last_modified,
        })
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Bytes> {
        let state = self.state.lock().await;
        let obj = state
            .objects
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let size = obj.data.len() as u64;
        if offset >= size {
            return Err(BackendError::InvalidRange(key.to_string()));
        }
        let end = offset.saturating_add(len).min(size);
        Ok(obj.data.slice(offset as usize..end as usize))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let mut state = self.state.lock().await;
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<CompletedPart> {
        let mut state = self.state.lock().await;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BackendError::NotFound(format!("{key} (upload {upload_id})")))?;
        let e_tag = Self::e_tag(&body);
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(CompletedPart {
            part_number,
            e_tag: Some(e_tag),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| BackendError::NotFound(format!("{key} (upload {upload_id})")))?;

        let invalid = |message: String| BackendError::Service {
            op: "complete_multipart_upload",
            message,
        };
        if parts.is_empty() {
            return Err(invalid("MalformedXML: no parts".into()));
        }
        let mut body = BytesMut::new();
        let mut previous = 0;
        for (idx, part) in parts.iter().enumerate() {
            if part.part_number <= previous {
                return Err(invalid(format!("InvalidPartOrder: {}", part.part_number)));
            }
            previous = part.part_number;
            let (e_tag, data) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid(format!("InvalidPart: {}", part.part_number)))?;
            if part.e_tag.as_deref() != Some(e_tag.as_str()) {
                return Err(invalid(format!("InvalidPart: etag of {}", part.part_number)));
            }
            if idx + 1 < parts.len() && data.len() < self.min_part_size {
                return Err(invalid(format!("EntityTooSmall: part {}", part.part_number)));
            }
            body.extend_from_slice(data);
        }

        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body.freeze(),
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        let known = state.uploads.get(upload_id).is_some_and(|u| u.key == key);
        if !known {
            return Err(BackendError::NotFound(format!("{key} (upload {upload_id})")));
        }
        state.uploads.remove(upload_id);
        Ok(())
    }
}
