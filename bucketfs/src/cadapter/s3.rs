//! S3 backend built on aws-sdk-s3.
//!
//! Every request goes through [`S3Backend::execute_with_retry`], which re-issues
//! transient failures with exponential backoff. SDK retries are disabled so the
//! retry budget is the one configured here. SDK errors are classified into
//! [`BackendError`] before leaving this module.

use crate::cadapter::client::{
    BackendError, BackendResult, CompletedPart, ListPage, ObjectBackend, ObjectInfo, content_md5,
};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use bytes::Bytes;
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

/// Connection and retry options for the S3 backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Custom endpoint, e.g. a MinIO server. `None` uses AWS.
    pub endpoint: Option<String>,
    pub region: String,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    pub force_path_style: bool,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds, doubled on every attempt.
    pub initial_retry_delay_ms: u64,
    /// Per-operation timeout.
    pub timeout_secs: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            force_path_style: false,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            timeout_secs: 30,
        }
    }
}

impl S3Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

impl S3Backend {
    /// Credentials come from the SDK default provider chain.
    pub async fn new(bucket: impl Into<String>, config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(config.timeout())
                    .build(),
            )
            .retry_config(aws_config::retry::RetryConfig::disabled());
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: bucket.into(),
            config,
        }
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &'static str,
        operation: F,
    ) -> BackendResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let delay_ms = self
                        .config
                        .initial_retry_delay_ms
                        .saturating_mul(1u64 << (attempt - 1).min(16));
                    tracing::warn!(
                        op = operation_name,
                        attempt,
                        delay_ms,
                        error = %e,
                        "retrying backend call"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify<E>(op: &'static str, key: &str, err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_owned);
    let message = DisplayErrorContext(&err).to_string();
    match (code.as_deref(), status) {
        (Some("NoSuchBucket"), _) => BackendError::Service { op, message },
        (Some("NoSuchKey" | "NotFound" | "NoSuchUpload"), _) | (_, Some(404)) => {
            BackendError::NotFound(key.to_string())
        }
        (Some("InvalidRange"), _) | (_, Some(416)) => BackendError::InvalidRange(key.to_string()),
        (Some("NotImplemented" | "MethodNotAllowed"), _) | (_, Some(501)) => {
            BackendError::Unsupported(format!("{op}: {message}"))
        }
        (_, Some(s)) if s >= 500 || s == 429 => BackendError::Transient { op, message },
        (_, Some(_)) => BackendError::Service { op, message },
        // no response at all: dispatch failure or timeout
        (_, None) => BackendError::Transient { op, message },
    }
}

fn to_system_time(dt: &DateTime) -> SystemTime {
    match u64::try_from(dt.secs()) {
        Ok(secs) => UNIX_EPOCH + Duration::new(secs, dt.subsec_nanos()),
        Err(_) => UNIX_EPOCH,
    }
}

fn range_header(offset: u64, len: u64) -> String {
    format!("bytes={}-{}", offset, offset + len - 1)
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: i32,
    ) -> BackendResult<ListPage> {
        let out = self
            .execute_with_retry("list_objects", || async move {
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_delimiter(delimiter.map(str::to_owned))
                    .set_continuation_token(continuation.map(str::to_owned))
                    .max_keys(max_keys)
                    .send()
                    .await
                    .map_err(|e| classify("list_objects", prefix, e))
            })
            .await?;

        let common_prefixes = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_owned))
            .collect();
        let objects = out
            .contents()
            .iter()
            .filter_map(|o| {
                Some(ObjectInfo {
                    key: o.key()?.to_owned(),
                    size: o.size().unwrap_or(0).max(0) as u64,
                    last_modified: o.last_modified().map(to_system_time).unwrap_or(UNIX_EPOCH),
                })
            })
            .collect();
        let next_token = if out.is_truncated().unwrap_or(false) {
            out.next_continuation_token().map(str::to_owned)
        } else {
            None
        };
        Ok(ListPage {
            common_prefixes,
            objects,
            next_token,
        })
    }

    async fn head_object(&self, key: &str) -> BackendResult<ObjectInfo> {
        let out = self
            .execute_with_retry("head_object", || async move {
                self.client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("head_object", key, e))
            })
            .await?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: out.content_length().unwrap_or(0).max(0) as u64,
            last_modified: out.last_modified().map(to_system_time).unwrap_or(UNIX_EPOCH),
        })
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = range_header(offset, len);
        self.execute_with_retry("get_object", || {
            let range = range.clone();
            async move {
                let out = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .range(range)
                    .send()
                    .await
                    .map_err(|e| classify("get_object", key, e))?;
                let body = out.body.collect().await.map_err(|e| BackendError::Transient {
                    op: "get_object",
                    message: e.to_string(),
                })?;
                Ok(body.into_bytes())
            }
        })
        .await
    }

    async fn put_object(&self, key: &str, body: Bytes) -> BackendResult<()> {
        let checksum = content_md5(&body);
        self.execute_with_retry("put_object", || {
            let body = body.clone();
            let checksum = checksum.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_md5(checksum)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("put_object", key, e))
            }
        })
        .await
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.execute_with_retry("delete_object", || async move {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify("delete_object", key, e))
        })
        .await
    }

    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let out = self
            .execute_with_retry("create_multipart_upload", || async move {
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("create_multipart_upload", key, e))
            })
            .await?;
        out.upload_id()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Service {
                op: "create_multipart_upload",
                message: format!("no upload id returned for {key}"),
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> BackendResult<CompletedPart> {
        let checksum = content_md5(&body);
        let out = self
            .execute_with_retry("upload_part", || {
                let body = body.clone();
                let checksum = checksum.clone();
                async move {
                    self.client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .content_md5(checksum)
                        .body(ByteStream::from(body))
                        .send()
                        .await
                        .map_err(|e| classify("upload_part", key, e))
                }
            })
            .await?;
        Ok(CompletedPart {
            part_number,
            e_tag: out.e_tag().map(str::to_owned),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number)
                            .set_e_tag(p.e_tag.clone())
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.execute_with_retry("complete_multipart_upload", || {
            let completed = completed.clone();
            async move {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify("complete_multipart_upload", key, e))
            }
        })
        .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.execute_with_retry("abort_multipart_upload", || async move {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| classify("abort_multipart_upload", key, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        assert_eq!(range_header(0, 4096), "bytes=0-4095");
        assert_eq!(range_header(10, 1), "bytes=10-10");
    }

    #[test]
    fn timestamps_before_epoch_clamp() {
        let dt = DateTime::from_secs(-5);
        assert_eq!(to_system_time(&dt), UNIX_EPOCH);
        let dt = DateTime::from_secs(1_700_000_000);
        assert_eq!(
            to_system_time(&dt),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    // Needs a reachable S3-compatible endpoint, e.g. a local MinIO:
    // BUCKETFS_S3_TEST_BUCKET=test BUCKETFS_S3_TEST_ENDPOINT=http://127.0.0.1:9000
    #[tokio::test]
    async fn s3_backend_round_trip() {
        let Ok(bucket) = std::env::var("BUCKETFS_S3_TEST_BUCKET") else {
            eprintln!("skip s3 test: set BUCKETFS_S3_TEST_BUCKET to enable");
            return;
        };
        let config = S3Config {
            endpoint: std::env::var("BUCKETFS_S3_TEST_ENDPOINT").ok(),
            force_path_style: true,
            ..S3Config::default()
        };
        let backend = S3Backend::new(bucket, config).await;

        backend
            .put_object("bucketfs-test/hello", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let info = backend.head_object("bucketfs-test/hello").await.unwrap();
        assert_eq!(info.size, 5);
        let data = backend.get_range("bucketfs-test/hello", 1, 3).await.unwrap();
        assert_eq!(&data[..], b"ell");
        backend.delete_object("bucketfs-test/hello").await.unwrap();
        assert!(matches!(
            backend.head_object("bucketfs-test/hello").await,
            Err(BackendError::NotFound(_))
        ));
    }
}
