//! Mount configuration loaded from YAML and overridden from the command line.

use crate::cadapter::S3Config;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// S3 rejects non-final multipart parts below 5 MiB.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub bucket: String,
    pub s3: S3Config,
    pub fs: FsConfig,
    pub allow_other: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Bytes buffered before a multipart part is uploaded.
    pub part_size: usize,
    pub list_page_size: i32,
    pub attr_ttl_ms: u64,
    /// Owner reported for every entry; `None` means the requesting user.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub file_mode: u16,
    pub dir_mode: u16,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            list_page_size: 1000,
            attr_ttl_ms: 1000,
            uid: None,
            gid: None,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

impl FsConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }
}

impl MountConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            bail!("bucket name is required");
        }
        if self.fs.part_size == 0 {
            bail!("fs.part_size must be greater than zero");
        }
        if self.fs.list_page_size <= 0 {
            bail!("fs.list_page_size must be positive");
        }
        Ok(())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<MountConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: MountConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bucket: photos\ns3:\n  endpoint: http://127.0.0.1:9000\n  force_path_style: true\nfs:\n  attr_ttl_ms: 250"
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.bucket, "photos");
        assert_eq!(cfg.s3.endpoint.as_deref(), Some("http://127.0.0.1:9000"));
        assert!(cfg.s3.force_path_style);
        assert_eq!(cfg.s3.region, "us-east-1");
        assert_eq!(cfg.s3.max_retries, 3);
        assert_eq!(cfg.fs.attr_ttl(), Duration::from_millis(250));
        assert_eq!(cfg.fs.part_size, MIN_PART_SIZE);
        assert_eq!(cfg.fs.file_mode, 0o644);
        assert!(!cfg.allow_other);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn empty_bucket_fails_validation() {
        assert!(MountConfig::default().validate().is_err());
    }
}
