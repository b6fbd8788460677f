use anyhow::{Context, Result};
use bucketfs::cadapter::{MemoryBackend, ObjectBackend, S3Backend};
use bucketfs::config::{MountConfig, load_config};
use bucketfs::fuse::mount::mount_bucket;
use bucketfs::vfs::BucketFs;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    S3,
    /// Throwaway in-process bucket, handy for trying the mount locally.
    Memory,
}

/// Mount an S3-compatible bucket as a filesystem
#[derive(Parser, Debug)]
#[command(name = "bucketfs", version, about)]
struct Cli {
    /// Bucket to mount
    bucket: String,

    /// Directory to mount on (created if missing)
    mountpoint: PathBuf,

    /// YAML configuration file
    #[arg(short, long, env = "BUCKETFS_CONFIG")]
    config: Option<PathBuf>,

    /// Custom S3 endpoint, e.g. http://127.0.0.1:9000
    #[arg(long, env = "BUCKETFS_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long)]
    region: Option<String>,

    /// Use path-style bucket addressing
    #[arg(long)]
    force_path_style: bool,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Owner reported for every entry (default: the requesting user)
    #[arg(long)]
    uid: Option<u32>,

    #[arg(long)]
    gid: Option<u32>,

    #[arg(long, value_enum, default_value_t = BackendKind::S3)]
    backend: BackendKind,
}

impl Cli {
    fn mount_config(&self) -> Result<MountConfig> {
        let mut cfg = match &self.config {
            Some(path) => load_config(path)?,
            None => MountConfig::default(),
        };
        cfg.bucket = self.bucket.clone();
        if let Some(endpoint) = &self.endpoint {
            cfg.s3.endpoint = Some(endpoint.clone());
        }
        if let Some(region) = &self.region {
            cfg.s3.region = region.clone();
        }
        cfg.s3.force_path_style |= self.force_path_style;
        cfg.allow_other |= self.allow_other;
        if self.uid.is_some() {
            cfg.fs.uid = self.uid;
        }
        if self.gid.is_some() {
            cfg.fs.gid = self.gid;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl+C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let cfg = cli.mount_config()?;

    let backend: Arc<dyn ObjectBackend> = match cli.backend {
        BackendKind::S3 => Arc::new(S3Backend::new(cfg.bucket.clone(), cfg.s3.clone()).await),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    let fs = BucketFs::new(backend, cfg.fs.clone());

    std::fs::create_dir_all(&cli.mountpoint).with_context(|| {
        format!(
            "Failed to create mount point {}",
            cli.mountpoint.display()
        )
    })?;
    let handle = mount_bucket(fs, &cli.mountpoint, cfg.allow_other)
        .await
        .with_context(|| format!("Failed to mount bucket at {}", cli.mountpoint.display()))?;
    tracing::info!(
        bucket = %cfg.bucket,
        mountpoint = %cli.mountpoint.display(),
        backend = ?cli.backend,
        "bucket mounted, press Ctrl+C to unmount"
    );

    wait_for_shutdown().await?;
    tracing::info!("unmounting");
    handle.unmount().await.context("Failed to unmount")?;
    Ok(())
}
