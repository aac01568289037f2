use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use url::Url;

use crate::error::{Result, S3ffsError};
use crate::logging::{LogConfig, LogTarget};

/// Config file consulted when `--config` is not given. Its absence is not an error.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/s3ffs.toml";

#[derive(Parser, Debug)]
#[command(name = "s3ffs", version, about = "Mount an S3 bucket as a FUSE filesystem")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a bucket
    Mount(MountArgs),
    /// Unmount an s3ffs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct MountArgs {
    /// Service endpoint, e.g. http://s3.amazonaws.com
    pub endpoint: String,

    /// Bucket name
    pub bucket: String,

    /// Path to the mount point
    pub mountpoint: PathBuf,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Also log to stderr
    #[arg(short, long)]
    pub foreground: bool,

    /// Verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// On-disk configuration. Every key is optional; unknown keys are ignored.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ConfigFile {
    pub general: GeneralSection,
    pub connections: ConnectionsSection,
    pub filesystem: FilesystemSection,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct GeneralSection {
    pub log_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionsSection {
    pub writers: usize,
    pub readers: usize,
    pub operations: usize,
    /// Per-attempt timeout in seconds.
    pub timeout: u64,
    /// Retry budget for failed requests; negative means unlimited.
    pub retries: i32,
    pub path_style: bool,
}

impl Default for ConnectionsSection {
    fn default() -> Self {
        Self {
            writers: 2,
            readers: 2,
            operations: 4,
            timeout: 20,
            retries: -1,
            path_style: true,
        }
    }
}

impl ConnectionsSection {
    pub fn retry_limit(&self) -> Option<u32> {
        u32::try_from(self.retries).ok()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FilesystemSection {
    /// Seconds a directory listing stays fresh.
    pub dir_cache_max_time: u64,
    pub tmp_dir: PathBuf,
    /// Page-size cap for bucket listings.
    pub max_keys: u32,
}

impl Default for FilesystemSection {
    fn default() -> Self {
        Self {
            dir_cache_max_time: 5,
            tmp_dir: PathBuf::from("/tmp"),
            max_keys: 1000,
        }
    }
}

impl FilesystemSection {
    pub fn dir_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dir_cache_max_time)
    }
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| S3ffsError::Config(e.to_string()))
    }

    /// Load an explicitly requested file, or the default one if it exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            S3ffsError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }
}

/// Bucket address: service endpoint plus bucket name.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub base: Url,
    pub bucket: String,
    pub path_style: bool,
}

/// Fully resolved process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct S3ffsConfig {
    pub endpoint: Endpoint,
    pub mountpoint: PathBuf,
    pub connections: ConnectionsSection,
    pub filesystem: FilesystemSection,
    pub log: LogConfig,
}

impl S3ffsConfig {
    pub fn resolve(args: MountArgs) -> Result<Self> {
        let file = ConfigFile::load(args.config.as_deref())?;
        Self::from_parts(args, file)
    }

    pub fn from_parts(args: MountArgs, file: ConfigFile) -> Result<Self> {
        let base = Url::parse(&args.endpoint)
            .map_err(|e| S3ffsError::Config(format!("invalid endpoint {}: {}", args.endpoint, e)))?;
        if base.host_str().is_none() {
            return Err(S3ffsError::Config(format!("endpoint {} has no host", args.endpoint)));
        }
        if args.bucket.is_empty() {
            return Err(S3ffsError::Config("bucket name is empty".to_string()));
        }

        let target = match args.log_file.or(file.general.log_file) {
            Some(path) => LogTarget::File(path),
            None => LogTarget::Stderr,
        };

        Ok(Self {
            endpoint: Endpoint {
                base,
                bucket: args.bucket,
                path_style: file.connections.path_style,
            },
            mountpoint: args.mountpoint,
            connections: file.connections,
            filesystem: file.filesystem,
            log: LogConfig {
                verbose: args.verbose,
                target,
                mirror_stderr: args.foreground,
            },
        })
    }
}
