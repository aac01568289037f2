//! Process-wide logging, configured once at startup.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{Result, S3ffsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub verbose: bool,
    pub target: LogTarget,
    /// Copy file output to stderr as well (foreground runs).
    pub mirror_stderr: bool,
}

impl LogConfig {
    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process so buffered file output is flushed on exit.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let (file_layer, guard) = match &config.target {
        LogTarget::File(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("/tmp"));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("s3ffs.log"));
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            (Some(layer), Some(guard))
        }
        LogTarget::Stderr => (None, None),
    };

    let stderr_layer = (config.target == LogTarget::Stderr || config.mirror_stderr)
        .then(|| fmt::layer().with_writer(std::io::stderr));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| S3ffsError::Config(format!("failed to set tracing subscriber: {}", e)))?;

    Ok(guard)
}
