use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use s3ffs::config::{Cli, Command, MountArgs, S3ffsConfig};
use s3ffs::error::{Result, S3ffsError};
use s3ffs::fs::channel::ChannelLoop;
use s3ffs::fs::dispatch::Dispatcher;
use s3ffs::fs::reply::ReplyCodec;
use s3ffs::fs::session;
use s3ffs::logging;
use s3ffs::s3::{object, Pools};
use s3ffs::tree::BucketTree;

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount(args) => {
            if let Err(e) = run_mount(args) {
                error!("{}", e);
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

fn run_mount(args: MountArgs) -> Result<()> {
    let mut config = S3ffsConfig::resolve(args)?;
    config.mountpoint = std::fs::canonicalize(&config.mountpoint)
        .map_err(|e| S3ffsError::Config(format!("mountpoint {}: {}", config.mountpoint.display(), e)))?;
    if !config.mountpoint.is_dir() {
        return Err(S3ffsError::Config(format!(
            "mountpoint {} is not a directory",
            config.mountpoint.display()
        )));
    }
    if is_stale_fuse_mount(&config.mountpoint) {
        return Err(S3ffsError::Mount(format!(
            "{} is a stale FUSE mount; fix with: s3ffs unmount {}",
            config.mountpoint.display(),
            config.mountpoint.display()
        )));
    }

    // Held until exit so buffered log lines are flushed.
    let _guard = logging::init(&config.log)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: S3ffsConfig) -> Result<()> {
    info!(
        "s3ffs starting: endpoint={}, bucket={}, mountpoint={}",
        config.endpoint.base,
        config.endpoint.bucket,
        config.mountpoint.display()
    );

    let pools = Pools::new(&config)?;
    object::check_bucket(pools.ops.as_ref()).await?;

    let tree = Arc::new(BucketTree::new(pools, &config.filesystem));
    let (mount, channel) = session::mount(&config.mountpoint, &config.endpoint.bucket)?;
    let dispatcher = Dispatcher::new(Arc::clone(&tree), ReplyCodec::for_current_user());

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = ChannelLoop::new(channel, dispatcher).run() => info!("fuse session ended"),
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
    }

    // Released files must reach the bucket before the runtime goes away.
    tree.flush().await;
    mount.unmount();
    info!("s3ffs stopped");
    Ok(())
}

/// Check if `path` is listed as a FUSE mount but no longer answers.
fn is_stale_fuse_mount(path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    let is_fuse_mount = stdout
        .lines()
        .any(|line| line.contains(path_str.as_ref()) && line.contains("fuse"));
    is_fuse_mount && std::fs::read_dir(path).is_err()
}

fn run_quiet(program: &str, args: &[&str]) -> Option<std::process::Output> {
    std::process::Command::new(program).args(args).output().ok()
}

fn unmount(mountpoint: &Path) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|e| {
        eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
        std::process::exit(1);
    });
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    for (program, args) in [("fusermount", vec!["-u", &*mp]), ("umount", vec![&*mp])] {
        match run_quiet(program, &args) {
            Some(o) if o.status.success() => {
                eprintln!("Successfully unmounted {}", mp);
                return;
            }
            Some(o) if String::from_utf8_lossy(&o.stderr).contains("busy") => {
                eprintln!(
                    "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                    mp
                );
                std::process::exit(1);
            }
            _ => {}
        }
    }

    // Force unmount as last resort
    if matches!(run_quiet("umount", &["-f", &*mp]), Some(o) if o.status.success()) {
        eprintln!("Successfully unmounted {} (forced)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -f {}", mp, mp);
    std::process::exit(1);
}
