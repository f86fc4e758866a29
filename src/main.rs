//! CLI entry point (§2's ambient-stack addition, §6.1/§6.3): parses
//! configuration-file overrides and the two environment toggles, builds the
//! immutable [`Config`] and the [`Facade`] a kernel FUSE bridge would drive.
//! Mounting `/dev/fuse` itself, daemonizing, and signal handling live
//! upstream of this crate (§1's "explicitly out of scope" list) — this
//! binary only proves the core wires together and is ready to be driven.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, warn};

use viewfs::config::Config;
use viewfs::fs_ops::Facade;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(bin_name = "viewfs")]
#[command(help_template = "\
{name} {version}
{usage-heading} {usage}

{all-args}{after-help}
")]
struct ViewfsArgs {
    /// Path to the YAML configuration document (§6.1).
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Override the configured mountpoint.
    #[arg(long, value_name = "PATH")]
    mountpoint: Option<PathBuf>,

    /// Override the configured filestore root.
    #[arg(long, value_name = "PATH")]
    filestore: Option<PathBuf>,
}

fn load_config(args: &ViewfsArgs) -> Result<Config, anyhow::Error> {
    let mut config = Config::load(&args.config)?;
    if let Some(mountpoint) = &args.mountpoint {
        config.mountpoint = mountpoint.clone();
    }
    if let Some(filestore) = &args.filestore {
        config.filestore_root = filestore.clone();
    }
    Ok(config)
}

/// §6.3: both toggles are boolean-ish and advisory; a correct implementation
/// may ignore either. `0`/`false`/`no` (case-insensitive) disable, anything
/// else (including unset, for `FLATTEN_ZIPS`) is treated as enabled.
fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"),
        Err(_) => default,
    }
}

pub fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = ViewfsArgs::parse();
    let config = load_config(&args)?;

    info!(
        "viewfs: {} clients configured, filestore={}, mountpoint={}",
        config.clients.len(),
        config.filestore_root.display(),
        config.mountpoint.display()
    );

    if env_bool("PERSIST_ZIP_INDEX", false) {
        warn!("PERSIST_ZIP_INDEX is set but this build keeps ZipIndex entries in-memory only");
    }
    info!("FLATTEN_ZIPS={}", env_bool("FLATTEN_ZIPS", true));

    let _facade = Facade::new(Arc::new(config));
    info!("viewfs: core ready; an external kernel FUSE bridge drives it from here");
    Ok(())
}
