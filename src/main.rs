#![deny(clippy::mod_module_files)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use tracing_subscriber::EnvFilter;

mod archive;
mod commands;
mod commit;
mod config;
mod coordinator;
mod error;
mod remote;
mod storage;

use config::{OriginConfig, UpdaterConfig};
use coordinator::UpdateCoordinator;
use remote::HttpRemote;
use storage::FileVersionStore;

/// Keeps an installed tree in sync with the latest snapshot of a remote branch
#[derive(Parser)]
#[command(name = "snapshot-updater", version, about)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print whether a newer commit is available
    Check,
    /// Print the commit currently applied
    Status,
    /// Back up the installation and apply the latest snapshot
    Deploy {
        /// Deploy even if the applied commit is already the latest
        #[arg(long)]
        force: bool,
    },
    /// Delete downloaded snapshots from the staging directory
    Purge,
    /// Write a default config file
    Init {
        /// Root of the installed tree
        #[arg(long)]
        install_root: PathBuf,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // stdout carries command results only
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("snapshot_updater=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut stdout = io::stdout();

    if let Command::Init {
        install_root,
        force,
    } = &cli.command
    {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => UpdaterConfig::config_file_path()?,
        };
        return commands::init::handle(&config_path, install_root, *force, &mut stdout);
    }

    let config = UpdaterConfig::load(cli.config.as_deref())?;
    tracing::debug!("Using config {:?}", config);

    let remote = HttpRemote::new(
        &config.api_base,
        &config.web_base,
        config.connect_timeout(),
        config.read_timeout(),
    )
    .with_progress(io::stderr().is_terminal());
    let store = FileVersionStore::new(config.version_file());
    tracing::debug!("Version state at {:?}", store.path());
    let layout = config.layout().context("Invalid installation layout")?;
    let mut coordinator =
        UpdateCoordinator::new(remote, store, layout).with_branch_type(&config.branch_type);

    match cli.command {
        Command::Check => {
            let origin = OriginConfig::load(&config.origin_file())?;
            commands::check::handle(&mut coordinator, &origin, &mut stdout)?;
        }
        Command::Status => {
            commands::status::handle(&coordinator, &mut stdout)?;
        }
        Command::Deploy { force } => {
            let origin = OriginConfig::load(&config.origin_file())?;
            let cancel = coordinator.cancel_flag();
            thread::spawn(move || watch_ctrl_c(cancel));
            commands::deploy::handle(&mut coordinator, &origin, &mut stdout, force)?;
        }
        Command::Purge => {
            commands::purge::handle(&coordinator, &mut stdout)?;
        }
        Command::Init { .. } => unreachable!("handled before loading config"),
    }

    Ok(())
}

/// Set `cancel` on Ctrl+C so a deploy stops at the next member or phase
fn watch_ctrl_c(cancel: Arc<AtomicBool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!("Ctrl+C handling unavailable: {}", e);
            return;
        }
    };
    runtime.block_on(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl+C, stopping deploy...");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}
