//! CLI command definitions and dispatch.
//!
//! Each group of subcommands is implemented in its own submodule:
//! - `scan`: Library scanning, album listing and file watching

mod scan;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{self, Config};

pub use scan::{cmd_albums, cmd_scan, cmd_watch};

/// Tunedex CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Use this config file instead of the default one
    #[arg(long, global = true, env = "TUNEDEX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Bring the saved library up to date with the disk
    Scan {
        /// Directories to scan (default: configured library paths)
        paths: Vec<PathBuf>,
        /// Re-read every file, even ones that look unchanged
        #[arg(long)]
        force: bool,
    },
    /// List albums in the saved library
    Albums,
    /// Keep the library updated while files change
    Watch {
        /// Directories to watch (default: configured library paths)
        paths: Vec<PathBuf>,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
        /// Print every library change
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli);

    match &cli.command {
        Commands::Scan { paths, force } => cmd_scan(&config, paths, *force),
        Commands::Albums => cmd_albums(&config),
        Commands::Watch {
            paths,
            seconds,
            verbose,
        } => cmd_watch(&config, paths, *seconds, *verbose),
    }
}

fn load_config(cli: &Cli) -> Config {
    match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
}

/// Roots given on the command line, or the configured ones.
pub(crate) fn library_roots(config: &Config, paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let roots = if paths.is_empty() {
        config.library.paths.clone()
    } else {
        paths.to_vec()
    };
    if roots.is_empty() {
        anyhow::bail!("No library paths given and none configured");
    }
    for root in &roots {
        if !root.exists() {
            tracing::warn!(target: "tunedex::cli", path = %root.display(), "Library path does not exist");
        }
    }
    Ok(roots)
}
