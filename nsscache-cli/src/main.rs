//! nsscache: keep local NSS map caches in sync with a directory source.
//!
//! # Usage
//!
//! ```text
//! nsscache [--config PATH] [-v...] update [--full] [--force-write] [--sleep SECS] [--map KIND]...
//! nsscache verify [--map KIND]... [--sample N] [--json]
//! nsscache status [--map KIND]... [--json] [--epoch] [--template TERA]
//! nsscache repair [--map KIND]... [--force-write]
//! nsscache diff --map KIND
//! ```
//!
//! Exit status: 0 success, 1 partial failure, 2 total failure, 200 when the
//! only problem was a map already being updated by another process.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use commands::{
    diff::DiffArgs, repair::RepairArgs, status::StatusArgs, update::UpdateArgs,
    verify::VerifyArgs,
};
use nsscache_core::Config;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "nsscache",
    version,
    about = "Synchronise local NSS cache files from a directory source",
    long_about = None,
)]
struct Cli {
    /// Config file (default: $NSSCACHE_CONFIG, then /etc/nsscache.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update caches from their sources, incrementally where possible.
    Update(UpdateArgs),

    /// Compare caches with their sources without changing anything.
    Verify(VerifyArgs),

    /// Show when each cache was last updated and whether it is current.
    Status(StatusArgs),

    /// Rebuild caches from a full fetch, ignoring watermarks.
    Repair(RepairArgs),

    /// Show a unified diff of what a full update would publish.
    Diff(DiffArgs),
}

/// Options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Globals {
    pub config: Option<PathBuf>,
}

impl Globals {
    pub fn load_config(&self) -> Result<Arc<Config>> {
        let path = self.config.clone().unwrap_or_else(Config::default_path);
        let config = Config::load(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        tracing::debug!(path = %path.display(), maps = config.maps.len(), "loaded config");
        Ok(Arc::new(config))
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let globals = Globals { config: cli.config };

    let result = match cli.command {
        Commands::Update(args) => args.run(&globals),
        Commands::Verify(args) => args.run(&globals),
        Commands::Status(args) => args.run(&globals),
        Commands::Repair(args) => args.run(&globals),
        Commands::Diff(args) => args.run(&globals),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
