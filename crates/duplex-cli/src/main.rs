//! duplex CLI - double-buffered accelerator offload

use anyhow::Result;
use clap::{Parser, Subcommand};
use duplex_core::FailurePolicy;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "duplex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a file chunk by chunk on the accelerator
    Hash {
        /// File to hash
        file: PathBuf,
        /// Transfer buffer size in bytes
        #[arg(long)]
        buffer_size: Option<usize>,
        /// Chunk size in bytes
        #[arg(long)]
        unit_payload: Option<usize>,
        /// Recompute every digest on the CPU and compare
        #[arg(long)]
        verify: bool,
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
        /// What to do when the device fails (abort, propagate)
        #[arg(long)]
        on_device_error: Option<FailurePolicy>,
    },
    /// Show device and pipeline configuration
    Info {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Hash {
            file,
            buffer_size,
            unit_payload,
            verify,
            json,
            on_device_error,
        } => {
            let overrides = commands::Overrides {
                buffer_size,
                unit_payload,
                on_device_error,
            };
            let config = commands::load_config(cli.config.as_deref(), &overrides)?;
            commands::hash::execute(&file, config, verify, json)
        }
        Commands::Info { json } => {
            let config = commands::load_config(cli.config.as_deref(), &Default::default())?;
            commands::info::execute(&config, json)
        }
    }
}
