//! Skewer - multi-protocol syslog ingestion and forwarding daemon
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon (supervisor + one confined worker per service)
//! skewer
//! skewer serve --config /etc/skewer/skewer.toml
//!
//! # Test mode: messages are echoed to stderr instead of produced to Kafka
//! skewer serve --test
//! ```
//!
//! Child workers are this same executable re-invoked as
//! `confined-skewer-<service>`; they are recognised by argv0 and never
//! parse the CLI.

mod child;
mod services;
mod supervisor;
mod tcp;
mod udp;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::services::ServiceType;
use crate::supervisor::ServeArgs;

/// Skewer - syslog ingestion and forwarding daemon
#[derive(Parser, Debug)]
#[command(name = "skewer")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/skewer/skewer.toml", global = true)]
    config: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Serve(ServeCli),
}

#[derive(clap::Args, Debug)]
struct ServeCli {
    /// Store data directory
    #[arg(long, default_value = "/var/lib/skewer")]
    store_path: std::path::PathBuf,

    /// Test mode: echo messages to stderr instead of producing to Kafka
    #[arg(long)]
    test: bool,

    /// Leave child processes dumpable (core dumps enabled)
    #[arg(long)]
    dumpable: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // child workers are recognised by argv0, before any CLI parsing
    let process_name = std::env::args()
        .next()
        .map(|arg0| {
            std::path::Path::new(&arg0)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(arg0)
        })
        .unwrap_or_default();
    if let Some(typ) = ServiceType::from_process_name(&process_name) {
        return child::run(typ).await;
    }

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let serve = match cli.command {
        Some(Command::Serve(serve)) => serve,
        None => ServeCli {
            store_path: "/var/lib/skewer".into(),
            test: false,
            dumpable: false,
        },
    };

    supervisor::run(ServeArgs {
        config: cli.config,
        store_path: serve.store_path,
        test: serve.test,
        dumpable: serve.dumpable,
    })
    .await
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
