//! Expansion I/O Service
//!
//! Keeps a Modbus expansion board's I/O state in sync and logs its changes.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use expiosrv::config::{load_config, DEFAULT_CONFIG_PATH};
use expiosrv::logging::init_logging;
use expiosrv::{runtime, shutdown};

/// Command-line arguments for expiosrv
#[derive(Parser, Clone, Debug)]
#[command(
    name = "expiosrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Expansion I/O Board Service",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH, env = "EXPIOSRV_CONFIG")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    let _log_guard = init_logging(&config.log)?;

    info!(
        "expiosrv {} starting (board '{}', unit {})",
        env!("CARGO_PKG_VERSION"),
        config.board.name,
        config.board.unit_id
    );

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let token = CancellationToken::new();
    shutdown::cancel_on_signal(token.clone());
    runtime::run(config, token).await?;

    info!("expiosrv stopped");
    Ok(())
}
