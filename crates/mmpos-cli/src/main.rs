//! Money-market position manager - Entry Point

use anyhow::Result;
use clap::Parser;
use mmpos_cli::{AppConfig, Application, Command};
use tracing::info;

/// Supply, borrow, repay and redeem against a money market.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via MMPOS_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Run against an in-memory protocol seeded from [simulation]
    #[arg(long)]
    simulate: bool,

    /// Print Prometheus metrics after the command completes
    #[arg(long)]
    metrics: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    mmpos_telemetry::init_logging(args.log_filter.as_deref())?;

    info!("Starting mmpos v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > MMPOS_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("MMPOS_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, simulate = args.simulate, "Loading configuration");

    let config = AppConfig::from_file(&config_path)?;
    config.validate(args.simulate)?;
    info!(markets = config.markets.len(), "Configuration loaded");

    let app = if args.simulate {
        Application::simulated(config)?
    } else {
        Application::connect(config).await?
    };

    app.execute(args.command).await?;

    if args.metrics {
        print!("{}", mmpos_telemetry::Metrics::render()?);
    }

    Ok(())
}
