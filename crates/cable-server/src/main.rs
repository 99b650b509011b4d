//! # Cable Server
//!
//! Action Cable compatible realtime server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! cable
//!
//! # Run with custom config
//! cable --config /path/to/cable.toml
//!
//! # Override single settings from the environment
//! CABLE__PORT=8080 CABLE__CABLE__REQUIRE_IDENTITY=true cable
//! ```

mod app;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "cable=info,tenvis_cable_core=info,tower_http=debug";

/// Action Cable compatible realtime server
#[derive(Parser, Debug)]
#[command(name = "cable")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CABLE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!(host = %config.host, port = config.port, "Starting cable server");

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
