//! Flotilla - cluster management control plane for Docker fleets
//!
//! Administers groups of container-hosting nodes through their daemons'
//! HTTP APIs: container lifecycle, rolling updates by image tag, and
//! declarative cluster state, driven over a REST surface.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use flotilla::app::Application;
use flotilla::config::Configuration;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Cluster management control plane for Docker container fleets")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "flotilla.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flotilla={}", log_level).into()),
        )
        .init();

    info!("Starting Flotilla v{}", env!("CARGO_PKG_VERSION"));

    let config = if std::path::Path::new(&cli.config).exists() {
        Configuration::load(&cli.config)?
    } else {
        warn!("Config file {} not found, using defaults", cli.config);
        Configuration::default()
    };

    let app = Application::build(config).await?;
    app.run().await
}
