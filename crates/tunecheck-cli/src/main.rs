//! tunecheck CLI
//!
//! Validates node power-management tuning and the MetalLB operator install on
//! an OpenShift single-node cluster.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunecheck_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tunecheck_common::install_crypto_provider();

    let cli = Cli::parse();
    cli.run().await
}
