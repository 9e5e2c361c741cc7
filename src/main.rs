//! Taskloom - Persistence and state-coordination engine for multi-agent task orchestration

mod cli;
mod core;
mod db;
mod error;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskloom=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Taskloom v{}", env!("CARGO_PKG_VERSION"));

    // Run CLI
    cli::run()?;

    Ok(())
}
