// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use subwave::{AlertRegistry, BotConfig, EventBot};

/// EventSub alert bot runner.
#[derive(Debug, Parser)]
#[command(name = "subwave", version, about)]
struct Cli {
    /// Path to the bot configuration JSON.
    #[arg(long, env = "SUBWAVE_CONFIG", default_value = "subwave.json")]
    config: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SUBWAVE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    // reqwest is built without a default TLS provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run(&cli).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = BotConfig::load(&cli.config)?;
    // No handlers registered: every topic flows through the generic fallback,
    // which makes this binary a structured event logger.
    let bot = EventBot::new(config, AlertRegistry::new())?;
    bot.start().await?;
    bot.hold().await?;
    Ok(())
}
