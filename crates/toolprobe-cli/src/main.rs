//! toolprobe CLI - Launch, probe and tear down sandboxed tool servers.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on debug flag
    let filter = if cli.debug {
        "toolprobe=debug"
    } else {
        "toolprobe=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Check(args) => commands::check::execute(args, cli.config.as_deref()).await,
        Commands::Plan(args) => commands::plan::execute(args, cli.config.as_deref()).await,
        Commands::Version => commands::version::execute().await,
    }
}
