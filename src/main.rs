use anyhow::Result;
use clap::Parser;

use kasbot::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Serve => cli::serve::run().await,
        Commands::Ask(args) => cli::ask::run(args).await,
        Commands::Chat(args) => cli::chat::run(args).await,
    }
}
