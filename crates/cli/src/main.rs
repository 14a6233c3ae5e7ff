mod app;
mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;

use feedwatch_core::{load_dotenv, Config};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = Config::load().context("failed to load configuration")?;

    match args.command {
        Command::Run => {
            config.log_summary();
            commands::run(&config).await
        }
        Command::Once => {
            config.log_summary();
            commands::once(&config).await
        }
        Command::Subs { action } => commands::subs(&config, action).await,
        Command::CheckToken { probe } => commands::check_token(&config, &probe).await,
    }
}
