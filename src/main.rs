use std::path::Path;

use anyhow::{Result, anyhow};
use clap::Parser;

use report_processor::cli::commands::{init, watch};
use report_processor::cli::{Cli, Commands};
use report_processor::{Settings, logging};

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow!("Configuration error: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&load_settings(config_path)?),
        Commands::Watch {
            folders,
            period_ms,
            workers,
            json,
        } => {
            let settings = load_settings(config_path)?;
            logging::init_with_config(&settings.logging);

            let args = watch::WatchArgs {
                folders,
                period_ms,
                workers,
                json,
            };
            watch::run(args, settings).await
        }
    }
}
