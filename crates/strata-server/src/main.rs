use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use strata_config::{CliArgs, Config};
use strata_server::{Server, ServerError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(|| PathBuf::from("."));

    // Logging is configured from the config, so report how loading went
    // only once the subscriber is up.
    let (mut config, loaded) = match Config::load_or_create_quiet(&config_dir) {
        Ok((config, source)) => (config, Ok(source)),
        Err(e) => (Config::default(), Err(e)),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    strata_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    match loaded {
        Ok(source) => tracing::info!("Config {source}"),
        Err(e) => tracing::warn!("Failed to load config: {e}, using defaults"),
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), ServerError> {
    let handle = Server::load(config)?.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");
    handle.shutdown();
    handle.join().await
}
