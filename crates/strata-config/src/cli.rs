//! Command-line argument parsing for the Strata server.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, WorldMode};

/// Strata server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strata-server", about = "Authoritative voxel world server")]
pub struct CliArgs {
    /// Port for both UDP and TCP.
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory holding region files.
    #[arg(long)]
    pub world_dir: Option<PathBuf>,

    /// Block catalog JSON file.
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Edit or play mode.
    #[arg(long, value_enum)]
    pub mode: Option<WorldMode>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (defaults to the working directory).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref addr) = args.bind {
            self.network.bind_address = addr.clone();
        }
        if let Some(ref dir) = args.world_dir {
            self.world.world_dir = dir.clone();
        }
        if let Some(ref path) = args.catalog {
            self.world.catalog_file = path.clone();
        }
        if let Some(mode) = args.mode {
            self.world.mode = mode;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(4000),
            mode: Some(WorldMode::Play),
            world_dir: Some(PathBuf::from("maps/alpha")),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.port, 4000);
        assert_eq!(config.world.mode, WorldMode::Play);
        assert_eq!(config.world.world_dir, PathBuf::from("maps/alpha"));
        // Non-overridden fields retain defaults
        assert_eq!(config.network.bind_address, "0.0.0.0");
        assert_eq!(config.world.catalog_file, PathBuf::from("world/data.json"));
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_from_args() {
        let args = CliArgs::parse_from([
            "strata-server",
            "--port",
            "7000",
            "--mode",
            "play",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.mode, Some(WorldMode::Play));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.catalog.is_none());
    }
}
