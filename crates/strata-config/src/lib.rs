//! Configuration system for the Strata server.
//!
//! Settings persist to disk as a RON file, can be overridden from the command
//! line via clap, and tolerate missing or unknown fields so old config files
//! keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, ConfigSource, DebugConfig, NetworkConfig, TimingConfig, WorldConfig, WorldMode,
};
pub use error::ConfigError;
