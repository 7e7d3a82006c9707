//! Configuration structs with sensible defaults and RON persistence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Socket settings.
    pub network: NetworkConfig,
    /// World data locations and edit policy.
    pub world: WorldConfig,
    /// Scheduler intervals.
    pub timing: TimingConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration. UDP and TCP share `port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both sockets bind to.
    pub bind_address: String,
    /// Port for both the UDP socket and the TCP listener.
    pub port: u16,
    /// Largest accepted inbound TCP frame payload, in bytes.
    pub max_tcp_payload: usize,
    /// Maximum simultaneous TCP connections.
    pub max_connections: usize,
}

/// Whether clients may edit the world.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum WorldMode {
    /// Clients receive the block catalog and may place blocks.
    #[default]
    Edit,
    /// Read-only world; block edits are ignored.
    Play,
}

/// World storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// Directory holding `{x}.{y}.{z}.dat` region files.
    pub world_dir: PathBuf,
    /// JSON block catalog.
    pub catalog_file: PathBuf,
    pub mode: WorldMode,
    /// Write all regions back to disk on shutdown.
    pub save_on_shutdown: bool,
    /// Create an empty origin region when the world directory holds none,
    /// so a fresh server can be edited.
    pub seed_origin: bool,
}

/// Scheduler timing, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between position broadcasts.
    pub position_tick_ms: u64,
    /// Interval between keepalive pings / timeout sweeps.
    pub keepalive_tick_ms: u64,
    /// Silence after which a session is evicted.
    pub keepalive_grace_ms: u64,
}

impl TimingConfig {
    pub fn position_tick(&self) -> Duration {
        Duration::from_millis(self.position_tick_ms)
    }

    pub fn keepalive_tick(&self) -> Duration {
        Duration::from_millis(self.keepalive_tick_ms)
    }

    pub fn keepalive_grace(&self) -> Duration {
        Duration::from_millis(self.keepalive_grace_ms)
    }
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7689,
            max_tcp_payload: 1024 * 1024,
            max_connections: 256,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_dir: PathBuf::from("world"),
            catalog_file: PathBuf::from("world/data.json"),
            mode: WorldMode::Edit,
            save_on_shutdown: true,
            seed_origin: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            position_tick_ms: 20,
            keepalive_tick_ms: 6000,
            keepalive_grace_ms: 300_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

/// Where a loaded config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from an existing file.
    Loaded(PathBuf),
    /// No file existed; defaults were written here.
    Created(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded(path) => write!(f, "loaded from {}", path.display()),
            Self::Created(path) => write!(f, "created with defaults at {}", path.display()),
        }
    }
}

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let (config, source) = Self::load_or_create_quiet(config_dir)?;
        log::info!("Config {source}");
        Ok(config)
    }

    /// Like [`Config::load_or_create`], but logs nothing and reports where
    /// the config came from instead. For callers that set up logging from
    /// the config they are loading.
    pub fn load_or_create_quiet(config_dir: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let config = read_config(&config_path)?;
            Ok((config, ConfigSource::Loaded(config_path)))
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            Ok((config, ConfigSource::Created(config_path)))
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join("config.ron");
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Re-read `config.ron`: returns `Some(new_config)` if it differs from
    /// `self`, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let new_config = read_config(&config_path)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
