//! Service Configuration
//!
//! Layered from an optional TOML file and `TELEMETRY__<SECTION>__<KEY>`
//! environment variables, environment winning.

use acquisition_supervisor::SupervisorConfig;
use command_dispatcher::BusConfig;
use inference_engine::ForestConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Config file used when `TELEMETRY_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

const ENV_PREFIX: &str = "TELEMETRY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mqtt: BusConfig,
    pub store: StoreSettings,
    pub models: ModelSettings,
    pub worker: SupervisorConfig,
    pub log: LogSettings,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// sqlx SQLite URL
    pub database_url: String,
    /// Upper bound on one store query (milliseconds)
    pub query_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://telemetry.db".to_string(),
            query_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Registry root; artifacts live at `<root>/<brand>/idle_<vehicle>.pkl`
    pub root: PathBuf,
    pub forest: ForestConfig,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models"),
            forest: ForestConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Prometheus scrape endpoint; disabled when unset
    pub listen: Option<SocketAddr>,
}

impl Settings {
    /// Load from `TELEMETRY_CONFIG` (or the default path) plus the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("TELEMETRY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from `path` plus the environment. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
