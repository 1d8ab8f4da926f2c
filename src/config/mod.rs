use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Signal engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Skip companies with no new quarterly data since their last calculation.
    #[serde(default = "default_true")]
    pub incremental: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_recorded_failures")]
    pub max_recorded_failures: usize,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// CSV import configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_companies_file")]
    pub companies_file: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_db_path() -> PathBuf {
    PathBuf::from("data/screener.duckdb")
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_max_recorded_failures() -> usize {
    50
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data/quarterly")
}
fn default_companies_file() -> PathBuf {
    PathBuf::from("data/companies.csv")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path(), run_migrations: true }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            incremental: true,
            poll_interval_ms: default_poll_interval_ms(),
            max_recorded_failures: default_max_recorded_failures(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir(), companies_file: default_companies_file() }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("SCREENER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize().context("Invalid configuration")
    }
}
