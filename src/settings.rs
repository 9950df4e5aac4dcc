use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::{CacheConfig, RouteRule};
use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_ttl() -> u64 {
    300
}

fn default_origin_timeout() -> u64 {
    30
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_cache_max_entry_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_total_capacity() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_cache_sweeper_interval() -> u64 {
    60
}

fn default_cache_sweeper_batch_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Base url of the origin, e.g. `http://127.0.0.1:8080`.
    pub origin: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Seconds; used when the origin sends no freshness information.
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_total_capacity")]
    pub cache_total_capacity: u64,
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default = "default_cache_sweeper_batch_size")]
    pub cache_sweeper_batch_size: usize,
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(config_path.to_path_buf()).required(true))
            .add_source(
                Environment::with_prefix("EDGECACHE")
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: self.default_ttl(),
            max_entries: self.cache_max_entries,
            total_capacity: self.cache_total_capacity,
            max_entry_size: self.cache_max_entry_size,
            origin_timeout: self.origin_timeout(),
            max_body_size: self.max_body_size,
            sweeper_interval: self.cache_sweeper_interval(),
            sweeper_batch_size: self.cache_sweeper_batch_size,
            routes: self.routes.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.origin.starts_with("http://"),
            "origin must be an http:// url (got '{}')",
            self.origin
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        ensure!(
            self.cache_max_entry_size > 0,
            "cache_max_entry_size must be greater than 0 (got {})",
            self.cache_max_entry_size
        );
        ensure!(
            self.cache_max_entries > 0,
            "cache_max_entries must be greater than 0 (got {})",
            self.cache_max_entries
        );
        ensure!(
            self.cache_total_capacity > 0,
            "cache_total_capacity must be greater than 0 (got {})",
            self.cache_total_capacity
        );
        ensure!(
            self.cache_max_entry_size <= self.cache_total_capacity,
            "cache_max_entry_size ({}) must not exceed cache_total_capacity ({})",
            self.cache_max_entry_size,
            self.cache_total_capacity
        );
        ensure!(
            self.cache_sweeper_interval > 0,
            "cache_sweeper_interval must be greater than 0 seconds (got {})",
            self.cache_sweeper_interval
        );
        ensure!(
            self.cache_sweeper_batch_size > 0,
            "cache_sweeper_batch_size must be greater than 0 (got {})",
            self.cache_sweeper_batch_size
        );
        for route in &self.routes {
            if !route.path_prefix.starts_with('/') {
                bail!(
                    "route path_prefix must start with '/' (got '{}')",
                    route.path_prefix
                );
            }
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/edgecache/edgecache.toml"),
        PathBuf::from("edgecache.toml"),
    ]
}
