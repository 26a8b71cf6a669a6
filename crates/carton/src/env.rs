use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

/// Environment-driven configuration for the archive store and runner catalog.
#[derive(Debug, Clone)]
pub struct CartonConfig {
    pub cache_dir: PathBuf,
    pub cache_max_bytes: Option<u64>,
    pub runner_dir: Option<PathBuf>,
    pub download_timeout: Option<Duration>,
}

impl Default for CartonConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cartons"),
            cache_max_bytes: None,
            runner_dir: None,
            download_timeout: None,
        }
    }
}

impl CartonConfig {
    /// Build a [`CartonConfig`] by reading the documented CARTON_* variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let cache_dir = env::var("CARTON_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let cache_max_bytes = env::var("CARTON_CACHE_MAX_BYTES")
            .ok()
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("CARTON_CACHE_MAX_BYTES `{raw}` is not a byte count"))
            })
            .transpose()?;

        let runner_dir = env::var("CARTON_RUNNER_DIR").ok().map(PathBuf::from);

        let download_timeout = env::var("CARTON_DOWNLOAD_TIMEOUT_SECS")
            .ok()
            .map(|raw| parse_timeout(&raw))
            .transpose()?;

        Ok(Self {
            cache_dir,
            cache_max_bytes,
            runner_dir,
            download_timeout,
        })
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }
}

/// Accepts plain seconds (`90`) or a humantime duration (`1m 30s`).
fn parse_timeout(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed)
        .map_err(|err| anyhow!("CARTON_DOWNLOAD_TIMEOUT_SECS `{raw}` is invalid: {err}"))
}
