use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub read_pool_size: Option<usize>,

    pub publisher: Option<PublisherConfig>,
}

/// `[publisher]` section.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PublisherConfig {
    /// Endpoint receiving change events. Events are only logged when unset.
    pub bus_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub publish_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub park_duration_secs: Option<u64>,
    pub published_retention_days: Option<u64>,
    pub prune_interval_hours: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
