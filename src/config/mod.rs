mod file_config;

pub use file_config::{FileConfig, PublisherConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be overridden by the TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub read_pool_size: usize,
    pub bus_url: Option<String>,
    pub publish_timeout_ms: u64,
    pub published_retention_days: u64,
    pub prune_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub read_pool_size: usize,
    pub publisher: PublisherSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let read_pool_size = file.read_pool_size.unwrap_or(cli.read_pool_size);
        if read_pool_size == 0 {
            bail!("read_pool_size must be at least 1");
        }

        let defaults = PublisherSettings::default();
        let pub_file = file.publisher.unwrap_or_default();
        let publisher = PublisherSettings {
            bus_url: pub_file.bus_url.or_else(|| cli.bus_url.clone()),
            poll_interval_ms: pub_file
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
            batch_size: pub_file.batch_size.unwrap_or(defaults.batch_size),
            max_in_flight: pub_file.max_in_flight.unwrap_or(defaults.max_in_flight),
            publish_timeout_ms: pub_file
                .publish_timeout_ms
                .unwrap_or(cli.publish_timeout_ms),
            max_retries: pub_file.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_ms: pub_file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: pub_file.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            backoff_multiplier: pub_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            park_duration_secs: pub_file
                .park_duration_secs
                .unwrap_or(defaults.park_duration_secs),
            published_retention_days: pub_file
                .published_retention_days
                .unwrap_or(cli.published_retention_days),
            prune_interval_hours: pub_file
                .prune_interval_hours
                .unwrap_or(cli.prune_interval_hours),
        };
        publisher.validate()?;

        Ok(Self {
            db_path,
            read_pool_size,
            publisher,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub bus_url: Option<String>, // None: events are logged only
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_in_flight: usize,
    pub publish_timeout_ms: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub park_duration_secs: u64,
    pub published_retention_days: u64, // 0 disables pruning
    pub prune_interval_hours: u64,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            bus_url: None,
            poll_interval_ms: 1000,
            batch_size: 100,
            max_in_flight: 8,
            publish_timeout_ms: 5000,
            max_retries: 8,
            initial_backoff_ms: 500,
            max_backoff_ms: 300_000, // 5 minutes
            backoff_multiplier: 2.0,
            park_duration_secs: 900,
            published_retention_days: 7,
            prune_interval_hours: 24,
        }
    }
}

impl PublisherSettings {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("publisher.batch_size must be at least 1");
        }
        if self.max_in_flight == 0 {
            bail!("publisher.max_in_flight must be at least 1");
        }
        if self.publish_timeout_ms == 0 {
            bail!("publisher.publish_timeout_ms must be greater than 0");
        }
        if self.backoff_multiplier < 1.0 {
            bail!(
                "publisher.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            bail!("publisher.initial_backoff_ms must not exceed publisher.max_backoff_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_cli(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(temp_dir.path().join("catalog.db")),
            read_pool_size: 4,
            bus_url: None,
            publish_timeout_ms: 5000,
            published_retention_days: 7,
            prune_interval_hours: 24,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            bus_url: Some("http://cache:8080/events".to_string()),
            ..make_cli(&temp_dir)
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("catalog.db"));
        assert_eq!(config.read_pool_size, 4);
        assert_eq!(
            config.publisher.bus_url.as_deref(),
            Some("http://cache:8080/events")
        );
        assert_eq!(config.publisher.publish_timeout_ms, 5000);
        assert_eq!(config.publisher.max_retries, 8);
        assert_eq!(config.publisher.published_retention_days, 7);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/should/be/overridden.db")),
            ..make_cli(&temp_dir)
        };
        let file_config = FileConfig {
            db_path: Some(
                temp_dir
                    .path()
                    .join("from_toml.db")
                    .to_string_lossy()
                    .to_string(),
            ),
            read_pool_size: Some(2),
            publisher: Some(PublisherConfig {
                bus_url: Some("http://toml/events".to_string()),
                max_retries: Some(3),
                published_retention_days: Some(30),
                ..Default::default()
            }),
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("from_toml.db"));
        assert_eq!(config.read_pool_size, 2);
        assert_eq!(config.publisher.bus_url.as_deref(), Some("http://toml/events"));
        assert_eq!(config.publisher.max_retries, 3);
        assert_eq!(config.publisher.published_retention_days, 30);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.publisher.prune_interval_hours, 24);
        assert_eq!(config.publisher.publish_timeout_ms, 5000);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_directory_error() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/nonexistent/path/that/should/not/exist/c.db")),
            read_pool_size: 1,
            publish_timeout_ms: 1000,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_invalid_publisher_settings() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            publisher: Some(PublisherConfig {
                max_in_flight: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&make_cli(&temp_dir), Some(file_config));
        assert!(result.unwrap_err().to_string().contains("max_in_flight"));

        let file_config = FileConfig {
            publisher: Some(PublisherConfig {
                backoff_multiplier: Some(0.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&make_cli(&temp_dir), Some(file_config));
        assert!(result.unwrap_err().to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_default_publisher_settings_are_valid() {
        PublisherSettings::default().validate().unwrap();
    }
}
