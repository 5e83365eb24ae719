//! Configuration management for the chat store.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Number of migration backups kept after a successful migration.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Rows per transaction for batch, archival, and cleanup work.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Days between encryption key rotations.
pub const DEFAULT_KEY_ROTATION_INTERVAL_DAYS: i64 = 30;

/// Longest accepted key rotation interval (100 years).
pub const MAX_KEY_ROTATION_INTERVAL_DAYS: i64 = 36_500;

/// Maximum identifiers returned by a single search call.
pub const DEFAULT_SEARCH_RESULT_LIMIT: usize = 200;

/// Paginated queries slower than this are logged as slow.
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 200;

/// Reader connections kept open next to the single writer.
pub const DEFAULT_READER_POOL_SIZE: u32 = 4;

/// Chat store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Backups retained after a migration.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// Chunk size for batch mutation, archival, and cleanup.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Days before the encryption key is due for rotation.
    #[serde(default = "default_key_rotation_interval_days")]
    pub key_rotation_interval_days: i64,
    /// Cap on identifiers returned from a search.
    #[serde(default = "default_search_result_limit")]
    pub search_result_limit: usize,
    /// Advisory latency budget for paginated reads, in milliseconds.
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    /// Maximum reader connections.
    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: u32,
}

fn default_max_backups() -> usize {
    DEFAULT_MAX_BACKUPS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_key_rotation_interval_days() -> i64 {
    DEFAULT_KEY_ROTATION_INTERVAL_DAYS
}

fn default_search_result_limit() -> usize {
    DEFAULT_SEARCH_RESULT_LIMIT
}

fn default_slow_query_threshold_ms() -> u64 {
    DEFAULT_SLOW_QUERY_THRESHOLD_MS
}

fn default_reader_pool_size() -> u32 {
    DEFAULT_READER_POOL_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            max_backups: DEFAULT_MAX_BACKUPS,
            batch_size: DEFAULT_BATCH_SIZE,
            key_rotation_interval_days: DEFAULT_KEY_ROTATION_INTERVAL_DAYS,
            search_result_limit: DEFAULT_SEARCH_RESULT_LIMIT,
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            reader_pool_size: DEFAULT_READER_POOL_SIZE,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 {
            return Err(CoreError::Config("batch_size must be at least 1".to_string()));
        }
        if self.reader_pool_size == 0 {
            return Err(CoreError::Config(
                "reader_pool_size must be at least 1".to_string(),
            ));
        }
        if self.key_rotation_interval_days <= 0 {
            return Err(CoreError::Config(
                "key_rotation_interval_days must be positive".to_string(),
            ));
        }
        if self.key_rotation_interval_days > MAX_KEY_ROTATION_INTERVAL_DAYS {
            return Err(CoreError::Config(format!(
                "key_rotation_interval_days must be at most {}",
                MAX_KEY_ROTATION_INTERVAL_DAYS
            )));
        }
        Ok(())
    }

    /// Only the log level can be overridden at runtime.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("CHATSTORE_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.max_backups, 5);
        assert_eq!(config.key_rotation_interval_days, 30);
        assert_eq!(config.slow_query_threshold_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "batch_size": 250
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.max_backups, DEFAULT_MAX_BACKUPS);
        assert_eq!(config.search_result_limit, DEFAULT_SEARCH_RESULT_LIMIT);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.max_backups = 2;
        config.reader_pool_size = 8;

        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.max_backups, 2);
        assert_eq!(loaded.reader_pool_size, 8);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_config_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_rejects_non_positive_rotation_interval() {
        let mut config = Config::default();
        config.key_rotation_interval_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_reader_pool() {
        let mut config = Config::default();
        config.reader_pool_size = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_config_rejects_huge_rotation_interval() {
        let mut config = Config::default();
        config.key_rotation_interval_days = i64::MAX / 2;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        config.key_rotation_interval_days = MAX_KEY_ROTATION_INTERVAL_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_invalid_json() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();

        let result = Config::load_from_file(&config_path);
        assert!(matches!(result, Err(CoreError::Json(_))));
    }
}
