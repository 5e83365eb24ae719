//! File system paths for the chat store.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Application identifier used for the application-support directory.
const APP_IDENTIFIER: &str = "com.chatstore.app";
/// Database file name inside the application-support directory.
const DATABASE_FILE_NAME: &str = "chats.sqlite";

/// Manages file system paths for the chat store.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for config and logs (~/.chatstore)
    base_dir: PathBuf,
    /// Application-support directory for the database and its backups
    app_support_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance.
    ///
    /// Uses `~/.chatstore` for config and logs and the platform data
    /// directory (e.g. `~/Library/Application Support/com.chatstore.app`)
    /// for the database.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        let base_dir = home.join(".chatstore");

        let app_support_dir = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local").join("share"))
            .join(APP_IDENTIFIER);

        Ok(Self {
            base_dir,
            app_support_dir,
        })
    }

    /// Create a new Paths instance rooted at a single directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            app_support_dir: base_dir.clone(),
            base_dir,
        }
    }

    /// Get the base directory (~/.chatstore).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the application-support directory.
    pub fn app_support_dir(&self) -> &PathBuf {
        &self.app_support_dir
    }

    /// Get the config file path (~/.chatstore/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the database file path.
    pub fn database_file(&self) -> PathBuf {
        self.app_support_dir.join(DATABASE_FILE_NAME)
    }

    /// Get the directory holding migration backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.app_support_dir.join("backups")
    }

    /// Get the logs directory (~/.chatstore/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the structured log file path (~/.chatstore/logs/chatstore.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("chatstore.jsonl")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.app_support_dir)?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
