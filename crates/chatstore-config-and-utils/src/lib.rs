//! Configuration, paths, and logging shared by the chatstore crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DEFAULT_BATCH_SIZE, DEFAULT_KEY_ROTATION_INTERVAL_DAYS, DEFAULT_LOG_LEVEL,
    DEFAULT_MAX_BACKUPS, DEFAULT_READER_POOL_SIZE, DEFAULT_SEARCH_RESULT_LIMIT,
    DEFAULT_SLOW_QUERY_THRESHOLD_MS, MAX_KEY_ROTATION_INTERVAL_DAYS,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LogConfig, LogWriter};
pub use paths::Paths;
