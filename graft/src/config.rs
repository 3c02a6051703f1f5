//! Configuration handling for graft

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::db::dialect::Dialect;
use crate::error::{Error, Result};

/// Load configuration from a TOML file
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let config_str = fs::read_to_string(path.as_ref())
        .map_err(|e| Error::ConfigError(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&config_str)
        .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?;

    config.validate()?;
    Ok(config)
}

/// Represents the complete graft configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        Dialect::from_driver(&self.database.driver)?;

        if self.database.url.trim().is_empty() {
            return Err(Error::ConfigError("database.url must not be empty".to_string()));
        }
        if self.migrations.directory.trim().is_empty() {
            return Err(Error::ConfigError(
                "migrations.directory must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Database connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub driver: String,
    pub url: String,
    pub pool_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Migration file locations
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MigrationsConfig {
    #[serde(default = "default_migrations_directory")]
    pub directory: String,
    #[serde(default = "default_schema_path")]
    pub schema_path: String,
    pub backup_directory: Option<String>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_directory(),
            schema_path: default_schema_path(),
            backup_directory: None,
        }
    }
}

impl MigrationsConfig {
    /// Directory that JSON backups are written to
    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_directory {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.directory).join("backups"),
        }
    }
}

fn default_migrations_directory() -> String {
    "db/migrations".to_string()
}

fn default_schema_path() -> String {
    "db/schema".to_string()
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub file: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_stdout")]
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            format: default_log_format(),
            stdout: default_stdout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_stdout() -> bool {
    true
}
