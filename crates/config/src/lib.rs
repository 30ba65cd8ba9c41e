#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration management for strata admission control
//!
//! This crate handles loading and merging limiter configuration from:
//! - Default values (hard-coded, CPU-count based pool sizes)
//! - Configuration file (~/.config/strata/limits.toml)
//! - Environment variables

pub mod limits;

pub use limits::{
    auto_pool_size, calculate_pool_size, LimitsConfig, PartitionConfig, ResolvedPartition,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_errors::{ConfigError, Error};
use strata_types::Resource;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    /// Get the default config file path
    ///
    /// # Errors
    ///
    /// Returns an error if the system config directory cannot be determined.
    pub fn default_path() -> Result<PathBuf, Error> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::NotFound {
            path: "config directory".to_string(),
        })?;
        Ok(config_dir.join("strata").join("limits.toml"))
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, contains invalid TOML,
    /// or describes a zero-sized wait queue.
    pub async fn load_from_file(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::NotFound {
                path: path.display().to_string(),
            })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.limits.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read
    /// or contains invalid TOML syntax.
    pub async fn load() -> Result<Self, Error> {
        let config_path = Self::default_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            tracing::debug!(path = %config_path.display(), "no limits file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from an optional path or use default
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        match path {
            Some(config_path) => Self::load_from_file(config_path).await,
            None => Self::load().await,
        }
    }

    /// Write configuration to a file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub async fn save_to_file(&self, path: &Path) -> Result<(), Error> {
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError {
            error: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::WriteError {
                    path: parent.display().to_string(),
                    error: e.to_string(),
                })?;
        }

        fs::write(path, contents)
            .await
            .map_err(|e| ConfigError::WriteError {
                path: path.display().to_string(),
                error: e.to_string(),
            })?;
        Ok(())
    }

    /// Merge with environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    /// that cannot be parsed into positive integers.
    pub fn merge_env(&mut self) -> Result<(), Error> {
        // STRATA_QUEUE_CAPACITY
        if let Ok(capacity) = std::env::var("STRATA_QUEUE_CAPACITY") {
            self.limits.queue_capacity = parse_positive("STRATA_QUEUE_CAPACITY", capacity)?;
        }

        // STRATA_<RESOURCE>_POOL_SIZE
        for resource in Resource::ALL {
            let var = pool_size_var(resource);
            if let Ok(size) = std::env::var(&var) {
                self.limits.partition_config_mut(resource).pool_size = parse_positive(&var, size)?;
            }
        }

        Ok(())
    }
}

/// Environment variable overriding a resource's pool size
#[must_use]
pub fn pool_size_var(resource: Resource) -> String {
    format!("STRATA_{}_POOL_SIZE", resource.as_str().to_ascii_uppercase())
}

fn parse_positive(field: &str, value: String) -> Result<usize, Error> {
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value,
        }
        .into()),
    }
}
