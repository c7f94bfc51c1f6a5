//! Configuration module for the cluster search service.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! Settings are applied exactly once, when the service is constructed, and
//! are read-only afterwards.
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CLUSTRA_` and use double
//! underscores to separate nested levels:
//! - `CLUSTRA_SEARCH__TOP_K=10` sets `search.top_k`
//! - `CLUSTRA_SEARCH__BACKEND=ivf-flat` sets `search.backend`
//! - `CLUSTRA_WORKER__MAX_QUERIES_PER_BATCH=500` sets
//!   `worker.max_queries_per_batch`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::{SearchBackend, VectorDimension};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Search worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    /// Dimensionality of every embedding and query vector
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Number of nearest neighbors returned per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Index backend used for every cluster
    #[serde(default)]
    pub backend: SearchBackend,

    /// Inverted lists probed per query (ivf-flat backend only)
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WorkerConfig {
    /// Upper bound on queries handed to one search call
    #[serde(default = "default_max_queries_per_batch")]
    pub max_queries_per_batch: usize,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_false() -> bool {
    false
}
fn default_dimension() -> usize {
    64
}
fn default_top_k() -> usize {
    4
}
fn default_nprobe() -> usize {
    8
}
fn default_max_queries_per_batch() -> usize {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            debug: false,
            search: SearchConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            top_k: default_top_k(),
            backend: SearchBackend::default(),
            nprobe: default_nprobe(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_queries_per_batch: default_max_queries_per_batch(),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("clustra.toml")
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path))
            // Layer in environment variables with CLUSTRA_ prefix
            // Double underscore (__) separates nested levels
            .merge(Env::prefixed("CLUSTRA_").split("__"))
            .extract()
            .map_err(Box::new)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            reason: format!("cannot serialize settings: {e}"),
        })?;
        std::fs::write(path, toml_string).map_err(|e| ConfigError::Invalid {
            reason: format!("cannot write settings file: {e}"),
        })?;
        Ok(())
    }

    /// Rejects zero-valued settings that would make search degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search.dimension == 0 {
            return Err(ConfigError::Invalid {
                reason: "search.dimension must be positive".to_string(),
            });
        }
        if self.search.top_k == 0 {
            return Err(ConfigError::Invalid {
                reason: "search.top_k must be positive".to_string(),
            });
        }
        if self.search.nprobe == 0 {
            return Err(ConfigError::Invalid {
                reason: "search.nprobe must be positive".to_string(),
            });
        }
        if self.worker.max_queries_per_batch == 0 {
            return Err(ConfigError::Invalid {
                reason: "worker.max_queries_per_batch must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// The configured dimension as a validated newtype.
    pub fn search_dimension(&self) -> Result<VectorDimension, ConfigError> {
        VectorDimension::new(self.search.dimension).map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
        })
    }
}
