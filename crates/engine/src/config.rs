//! Engine configuration.
//!
//! Settings live in a small JSON file under the standard configuration
//! directory (`~/.config/stepwise/engine.json` on most platforms). The path can
//! be overridden with `STEPWISE_CONFIG_PATH`. A missing file yields defaults;
//! an unreadable or malformed file is an error.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use stepwise_util::expand_tilde;
use thiserror::Error;
use tracing::debug;

/// Environment variable allowing callers to override the config file path.
pub const CONFIG_PATH_ENV: &str = "STEPWISE_CONFIG_PATH";

/// Default filename for the JSON payload.
pub const CONFIG_FILE_NAME: &str = "engine.json";

/// Largest accepted `max_depth`; deeper nesting would exhaust the stack
/// before the depth guard reports a cycle.
pub const MAX_DEPTH_LIMIT: usize = 128;

/// Error surfaced when loading the engine configuration fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid engine config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// What the registry does with a step whose kind has no resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKindPolicy {
    /// Abort the invocation with an unresolved-kind error.
    #[default]
    Fail,
    /// Forward `previous` unchanged to the next step.
    Passthrough,
}

/// What happens when a dependency sub-pipeline fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Propagate the error and abort the invocation.
    #[default]
    Abort,
    /// Merge an error marker under the dependency name and keep going.
    /// Fatal errors still abort.
    Isolate,
}

/// Limits for the cache-backed async source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds a completed entry stays fresh.
    pub ttl_sec: u64,
    /// Seconds a failed entry is remembered before the next request retries it.
    pub failure_ttl_sec: u64,
    /// Upper bound on cached entries; the least recently used settled entry is
    /// evicted first.
    pub max_entries: usize,
    /// Per-request timeout for the HTTP fetcher.
    pub request_timeout_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 300,
            failure_ttl_sec: 30,
            max_entries: 512,
            request_timeout_sec: 30,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_sec)
    }

    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting of dependency sub-pipelines.
    pub max_depth: usize,
    pub unknown_kind: UnknownKindPolicy,
    pub error_policy: ErrorPolicy,
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            unknown_kind: UnknownKindPolicy::default(),
            error_policy: ErrorPolicy::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    /// Load from an explicit path, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "engine config not found; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Reject limits that keep the re-run loop from settling or let nesting
    /// overflow the stack.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 || self.max_depth > MAX_DEPTH_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_depth",
                reason: format!("must be between 1 and {MAX_DEPTH_LIMIT}, got {}", self.max_depth),
            });
        }
        let cache = &self.cache;
        for (field, value) in [
            ("cache.ttl_sec", cache.ttl_sec),
            ("cache.failure_ttl_sec", cache.failure_ttl_sec),
            ("cache.request_timeout_sec", cache.request_timeout_sec),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if cache.max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.max_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Get the default path for the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stepwise")
        .join(CONFIG_FILE_NAME)
}
