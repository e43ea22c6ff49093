use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
}

pub const DEFAULT_LEASE_DURATION_SECONDS: i64 = 60;
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONSULT_TIMEOUT_SECONDS: i64 = 90;
pub const DEFAULT_REPLAN_TIMEOUT_SECONDS: i64 = 300;
pub const DEFAULT_MAX_REPLAN_DEPTH: u32 = 2;
pub const DEFAULT_MAX_CONCURRENT_ITEMS: usize = 4;
pub const DEFAULT_MAX_CONCURRENT_PER_SCOPE: usize = 2;
pub const DEFAULT_MIN_POLL_MS: u64 = 100;
pub const DEFAULT_MAX_POLL_MS: u64 = 1000;
pub const DEFAULT_MAX_TOKEN_TTL_SECONDS: i64 = 3600;
pub const DEFAULT_NONCE_SAFETY_BUFFER_SECONDS: i64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_lease_duration_seconds")]
    pub lease_duration_seconds: i64,
    /// Interval at which long-running consumers extend their lease. When
    /// absent, consumers derive lease/3. An explicit value must stay strictly
    /// below lease/3 or a slow consumer is indistinguishable from a crash.
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<i64>,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_consult_timeout_seconds")]
    pub consult_timeout_seconds: i64,
    #[serde(default = "default_replan_timeout_seconds")]
    pub replan_timeout_seconds: i64,
    #[serde(default = "default_max_replan_depth")]
    pub max_replan_depth: u32,
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,
    #[serde(default = "default_max_concurrent_per_scope")]
    pub max_concurrent_per_scope: usize,
    #[serde(default = "default_min_poll_ms")]
    pub min_poll_ms: u64,
    #[serde(default = "default_max_poll_ms")]
    pub max_poll_ms: u64,
    #[serde(default = "default_max_token_ttl_seconds")]
    pub max_token_ttl_seconds: i64,
    #[serde(default = "default_nonce_safety_buffer_seconds")]
    pub nonce_safety_buffer_seconds: i64,
}

fn default_lease_duration_seconds() -> i64 {
    DEFAULT_LEASE_DURATION_SECONDS
}

fn default_max_delivery_attempts() -> u32 {
    DEFAULT_MAX_DELIVERY_ATTEMPTS
}

fn default_consult_timeout_seconds() -> i64 {
    DEFAULT_CONSULT_TIMEOUT_SECONDS
}

fn default_replan_timeout_seconds() -> i64 {
    DEFAULT_REPLAN_TIMEOUT_SECONDS
}

fn default_max_replan_depth() -> u32 {
    DEFAULT_MAX_REPLAN_DEPTH
}

fn default_max_concurrent_items() -> usize {
    DEFAULT_MAX_CONCURRENT_ITEMS
}

fn default_max_concurrent_per_scope() -> usize {
    DEFAULT_MAX_CONCURRENT_PER_SCOPE
}

fn default_min_poll_ms() -> u64 {
    DEFAULT_MIN_POLL_MS
}

fn default_max_poll_ms() -> u64 {
    DEFAULT_MAX_POLL_MS
}

fn default_max_token_ttl_seconds() -> i64 {
    DEFAULT_MAX_TOKEN_TTL_SECONDS
}

fn default_nonce_safety_buffer_seconds() -> i64 {
    DEFAULT_NONCE_SAFETY_BUFFER_SECONDS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lease_duration_seconds: DEFAULT_LEASE_DURATION_SECONDS,
            heartbeat_interval_seconds: None,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            consult_timeout_seconds: DEFAULT_CONSULT_TIMEOUT_SECONDS,
            replan_timeout_seconds: DEFAULT_REPLAN_TIMEOUT_SECONDS,
            max_replan_depth: DEFAULT_MAX_REPLAN_DEPTH,
            max_concurrent_items: DEFAULT_MAX_CONCURRENT_ITEMS,
            max_concurrent_per_scope: DEFAULT_MAX_CONCURRENT_PER_SCOPE,
            min_poll_ms: DEFAULT_MIN_POLL_MS,
            max_poll_ms: DEFAULT_MAX_POLL_MS,
            max_token_ttl_seconds: DEFAULT_MAX_TOKEN_TTL_SECONDS,
            nonce_safety_buffer_seconds: DEFAULT_NONCE_SAFETY_BUFFER_SECONDS,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration_seconds <= 0 {
            return Err(ConfigError::Settings(
                "lease_duration_seconds must be positive".to_string(),
            ));
        }
        if let Some(heartbeat) = self.heartbeat_interval_seconds {
            if heartbeat <= 0 {
                return Err(ConfigError::Settings(
                    "heartbeat_interval_seconds must be positive".to_string(),
                ));
            }
            if heartbeat >= self.lease_duration_seconds / 3 {
                return Err(ConfigError::Settings(format!(
                    "heartbeat_interval_seconds ({heartbeat}) must be below one third of \
                     lease_duration_seconds ({})",
                    self.lease_duration_seconds
                )));
            }
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Settings(
                "max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        if self.consult_timeout_seconds < 0 || self.replan_timeout_seconds < 0 {
            return Err(ConfigError::Settings(
                "consult and replan timeouts must not be negative".to_string(),
            ));
        }
        if self.max_concurrent_items == 0 || self.max_concurrent_per_scope == 0 {
            return Err(ConfigError::Settings(
                "concurrency caps must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_per_scope > self.max_concurrent_items {
            return Err(ConfigError::Settings(format!(
                "max_concurrent_per_scope ({}) exceeds max_concurrent_items ({})",
                self.max_concurrent_per_scope, self.max_concurrent_items
            )));
        }
        if self.min_poll_ms == 0 || self.max_poll_ms < self.min_poll_ms {
            return Err(ConfigError::Settings(
                "poll interval bounds must satisfy 0 < min_poll_ms <= max_poll_ms".to_string(),
            ));
        }
        if self.max_token_ttl_seconds <= 0 {
            return Err(ConfigError::Settings(
                "max_token_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.nonce_safety_buffer_seconds < 0 {
            return Err(ConfigError::Settings(
                "nonce_safety_buffer_seconds must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective heartbeat cadence: the explicit setting, or lease/3.
    pub fn effective_heartbeat_seconds(&self) -> i64 {
        self.heartbeat_interval_seconds
            .unwrap_or(self.lease_duration_seconds / 3)
            .max(1)
    }

    /// Horizon after which a nonce record can no longer protect anything and
    /// is eligible for pruning.
    pub fn nonce_retention_seconds(&self) -> i64 {
        self.max_token_ttl_seconds + self.nonce_safety_buffer_seconds
    }
}
