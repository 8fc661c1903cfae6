//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::query::DEFAULT_MAX_HISTORY_LIMIT;
use crate::storage::{
    DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_SWEEP_INTERVAL, IngestPolicy, RetryPolicy, StoreOptions,
    SynchronousMode,
};

use super::validation::{ConfigError, expand_env_vars, require_at_most, require_positive};

// =============================================================================
// Constants
// =============================================================================

/// Default database file, relative to the working directory.
pub const DEFAULT_DATABASE_FILE: &str = "data/visitor_tracking.db";

/// Default server port.
pub const DEFAULT_PORT: u16 = 5000;

/// Upper bound for the session idle timeout and the future clock skew.
const MAX_TRACKING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for the oldest accepted event.
const MAX_EVENT_AGE_LIMIT: Duration = Duration::from_secs(3650 * 24 * 60 * 60);

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 5000).
    pub port: u16,

    /// Allowed CORS origins. `"*"` allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path.
    pub path: String,

    /// Bounded wait for the file lock (default: 5s).
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Retry ceiling and backoff for contended transactions.
    pub retry: RetryPolicy,

    /// Reader connections per process (default: 4).
    pub read_pool_size: u32,

    /// Writer connections per process (default: 2).
    pub write_pool_size: u32,

    /// Wait for a free pooled connection (default: 10s).
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// SQLite `synchronous` mode (default: full).
    pub synchronous: SynchronousMode,

    /// Passive WAL checkpoint interval (default: 30s).
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let options = StoreOptions::default();
        Self {
            path: DEFAULT_DATABASE_FILE.to_string(),
            busy_timeout: options.busy_timeout,
            retry: options.retry,
            read_pool_size: options.read_pool_size,
            write_pool_size: options.write_pool_size,
            acquire_timeout: options.acquire_timeout,
            synchronous: options.synchronous,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

impl DatabaseConfig {
    /// Engine options for [`crate::storage::SqliteStore::open`].
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: self.busy_timeout,
            retry: self.retry.clone(),
            acquire_timeout: self.acquire_timeout,
            write_pool_size: self.write_pool_size,
            read_pool_size: self.read_pool_size,
            synchronous: self.synchronous,
        }
    }
}

// =============================================================================
// Tracking Configuration
// =============================================================================

/// Ingestion and query limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Gap after which an event starts a new session (default: 30m).
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,

    /// Cap on serialized attribute size in bytes (default: 8192).
    pub max_attributes_bytes: usize,

    /// Oldest accepted event timestamp relative to server time (default: 7d).
    #[serde(with = "humantime_serde")]
    pub max_event_age: Duration,

    /// Tolerance for client clocks running ahead (default: 5m).
    #[serde(with = "humantime_serde")]
    pub max_future_skew: Duration,

    /// Upper bound for history lookups (default: 1000).
    pub max_history_limit: u32,

    /// Interval between idle-session sweeps (default: 60s).
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        let policy = IngestPolicy::default();
        Self {
            session_idle_timeout: policy.session_idle_timeout,
            max_attributes_bytes: policy.max_attributes_bytes,
            max_event_age: policy.max_event_age,
            max_future_skew: policy.max_future_skew,
            max_history_limit: DEFAULT_MAX_HISTORY_LIMIT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl TrackingConfig {
    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy {
            session_idle_timeout: self.session_idle_timeout,
            max_attributes_bytes: self.max_attributes_bytes,
            max_event_age: self.max_event_age,
            max_future_skew: self.max_future_skew,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server configuration.
    pub server: ServerConfig,

    /// Database configuration.
    pub database: DatabaseConfig,

    /// Ingestion and query limits.
    pub tracking: TrackingConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are expanded before parsing.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;
        require_positive(self.server.port, "server port")?;

        for origin in &self.server.cors_origins {
            let origin = origin.trim();
            if origin != "*" && !(origin.starts_with("http://") || origin.starts_with("https://"))
            {
                return Err(ConfigError::Invalid(format!(
                    "invalid CORS origin: '{origin}'"
                )));
            }
        }

        let db = &self.database;
        if db.path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database path must not be empty".to_string(),
            ));
        }
        require_positive(db.busy_timeout, "database busy_timeout")?;
        require_positive(db.read_pool_size, "database read_pool_size")?;
        require_positive(db.write_pool_size, "database write_pool_size")?;
        require_positive(db.acquire_timeout, "database acquire_timeout")?;
        require_positive(db.checkpoint_interval, "database checkpoint_interval")?;
        db.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("database retry: {e}")))?;

        let tracking = &self.tracking;
        require_positive(tracking.session_idle_timeout, "tracking session_idle_timeout")?;
        require_positive(tracking.max_attributes_bytes, "tracking max_attributes_bytes")?;
        require_positive(tracking.max_event_age, "tracking max_event_age")?;
        require_at_most(
            tracking.session_idle_timeout,
            MAX_TRACKING_WINDOW,
            "tracking session_idle_timeout",
        )?;
        require_at_most(
            tracking.max_future_skew,
            MAX_TRACKING_WINDOW,
            "tracking max_future_skew",
        )?;
        require_at_most(
            tracking.max_event_age,
            MAX_EVENT_AGE_LIMIT,
            "tracking max_event_age",
        )?;
        require_positive(tracking.max_history_limit, "tracking max_history_limit")?;
        require_positive(tracking.sweep_interval, "tracking sweep_interval")?;

        Ok(())
    }
}
