//! Configuration module for footfall.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address, CORS origins)
//! - Database settings (path, busy timeout, retry policy, pools)
//! - Tracking settings (session idle timeout, payload cap, clock skew)

mod app;
mod validation;

pub use app::{AppConfig, DatabaseConfig, ServerConfig, TrackingConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration};

// Re-export constants
pub use app::{DEFAULT_DATABASE_FILE, DEFAULT_PORT};
