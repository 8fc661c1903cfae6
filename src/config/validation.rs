//! Config error type and the helpers shared by the YAML loader and the CLI.

use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;

/// Why a worker configuration was rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value parsed but is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Value parser for the `FOOTFALL_*` duration flags (`busy_timeout`,
/// backoff bounds, idle timeout). Accepts humantime text such as `250ms`,
/// `5s` or `30m`; a bare number has no unit and is rejected.
///
/// ```
/// use footfall::config::parse_duration;
///
/// assert_eq!(parse_duration("30m").unwrap().as_secs(), 1800);
/// assert!(parse_duration("30").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    match s.trim() {
        "" => Err("expected a duration such as 250ms, 5s or 30m".to_string()),
        text => humantime::parse_duration(text).map_err(|e| format!("'{text}': {e}")),
    }
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile placeholder regex")
    })
}

/// Substitute `${NAME}` and `${NAME:-fallback}` in config text.
///
/// Unset variables without a fallback become empty, so a missing
/// `${FOOTFALL_DATABASE_FILE}` surfaces as an empty path during validation.
pub fn expand_env_vars(input: &str) -> String {
    placeholder_regex()
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

/// Reject zero values (durations, pool sizes, limits).
pub(crate) fn require_positive<T: Default + PartialEq>(
    value: T,
    field: &str,
) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid(format!("{field} must be positive")));
    }
    Ok(())
}

/// Reject durations above `max`.
pub(crate) fn require_at_most(
    value: Duration,
    max: Duration,
    field: &str,
) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid(format!(
            "{field} must be at most {}",
            humantime::format_duration(max)
        )));
    }
    Ok(())
}
