use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{config_invalid, config_missing, RetryPolicy, SessionResult};

// Default configuration values
const DEFAULT_REFRESH_URL: &str = "http://127.0.0.1:8080/api/auth/refresh";
const DEFAULT_STORAGE_PATH: &str = "punchclock.session.json";
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_WINDOW_UPPER_SECS: u64 = 180;
const DEFAULT_WINDOW_LOWER_SECS: u64 = 120;
const DEFAULT_EXPIRY_BUFFER_MS: u64 = 30_000;
const DEFAULT_EVENT_BUS_CAPACITY: usize = 64;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_COUNTDOWN_WARN_SECS: u64 = 60;

/// What the monitor does after a refresh attempt fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RefreshFailurePolicy {
    /// One attempt per window per approach to expiry; after a failure wait
    /// for the late window, an external refresh or a new session
    WaitForNextWindow,
    /// Retry on later ticks once an exponential backoff delay has elapsed
    RetryWithBackoff {
        max_attempts: usize,
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
}

impl RefreshFailurePolicy {
    /// Backoff schedule for `RetryWithBackoff`, `None` otherwise
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        match self {
            Self::WaitForNextWindow => None,
            Self::RetryWithBackoff {
                max_attempts,
                base_delay_ms,
                max_delay_ms,
            } => Some(RetryPolicy::exponential_backoff(
                *max_attempts,
                Duration::from_millis(*base_delay_ms),
                2.0,
                Some(Duration::from_millis(*max_delay_ms)),
            )),
        }
    }
}

impl Default for RefreshFailurePolicy {
    fn default() -> Self {
        default_failure_policy()
    }
}

/// Configuration for the session core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Endpoint the HTTP refresh client posts to
    #[serde(default = "default_refresh_url")]
    pub refresh_url: String,
    /// File backing the durable token store
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Scheduler tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound of the proactive refresh window, in seconds before expiry
    #[serde(default = "default_window_upper_secs")]
    pub window_upper_secs: u64,
    /// Lower bound of the proactive refresh window
    #[serde(default = "default_window_lower_secs")]
    pub window_lower_secs: u64,
    /// Margin before expiry at which a token counts as unusable
    #[serde(default = "default_expiry_buffer_ms")]
    pub expiry_buffer_ms: u64,
    /// Broadcast channel capacity of the event bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    /// Timeout for a single refresh request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Countdown shows an "expiring soon" warning below this many seconds
    #[serde(default = "default_countdown_warn_secs")]
    pub countdown_warn_secs: u64,
    /// Behaviour after a failed refresh
    #[serde(default = "default_failure_policy")]
    pub on_refresh_failure: RefreshFailurePolicy,
}

impl SessionConfig {
    /// Reject settings the monitor cannot work with
    pub fn validate(&self) -> SessionResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(config_invalid("tick_interval_ms", "must be greater than zero"));
        }
        if self.window_lower_secs >= self.window_upper_secs {
            return Err(config_invalid(
                "window_lower_secs",
                format!(
                    "must be below window_upper_secs ({} >= {})",
                    self.window_lower_secs, self.window_upper_secs
                ),
            ));
        }
        if self.refresh_url.trim().is_empty() {
            return Err(config_missing("refresh_url"));
        }
        if let RefreshFailurePolicy::RetryWithBackoff {
            max_attempts,
            base_delay_ms,
            ..
        } = &self.on_refresh_failure
        {
            if *max_attempts == 0 || *base_delay_ms == 0 {
                return Err(config_invalid(
                    "on_refresh_failure",
                    "retry_with_backoff needs max_attempts and base_delay_ms above zero",
                ));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.expiry_buffer_ms as i64)
    }
}

// Default functions
fn default_refresh_url() -> String {
    std::env::var("PUNCHCLOCK_REFRESH_URL").unwrap_or_else(|_| DEFAULT_REFRESH_URL.to_string())
}

fn default_storage_path() -> PathBuf {
    std::env::var("PUNCHCLOCK_STORAGE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORAGE_PATH))
}

fn default_tick_interval_ms() -> u64 {
    std::env::var("PUNCHCLOCK_TICK_INTERVAL_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_TICK_INTERVAL_MS)
}

fn default_window_upper_secs() -> u64 {
    std::env::var("PUNCHCLOCK_WINDOW_UPPER_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_WINDOW_UPPER_SECS)
}

fn default_window_lower_secs() -> u64 {
    std::env::var("PUNCHCLOCK_WINDOW_LOWER_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_WINDOW_LOWER_SECS)
}

fn default_expiry_buffer_ms() -> u64 {
    std::env::var("PUNCHCLOCK_EXPIRY_BUFFER_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_EXPIRY_BUFFER_MS)
}

fn default_event_bus_capacity() -> usize {
    std::env::var("PUNCHCLOCK_EVENT_BUS_CAPACITY")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_EVENT_BUS_CAPACITY)
}

fn default_request_timeout_ms() -> u64 {
    std::env::var("PUNCHCLOCK_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)
}

fn default_countdown_warn_secs() -> u64 {
    std::env::var("PUNCHCLOCK_COUNTDOWN_WARN_SECS")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_COUNTDOWN_WARN_SECS)
}

fn default_failure_policy() -> RefreshFailurePolicy {
    match std::env::var("PUNCHCLOCK_ON_REFRESH_FAILURE").as_deref() {
        Ok("retry_with_backoff") => RefreshFailurePolicy::RetryWithBackoff {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 30_000,
        },
        _ => RefreshFailurePolicy::WaitForNextWindow,
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_url: default_refresh_url(),
            storage_path: default_storage_path(),
            tick_interval_ms: default_tick_interval_ms(),
            window_upper_secs: default_window_upper_secs(),
            window_lower_secs: default_window_lower_secs(),
            expiry_buffer_ms: default_expiry_buffer_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            countdown_warn_secs: default_countdown_warn_secs(),
            on_refresh_failure: default_failure_policy(),
        }
    }
}

/// Load the session configuration from its default location
pub async fn load_config() -> Result<SessionConfig> {
    let path = get_config_path();
    let config = load_or_create_config(&path).await?;
    config.validate()?;
    Ok(config)
}

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PUNCHCLOCK_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from("punchclock.config.json")
}

/// Load configuration from file or create default
pub async fn load_or_create_config(path: &Path) -> Result<SessionConfig> {
    if !path.exists() {
        let default_config = SessionConfig::default();
        save_config(path, &default_config).await?;
        info!("Created default session configuration at {}", path.display());
        return Ok(default_config);
    }

    let config_str = fs::read_to_string(path).await?;
    let config: SessionConfig = serde_json::from_str(&config_str)?;
    debug!("Loaded session configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
pub async fn save_config(path: &Path, config: &SessionConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str).await?;
    debug!("Saved session configuration to {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"refresh_url":"https://hr.example.com/api/auth/refresh"}"#)
                .unwrap();

        assert_eq!(config.refresh_url, "https://hr.example.com/api/auth/refresh");
        assert!(config.window_upper_secs > config.window_lower_secs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_failure_policy_serialization() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"on_refresh_failure":{"mode":"retry_with_backoff","max_attempts":4,"base_delay_ms":1000,"max_delay_ms":8000}}"#,
        )
        .unwrap();

        assert_eq!(
            config.on_refresh_failure,
            RefreshFailurePolicy::RetryWithBackoff {
                max_attempts: 4,
                base_delay_ms: 1000,
                max_delay_ms: 8000
            }
        );
        let policy = config.on_refresh_failure.retry_policy().unwrap();
        assert_eq!(policy.max_retries, 4);

        let wait: RefreshFailurePolicy =
            serde_json::from_str(r#"{"mode":"wait_for_next_window"}"#).unwrap();
        assert_eq!(wait, RefreshFailurePolicy::WaitForNextWindow);
        assert!(wait.retry_policy().is_none());
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let config = SessionConfig {
            window_upper_secs: 100,
            window_lower_secs: 100,
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let config = SessionConfig {
            tick_interval_ms: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("session.json");

        let created = load_or_create_config(&path).await.unwrap();
        assert!(path.exists());

        let loaded = load_or_create_config(&path).await.unwrap();
        assert_eq!(loaded.window_upper_secs, created.window_upper_secs);
        assert_eq!(loaded.on_refresh_failure, created.on_refresh_failure);
    }
}
