use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured error type for session operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionError {
    /// Error code for programmatic handling
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional context for additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Severity level
    pub severity: ErrorSeverity,
    /// Error category for retry policies and handling strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl SessionError {
    /// Create a new error builder with the specified error code
    pub fn new(code: ErrorCode) -> SessionErrorBuilder {
        SessionErrorBuilder {
            code,
            message: String::new(),
            context: None,
            severity: ErrorSeverity::Error,
            category: None,
        }
    }

    /// Whether the failure is worth another attempt later
    pub fn is_retryable(&self) -> bool {
        self.category.map_or(false, |c| c.is_retryable())
    }
}

/// Builder for creating SessionError instances
pub struct SessionErrorBuilder {
    code: ErrorCode,
    message: String,
    context: Option<String>,
    severity: ErrorSeverity,
    category: Option<ErrorCategory>,
}

impl SessionErrorBuilder {
    /// Set the error message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the error context
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the error category
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Build the final SessionError
    pub fn build(self) -> SessionError {
        SessionError {
            code: self.code,
            message: self.message,
            context: self.context,
            severity: self.severity,
            category: self.category,
        }
    }
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // General errors
    Internal,

    // Token errors
    TokenInvalid,

    // Refresh errors
    RefreshFailed,
    RefreshTokenInvalid,
    RefreshTokenMissing,

    // Network errors
    NetworkTimeout,
    NetworkFailure,
    ServerError,

    // Configuration related errors
    ConfigInvalid,
    ConfigMissing,
}

/// Session error types using thiserror
#[derive(Error, Debug, Clone)]
pub enum SessionErrorType {
    #[error("Access token is invalid: {reason}")]
    TokenInvalid { reason: String },

    #[error("Token refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("Refresh credential was rejected: {reason}")]
    RefreshTokenInvalid { reason: String },

    #[error("No refresh credential is available")]
    RefreshTokenMissing,

    #[error("Network timeout during {operation}")]
    NetworkTimeout { operation: String },

    #[error("Network failure: {reason}")]
    NetworkFailure { reason: String },

    #[error("Server responded with status {status}")]
    ServerError { status: u16 },

    #[error("Invalid configuration for '{key}': {reason}")]
    ConfigInvalid { key: String, reason: String },

    #[error("Missing configuration: {key}")]
    ConfigMissing { key: String },
}

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Informational messages that don't impact functionality
    Info,
    /// Warnings that might impact functionality but don't stop operation
    Warning,
    /// Errors that impact functionality but allow continued operation
    Error,
    /// Critical errors that prevent the session from functioning properly
    Critical,
}

/// Error categories for different retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary network issues, timeouts, etc. - usually retryable
    Network,
    /// The refresh credential was rejected - needs a new sign-in
    Authentication,
    /// Backend returned a server error - retryable with backoff
    ServiceUnavailable,
    /// Durable storage misbehaved - handled locally
    Storage,
    /// Configuration errors - not retryable without reconfiguration
    Configuration,
    /// Internal errors in our code - generally not retryable
    Internal,
    /// Validation errors - not retryable without input changes
    Validation,
}

impl ErrorCategory {
    /// Returns true if errors in this category are generally retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::ServiceUnavailable => true,

            Self::Authentication
            | Self::Storage
            | Self::Configuration
            | Self::Internal
            | Self::Validation => false,
        }
    }
}

/// Retry policy used when refresh failures are retried with backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Backoff factor for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Option<Duration>,
    /// Whether to add jitter to the delay
    pub use_jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn exponential_backoff(
        max_retries: usize,
        base_delay: Duration,
        backoff_factor: f64,
        max_delay: Option<Duration>,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            max_delay,
            use_jitter: true,
        }
    }

    /// Disable jitter, mostly useful for deterministic tests
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Calculate the delay for a specific retry attempt
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 || attempt > self.max_retries {
            return Duration::from_millis(0);
        }

        let mut delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_factor.powf((attempt - 1) as f64);

        // Add up to 25% jitter so several consoles don't hammer the backend together
        if self.use_jitter {
            delay_ms *= 1.0 + fastrand::f64() * 0.25;
        }

        if let Some(max_delay) = self.max_delay {
            delay_ms = delay_ms.min(max_delay.as_millis() as f64);
        }

        Duration::from_millis(delay_ms as u64)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{}: {} ({})", self.code, self.message, context)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Internal => write!(f, "INTERNAL"),
            ErrorCode::TokenInvalid => write!(f, "TOKEN_INVALID"),
            ErrorCode::RefreshFailed => write!(f, "REFRESH_FAILED"),
            ErrorCode::RefreshTokenInvalid => write!(f, "REFRESH_TOKEN_INVALID"),
            ErrorCode::RefreshTokenMissing => write!(f, "REFRESH_TOKEN_MISSING"),
            ErrorCode::NetworkTimeout => write!(f, "NETWORK_TIMEOUT"),
            ErrorCode::NetworkFailure => write!(f, "NETWORK_FAILURE"),
            ErrorCode::ServerError => write!(f, "SERVER_ERROR"),
            ErrorCode::ConfigInvalid => write!(f, "CONFIG_INVALID"),
            ErrorCode::ConfigMissing => write!(f, "CONFIG_MISSING"),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Authentication => write!(f, "Authentication"),
            ErrorCategory::ServiceUnavailable => write!(f, "ServiceUnavailable"),
            ErrorCategory::Storage => write!(f, "Storage"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Validation => write!(f, "Validation"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SessionErrorType> for SessionError {
    fn from(err: SessionErrorType) -> Self {
        let message = err.to_string();
        let (code, category, severity) = match &err {
            SessionErrorType::TokenInvalid { .. } => (
                ErrorCode::TokenInvalid,
                ErrorCategory::Validation,
                ErrorSeverity::Error,
            ),
            SessionErrorType::RefreshFailed { .. } => (
                ErrorCode::RefreshFailed,
                ErrorCategory::ServiceUnavailable,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::RefreshTokenInvalid { .. } => (
                ErrorCode::RefreshTokenInvalid,
                ErrorCategory::Authentication,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::RefreshTokenMissing => (
                ErrorCode::RefreshTokenMissing,
                ErrorCategory::Authentication,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::NetworkTimeout { .. } => (
                ErrorCode::NetworkTimeout,
                ErrorCategory::Network,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::NetworkFailure { .. } => (
                ErrorCode::NetworkFailure,
                ErrorCategory::Network,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::ServerError { .. } => (
                ErrorCode::ServerError,
                ErrorCategory::ServiceUnavailable,
                ErrorSeverity::Warning,
            ),
            SessionErrorType::ConfigInvalid { .. } => (
                ErrorCode::ConfigInvalid,
                ErrorCategory::Configuration,
                ErrorSeverity::Critical,
            ),
            SessionErrorType::ConfigMissing { .. } => (
                ErrorCode::ConfigMissing,
                ErrorCategory::Configuration,
                ErrorSeverity::Critical,
            ),
        };

        SessionError::new(code)
            .message(message)
            .category(category)
            .severity(severity)
            .build()
    }
}

/// Custom Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Create a configuration validation error
pub fn config_invalid(key: &str, reason: impl fmt::Display) -> SessionError {
    SessionErrorType::ConfigInvalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Create a missing configuration error
pub fn config_missing(key: &str) -> SessionError {
    SessionErrorType::ConfigMissing {
        key: key.to_string(),
    }
    .into()
}

/// Create an invalid token error
pub fn token_invalid(reason: impl fmt::Display) -> SessionError {
    SessionErrorType::TokenInvalid {
        reason: reason.to_string(),
    }
    .into()
}
