use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::token::{TokenBundle, TokenResponse};
use crate::error::{SessionError, SessionErrorType};

/// Why a refresh call failed.
///
/// The monitor treats every variant the same way; the distinction exists
/// for logging and for callers that subscribe to failure events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error("network error: {0}")]
    Network(String),

    #[error("refresh request timed out")]
    Timeout,

    #[error("refresh credential rejected: {0}")]
    InvalidRefreshToken(String),

    #[error("server error ({status})")]
    Server { status: u16 },

    #[error("no refresh credential available")]
    MissingRefreshToken,

    #[error("could not decode refresh response: {0}")]
    Decode(String),
}

impl From<RefreshError> for SessionError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Network(reason) => SessionErrorType::NetworkFailure { reason },
            RefreshError::Timeout => SessionErrorType::NetworkTimeout {
                operation: "token refresh".to_string(),
            },
            RefreshError::InvalidRefreshToken(reason) => {
                SessionErrorType::RefreshTokenInvalid { reason }
            }
            RefreshError::Server { status } => SessionErrorType::ServerError { status },
            RefreshError::MissingRefreshToken => SessionErrorType::RefreshTokenMissing,
            RefreshError::Decode(reason) => SessionErrorType::RefreshFailed { reason },
        }
        .into()
    }
}

/// Trades the current bundle for a new one in a single round trip.
///
/// Implementations must not retry; retry policy belongs to the monitor.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn refresh(&self, current: &TokenBundle) -> Result<TokenResponse, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Refresh client for the console backend's JSON refresh endpoint
pub struct HttpRefreshClient {
    http: reqwest::Client,
    refresh_url: String,
    /// Send the request even without a refresh token, relying on a cookie
    allow_cookie_refresh: bool,
}

impl HttpRefreshClient {
    /// Build a client for `refresh_url` with the given request timeout
    pub fn new(refresh_url: impl Into<String>, timeout: Duration) -> Result<Self, RefreshError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        Ok(Self::with_client(http, refresh_url))
    }

    /// Use an existing reqwest client
    pub fn with_client(http: reqwest::Client, refresh_url: impl Into<String>) -> Self {
        Self {
            http,
            refresh_url: refresh_url.into(),
            allow_cookie_refresh: false,
        }
    }

    /// Allow refreshing with only the re-auth cookie when no refresh token is stored
    pub fn allow_cookie_refresh(mut self, allow: bool) -> Self {
        self.allow_cookie_refresh = allow;
        self
    }
}

#[async_trait]
impl RefreshClient for HttpRefreshClient {
    async fn refresh(&self, current: &TokenBundle) -> Result<TokenResponse, RefreshError> {
        let refresh_token = match current.refresh_token.as_deref() {
            Some(rt) => rt,
            None if self.allow_cookie_refresh => "",
            None => return Err(RefreshError::MissingRefreshToken),
        };

        debug!(url = %self.refresh_url, "Requesting token refresh");

        let resp = self
            .http
            .post(&self.refresh_url)
            .header(reqwest::header::AUTHORIZATION, current.authorization_header())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RefreshError::Timeout
                } else {
                    RefreshError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %text, "Refresh endpoint rejected request");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => {
                    RefreshError::InvalidRefreshToken(text)
                }
                _ => RefreshError::Server {
                    status: status.as_u16(),
                },
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RefreshError::Decode(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(RefreshError::Decode("empty access token".to_string()));
        }

        Ok(token)
    }
}
