use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token scheme used when the backend omits `token_type`
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Longest lifetime turned into an absolute expiry (about a century).
/// Anything beyond it is stored without an expiry.
pub const MAX_EXPIRES_IN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Response from a credential exchange or a refresh call.
///
/// This is the wire shape; `expires_in` is relative and turned into an
/// absolute expiry when the bundle is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The new access token
    pub access_token: String,
    /// A rotated refresh token, if the backend issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token scheme, usually "Bearer"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Seconds until the access token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Convenience constructor for an access token with a lifetime
    pub fn new(access_token: impl Into<String>, expires_in: Option<u64>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            expires_in,
        }
    }

    /// Attach a refresh token
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }
}

/// The active session's credentials and their validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    /// Opaque bearer credential
    pub access_token: String,
    /// Optional refresh credential
    pub refresh_token: Option<String>,
    /// Token scheme
    pub token_type: String,
    /// When this bundle was stored
    pub issued_at: DateTime<Utc>,
    /// When the access token expires; `None` means it never does
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenBundle {
    /// Build a bundle from a wire response, anchoring its expiry at `now`
    pub fn from_response(response: &TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| expiry_after(now, secs));

        Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            token_type: response
                .token_type
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
            issued_at: now,
            expires_at,
        }
    }

    /// Merge a refresh response into this bundle.
    ///
    /// Backends are allowed to omit the refresh token on rotation, in which
    /// case the previous one stays valid.
    pub fn refreshed(&self, response: &TokenResponse, now: DateTime<Utc>) -> Self {
        let mut next = Self::from_response(response, now);
        if next.refresh_token.is_none() {
            next.refresh_token = self.refresh_token.clone();
        }
        next
    }

    /// Remaining whole seconds at `now`, clamped at zero
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|exp| ((exp - now).num_milliseconds().div_euclid(1000)).max(0))
    }

    /// True when `now` is within `buffer` of expiry (or past it)
    pub fn is_expired_or_near_expiry(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp - buffer)
    }

    /// Value for an `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// `now + secs`, or `None` when the lifetime is out of range
fn expiry_after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    if secs > MAX_EXPIRES_IN_SECS {
        return None;
    }
    let secs = i64::try_from(secs).ok()?;
    now.checked_add_signed(Duration::try_seconds(secs)?)
}

/// Unverified claims embedded in a JWT-shaped access token.
///
/// Display and debugging only; nothing here is trusted for authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (the user id)
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issued-at, epoch seconds
    #[serde(default)]
    pub iat: Option<i64>,
    /// Expiry, epoch seconds
    #[serde(default)]
    pub exp: Option<i64>,
    /// Everything else in the payload
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Claims {
    /// Best-effort decode of the payload segment of a `header.payload.signature` token.
    ///
    /// Returns `None` for anything that is not a three-part token with a
    /// base64url JSON object in the middle.
    pub fn decode(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || payload.is_empty() {
            return None;
        }

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Get an arbitrary claim from the extra fields
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No bundle is stored
    NoSession,
    /// Bundle present, remaining validity above the refresh window
    Valid,
    /// Bundle present and inside the refresh window
    NearExpiry,
    /// A refresh call has been issued and not yet resolved
    RefreshInFlight,
    /// Bundle present but past its expiry
    Expired,
}

/// Derived state fanned out to observers on every scheduler tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// `None` when there is no session or the session never expires
    pub remaining_seconds: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn no_session(observed_at: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::NoSession,
            remaining_seconds: None,
            observed_at,
        }
    }
}
