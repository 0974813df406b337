use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::auth::storage::{KeyValueStore, StorageError};
use crate::auth::token::{Claims, TokenBundle, TokenResponse, DEFAULT_TOKEN_TYPE};
use crate::clock::{Clock, SystemClock};

/// Well-known keys the session record is spread over
pub const ACCESS_TOKEN_KEY: &str = "session.access_token";
pub const REFRESH_TOKEN_KEY: &str = "session.refresh_token";
pub const TOKEN_TYPE_KEY: &str = "session.token_type";
pub const ISSUED_AT_KEY: &str = "session.issued_at";
pub const EXPIRES_AT_KEY: &str = "session.expires_at";
pub const INTEGRITY_KEY: &str = "session.integrity";

const SESSION_KEYS: [&str; 6] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_TYPE_KEY,
    ISSUED_AT_KEY,
    EXPIRES_AT_KEY,
    INTEGRITY_KEY,
];

/// Outcome of reading the persisted record
enum Restored {
    Empty,
    Bundle(TokenBundle),
    Corrupt(String),
}

/// Single source of truth for the active token bundle.
///
/// Readers go through an in-memory cache that is replaced in one write, so
/// nobody ever sees a half-updated bundle. The durable backend is written
/// after the cache and only on a best-effort basis: storage failures are
/// logged and swallowed so the console keeps working without persistence.
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<TokenBundle>>,
    expiry_buffer: Duration,
}

impl TokenStore {
    /// Create a store over `backend` using the system clock
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Create a store with an explicit clock
    pub fn with_clock(backend: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            current: RwLock::new(None),
            expiry_buffer: Duration::zero(),
        }
    }

    /// Buffer used by `needs_refresh`
    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Restore the bundle from durable storage; call once on start-up.
    ///
    /// Returns whether a session was restored.
    pub fn init(&self) -> bool {
        match self.restore() {
            Restored::Bundle(bundle) => {
                info!(
                    expires_at = ?bundle.expires_at,
                    "Restored session from storage"
                );
                *self.write_guard() = Some(bundle);
                true
            }
            Restored::Empty => {
                debug!("No persisted session found");
                false
            }
            Restored::Corrupt(reason) => {
                error!(reason = %reason, "Persisted session is corrupt, discarding it");
                self.clear();
                false
            }
        }
    }

    /// Store a fresh bundle built from a wire response
    pub fn save(&self, response: &TokenResponse) -> TokenBundle {
        let bundle = TokenBundle::from_response(response, self.clock.now());
        self.save_bundle(bundle.clone());
        bundle
    }

    /// Replace the active bundle
    pub fn save_bundle(&self, bundle: TokenBundle) {
        self.save_bundle_if(bundle, || true);
    }

    /// Replace the active bundle if `still_wanted` holds once the write lock
    /// is taken.
    ///
    /// The lock is held through persistence, so the check, the cache write
    /// and the durable write land as one step relative to every other save
    /// and clear. Returns whether the bundle was stored.
    pub fn save_bundle_if(
        &self,
        bundle: TokenBundle,
        still_wanted: impl FnOnce() -> bool,
    ) -> bool {
        let mut current = self.write_guard();
        if !still_wanted() {
            debug!("Session write skipped, it is no longer wanted");
            return false;
        }
        *current = Some(bundle.clone());

        if let Err(e) = self.persist(&bundle) {
            warn!(error = %e, "Failed to persist session, keeping it in memory only");
        } else {
            debug!(expires_at = ?bundle.expires_at, "Session persisted");
        }
        true
    }

    /// Remove every trace of the session; idempotent
    pub fn clear(&self) {
        self.clear_with(|| {});
    }

    /// Clear the session, running `before_clear` under the same write lock
    pub fn clear_with(&self, before_clear: impl FnOnce()) {
        let mut current = self.write_guard();
        before_clear();
        *current = None;

        let result = SESSION_KEYS
            .iter()
            .try_for_each(|key| self.backend.delete(key).map(|_| ()))
            .and_then(|_| self.backend.save());

        match result {
            Ok(()) => debug!("Session cleared"),
            Err(e) => warn!(error = %e, "Failed to clear persisted session"),
        }
    }

    /// Copy of the active bundle
    pub fn snapshot(&self) -> Option<TokenBundle> {
        self.read_guard().clone()
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.read_guard().as_ref().map(|b| b.access_token.clone())
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.read_guard()
            .as_ref()
            .and_then(|b| b.refresh_token.clone())
    }

    /// Whole seconds of validity left, or `None` when expiry isn't managed
    pub fn get_remaining_seconds(&self) -> Option<i64> {
        let now = self.clock.now();
        self.read_guard()
            .as_ref()
            .and_then(|b| b.remaining_seconds(now))
    }

    /// True when the token is unusable `buffer` before its real expiry.
    ///
    /// With no bundle there is nothing usable, so this is true; a bundle
    /// without an expiry never reports true.
    pub fn is_expired_or_near_expiry(&self, buffer: Duration) -> bool {
        let now = self.clock.now();
        match self.read_guard().as_ref() {
            Some(bundle) => bundle.is_expired_or_near_expiry(now, buffer),
            None => true,
        }
    }

    pub fn has_access_token(&self) -> bool {
        self.read_guard().is_some()
    }

    pub fn is_token_expired(&self) -> bool {
        self.is_expired_or_near_expiry(Duration::zero())
    }

    /// Expired or within the configured expiry buffer
    pub fn needs_refresh(&self) -> bool {
        self.is_expired_or_near_expiry(self.expiry_buffer)
    }

    /// Unverified claims of the current access token, for display only
    pub fn decode_claims(&self) -> Option<Claims> {
        let token = self.get_access_token()?;
        let claims = Claims::decode(&token);
        if claims.is_none() {
            debug!("Access token does not carry decodable claims");
        }
        claims
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Option<TokenBundle>> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Option<TokenBundle>> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, bundle: &TokenBundle) -> Result<(), StorageError> {
        self.backend
            .set(ACCESS_TOKEN_KEY, json!(bundle.access_token))?;
        match &bundle.refresh_token {
            Some(rt) => self.backend.set(REFRESH_TOKEN_KEY, json!(rt))?,
            None => {
                self.backend.delete(REFRESH_TOKEN_KEY)?;
            }
        }
        self.backend.set(TOKEN_TYPE_KEY, json!(bundle.token_type))?;
        self.backend
            .set(ISSUED_AT_KEY, json!(bundle.issued_at.to_rfc3339()))?;
        match bundle.expires_at {
            Some(exp) => self.backend.set(EXPIRES_AT_KEY, json!(exp.to_rfc3339()))?,
            None => {
                self.backend.delete(EXPIRES_AT_KEY)?;
            }
        }
        self.backend
            .set(INTEGRITY_KEY, json!(integrity_hash(bundle)))?;
        self.backend.save()
    }

    fn restore(&self) -> Restored {
        match self.read_record() {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "Session storage unreadable, starting without a session");
                Restored::Empty
            }
        }
    }

    fn read_record(&self) -> Result<Restored, StorageError> {
        let access_token = match self.backend.get(ACCESS_TOKEN_KEY)? {
            Some(Value::String(token)) if !token.is_empty() => token,
            Some(_) => return Ok(Restored::Corrupt("access token is not a string".into())),
            None => return Ok(Restored::Empty),
        };

        let refresh_token = self
            .backend
            .get(REFRESH_TOKEN_KEY)?
            .and_then(|v| v.as_str().map(str::to_string));

        let token_type = self
            .backend
            .get(TOKEN_TYPE_KEY)?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        let issued_at = match parse_timestamp(self.backend.get(ISSUED_AT_KEY)?) {
            Ok(Some(ts)) => ts,
            Ok(None) => self.clock.now(),
            Err(reason) => return Ok(Restored::Corrupt(format!("issued_at: {}", reason))),
        };

        let expires_at = match parse_timestamp(self.backend.get(EXPIRES_AT_KEY)?) {
            Ok(ts) => ts,
            Err(reason) => return Ok(Restored::Corrupt(format!("expires_at: {}", reason))),
        };

        let bundle = TokenBundle {
            access_token,
            refresh_token,
            token_type,
            issued_at,
            expires_at,
        };

        match self.backend.get(INTEGRITY_KEY)? {
            Some(Value::String(stored)) if stored != integrity_hash(&bundle) => {
                Ok(Restored::Corrupt("integrity check failed".into()))
            }
            Some(Value::String(_)) => Ok(Restored::Bundle(bundle)),
            _ => {
                debug!("Persisted session has no integrity hash, accepting it");
                Ok(Restored::Bundle(bundle))
            }
        }
    }
}

fn parse_timestamp(value: Option<Value>) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| e.to_string()),
        Some(other) => Err(format!("unexpected value {}", other)),
    }
}

/// Hash over the fields that matter, to detect a tampered or torn record
fn integrity_hash(bundle: &TokenBundle) -> String {
    let token_string = format!(
        "{}:{}:{}:{}",
        bundle.access_token,
        bundle.refresh_token.as_deref().unwrap_or(""),
        bundle.token_type,
        bundle.expires_at.map_or_else(String::new, |e| e.to_rfc3339())
    );

    let mut hasher = Sha256::new();
    hasher.update(token_string.as_bytes());
    format!("{:x}", hasher.finalize())
}
