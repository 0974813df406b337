pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod observers;

#[cfg(test)]
mod tests;

// Re-export core components
pub use crate::auth::{
    HttpRefreshClient, MonitorHandle, RefreshClient, RefreshOutcome, SessionMonitor,
    SessionSnapshot, SessionState, TickOutcome, TokenBundle, TokenResponse, TokenStore,
};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{RefreshFailurePolicy, SessionConfig};
pub use crate::error::{SessionError, SessionResult};
pub use crate::event_bus::{EventBus, SessionEvent, SessionEventKind, Subscription};
pub use crate::observers::{CountdownDisplay, GuardDecision, RouteGuard, SessionView};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
