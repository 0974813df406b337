use tracing::debug;

use super::SessionView;

/// Decision for a navigation into a protected view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    RedirectToLogin,
}

/// Gate for protected views
#[derive(Debug, Clone)]
pub struct RouteGuard {
    view: SessionView,
}

impl RouteGuard {
    pub fn new(view: SessionView) -> Self {
        Self { view }
    }

    /// Allow only while a token is held and has not expired
    pub fn check(&self) -> GuardDecision {
        if self.view.has_access_token() && !self.view.is_token_expired() {
            GuardDecision::Allow
        } else {
            debug!("No usable session, redirecting to login");
            GuardDecision::RedirectToLogin
        }
    }
}
