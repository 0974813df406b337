//! Read-only consumers of the session: countdown display and route guard.
//!
//! Observers never write to the token store. They read remaining time
//! through a [`SessionView`] and listen on the event bus to re-arm their
//! local "already acted" flags.

mod countdown;
mod route_guard;

use std::sync::Arc;

use crate::auth::token::Claims;
use crate::auth::token_store::TokenStore;

pub use countdown::{format_remaining, CountdownDisplay, CountdownFrame};
pub use route_guard::{GuardDecision, RouteGuard};

/// Read-only window onto the token store
#[derive(Clone)]
pub struct SessionView {
    store: Arc<TokenStore>,
}

impl SessionView {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.store.get_access_token()
    }

    /// `None` means there is no countdown to show
    pub fn get_remaining_seconds(&self) -> Option<i64> {
        self.store.get_remaining_seconds()
    }

    pub fn has_access_token(&self) -> bool {
        self.store.has_access_token()
    }

    pub fn is_token_expired(&self) -> bool {
        self.store.is_token_expired()
    }

    pub fn needs_refresh(&self) -> bool {
        self.store.needs_refresh()
    }

    /// Unverified claims for display (user name, roles)
    pub fn decode_claims(&self) -> Option<Claims> {
        self.store.decode_claims()
    }
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("has_access_token", &self.has_access_token())
            .field("remaining_seconds", &self.get_remaining_seconds())
            .finish()
    }
}
