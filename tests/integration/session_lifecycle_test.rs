//! End-to-end session lifecycle tests

use std::sync::Arc;

use punchclock_session::auth::{KeyValueStore, RefreshError, UnavailableStore};
use punchclock_session::{
    GuardDecision, ManualClock, RouteGuard, SessionConfig, SessionEventKind, SessionState,
    TickOutcome,
};

use crate::test_harness::{fast_config, token, StubRefreshClient, TestEnvironment};

#[tokio::test]
async fn test_refreshed_session_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let clock = ManualClock::starting_now();

    {
        let env = TestEnvironment::with_file(
            &path,
            StubRefreshClient::new(Ok(token("next", 200))),
            SessionConfig::default(),
            clock.clone(),
        );
        env.monitor.establish(&token("first", 200)).unwrap();
        env.run_ticks(30).await;

        assert_eq!(env.client.calls(), 1);
        assert!(env.events.wait_for(SessionEventKind::TokenRefreshed, 1).await);
        assert_eq!(env.events.count(SessionEventKind::TokenRefreshed).await, 1);
        assert_eq!(env.store.get_remaining_seconds(), Some(190));
    }

    // A new process picks the refreshed bundle up from disk
    let restarted = TestEnvironment::with_file(
        &path,
        StubRefreshClient::new(Err(RefreshError::Timeout)),
        SessionConfig::default(),
        clock.clone(),
    );
    assert_eq!(restarted.store.get_access_token().as_deref(), Some("next"));
    assert_eq!(
        restarted.store.get_refresh_token().as_deref(),
        Some("next-refresh")
    );
    assert_eq!(restarted.store.get_remaining_seconds(), Some(190));
    assert_eq!(restarted.monitor.state(), SessionState::Valid);
}

#[tokio::test]
async fn test_hard_expiry_evicts_persisted_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let clock = ManualClock::starting_now();

    {
        let env = TestEnvironment::with_file(
            &path,
            StubRefreshClient::new(Err(RefreshError::Network("offline".into()))),
            SessionConfig::default(),
            clock.clone(),
        );
        env.monitor.establish(&token("first", 60)).unwrap();
        let guard = RouteGuard::new(env.monitor.view());
        assert_eq!(guard.check(), GuardDecision::Allow);

        env.run_ticks(60).await;

        assert!(env.events.wait_for(SessionEventKind::TokenExpired, 1).await);
        // Late window only: a single attempt before expiry
        assert_eq!(env.client.calls(), 1);
        assert_eq!(env.events.count(SessionEventKind::RefreshFailed).await, 1);
        assert_eq!(guard.check(), GuardDecision::RedirectToLogin);
    }

    let restarted = TestEnvironment::with_file(
        &path,
        StubRefreshClient::new(Err(RefreshError::Timeout)),
        SessionConfig::default(),
        clock,
    );
    assert!(!restarted.store.has_access_token());
    assert_eq!(restarted.monitor.state(), SessionState::NoSession);
}

#[tokio::test]
async fn test_scheduler_refreshes_in_background() {
    let env = TestEnvironment::new(StubRefreshClient::new(Ok(token("next", 600))), fast_config());
    env.monitor.establish(&token("first", 150)).unwrap();

    let handle = env.monitor.start().unwrap();
    assert!(env.events.wait_for(SessionEventKind::TokenRefreshed, 1).await);

    let mut snapshots = handle.subscribe_snapshots();
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow().state, SessionState::Valid);

    handle.shutdown().await.unwrap();
    assert_eq!(env.client.calls(), 1);
    assert_eq!(env.store.get_access_token().as_deref(), Some("next"));
}

#[tokio::test]
async fn test_scheduler_forces_logout_on_expiry() {
    let env = TestEnvironment::new(
        StubRefreshClient::new(Err(RefreshError::Server { status: 502 })),
        fast_config(),
    );
    env.monitor.establish(&token("first", 100)).unwrap();

    let handle = env.monitor.start().unwrap();
    assert!(env.events.wait_for(SessionEventKind::RefreshFailed, 1).await);

    env.clock.advance_secs(100);
    assert!(env.events.wait_for(SessionEventKind::TokenExpired, 1).await);
    handle.shutdown().await.unwrap();

    assert!(!env.store.has_access_token());
    assert_eq!(env.client.calls(), 1);
    assert_eq!(
        env.events.kinds().await,
        vec![
            SessionEventKind::SessionStarted,
            SessionEventKind::RefreshFailed,
            SessionEventKind::TokenExpired,
        ]
    );
}

#[tokio::test]
async fn test_session_works_without_durable_storage() {
    let env = TestEnvironment::with_backend(
        Arc::new(UnavailableStore::new("storage disabled")),
        StubRefreshClient::new(Ok(token("next", 900))),
        SessionConfig::default(),
        ManualClock::starting_now(),
    );
    assert_eq!(env.monitor.state(), SessionState::NoSession);

    env.monitor.establish(&token("first", 200)).unwrap();
    env.run_ticks(25).await;

    assert_eq!(env.store.get_access_token().as_deref(), Some("next"));
    assert!(env.backend.get("session.access_token").is_err());

    env.monitor.logout();
    assert!(env.events.wait_for(SessionEventKind::Logout, 1).await);
    assert_eq!(env.monitor.tick().await, TickOutcome::NoSession);
}
