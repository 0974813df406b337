//! Monitor driving the HTTP refresh client against a mock backend

use std::sync::Arc;
use std::time::Duration;

use punchclock_session::auth::MemoryStore;
use punchclock_session::{
    EventBus, HttpRefreshClient, ManualClock, RefreshOutcome, SessionConfig, SessionEventKind,
    SessionMonitor, TickOutcome, TokenStore,
};

use crate::test_harness::{token, EventCollector};

fn monitor_for(server: &mockito::Server) -> (Arc<SessionMonitor>, Arc<TokenStore>, EventCollector) {
    let clock = ManualClock::starting_now();
    let store = Arc::new(TokenStore::with_clock(
        Arc::new(MemoryStore::new()),
        Arc::new(clock),
    ));
    let client = HttpRefreshClient::new(
        format!("{}/api/auth/refresh", server.url()),
        Duration::from_secs(5),
    )
    .unwrap();
    let bus = EventBus::new(16);
    let events = EventCollector::start(bus.receiver());
    let monitor = SessionMonitor::new(
        Arc::clone(&store),
        Arc::new(client),
        bus,
        &SessionConfig::default(),
    );
    (monitor, store, events)
}

#[tokio::test]
async fn test_monitor_refreshes_over_http() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/auth/refresh")
        .match_header("authorization", "Bearer first")
        .match_body(mockito::Matcher::Json(
            serde_json::json!({"refresh_token": "first-refresh"}),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"second","expires_in":900,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;

    let (monitor, store, events) = monitor_for(&server);
    monitor.establish(&token("first", 150)).unwrap();

    assert_eq!(
        monitor.tick().await,
        TickOutcome::Refresh(RefreshOutcome::Refreshed {
            remaining_seconds: Some(900)
        })
    );
    mock.assert_async().await;

    assert_eq!(store.get_access_token().as_deref(), Some("second"));
    // No rotation in the response, so the old refresh token is kept
    assert_eq!(store.get_refresh_token().as_deref(), Some("first-refresh"));
    assert!(events.wait_for(SessionEventKind::TokenRefreshed, 1).await);
}

#[tokio::test]
async fn test_rejected_refresh_keeps_session() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/auth/refresh")
        .with_status(401)
        .with_body("expired refresh token")
        .expect(1)
        .create_async()
        .await;

    let (monitor, store, events) = monitor_for(&server);
    monitor.establish(&token("first", 150)).unwrap();

    assert!(matches!(
        monitor.tick().await,
        TickOutcome::Refresh(RefreshOutcome::Failed(_))
    ));
    // The failure policy holds back a second call in the same window
    assert!(matches!(monitor.tick().await, TickOutcome::Deferred { .. }));
    mock.assert_async().await;

    assert_eq!(store.get_access_token().as_deref(), Some("first"));
    assert!(events.wait_for(SessionEventKind::RefreshFailed, 1).await);
}
