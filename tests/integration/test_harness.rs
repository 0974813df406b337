//! Integration test harness for the session core
//! Provides a wired-up monitor, a scripted refresh client and an event collector

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::Receiver;
use tokio::sync::Mutex;

use punchclock_session::auth::{FileStore, KeyValueStore, MemoryStore, RefreshError};
use punchclock_session::{
    EventBus, ManualClock, RefreshClient, SessionConfig, SessionEvent, SessionEventKind,
    SessionMonitor, TokenBundle, TokenResponse, TokenStore,
};

/// Refresh client that replays scripted results and counts calls
pub struct StubRefreshClient {
    results: std::sync::Mutex<VecDeque<Result<TokenResponse, RefreshError>>>,
    fallback: Result<TokenResponse, RefreshError>,
    calls: AtomicUsize,
}

impl StubRefreshClient {
    pub fn new(fallback: Result<TokenResponse, RefreshError>) -> Self {
        Self {
            results: std::sync::Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a result ahead of the fallback
    pub fn push(&self, result: Result<TokenResponse, RefreshError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshClient for StubRefreshClient {
    async fn refresh(&self, _current: &TokenBundle) -> Result<TokenResponse, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Let other tasks observe the in-flight state
        tokio::task::yield_now().await;
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Collects every event published on the bus from a background task
pub struct EventCollector {
    events: Arc<Mutex<Vec<SessionEvent>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl EventCollector {
    pub fn start(mut receiver: Receiver<SessionEvent>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                sink.lock().await.push(event);
            }
        });
        Self {
            events,
            _task: task,
        }
    }

    pub async fn kinds(&self) -> Vec<SessionEventKind> {
        self.events.lock().await.iter().map(|e| e.kind).collect()
    }

    pub async fn count(&self, kind: SessionEventKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Wait until at least `n` events of `kind` were collected
    pub async fn wait_for(&self, kind: SessionEventKind, n: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.count(kind).await < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Test environment for integration tests
pub struct TestEnvironment {
    pub clock: ManualClock,
    pub backend: Arc<dyn KeyValueStore>,
    pub store: Arc<TokenStore>,
    pub bus: EventBus,
    pub client: Arc<StubRefreshClient>,
    pub monitor: Arc<SessionMonitor>,
    pub events: EventCollector,
}

impl TestEnvironment {
    /// Environment over an in-memory backend
    pub fn new(client: StubRefreshClient, config: SessionConfig) -> Self {
        Self::with_backend(Arc::new(MemoryStore::new()), client, config, ManualClock::starting_now())
    }

    /// Environment over a session file at `path`
    pub fn with_file(
        path: &Path,
        client: StubRefreshClient,
        config: SessionConfig,
        clock: ManualClock,
    ) -> Self {
        let backend = Arc::new(FileStore::open(path).unwrap());
        Self::with_backend(backend, client, config, clock)
    }

    pub fn with_backend(
        backend: Arc<dyn KeyValueStore>,
        client: StubRefreshClient,
        config: SessionConfig,
        clock: ManualClock,
    ) -> Self {
        let store = Arc::new(
            TokenStore::with_clock(Arc::clone(&backend), Arc::new(clock.clone()))
                .with_expiry_buffer(config.expiry_buffer()),
        );
        store.init();

        let bus = EventBus::new(config.event_bus_capacity);
        let client = Arc::new(client);
        let monitor = SessionMonitor::new(Arc::clone(&store), client.clone(), bus.clone(), &config);
        let events = EventCollector::start(bus.receiver());

        Self {
            clock,
            backend,
            store,
            bus,
            client,
            monitor,
            events,
        }
    }

    /// Advance the clock one second at a time, ticking after each step
    pub async fn run_ticks(&self, seconds: usize) {
        for _ in 0..seconds {
            self.clock.advance_secs(1);
            self.monitor.tick().await;
        }
    }
}

/// Config with a fast scheduler for tests that start the real task
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        tick_interval_ms: 10,
        ..SessionConfig::default()
    }
}

pub fn token(access: &str, expires_in: u64) -> TokenResponse {
    TokenResponse::new(access, Some(expires_in)).with_refresh_token(format!("{}-refresh", access))
}
