//! Shared fixtures for the unit tests

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::auth::refresh::{RefreshClient, RefreshError};
use crate::auth::storage::MemoryStore;
use crate::auth::token::{TokenBundle, TokenResponse};
use crate::auth::token_store::TokenStore;
use crate::clock::{Clock, ManualClock};
use crate::config::SessionConfig;
use crate::event_bus::{EventBus, SessionEventKind, Subscription};
use crate::SessionMonitor;

/// Refresh client that replays scripted results
pub struct StubRefreshClient {
    scripted: Mutex<VecDeque<Result<TokenResponse, RefreshError>>>,
    fallback: Result<TokenResponse, RefreshError>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl StubRefreshClient {
    /// Always answer with `fallback`
    pub fn returning(fallback: Result<TokenResponse, RefreshError>) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer with `results` in order, then with `fallback`
    pub fn scripted(
        results: Vec<Result<TokenResponse, RefreshError>>,
        fallback: Result<TokenResponse, RefreshError>,
    ) -> Self {
        Self {
            scripted: Mutex::new(results.into()),
            ..Self::returning(fallback)
        }
    }

    /// Block every call until `gate` is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RefreshClient for StubRefreshClient {
    async fn refresh(&self, _current: &TokenBundle) -> Result<TokenResponse, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.scripted.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Manual clock that can run a one-shot action on its next read.
///
/// Lets a test land a call at an exact point inside the monitor, e.g. right
/// as a refresh result is about to be stored.
#[derive(Clone)]
pub struct HookedClock {
    inner: ManualClock,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl HookedClock {
    pub fn new(inner: ManualClock) -> Self {
        Self {
            inner,
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `action` the next time the clock is read
    pub fn arm(&self, action: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(action));
    }
}

impl Clock for HookedClock {
    fn now(&self) -> DateTime<Utc> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(action) = hook {
            action();
        }
        self.inner.now()
    }
}

/// Monitor wired to a memory store, a manual clock and a stub client
pub struct Fixture {
    pub monitor: Arc<SessionMonitor>,
    pub store: Arc<TokenStore>,
    pub bus: EventBus,
    pub clock: ManualClock,
    pub hook: HookedClock,
    pub client: Arc<StubRefreshClient>,
}

impl Fixture {
    pub fn new(client: StubRefreshClient) -> Self {
        Self::with_config(client, SessionConfig::default())
    }

    pub fn with_config(client: StubRefreshClient, config: SessionConfig) -> Self {
        let clock = ManualClock::starting_now();
        let hook = HookedClock::new(clock.clone());
        let store = Arc::new(TokenStore::with_clock(
            Arc::new(MemoryStore::new()),
            Arc::new(hook.clone()),
        ));
        let bus = EventBus::new(32);
        let client = Arc::new(client);
        let monitor = SessionMonitor::new(
            Arc::clone(&store),
            client.clone(),
            bus.clone(),
            &config,
        );

        Self {
            monitor,
            store,
            bus,
            clock,
            hook,
            client,
        }
    }

    /// Record the kind of every event published from now on
    pub fn record_events(&self) -> (Arc<Mutex<Vec<SessionEventKind>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = self
            .bus
            .subscribe(move |event| sink.lock().unwrap().push(event.kind));
        (seen, subscription)
    }
}

pub fn token(access: &str, expires_in: u64) -> TokenResponse {
    TokenResponse::new(access, Some(expires_in)).with_refresh_token(format!("{}-refresh", access))
}

/// Yield until `condition` holds, giving spawned tasks a chance to run
pub async fn yield_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// Poll a future once, for futures that finish without waiting
pub fn poll_ready<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(NoopWake));
    let mut cx = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(output) => output,
        Poll::Pending => panic!("future was not ready"),
    }
}
