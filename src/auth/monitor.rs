//! Session lifecycle state machine.
//!
//! The monitor derives the session state from the token store on every
//! tick, refreshes the bundle while it sits inside the refresh window, and
//! forces a logout once it runs out. Exactly one refresh may be in flight
//! per monitor; outcomes are broadcast on the event bus.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::auth::refresh::{RefreshClient, RefreshError};
use crate::auth::token::{SessionSnapshot, SessionState, TokenBundle, TokenResponse};
use crate::auth::token_store::TokenStore;
use crate::config::{RefreshFailurePolicy, SessionConfig};
use crate::error::{token_invalid, ErrorCode, SessionError, SessionResult};
use crate::event_bus::{EventBus, SessionEvent, SessionEventKind, Subscription};
use crate::observers::SessionView;

/// Event source names used by the monitor
pub const MONITOR_SOURCE: &str = "monitor";
pub const SCHEDULER_SOURCE: &str = "scheduler";
pub const ESTABLISH_SOURCE: &str = "establish";
pub const LOGOUT_SOURCE: &str = "logout";
pub const EXTERNAL_SOURCE: &str = "external";

/// Which part of the approach to expiry a refresh was attempted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshWindow {
    /// `(window_lower, window_upper]` seconds left
    Proactive,
    /// `(0, window_lower]` seconds left
    Late,
}

/// Result of a single refresh attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New bundle stored and `TokenRefreshed` published
    Refreshed { remaining_seconds: Option<i64> },
    /// The client failed; the old bundle is kept
    Failed(RefreshError),
    /// Another refresh holds the flag; nothing was done
    AlreadyInFlight,
    /// There is nothing to refresh
    NoSession,
    /// The monitor was torn down or reset while the call was pending
    Discarded,
}

/// What a scheduler tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoSession,
    /// Outside the refresh window, or the session never expires
    Valid { remaining_seconds: Option<i64> },
    /// Inside a window, but the failure policy holds the next attempt back
    Deferred {
        window: RefreshWindow,
        remaining_seconds: i64,
    },
    Refresh(RefreshOutcome),
    /// The session ran out and was cleared
    Expired,
}

enum TickPlan {
    NoSession,
    Valid(Option<i64>),
    InFlight,
    Deferred(RefreshWindow, i64),
    Refresh(RefreshWindow),
    Expire,
}

/// Failure bookkeeping for one approach to expiry.
///
/// An approach is identified by the expiry of the bundle it belongs to, so a
/// new bundle from any writer starts a fresh approach.
#[derive(Debug, Default)]
struct FailureState {
    approach: Option<DateTime<Utc>>,
    proactive_failed: bool,
    late_failed: bool,
    failures: usize,
    next_retry_at: Option<DateTime<Utc>>,
}

impl FailureState {
    fn sync_with(&mut self, expires_at: Option<DateTime<Utc>>) {
        if self.approach != expires_at {
            *self = FailureState {
                approach: expires_at,
                ..FailureState::default()
            };
        }
    }
}

/// Holds the in-flight flag for one refresh attempt.
///
/// The flag stores the ticket of its holder (0 when free) so a guard
/// released after a reset never frees a newer attempt's claim.
struct InFlightGuard<'a> {
    flag: &'a AtomicU64,
    ticket: u64,
}

impl<'a> InFlightGuard<'a> {
    fn claim(flag: &'a AtomicU64, tickets: &AtomicU64) -> Option<Self> {
        let ticket = tickets.fetch_add(1, Ordering::Relaxed) + 1;
        flag.compare_exchange(0, ticket, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag, ticket })
    }

    /// False once a reset or another claim took the flag away
    fn is_current(&self) -> bool {
        self.flag.load(Ordering::Acquire) == self.ticket
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let _ = self.flag.compare_exchange(
            self.ticket,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Drives the session lifecycle over a token store and refresh client
pub struct SessionMonitor {
    store: Arc<TokenStore>,
    client: Arc<dyn RefreshClient>,
    bus: EventBus,
    window_upper: i64,
    window_lower: i64,
    tick_interval: std::time::Duration,
    policy: RefreshFailurePolicy,
    in_flight: AtomicU64,
    tickets: AtomicU64,
    failures: Mutex<FailureState>,
    running: AtomicBool,
    closed: AtomicBool,
    snapshots: watch::Sender<SessionSnapshot>,
    _external_refresh: Subscription,
}

impl SessionMonitor {
    /// Build a monitor and subscribe it to external refresh events
    pub fn new(
        store: Arc<TokenStore>,
        client: Arc<dyn RefreshClient>,
        bus: EventBus,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let (snapshots, _) = watch::channel(SessionSnapshot::no_session(store.now()));

        let monitor = Arc::new_cyclic(|weak: &std::sync::Weak<SessionMonitor>| {
            let weak = weak.clone();
            let external_refresh = bus.subscribe(move |event| {
                if event.kind == SessionEventKind::ExternalRefresh {
                    if let Some(monitor) = weak.upgrade() {
                        monitor.reset_after_external_refresh(&event.source);
                    }
                }
            });

            Self {
                store,
                client,
                bus,
                window_upper: config.window_upper_secs as i64,
                window_lower: config.window_lower_secs as i64,
                tick_interval: config.tick_interval(),
                policy: config.on_refresh_failure.clone(),
                in_flight: AtomicU64::new(0),
                tickets: AtomicU64::new(0),
                failures: Mutex::new(FailureState::default()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                snapshots,
                _external_refresh: external_refresh,
            }
        });

        monitor.publish_snapshot();
        monitor
    }

    /// Current state derived from the store and the in-flight flag
    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    /// State plus remaining seconds, as fanned out to observers
    pub fn snapshot(&self) -> SessionSnapshot {
        let now = self.store.now();
        let Some(bundle) = self.store.snapshot() else {
            return SessionSnapshot::no_session(now);
        };

        let remaining_seconds = bundle.remaining_seconds(now);
        let state = match remaining_seconds {
            None => SessionState::Valid,
            Some(0) => SessionState::Expired,
            Some(_) if self.is_refresh_in_flight() => SessionState::RefreshInFlight,
            Some(r) if r <= self.window_upper => SessionState::NearExpiry,
            Some(_) => SessionState::Valid,
        };

        SessionSnapshot {
            state,
            remaining_seconds,
            observed_at: now,
        }
    }

    pub fn is_refresh_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) != 0
    }

    /// Receiver for the snapshots published by the scheduler
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Read-only access for observers
    pub fn view(&self) -> SessionView {
        SessionView::new(Arc::clone(&self.store))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Store the bundle from a credential exchange and start the session
    pub fn establish(&self, response: &TokenResponse) -> SessionResult<()> {
        if response.access_token.is_empty() {
            return Err(token_invalid("credential exchange returned an empty access token"));
        }

        let bundle = TokenBundle::from_response(response, self.store.now());
        self.store.save_bundle_if(bundle.clone(), || {
            self.reset_refresh_state();
            true
        });
        info!(expires_at = ?bundle.expires_at, "Session established");

        self.bus.publish(
            self.event(SessionEventKind::SessionStarted, ESTABLISH_SOURCE)
                .with_payload(bundle_payload(&bundle, self.store.now())),
        );
        self.publish_snapshot();
        Ok(())
    }

    /// Sign out: clear the store and publish `Logout`
    pub fn logout(&self) {
        self.store.clear_with(|| self.reset_refresh_state());
        info!("Session logged out");

        self.bus
            .publish(self.event(SessionEventKind::Logout, LOGOUT_SOURCE));
        self.publish_snapshot();
    }

    /// Adopt a bundle obtained by some other refresh path.
    ///
    /// Stores it and resets the in-flight flag and failure bookkeeping in
    /// one step, then publishes `ExternalRefresh`.
    pub fn notify_external_refresh(&self, response: &TokenResponse) -> SessionResult<()> {
        if response.access_token.is_empty() {
            return Err(token_invalid("external refresh returned an empty access token"));
        }

        let now = self.store.now();
        let bundle = match self.store.snapshot() {
            Some(current) => current.refreshed(response, now),
            None => TokenBundle::from_response(response, now),
        };
        self.store.save_bundle_if(bundle.clone(), || {
            self.reset_refresh_state();
            true
        });

        self.bus.publish(
            self.event(SessionEventKind::ExternalRefresh, EXTERNAL_SOURCE)
                .with_payload(bundle_payload(&bundle, now)),
        );
        self.publish_snapshot();
        Ok(())
    }

    /// Evaluate the session once and act on it
    pub async fn tick(&self) -> TickOutcome {
        match self.plan() {
            TickPlan::Refresh(window) => {
                TickOutcome::Refresh(self.run_refresh(MONITOR_SOURCE, Some(window)).await)
            }
            plan => self.apply(plan),
        }
    }

    /// Refresh now, ignoring the refresh window and failure policy.
    ///
    /// Returns `AlreadyInFlight` without side effects when another refresh
    /// holds the flag.
    pub async fn trigger_refresh(&self, source: &str) -> RefreshOutcome {
        let window = self
            .store
            .get_remaining_seconds()
            .and_then(|r| self.window_for(r));
        self.run_refresh(source, window).await
    }

    /// Spawn the scheduler task.
    ///
    /// Ticks every `tick_interval`, publishes a snapshot after each tick and
    /// after every bus event, and runs refreshes on a separate task so the
    /// countdown keeps moving while a call is pending.
    pub fn start(self: &Arc<Self>) -> SessionResult<MonitorHandle> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Session monitor already running");
            return Err(SessionError::new(ErrorCode::Internal)
                .message("session monitor already running")
                .build());
        }

        let (shutdown_sender, mut shutdown_receiver) = mpsc::channel::<()>(1);
        let mut events = self.bus.receiver();
        let monitor = Arc::clone(self);
        let period = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut refresh_task: Option<JoinHandle<()>> = None;

            info!(tick_ms = period.as_millis() as u64, "Session monitor started");

            loop {
                tokio::select! {
                    _ = shutdown_receiver.recv() => {
                        info!("Session monitor shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        if refresh_task.as_ref().is_some_and(|task| task.is_finished()) {
                            refresh_task = None;
                        }

                        match monitor.plan() {
                            TickPlan::Refresh(window) if refresh_task.is_none() => {
                                let refresher = Arc::clone(&monitor);
                                refresh_task = Some(tokio::spawn(async move {
                                    refresher.run_refresh(SCHEDULER_SOURCE, Some(window)).await;
                                }));
                            }
                            TickPlan::Refresh(_) => trace!("Previous refresh task still running"),
                            plan => {
                                monitor.apply(plan);
                            }
                        }
                        monitor.publish_snapshot();
                    }

                    received = events.recv() => match received {
                        Ok(event) => {
                            trace!(kind = %event.kind, "Session event observed by scheduler");
                            monitor.publish_snapshot();
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Scheduler lagged behind session events");
                            monitor.publish_snapshot();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            // Results of an interrupted refresh are never applied
            monitor.closed.store(true, Ordering::Release);
            if let Some(task) = refresh_task.take() {
                task.abort();
                let _ = task.await;
            }
            monitor.closed.store(false, Ordering::Release);
            monitor.running.store(false, Ordering::Release);
            debug!("Session monitor stopped");
        });

        Ok(MonitorHandle {
            shutdown_sender,
            handle,
            snapshots: self.subscribe_snapshots(),
        })
    }

    fn plan(&self) -> TickPlan {
        let now = self.store.now();
        let Some(bundle) = self.store.snapshot() else {
            return TickPlan::NoSession;
        };
        let Some(remaining) = bundle.remaining_seconds(now) else {
            return TickPlan::Valid(None);
        };

        debug!(remaining_secs = remaining, "Session tick");

        if remaining == 0 {
            return TickPlan::Expire;
        }
        let Some(window) = self.window_for(remaining) else {
            return TickPlan::Valid(Some(remaining));
        };
        if self.is_refresh_in_flight() {
            return TickPlan::InFlight;
        }
        if self.attempt_allowed(&bundle, window, now) {
            TickPlan::Refresh(window)
        } else {
            TickPlan::Deferred(window, remaining)
        }
    }

    fn apply(&self, plan: TickPlan) -> TickOutcome {
        match plan {
            TickPlan::NoSession => TickOutcome::NoSession,
            TickPlan::Valid(remaining_seconds) => TickOutcome::Valid { remaining_seconds },
            TickPlan::InFlight => TickOutcome::Refresh(RefreshOutcome::AlreadyInFlight),
            TickPlan::Deferred(window, remaining_seconds) => {
                trace!(?window, remaining_seconds, "Refresh deferred by failure policy");
                TickOutcome::Deferred {
                    window,
                    remaining_seconds,
                }
            }
            // Refresh plans are executed by the caller
            TickPlan::Refresh(window) => TickOutcome::Deferred {
                window,
                remaining_seconds: self.store.get_remaining_seconds().unwrap_or(0),
            },
            TickPlan::Expire => {
                self.expire();
                TickOutcome::Expired
            }
        }
    }

    fn window_for(&self, remaining: i64) -> Option<RefreshWindow> {
        if remaining <= 0 || remaining > self.window_upper {
            None
        } else if remaining > self.window_lower {
            Some(RefreshWindow::Proactive)
        } else {
            Some(RefreshWindow::Late)
        }
    }

    fn attempt_allowed(&self, bundle: &TokenBundle, window: RefreshWindow, now: DateTime<Utc>) -> bool {
        let mut failures = self.failure_state();
        failures.sync_with(bundle.expires_at);

        match &self.policy {
            RefreshFailurePolicy::WaitForNextWindow => match window {
                RefreshWindow::Proactive => !failures.proactive_failed && !failures.late_failed,
                RefreshWindow::Late => !failures.late_failed,
            },
            RefreshFailurePolicy::RetryWithBackoff { max_attempts, .. } => {
                failures.failures < *max_attempts
                    && failures.next_retry_at.map_or(true, |at| now >= at)
            }
        }
    }

    /// Record a failed attempt, returning the number of failures this approach
    fn record_failure(
        &self,
        bundle: &TokenBundle,
        window: Option<RefreshWindow>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut failures = self.failure_state();
        failures.sync_with(bundle.expires_at);
        failures.failures += 1;

        match window {
            Some(RefreshWindow::Proactive) => failures.proactive_failed = true,
            Some(RefreshWindow::Late) => failures.late_failed = true,
            None => {}
        }

        if let Some(policy) = self.policy.retry_policy() {
            let delay = policy.calculate_delay(failures.failures);
            failures.next_retry_at =
                Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
        }

        failures.failures
    }

    async fn run_refresh(&self, source: &str, window: Option<RefreshWindow>) -> RefreshOutcome {
        let Some(current) = self.store.snapshot() else {
            debug!(source, "No session to refresh");
            return RefreshOutcome::NoSession;
        };

        let Some(guard) = InFlightGuard::claim(&self.in_flight, &self.tickets) else {
            debug!(source, "Refresh already in flight, ignoring trigger");
            return RefreshOutcome::AlreadyInFlight;
        };

        info!(
            source,
            ?window,
            remaining_secs = ?current.remaining_seconds(self.store.now()),
            "Refreshing access token"
        );
        self.publish_snapshot();

        let result = self.client.refresh(&current).await;

        if self.closed.load(Ordering::Acquire) || !guard.is_current() {
            info!(source, "Discarding refresh result after monitor reset");
            return RefreshOutcome::Discarded;
        }

        let now = self.store.now();
        match result {
            Ok(response) => {
                let bundle = current.refreshed(&response, now);
                // Logout, expiry and establish reset the flag under the same
                // lock, so a stale result can never land after them
                let stored = self.store.save_bundle_if(bundle.clone(), || {
                    let wanted = !self.closed.load(Ordering::Acquire) && guard.is_current();
                    if wanted {
                        self.reset_failures();
                    }
                    wanted
                });
                if !stored {
                    info!(source, "Discarding refresh result after monitor reset");
                    return RefreshOutcome::Discarded;
                }
                drop(guard);

                let remaining_seconds = bundle.remaining_seconds(now);
                info!(source, remaining_secs = ?remaining_seconds, "Access token refreshed");
                self.bus.publish(
                    self.event(SessionEventKind::TokenRefreshed, source)
                        .with_payload(bundle_payload(&bundle, now)),
                );
                self.publish_snapshot();
                RefreshOutcome::Refreshed { remaining_seconds }
            }
            Err(e) => {
                let attempt = self.record_failure(&current, window, now);
                drop(guard);

                warn!(source, error = %e, attempt, ?window, "Token refresh failed");
                self.bus.publish(
                    self.event(SessionEventKind::RefreshFailed, source)
                        .with_payload(json!({
                            "reason": e.to_string(),
                            "attempt": attempt,
                            "window": window,
                            "remaining_seconds": current.remaining_seconds(now),
                        })),
                );
                self.publish_snapshot();
                RefreshOutcome::Failed(e)
            }
        }
    }

    fn expire(&self) {
        info!("Session expired without a successful refresh, logging out");
        self.store.clear_with(|| self.reset_refresh_state());

        self.bus
            .publish(self.event(SessionEventKind::TokenExpired, MONITOR_SOURCE));
        self.publish_snapshot();
    }

    fn reset_after_external_refresh(&self, source: &str) {
        info!(source, "External refresh observed, resetting refresh state");
        self.reset_refresh_state();
    }

    fn reset_refresh_state(&self) {
        self.in_flight.store(0, Ordering::Release);
        self.reset_failures();
    }

    fn reset_failures(&self) {
        *self.failure_state() = FailureState::default();
    }

    fn failure_state(&self) -> std::sync::MutexGuard<'_, FailureState> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event(&self, kind: SessionEventKind, source: &str) -> SessionEvent {
        SessionEvent::from_clock(kind, source, &*self.store.clock())
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

impl std::fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("window_upper", &self.window_upper)
            .field("window_lower", &self.window_lower)
            .field("policy", &self.policy)
            .field("in_flight", &self.is_refresh_in_flight())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

fn bundle_payload(bundle: &TokenBundle, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "expires_at": bundle.expires_at.map(|e| e.to_rfc3339()),
        "remaining_seconds": bundle.remaining_seconds(now),
    })
}

/// Handle to a running scheduler task
pub struct MonitorHandle {
    shutdown_sender: mpsc::Sender<()>,
    handle: JoinHandle<()>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl MonitorHandle {
    /// Snapshot receiver tied to this run
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the scheduler and wait for it to finish
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_sender.send(()).await;
        self.handle.await?;
        Ok(())
    }
}
