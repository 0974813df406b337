use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::SessionView;
use crate::event_bus::{EventBus, SessionEventKind, Subscription};

/// Render whole seconds as `MM:SS`
pub fn format_remaining(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// What the countdown shows on one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownFrame {
    /// `MM:SS`, or `None` when the session has no expiry to count down
    pub text: Option<String>,
    /// Set on the first poll below the warning threshold only
    pub warning: bool,
}

/// Session countdown with a one-shot "expiring soon" warning.
///
/// The warning fires once per approach to expiry and is re-armed whenever
/// a refresh or a new session is observed on the bus.
pub struct CountdownDisplay {
    view: SessionView,
    warn_below_secs: i64,
    warned: Arc<AtomicBool>,
    _rearm: Option<Subscription>,
}

impl CountdownDisplay {
    pub fn new(view: SessionView, warn_below_secs: u64) -> Self {
        Self {
            view,
            warn_below_secs: warn_below_secs as i64,
            warned: Arc::new(AtomicBool::new(false)),
            _rearm: None,
        }
    }

    /// Re-arm the warning on refresh and session-start events from `bus`
    pub fn attach(mut self, bus: &EventBus) -> Self {
        let warned = Arc::clone(&self.warned);
        self._rearm = Some(bus.subscribe(move |event| {
            if event.kind.is_refresh() || event.kind == SessionEventKind::SessionStarted {
                if warned.swap(false, Ordering::AcqRel) {
                    debug!(kind = %event.kind, "Countdown warning re-armed");
                }
            }
        }));
        self
    }

    /// Current countdown text without touching the warning state
    pub fn render(&self) -> Option<String> {
        self.view.get_remaining_seconds().map(format_remaining)
    }

    /// Read the countdown and raise the warning if it is due
    pub fn poll(&self) -> CountdownFrame {
        let Some(remaining) = self.view.get_remaining_seconds() else {
            return CountdownFrame {
                text: None,
                warning: false,
            };
        };

        let warning = remaining < self.warn_below_secs
            && !self.warned.swap(true, Ordering::AcqRel);
        if warning {
            info!(remaining_secs = remaining, "Session expiring soon");
        }

        CountdownFrame {
            text: Some(format_remaining(remaining)),
            warning,
        }
    }

    /// Whether the warning has fired and not been re-armed yet
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Acquire)
    }
}
