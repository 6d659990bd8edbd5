//! Endpoint availability tracking
//!
//! A single slot per endpoint holds the current offline cause, or nothing
//! while the endpoint is online. Calls made while the cause's cooldown is
//! running fail fast without touching the network; consecutive failures
//! double the cooldown up to a bound. All updates go through one lock, so
//! concurrent failure reports collapse into a single increasing cooldown.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::result::CallError;

/// Cooldown installed on the first failure of an episode.
pub const INITIAL_OFFLINE_COOLDOWN: Duration = Duration::from_secs(5);

/// Why an endpoint is considered unreachable.
#[derive(Debug, Clone)]
pub struct OfflineCause {
    /// When this offline episode began.
    pub first_observed: DateTime<Utc>,
    /// No network attempts until this instant.
    pub deadline: Instant,
    /// Current cooldown length.
    pub cooldown: Duration,
    /// Consecutive failures in this episode.
    pub attempts: u32,
    /// Most recent transport error text.
    pub last_error: String,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy)]
pub struct FailureOutcome {
    /// True when the endpoint just flipped from online to offline.
    pub became_offline: bool,
    pub cooldown: Duration,
}

pub struct AvailabilityTracker {
    slot: Mutex<Option<OfflineCause>>,
    initial_cooldown: Duration,
    max_cooldown: Duration,
}

impl AvailabilityTracker {
    pub fn new(max_cooldown: Duration) -> Self {
        Self::with_initial(INITIAL_OFFLINE_COOLDOWN, max_cooldown)
    }

    pub fn with_initial(initial_cooldown: Duration, max_cooldown: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            initial_cooldown,
            max_cooldown: max_cooldown.max(initial_cooldown),
        }
    }

    /// Fail-fast gate. Returns the error to surface when the endpoint is
    /// inside its cooldown; `None` means the call may proceed (including a
    /// probe after the cooldown elapsed).
    pub fn check(&self) -> Option<CallError> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(cause) if cause.deadline > Instant::now() => Some(CallError::offline(format!(
                "endpoint offline since {} ({}), retry in {:?}",
                cause.first_observed.to_rfc3339(),
                cause.last_error,
                cause.deadline.saturating_duration_since(Instant::now()),
            ))),
            _ => None,
        }
    }

    /// Record a successful request. Returns true when the endpoint was
    /// offline before, i.e. an `Online` event should be emitted.
    pub fn on_success(&self) -> bool {
        self.slot.lock().take().is_some()
    }

    /// Record a transport-class failure, installing or extending the
    /// offline cause.
    pub fn on_failure(&self, error: &str) -> FailureOutcome {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            None => {
                *slot = Some(OfflineCause {
                    first_observed: Utc::now(),
                    deadline: Instant::now() + self.initial_cooldown,
                    cooldown: self.initial_cooldown,
                    attempts: 1,
                    last_error: error.to_string(),
                });
                FailureOutcome {
                    became_offline: true,
                    cooldown: self.initial_cooldown,
                }
            }
            Some(cause) => {
                let cooldown = (cause.cooldown * 2).min(self.max_cooldown);
                cause.cooldown = cooldown;
                cause.deadline = Instant::now() + cooldown;
                cause.attempts += 1;
                cause.last_error = error.to_string();
                FailureOutcome {
                    became_offline: false,
                    cooldown,
                }
            }
        }
    }

    pub fn is_offline(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn current(&self) -> Option<OfflineCause> {
        self.slot.lock().clone()
    }
}
