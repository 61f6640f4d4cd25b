//! Per-backend health state machine.
//!
//! Health is a pure tagged union plus total transition functions
//! (`on_success`/`on_failure`), rather than mutable failure counters
//! scattered across the dispatcher — every transition is a plain function
//! from the current state and an event to the next state.

use std::time::Instant;

/// A backend's health, as tracked by the dispatcher.
///
/// Invariant: `Failing` only ever holds `consecutive_failures` of 1 or 2;
/// the third consecutive failure transitions to `Degraded`. `Healthy` and
/// `Failing` together make up the "routable" set — a backend
/// only leaves routability by accumulating a third consecutive failure.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendHealth {
    /// Last attempt succeeded.
    Healthy {
        /// When the last successful call completed.
        last_success_time: Instant,
    },
    /// Between one and two consecutive failures. Still routable.
    Failing {
        /// Always 1 or 2.
        consecutive_failures: u8,
        /// Description of the most recent failure.
        last_error: String,
        /// The last time this backend succeeded, if ever.
        last_success_time: Option<Instant>,
    },
    /// Three or more consecutive failures. Not routable unless every
    /// backend is degraded.
    Degraded {
        /// Always ≥ 3.
        consecutive_failures: u32,
        /// Description of the most recent failure.
        last_error: String,
    },
}

impl BackendHealth {
    /// The initial state for a backend that has never been called.
    /// Optimistic: a freshly configured backend is assumed healthy until
    /// it actually fails a call.
    pub fn initial() -> Self {
        BackendHealth::Healthy {
            last_success_time: Instant::now(),
        }
    }

    /// Whether this backend is currently part of the routable set
    /// (Healthy ∪ Failing).
    pub fn is_routable(&self) -> bool {
        !matches!(self, BackendHealth::Degraded { .. })
    }

    /// Apply a successful call, transitioning back to `Healthy`.
    pub fn on_success(&self, at: Instant) -> BackendHealth {
        BackendHealth::Healthy {
            last_success_time: at,
        }
    }

    /// Apply a failed call, advancing the consecutive-failure count and
    /// possibly crossing into `Degraded`.
    pub fn on_failure(&self, error: impl Into<String>) -> BackendHealth {
        let error = error.into();
        match self {
            BackendHealth::Healthy { last_success_time } => BackendHealth::Failing {
                consecutive_failures: 1,
                last_error: error,
                last_success_time: Some(*last_success_time),
            },
            BackendHealth::Failing {
                consecutive_failures,
                last_success_time,
                ..
            } => {
                let next = consecutive_failures + 1;
                if next >= 3 {
                    BackendHealth::Degraded {
                        consecutive_failures: next as u32,
                        last_error: error,
                    }
                } else {
                    BackendHealth::Failing {
                        consecutive_failures: next,
                        last_error: error,
                        last_success_time: *last_success_time,
                    }
                }
            }
            BackendHealth::Degraded {
                consecutive_failures,
                ..
            } => BackendHealth::Degraded {
                consecutive_failures: consecutive_failures + 1,
                last_error: error,
            },
        }
    }

    /// The most recent error description, if this backend has ever failed.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            BackendHealth::Healthy { .. } => None,
            BackendHealth::Failing { last_error, .. } => Some(last_error),
            BackendHealth::Degraded { last_error, .. } => Some(last_error),
        }
    }
}
