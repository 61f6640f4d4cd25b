//! Optional `tracing-subscriber` setup for applications embedding this
//! crate.
//!
//! This crate itself only emits `tracing` events — it never installs a
//! global subscriber, since libraries shouldn't decide that for their
//! callers. [`init_default_logging`] is provided as a convenience for
//! applications (and this crate's own tests) that want a ready-made
//! env-filter-plus-fmt-layer setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `tracing_subscriber::fmt` layer filtered by `RUST_LOG` (or
/// `trackfan=info` if unset). Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init_default_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trackfan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
