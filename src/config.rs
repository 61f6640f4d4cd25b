//! Client and per-backend configuration.
//!
//! Plain structs built from explicit constructor arguments, with
//! `std::env` consulted once at construction time for the documented
//! override knobs. There is no global config singleton.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// How a client instance should process operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Operations are queued and sent by background consumer threads.
    Async,
    /// Operations are sent synchronously on the calling thread.
    Sync,
    /// Writes are rejected; only reads are served.
    ReadOnly,
    /// Like `Async`, but every operation is also logged at debug level.
    Debug,
    /// Operations are accepted but never sent; see `backend::offline`.
    Offline,
}

/// How the signals monitor should execute a user-supplied callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Call the callback directly on the monitor's draining thread.
    Inline,
    /// Spawn a short-lived thread per callback invocation, so a slow or
    /// panicking callback cannot stall signal draining.
    Spawned,
}

/// Which durable queue backend an async processor should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Crash-safe, append-log-backed queue (default).
    Disk,
    /// In-memory queue; lost on process exit. Intended for tests and
    /// benchmarks.
    Memory,
}

/// Per-backend connection configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of this backend server.
    pub base_url: String,
    /// Authentication token sent with every request.
    pub api_token: String,
    /// Optional HTTP(S) proxy map, keyed by scheme (`"http"`, `"https"`).
    pub proxies: Option<HashMap<String, String>>,
    /// Project identifier this backend should route runs into, if fixed.
    pub project: Option<String>,
    /// Human-readable address used in log prefixes and as a stable
    /// component of the queue's on-disk directory name.
    pub display_address: String,
    /// Request timeout for a single HTTP call.
    pub request_timeout: Duration,
    /// Substrings that mark a response from this backend as benign server
    /// policy rather than a real failure. Populated from
    /// [`ClientConfig::benign_error_substrings`] when backends are
    /// constructed, so each `HostedBackend` can classify errors without
    /// holding a reference back to the owning `ClientConfig`.
    pub benign_error_substrings: Vec<String>,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let display_address = base_url.clone();
        BackendConfig {
            base_url,
            api_token: api_token.into(),
            proxies: None,
            project: None,
            display_address,
            request_timeout: Duration::from_secs(30),
            benign_error_substrings: Error::DEFAULT_BENIGN_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn benign_substrings(&self) -> Vec<&str> {
        self.benign_error_substrings.iter().map(String::as_str).collect()
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_display_address(mut self, display_address: impl Into<String>) -> Self {
        self.display_address = display_address.into();
        self
    }

    pub fn with_proxies(mut self, proxies: HashMap<String, String>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Configuration for the whole multi-backend client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// One entry per replicated backend. The first entry is primary for
    /// `create_run`'s identifier-resolution protocol.
    pub backends: Vec<BackendConfig>,
    /// How operations are processed.
    pub mode: Mode,
    /// Which durable queue implementation async processors use.
    pub queue_backend: QueueBackend,
    /// Operations sent per batch by an async processor's consumer thread.
    pub batch_size: usize,
    /// How long `stop()` waits for queues to drain before giving up.
    pub stop_timeout: Duration,
    /// Substrings that mark a backend error response as benign
    /// server policy rather than a real failure.
    pub benign_error_substrings: Vec<String>,
    /// How the signals monitor invokes user callbacks.
    pub callback_mode: CallbackMode,
    /// Capacity of the lossy signal bus.
    pub signal_bus_capacity: usize,
    /// Queue-size-minus-acked-version threshold that triggers a
    /// `Signal::BatchLag`.
    pub lag_threshold: u64,
    /// Minimum interval between repeated firings of the same signals
    /// monitor callback.
    pub callbacks_interval: Duration,
    /// How often an async processor's consumer flushes its queue to disk,
    /// independent of how often it drains a batch.
    pub flush_period: Duration,
    /// How long a batch may remain outstanding (started but not yet
    /// processed) before the signals monitor fires its no-progress
    /// callback.
    pub async_no_progress_threshold: Duration,
}

impl ClientConfig {
    /// Build a config for the given backends, applying the three
    /// documented environment overrides on top of the defaults.
    pub fn new(backends: Vec<BackendConfig>, mode: Mode) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Configuration(
                "at least one backend is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for backend in &backends {
            if !seen.insert(&backend.api_token) {
                return Err(Error::Configuration(
                    "duplicate api_token across backends".to_string(),
                ));
            }
        }

        let mut config = ClientConfig {
            backends,
            mode,
            queue_backend: QueueBackend::Disk,
            batch_size: 500,
            stop_timeout: Duration::from_secs(30),
            benign_error_substrings: Error::DEFAULT_BENIGN_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            callback_mode: CallbackMode::Spawned,
            signal_bus_capacity: 256,
            lag_threshold: 1000,
            callbacks_interval: Duration::from_secs(60),
            flush_period: Duration::from_secs(5),
            async_no_progress_threshold: Duration::from_secs(300),
        };

        config.apply_env_overrides()?;
        let benign = config.benign_error_substrings.clone();
        for backend in &mut config.backends {
            backend.benign_error_substrings = benign.clone();
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("TRACKCLIENT_STOP_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                Error::Configuration(format!("TRACKCLIENT_STOP_TIMEOUT_SECS={raw} is not a valid integer"))
            })?;
            self.stop_timeout = Duration::from_secs(secs);
        }

        if let Ok(raw) = std::env::var("TRACKCLIENT_QUEUE_BACKEND") {
            self.queue_backend = match raw.as_str() {
                "disk" => QueueBackend::Disk,
                "memory" => QueueBackend::Memory,
                other => {
                    return Err(Error::Configuration(format!(
                        "TRACKCLIENT_QUEUE_BACKEND={other} must be \"disk\" or \"memory\""
                    )))
                }
            };
        }

        if let Ok(raw) = std::env::var("TRACKCLIENT_BATCH_SIZE") {
            let size: usize = raw.parse().map_err(|_| {
                Error::Configuration(format!("TRACKCLIENT_BATCH_SIZE={raw} is not a valid integer"))
            })?;
            if size == 0 {
                return Err(Error::Configuration(
                    "TRACKCLIENT_BATCH_SIZE must be greater than zero".to_string(),
                ));
            }
            self.batch_size = size;
        }

        Ok(())
    }

    /// Extend the benign-error substring list.
    pub fn with_benign_error_substring(mut self, substring: impl Into<String>) -> Self {
        self.benign_error_substrings.push(substring.into());
        self
    }

    pub fn benign_error_substrings(&self) -> Vec<&str> {
        self.benign_error_substrings.iter().map(String::as_str).collect()
    }
}
