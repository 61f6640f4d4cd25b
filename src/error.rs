//! Error kinds produced by the client, its backends, and its background workers.
//!
//! Transient errors ([`Error::ConnectionLost`]) are recovered inside
//! workers by the [`crate::daemon`] retry wrapper and should not normally
//! escape to a caller. Configuration errors and
//! [`Error::AllBackendsFailed`] are the only kinds that propagate
//! synchronously out of a user call.

use thiserror::Error;

/// Errors produced by the client and its components.
#[derive(Error, Debug)]
pub enum Error {
    /// No token, duplicate tokens, or mismatched project/run/token counts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transient network-class failure. Caught by the daemon's retry
    /// wrapper; only surfaces if the worker was interrupted mid-retry.
    #[error("connection lost: {cause}")]
    ConnectionLost {
        /// Description of the underlying transport failure.
        cause: String,
    },

    /// A recoverable metadata error returned alongside a partially
    /// successful `execute_operations` call.
    #[error("metadata inconsistency: {message}")]
    MetadataInconsistency {
        /// Server-provided description.
        message: String,
    },

    /// The backend rejected the request due to a rate limit.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Server-provided description.
        message: String,
    },

    /// The backend refused to accept a write (e.g. read-only run).
    #[error("write denied: {message}")]
    WriteDenied {
        /// Server-provided description.
        message: String,
    },

    /// Every routable backend failed the attempt.
    ///
    /// Carries `(original_index, cause)` for each failure. In a
    /// single-backend configuration, callers get the unwrapped original
    /// cause instead of this variant;
    /// see [`Error::into_single_backend_cause`].
    #[error("all backends failed: {}", format_causes(.0))]
    AllBackendsFailed(Vec<(usize, String)>),

    /// Operation submitted after the multi-backend client was closed.
    #[error("multi-backend client is closed")]
    MultiBackendClosed,

    /// The consumer terminated before the awaited version was acknowledged.
    #[error("synchronization already stopped")]
    SynchronizationAlreadyStopped,

    /// A known server-side policy response (e.g. "sys/state is read only").
    /// Callers should never see this surfaced; it is logged at debug and
    /// swallowed. Kept as a variant so `is_retryable`/classification stays
    /// total over backend errors.
    #[error("benign server policy: {message}")]
    BenignServerPolicy {
        /// The matched benign-policy message.
        message: String,
    },

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure in the durable queue or upload-directory handling.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

fn format_causes(causes: &[(usize, String)]) -> String {
    causes
        .iter()
        .map(|(idx, cause)| format!("[backend {idx}] {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// The substrings recognized as benign, server-side-policy responses.
    pub const DEFAULT_BENIGN_SUBSTRINGS: &'static [&'static str] = &["sys/state is read only"];

    /// Classify a raw backend error message, recognizing the benign-policy
    /// substrings configured on the client.
    pub fn classify_operation_error(message: impl Into<String>, benign: &[&str]) -> Error {
        let message = message.into();
        if benign.iter().any(|needle| message.contains(needle)) {
            Error::BenignServerPolicy { message }
        } else {
            Error::MetadataInconsistency { message }
        }
    }

    /// Whether this error represents a transient, connection-class failure
    /// that the daemon retry wrapper should back off and retry on.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost { .. })
            || matches!(self, Error::Request(e) if e.is_connect() || e.is_timeout())
    }

    /// Unwrap an [`Error::AllBackendsFailed`] with exactly one cause back
    /// into a plain [`Error::Other`] carrying that cause, for single-backend
    /// caller compatibility.
    pub fn into_single_backend_cause(self) -> Error {
        match self {
            Error::AllBackendsFailed(mut causes) if causes.len() == 1 => {
                let (_, cause) = causes.remove(0);
                Error::Other(cause)
            }
            other => other,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_benign_substring() {
        let err = Error::classify_operation_error(
            "run 12345: sys/state is read only",
            Error::DEFAULT_BENIGN_SUBSTRINGS,
        );
        assert!(matches!(err, Error::BenignServerPolicy { .. }));
    }

    #[test]
    fn classify_non_benign_is_metadata_inconsistency() {
        let err = Error::classify_operation_error(
            "attribute type mismatch",
            Error::DEFAULT_BENIGN_SUBSTRINGS,
        );
        assert!(matches!(err, Error::MetadataInconsistency { .. }));
    }

    #[test]
    fn single_backend_unwraps_all_backends_failed() {
        let err = Error::AllBackendsFailed(vec![(0, "boom".to_string())]);
        let unwrapped = err.into_single_backend_cause();
        assert!(matches!(unwrapped, Error::Other(msg) if msg == "boom"));
    }

    #[test]
    fn multi_backend_all_failed_stays_wrapped() {
        let err = Error::AllBackendsFailed(vec![(0, "a".into()), (1, "b".into())]);
        let unwrapped = err.into_single_backend_cause();
        assert!(matches!(unwrapped, Error::AllBackendsFailed(_)));
    }
}
