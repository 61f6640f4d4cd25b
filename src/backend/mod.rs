//! Backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over experiment-tracking servers,
//! translating between this crate's opaque [`crate::operation::Operation`]
//! model and a concrete server's wire protocol. Built-in implementations:
//! [`hosted::HostedBackend`], [`mock::MockBackend`], [`offline::OfflineBackend`].
//!
//! The trait is object-safe (`Arc<dyn Backend>`, one method per
//! capability) and synchronous: every call runs on the calling consumer
//! thread, backed by `reqwest::blocking`, since this crate's background
//! workers are native OS threads rather than an async runtime.

pub mod hosted;
pub mod mock;
pub mod offline;

pub use hosted::HostedBackend;
pub use mock::MockBackend;
pub use offline::OfflineBackend;

use crate::error::Result;
use crate::operation::Operation;

/// The identifiers a backend assigns a newly created run.
///
/// Opaque beyond `id`/`sys_id`: `fields` carries whatever additional
/// metadata the backend returned, untouched.
#[derive(Debug, Clone)]
pub struct ApiExperiment {
    /// The identifier this crate's public API exposes to callers.
    pub id: String,
    /// The backend's internal system identifier.
    pub sys_id: String,
    /// Any additional fields the backend returned, opaque to this crate.
    pub fields: serde_json::Value,
}

/// Parameters for [`Backend::create_run`]'s primary-then-secondary
/// identifier-resolution protocol.
#[derive(Debug, Clone, Default)]
pub struct CreateRunRequest {
    /// Caller-supplied custom run identifier, if any.
    pub custom_id: Option<String>,
    /// When calling a secondary backend, the identifier the primary
    /// backend assigned — secondaries must converge to it rather than
    /// minting their own.
    pub external_id: Option<String>,
    /// When calling a secondary backend, the primary's system identifier.
    pub external_sys_id: Option<String>,
}

/// The result of submitting a batch of operations to a backend. A backend may accept some operations and reject others in the
/// same call; `errors` carries one entry per rejected operation's index
/// within the batch.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOperationsOutcome {
    /// How many operations, counted from the head of the submitted slice,
    /// the backend actually applied. May be less than the submitted
    /// length; the caller must retry the remainder starting at this
    /// offset rather than assume the whole batch landed.
    pub processed_count: usize,
    /// Indices (within the submitted batch) that failed, paired with the
    /// backend's error message for that operation.
    pub errors: Vec<(usize, String)>,
}

impl ExecuteOperationsOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single search-result row.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub run_id: String,
    pub fields: serde_json::Value,
}

/// Abstraction over experiment-tracking backend servers.
///
/// Implementors translate between this crate's operation/run model and a
/// concrete server's HTTP API. The trait is object-safe and used as
/// `Arc<dyn Backend>` throughout the dispatcher and processors.
pub trait Backend: Send + Sync {
    /// Create a run. See [`CreateRunRequest`] for the primary/secondary
    /// identifier-convergence protocol.
    fn create_run(&self, request: &CreateRunRequest) -> Result<ApiExperiment>;

    /// Register a model, returning its assigned identifiers. On a
    /// secondary backend, `external_id`/`external_sys_id` converge the
    /// model's identifier the same way `create_run` does for runs.
    fn create_model(&self, request: &CreateRunRequest) -> Result<ApiExperiment>;

    /// Fetch project-level metadata.
    fn get_project(&self, project: &str) -> Result<serde_json::Value>;

    /// Fetch the current value of every attribute on a run.
    fn get_attributes(&self, run_id: &str) -> Result<serde_json::Value>;

    /// Submit a batch of operations for a run. Operations are applied in
    /// order; a `CopyAttribute` operation must be pre-resolved
    /// by the caller and may only appear at index 0.
    fn execute_operations(
        &self,
        run_id: &str,
        operations: &[Operation],
    ) -> Result<ExecuteOperationsOutcome>;

    /// Download a file attribute's bytes to `destination`.
    fn download_file(&self, run_id: &str, attribute_path: &str, destination: &std::path::Path) -> Result<()>;

    /// Run a search query, returning matching rows. Query syntax is
    /// opaque and backend-specific.
    fn search(&self, project: &str, query: &str) -> Result<Vec<SearchResult>>;

    /// The human-facing URL for a run on this backend's server. Used by
    /// [`crate::dispatcher::Dispatcher::get_all_run_urls`] to collect one
    /// URL per backend, unlike the rest of this trait's reads which the
    /// dispatcher serves from the first routable backend only.
    fn get_run_url(&self, run_id: &str) -> Result<String>;

    /// A cheap call used by the dispatcher's periodic health-check timer
    /// to probe whether a degraded backend has recovered.
    fn health_ping(&self) -> Result<()>;

    /// Release any resources (connection pools, etc.) held by this
    /// backend. Called once during client shutdown.
    fn close(&self) -> Result<()>;

    /// The address used in log prefixes and queue directory naming.
    fn display_address(&self) -> &str;
}
