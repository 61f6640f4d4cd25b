//! A backend that discards writes and returns empty reads.

use super::{ApiExperiment, Backend, CreateRunRequest, ExecuteOperationsOutcome, SearchResult};
use crate::error::Result;
use crate::operation::Operation;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Used when a client is configured in [`crate::config::Mode::Offline`]:
/// accepts everything, persists nothing, never touches the network.
pub struct OfflineBackend {
    display_address: String,
    next_id: AtomicUsize,
}

impl OfflineBackend {
    pub fn new() -> Self {
        OfflineBackend {
            display_address: "offline".to_string(),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for OfflineBackend {
    fn create_run(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        let idx = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = request
            .external_id
            .clone()
            .unwrap_or_else(|| format!("offline-{idx}"));
        let sys_id = request.external_sys_id.clone().unwrap_or_else(|| id.clone());
        Ok(ApiExperiment {
            id,
            sys_id,
            fields: serde_json::json!({}),
        })
    }

    fn create_model(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        self.create_run(request)
    }

    fn get_project(&self, _project: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn get_attributes(&self, _run_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn execute_operations(
        &self,
        _run_id: &str,
        operations: &[Operation],
    ) -> Result<ExecuteOperationsOutcome> {
        Ok(ExecuteOperationsOutcome {
            processed_count: operations.len(),
            errors: Vec::new(),
        })
    }

    fn download_file(&self, _run_id: &str, _attribute_path: &str, _destination: &std::path::Path) -> Result<()> {
        Ok(())
    }

    fn search(&self, _project: &str, _query: &str) -> Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }

    fn get_run_url(&self, run_id: &str) -> Result<String> {
        Ok(format!("offline://{run_id}"))
    }

    fn health_ping(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn display_address(&self) -> &str {
        &self.display_address
    }
}
