//! A deterministic, in-memory backend for tests.
//!
//! A list of canned responses is cycled through by an atomic index, so
//! concurrent callers each see a deterministic, predictable sequence
//! without needing a mutex.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ApiExperiment, Backend, CreateRunRequest, ExecuteOperationsOutcome, SearchResult};
use crate::error::{Error, Result};
use crate::operation::Operation;

/// A backend that returns a fixed, cycling sequence of run identifiers and
/// never talks to the network. Useful for dispatcher and processor tests
/// that need several independent backend instances.
pub struct MockBackend {
    display_address: String,
    run_ids: Vec<String>,
    next_run: AtomicUsize,
    executed: Mutex<Vec<Operation>>,
    fail_next_health_ping: AtomicBool,
}

impl MockBackend {
    /// A mock backend that mints sequential run ids `"run-0"`, `"run-1"`, ...
    pub fn new(display_address: impl Into<String>) -> Self {
        MockBackend {
            display_address: display_address.into(),
            run_ids: Vec::new(),
            next_run: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            fail_next_health_ping: AtomicBool::new(false),
        }
    }

    /// A mock backend that cycles through a fixed list of run ids instead
    /// of minting sequential ones.
    pub fn fixed(display_address: impl Into<String>, run_ids: Vec<String>) -> Self {
        MockBackend {
            display_address: display_address.into(),
            run_ids,
            next_run: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            fail_next_health_ping: AtomicBool::new(false),
        }
    }

    fn next_run_id(&self) -> String {
        let idx = self.next_run.fetch_add(1, Ordering::SeqCst);
        if self.run_ids.is_empty() {
            format!("run-{idx}")
        } else {
            self.run_ids[idx % self.run_ids.len()].clone()
        }
    }

    /// Operations this backend has accepted, for assertions in tests.
    pub fn executed_operations(&self) -> Vec<Operation> {
        self.executed.lock().unwrap().clone()
    }

    /// Make the next `health_ping` call fail, to simulate a backend that
    /// is still unreachable during a dispatcher health-check probe.
    pub fn fail_next_health_ping(&self) {
        self.fail_next_health_ping.store(true, Ordering::SeqCst);
    }
}

impl Backend for MockBackend {
    fn create_run(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        let id = request
            .external_id
            .clone()
            .unwrap_or_else(|| self.next_run_id());
        let sys_id = request
            .external_sys_id
            .clone()
            .unwrap_or_else(|| format!("sys-{id}"));
        Ok(ApiExperiment {
            id,
            sys_id,
            fields: serde_json::json!({}),
        })
    }

    fn create_model(&self, request: &CreateRunRequest) -> Result<ApiExperiment> {
        self.create_run(request)
    }

    fn get_project(&self, project: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "project": project }))
    }

    fn get_attributes(&self, _run_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }

    fn execute_operations(
        &self,
        _run_id: &str,
        operations: &[Operation],
    ) -> Result<ExecuteOperationsOutcome> {
        self.executed.lock().unwrap().extend_from_slice(operations);
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
        Ok(format!("https://{}/runs/{run_id}", self.display_address))
    }

    fn health_ping(&self) -> Result<()> {
        if self.fail_next_health_ping.swap(false, Ordering::SeqCst) {
            Err(Error::ConnectionLost {
                cause: "mock health ping forced failure".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn display_address(&self) -> &str {
        &self.display_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_sequential_run_ids() {
        let backend = MockBackend::new("mock-0");
        let a = backend.create_run(&CreateRunRequest::default()).unwrap();
        let b = backend.create_run(&CreateRunRequest::default()).unwrap();
        assert_eq!(a.id, "run-0");
        assert_eq!(b.id, "run-1");
    }

    #[test]
    fn secondary_converges_to_external_id() {
        let backend = MockBackend::new("mock-1");
        let request = CreateRunRequest {
            external_id: Some("RUN-42".to_string()),
            external_sys_id: Some("sys-RUN-42".to_string()),
            ..Default::default()
        };
        let experiment = backend.create_run(&request).unwrap();
        assert_eq!(experiment.id, "RUN-42");
        assert_eq!(experiment.sys_id, "sys-RUN-42");
    }

    #[test]
    fn fixed_ids_cycle() {
        let backend = MockBackend::fixed("mock-2", vec!["a".into(), "b".into()]);
        assert_eq!(backend.create_run(&CreateRunRequest::default()).unwrap().id, "a");
        assert_eq!(backend.create_run(&CreateRunRequest::default()).unwrap().id, "b");
        assert_eq!(backend.create_run(&CreateRunRequest::default()).unwrap().id, "a");
    }

    #[test]
    fn records_executed_operations() {
        let backend = MockBackend::new("mock-3");
        let ops = vec![Operation::new(serde_json::json!({"attr": "loss"}))];
        backend.execute_operations("run-0", &ops).unwrap();
        assert_eq!(backend.executed_operations().len(), 1);
    }

    #[test]
    fn health_ping_can_be_forced_to_fail_once() {
        let backend = MockBackend::new("mock-4");
        backend.fail_next_health_ping();
        assert!(backend.health_ping().is_err());
        assert!(backend.health_ping().is_ok());
    }
}
