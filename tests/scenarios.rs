//! End-to-end scenarios exercising the dispatcher, queue, and processor
//! wiring together — behavior a single module's unit tests can't reach on
//! their own.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trackfan::backend::{ApiExperiment, Backend, CreateRunRequest, ExecuteOperationsOutcome, MockBackend, SearchResult};
use trackfan::dispatcher::Dispatcher;
use trackfan::error::Error;
use trackfan::health::BackendHealth;
use trackfan::operation::Operation;
use trackfan::processor::async_processor::AsyncOperationProcessor;
use trackfan::processor::multi_processor::MultiBackendOperationProcessor;
use trackfan::queue::{DurableQueue, MemoryQueue};
use trackfan::signals::signal_bus;

/// A backend whose `execute_operations`/`create_run` always fail, for
/// exercising the dispatcher's failure-threshold and all-fail paths.
struct FailingBackend {
    display_address: String,
}

impl FailingBackend {
    fn new(display_address: impl Into<String>) -> Self {
        FailingBackend { display_address: display_address.into() }
    }
}

impl Backend for FailingBackend {
    fn create_run(&self, _request: &CreateRunRequest) -> trackfan::error::Result<ApiExperiment> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn create_model(&self, request: &CreateRunRequest) -> trackfan::error::Result<ApiExperiment> {
        self.create_run(request)
    }

    fn get_project(&self, _project: &str) -> trackfan::error::Result<serde_json::Value> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn get_attributes(&self, _run_id: &str) -> trackfan::error::Result<serde_json::Value> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn execute_operations(&self, _run_id: &str, _operations: &[Operation]) -> trackfan::error::Result<ExecuteOperationsOutcome> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn download_file(&self, _run_id: &str, _attribute_path: &str, _destination: &std::path::Path) -> trackfan::error::Result<()> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn search(&self, _project: &str, _query: &str) -> trackfan::error::Result<Vec<SearchResult>> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn health_ping(&self) -> trackfan::error::Result<()> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }

    fn close(&self) -> trackfan::error::Result<()> {
        Ok(())
    }

    fn display_address(&self) -> &str {
        &self.display_address
    }

    fn get_run_url(&self, _run_id: &str) -> trackfan::error::Result<String> {
        Err(Error::ConnectionLost { cause: "simulated backend outage".to_string() })
    }
}

/// Wraps a [`MockBackend`] and records every `create_run` request it
/// receives, so a test can assert on the identifiers a secondary backend
/// was actually called with.
struct CapturingBackend {
    inner: MockBackend,
    requests: Mutex<Vec<CreateRunRequest>>,
}

impl CapturingBackend {
    fn new(display_address: impl Into<String>) -> Self {
        CapturingBackend { inner: MockBackend::new(display_address), requests: Mutex::new(Vec::new()) }
    }

    fn requests(&self) -> Vec<CreateRunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Backend for CapturingBackend {
    fn create_run(&self, request: &CreateRunRequest) -> trackfan::error::Result<ApiExperiment> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.create_run(request)
    }

    fn create_model(&self, request: &CreateRunRequest) -> trackfan::error::Result<ApiExperiment> {
        self.create_run(request)
    }

    fn get_project(&self, project: &str) -> trackfan::error::Result<serde_json::Value> {
        self.inner.get_project(project)
    }

    fn get_attributes(&self, run_id: &str) -> trackfan::error::Result<serde_json::Value> {
        self.inner.get_attributes(run_id)
    }

    fn execute_operations(&self, run_id: &str, operations: &[Operation]) -> trackfan::error::Result<ExecuteOperationsOutcome> {
        self.inner.execute_operations(run_id, operations)
    }

    fn download_file(&self, run_id: &str, attribute_path: &str, destination: &std::path::Path) -> trackfan::error::Result<()> {
        self.inner.download_file(run_id, attribute_path, destination)
    }

    fn search(&self, project: &str, query: &str) -> trackfan::error::Result<Vec<SearchResult>> {
        self.inner.search(project, query)
    }

    fn health_ping(&self) -> trackfan::error::Result<()> {
        self.inner.health_ping()
    }

    fn close(&self) -> trackfan::error::Result<()> {
        self.inner.close()
    }

    fn display_address(&self) -> &str {
        self.inner.display_address()
    }

    fn get_run_url(&self, run_id: &str) -> trackfan::error::Result<String> {
        self.inner.get_run_url(run_id)
    }
}

fn async_processor_over_memory(
    index: usize,
    backend: Arc<dyn Backend>,
    batch_size: usize,
    lag_threshold: u64,
) -> (AsyncOperationProcessor, trackfan::signals::SignalReceiver) {
    let queue: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new());
    let (tx, rx) = signal_bus(64);
    let processor = AsyncOperationProcessor::new(
        "run-a",
        index,
        backend,
        queue,
        tx,
        batch_size,
        lag_threshold,
        Duration::from_secs(10),
        Duration::from_secs(5),
        Vec::new(),
    );
    (processor, rx)
}

/// Scenario A — single-backend smoke: enqueue three operations, wait for
/// them to drain, and confirm the backend received them as one batch and
/// the durable queue ends up empty.
#[test]
fn scenario_a_single_backend_smoke() {
    let backend = Arc::new(MockBackend::new("mock-a"));
    let (processor, signals) = async_processor_over_memory(0, backend.clone(), 10, 1000);

    processor.enqueue(Operation::new(serde_json::json!({"attr": "a"}))).unwrap();
    processor.enqueue(Operation::new(serde_json::json!({"attr": "b"}))).unwrap();
    let last_version = processor.enqueue(Operation::new(serde_json::json!({"attr": "c"}))).unwrap();
    assert_eq!(last_version, 3);

    assert!(processor.wait_for_version(3, Duration::from_secs(5)));
    assert_eq!(processor.queue_size(), 0);
    assert_eq!(backend.executed_operations().len(), 3);

    let mut saw_started = false;
    let mut saw_processed = false;
    while let Some(signal) = signals.recv_timeout(Duration::from_millis(200)) {
        match signal {
            trackfan::signals::Signal::BatchStarted { .. } => saw_started = true,
            trackfan::signals::Signal::BatchProcessed { count, .. } => {
                saw_processed = true;
                assert_eq!(count, 3);
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_processed);

    processor.stop().unwrap();
}

/// Scenario B — failure threshold: one stable backend and one that always
/// fails. After three writes the failing backend has advanced
/// Healthy -> Failing(1) -> Failing(2) -> Degraded(3), while every write
/// still succeeds because the stable backend accepted it.
#[test]
fn scenario_b_failure_threshold_degrades_one_backend() {
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(MockBackend::new("stable")),
        Arc::new(FailingBackend::new("flaky")),
    ];
    let dispatcher = Dispatcher::new(backends).unwrap();

    for _ in 0..3 {
        let result = dispatcher.write_fanout(|backend| {
            backend
                .execute_operations("run-b", &[Operation::new(serde_json::json!({"attr": "x"}))])
                .map(|_| ())
        });
        assert!(result.is_ok());
    }

    let snapshot = dispatcher.health_snapshot();
    assert!(matches!(snapshot[0], BackendHealth::Healthy { .. }));
    assert!(matches!(snapshot[1], BackendHealth::Degraded { consecutive_failures: 3, .. }));
}

/// Scenario C — create_run identity propagation: the primary mints
/// `id`/`sys_id`, and every secondary is called with those as
/// `external_id`/`external_sys_id` so its own experiment converges onto
/// the primary's identifiers.
#[test]
fn scenario_c_create_run_identity_propagation() {
    let primary = Arc::new(MockBackend::fixed("primary", vec!["U1".to_string()]));
    let secondary_a = Arc::new(CapturingBackend::new("secondary-a"));
    let secondary_b = Arc::new(CapturingBackend::new("secondary-b"));

    let backends: Vec<Arc<dyn Backend>> = vec![primary, secondary_a.clone(), secondary_b.clone()];
    let dispatcher = Dispatcher::new(backends).unwrap();

    let experiment = dispatcher.create_run(None).unwrap();
    assert_eq!(experiment.id, "U1");

    // Give the secondary fan-out a moment to complete; it runs on the
    // dispatcher's own thread pool in parallel with the primary's return.
    std::thread::sleep(Duration::from_millis(100));

    for secondary in [&secondary_a, &secondary_b] {
        let requests = secondary.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].external_id.as_deref(), Some("U1"));
        assert_eq!(requests[0].external_sys_id.as_deref(), Some(experiment.sys_id.as_str()));
    }
}

/// Scenario D — recovery ping: once a degraded backend's health check
/// succeeds, it becomes healthy again and participates in reads.
#[test]
fn scenario_d_recovery_ping_restores_health() {
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(MockBackend::new("mock-0")),
        Arc::new(MockBackend::new("mock-1")),
    ];
    let dispatcher = Arc::new(Dispatcher::new(backends).unwrap());
    dispatcher.mark_backend_disconnected(1, "simulated outage");
    assert!(matches!(dispatcher.health_snapshot()[1], BackendHealth::Degraded { .. }));

    dispatcher.start_health_check_timer(Duration::from_millis(20));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if matches!(dispatcher.health_snapshot()[1], BackendHealth::Healthy { .. }) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "backend never recovered");
        std::thread::sleep(Duration::from_millis(20));
    }

    dispatcher.shutdown().unwrap();
}

/// Scenario E — graceful stop with backlog: a processor with a sizeable
/// backlog still drains completely within its stop timeout, and the
/// queue's on-disk/in-memory state is cleaned up afterward.
#[test]
fn scenario_e_graceful_stop_drains_backlog() {
    let backend = Arc::new(MockBackend::new("mock-e"));
    let (processor, _signals) = async_processor_over_memory(0, backend.clone(), 50, 200);

    let mut last_version = 0;
    for i in 0..500 {
        last_version = processor
            .enqueue(Operation::new(serde_json::json!({"attr": "metric", "step": i})))
            .unwrap();
    }

    processor.stop().unwrap();

    assert_eq!(processor.queue_size(), 0);
    assert_eq!(backend.executed_operations().len(), 500);
    assert_eq!(last_version, 500);
}

/// Scenario F — all-fail propagation: when every backend fails, the
/// caller sees `AllBackendsFailed` listing each backend's index and
/// cause, and every backend's health has advanced by one failure step.
#[test]
fn scenario_f_all_backends_failing_propagates_with_causes() {
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(FailingBackend::new("flaky-0")),
        Arc::new(FailingBackend::new("flaky-1")),
    ];
    let dispatcher = Dispatcher::new(backends).unwrap();

    let result = dispatcher.write_fanout(|backend| {
        backend
            .execute_operations("run-f", &[Operation::new(serde_json::json!({"attr": "x"}))])
            .map(|_| ())
    });

    match result {
        Err(Error::AllBackendsFailed(causes)) => {
            assert_eq!(causes.len(), 2);
            let indices: Vec<usize> = causes.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, vec![0, 1]);
        }
        other => panic!("expected AllBackendsFailed, got {other:?}"),
    }

    for health in dispatcher.health_snapshot() {
        assert!(matches!(health, BackendHealth::Failing { consecutive_failures: 1, .. }));
    }
}

/// Multi-backend replication: a write enqueued once is delivered to every
/// backend's own queue independently, and a slow backend does not block a
/// fast one from acknowledging.
#[test]
fn multi_backend_replication_reaches_every_backend() {
    let fast = Arc::new(MockBackend::new("fast"));
    let slow = Arc::new(MockBackend::new("slow"));

    let (fast_processor, _fast_signals) = async_processor_over_memory(0, fast.clone(), 10, 1000);
    let (slow_processor, _slow_signals) = async_processor_over_memory(1, slow.clone(), 10, 1000);

    let members = vec![
        (Arc::new(fast_processor), std::env::temp_dir().join("trackfan-test-uploads-fast")),
        (Arc::new(slow_processor), std::env::temp_dir().join("trackfan-test-uploads-slow")),
    ];
    let dispatcher_backends: Vec<Arc<dyn Backend>> = vec![fast.clone(), slow.clone()];
    let dispatcher = Arc::new(Dispatcher::new(dispatcher_backends).unwrap());
    let multi = MultiBackendOperationProcessor::new(members, dispatcher).unwrap();

    let versions = multi.enqueue(Operation::new(serde_json::json!({"attr": "loss"}))).unwrap();
    assert_eq!(versions.len(), 2);
    assert!(multi.wait_for_all(&versions, Duration::from_secs(5)));

    assert_eq!(fast.executed_operations().len(), 1);
    assert_eq!(slow.executed_operations().len(), 1);

    multi.stop().unwrap();
}

/// Single-backend callers see the bare cause, not a wrapped
/// `AllBackendsFailed` with one entry — preserving compatibility with
/// code written against a single-backend client.
#[test]
fn single_backend_error_is_unwrapped_not_wrapped() {
    let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(FailingBackend::new("only"))];
    let dispatcher = Dispatcher::new(backends).unwrap();

    let result = dispatcher.read_first_available(|backend| backend.get_project("proj"));
    match result {
        Err(Error::Other(message)) => assert!(message.contains("simulated backend outage")),
        other => panic!("expected the bare cause unwrapped from AllBackendsFailed, got {other:?}"),
    }
}

/// Scenario G — `create_model` is a parallel fan-out over every backend,
/// not `create_run`'s primary-then-secondary protocol: it must still
/// succeed when the first backend is down, unlike a call that required the
/// first backend specifically to answer.
#[test]
fn scenario_g_create_model_survives_primary_outage() {
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(FailingBackend::new("down")),
        Arc::new(MockBackend::fixed("up", vec!["M1".to_string()])),
    ];
    let dispatcher = Dispatcher::new(backends).unwrap();

    let model = dispatcher.create_model(None).unwrap();
    assert_eq!(model.id, "M1");

    // create_run, by contrast, is fatal on a down primary.
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(FailingBackend::new("down")),
        Arc::new(MockBackend::fixed("up", vec!["M2".to_string()])),
    ];
    let dispatcher = Dispatcher::new(backends).unwrap();
    assert!(dispatcher.create_run(None).is_err());
}

/// Scenario H — a backend that goes down mid-drain is reported to the
/// dispatcher as disconnected once its processor stops, so subsequent
/// reads stop routing to it even though the dispatcher never saw the
/// failure itself.
#[test]
fn scenario_h_stop_marks_a_genuinely_failing_backend_disconnected() {
    let stable = Arc::new(MockBackend::new("stable"));
    let failing: Arc<dyn Backend> = Arc::new(FailingBackend::new("flaky"));

    let dispatcher = Arc::new(Dispatcher::new(vec![Arc::new(MockBackend::new("stable-dispatch")), failing.clone()]).unwrap());

    let (stable_processor, _stable_signals) = async_processor_over_memory(0, stable.clone(), 10, 1000);

    let queue: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new());
    let (tx, _failing_signals) = signal_bus(16);
    let failing_processor = AsyncOperationProcessor::new(
        "run-h",
        1,
        failing.clone(),
        queue,
        tx,
        1,
        1000,
        Duration::from_millis(300),
        Duration::from_secs(5),
        Vec::new(),
    );

    failing_processor
        .enqueue(Operation::new(serde_json::json!({"attr": "x"})))
        .unwrap();
    // Give the consumer a moment to attempt delivery and back off at
    // least once before stop() is called.
    std::thread::sleep(Duration::from_millis(100));

    let members = vec![
        (Arc::new(stable_processor), std::env::temp_dir().join("trackfan-test-uploads-stable-h")),
        (Arc::new(failing_processor), std::env::temp_dir().join("trackfan-test-uploads-flaky-h")),
    ];
    let multi = MultiBackendOperationProcessor::new(members, dispatcher.clone()).unwrap();
    multi.stop().unwrap();

    assert!(matches!(dispatcher.health_snapshot()[1], BackendHealth::Degraded { .. }));
}

