//! Per-backend async operation processor.
//!
//! Operations are durably enqueued on the caller's thread, then drained in
//! batches by a single [`crate::daemon::Daemon`] consumer thread that
//! submits them to one backend, retrying through
//! [`crate::daemon::with_connection_retry`] on transient failures. A
//! backend may accept only a prefix of a submitted batch; the consumer acks
//! only that prefix and resubmits the remainder, so a rejected operation
//! never causes the ones after it to be acknowledged without ever having
//! been applied. Benign rejections (e.g. writes to a read-only attribute)
//! are logged at `debug`, not `warn`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::daemon::{backend_log_prefix, with_connection_retry, Daemon, DaemonShared, DaemonWork};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::queue::DurableQueue;
use crate::signals::{ProcessorStopSignal, Signal, SignalSender};

/// How often `stop()` reports a [`ProcessorStopSignal::StillWaiting`]
/// signal while the queue is still draining, capped so a short
/// `stop_timeout` still produces a few check-ins instead of exactly one.
const STILL_WAITING_INTERVAL: Duration = Duration::from_secs(10);

/// Drains one backend's durable queue on a dedicated consumer thread.
pub struct AsyncOperationProcessor {
    queue: Arc<dyn DurableQueue>,
    daemon: Mutex<Option<Daemon>>,
    shared: Arc<DaemonShared>,
    backend_index: usize,
    display_address: String,
    last_acked_version: Arc<AtomicU64>,
    stop_timeout: Duration,
}

struct ConsumerWork {
    run_id: String,
    queue: Arc<dyn DurableQueue>,
    backend: Arc<dyn Backend>,
    shared: Arc<DaemonShared>,
    signals: SignalSender,
    batch_size: usize,
    log_prefix: String,
    lag_threshold: u64,
    last_acked_version: Arc<AtomicU64>,
    benign_substrings: Vec<String>,
    flush_period: Duration,
    last_flush: Instant,
}

impl ConsumerWork {
    fn benign_substrings(&self) -> Vec<&str> {
        self.benign_substrings.iter().map(String::as_str).collect()
    }
}

impl DaemonWork for ConsumerWork {
    fn work(&mut self) {
        if self.last_flush.elapsed() >= self.flush_period {
            if let Err(e) = self.queue.flush() {
                tracing::warn!("{} periodic flush failed: {e}", self.log_prefix);
            }
            self.last_flush = Instant::now();
        }

        let batch = match self.queue.get_batch(self.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("{} failed to read queue: {e}", self.log_prefix);
                return;
            }
        };

        if batch.is_empty() {
            return;
        }

        let backlog = self.queue.size();
        if backlog > self.lag_threshold {
            self.signals.send(Signal::BatchLag {
                at: Instant::now(),
                lag: backlog,
            });
        }

        self.signals.send(Signal::BatchStarted { at: Instant::now() });

        let mut remaining: Vec<Operation> = batch.iter().map(|e| e.obj.clone()).collect();
        let versions: Vec<u64> = batch.iter().map(|e| e.version).collect();
        let mut acked_count = 0usize;

        while !remaining.is_empty() {
            let backend = &self.backend;
            let log_prefix = &self.log_prefix;
            let run_id = self.run_id.as_str();
            let ops = &remaining;
            let result = with_connection_retry(&self.shared, log_prefix, || {
                backend.execute_operations(run_id, ops)
            });

            let Some(outcome) = result else { break };

            for (index, message) in &outcome.errors {
                let classified = Error::classify_operation_error(message.clone(), &self.benign_substrings());
                match classified {
                    Error::BenignServerPolicy { .. } => {
                        tracing::debug!("{log_prefix} operation {index} rejected (benign): {message}");
                    }
                    _ => {
                        tracing::warn!("{log_prefix} operation {index} rejected: {message}");
                    }
                }
            }

            let processed = outcome.processed_count.min(remaining.len());
            if processed == 0 {
                // The backend applied nothing from this attempt; retrying
                // the same prefix forever would spin, so stop here and let
                // the next tick pick the batch back up.
                break;
            }

            acked_count += processed;
            remaining.drain(0..processed);
            let acked_version = versions[acked_count - 1];

            if let Err(e) = self.queue.ack(acked_version) {
                tracing::error!("{log_prefix} failed to ack version {acked_version}: {e}");
                break;
            }
            self.last_acked_version.store(acked_version, Ordering::SeqCst);
        }

        self.signals.send(Signal::BatchProcessed {
            at: Instant::now(),
            count: acked_count,
        });
    }
}

impl AsyncOperationProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        backend_index: usize,
        backend: Arc<dyn Backend>,
        queue: Arc<dyn DurableQueue>,
        signals: SignalSender,
        batch_size: usize,
        lag_threshold: u64,
        stop_timeout: Duration,
        flush_period: Duration,
        benign_substrings: Vec<String>,
    ) -> Self {
        let run_id = run_id.into();
        let display_address = backend.display_address().to_string();
        let log_prefix = backend_log_prefix(backend_index, &display_address);
        let last_acked_version = Arc::new(AtomicU64::new(0));

        let work_queue = queue.clone();
        let work_last_acked = last_acked_version.clone();
        let daemon = Daemon::spawn_with(
            format!("async-processor-{backend_index}"),
            Duration::from_millis(50),
            move |shared| {
                Box::new(ConsumerWork {
                    run_id,
                    queue: work_queue,
                    backend,
                    shared,
                    signals,
                    batch_size,
                    log_prefix,
                    lag_threshold,
                    last_acked_version: work_last_acked,
                    benign_substrings,
                    flush_period,
                    last_flush: Instant::now(),
                })
            },
        );
        let shared = daemon.shared();

        AsyncOperationProcessor {
            queue,
            daemon: Mutex::new(Some(daemon)),
            shared,
            backend_index,
            display_address,
            last_acked_version,
            stop_timeout,
        }
    }

    /// Enqueue an operation for delivery. Returns the version assigned by
    /// the durable queue, usable with [`AsyncOperationProcessor::wait_for_version`].
    pub fn enqueue(&self, operation: Operation) -> Result<u64> {
        self.queue.put(operation)
    }

    /// Block until `version` has been acknowledged, or `timeout` elapses.
    pub fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.last_acked_version.load(Ordering::SeqCst) >= version {
                return true;
            }
            if self.shared.is_interrupted() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.last_acked_version.load(Ordering::SeqCst) >= version
    }

    pub fn queue_size(&self) -> u64 {
        self.queue.size()
    }

    pub fn backend_index(&self) -> usize {
        self.backend_index
    }

    pub fn display_address(&self) -> &str {
        &self.display_address
    }

    /// Currently accumulated connection-retry backoff for this processor's
    /// consumer. Greater than zero means its last attempt against the
    /// backend failed and has not yet recovered.
    pub fn last_backoff(&self) -> Duration {
        self.shared.last_backoff()
    }

    /// Stop accepting new operations, wait up to the configured timeout for
    /// the queue to drain, and join the consumer thread.
    pub fn stop(&self) -> Result<()> {
        self.stop_with_signals(None)
    }

    /// Like [`AsyncOperationProcessor::stop`], but also reports
    /// [`ProcessorStopSignal`]s on `signals` as the drain progresses, for a
    /// caller that wants structured stop progress rather than log lines
    /// alone.
    pub fn stop_with_signals(&self, signals: Option<&Sender<ProcessorStopSignal>>) -> Result<()> {
        let emit = |signal: ProcessorStopSignal| {
            if let Some(tx) = signals {
                let _ = tx.send(signal);
            }
        };

        if self.shared.last_backoff() > Duration::ZERO {
            emit(ProcessorStopSignal::ConnectionInterrupted);
        }

        self.queue.close()?;
        emit(ProcessorStopSignal::WaitingForOperations);

        let poll_interval = STILL_WAITING_INTERVAL
            .min(self.stop_timeout / 3)
            .max(Duration::from_millis(10));
        let deadline = Instant::now() + self.stop_timeout;

        let mut drained;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(poll_interval);
            drained = self.queue.wait_for_empty(wait);
            if drained || Instant::now() >= deadline {
                break;
            }
            emit(ProcessorStopSignal::StillWaiting);
        }

        if drained {
            emit(ProcessorStopSignal::Success);
        } else {
            tracing::warn!(
                "{} queue did not drain within {:?}; stopping anyway",
                backend_log_prefix(self.backend_index, &self.display_address),
                self.stop_timeout
            );
            if self.shared.last_backoff() > Duration::ZERO {
                emit(ProcessorStopSignal::ReconnectFailure);
            } else {
                emit(ProcessorStopSignal::SyncFailure);
            }
        }

        if let Some(daemon) = self.daemon.lock().unwrap().take() {
            daemon.join();
        }
        self.queue.cleanup()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ApiExperiment, CreateRunRequest, ExecuteOperationsOutcome, SearchResult};
    use crate::queue::MemoryQueue;
    use crate::signals::signal_bus;
    use std::sync::atomic::AtomicUsize;

    /// A backend that only ever applies the first operation of whatever
    /// slice it's given, rejecting the rest as benign.
    struct PartialBackend {
        display_address: String,
        accepted: Mutex<Vec<Operation>>,
        calls: AtomicUsize,
    }

    impl PartialBackend {
        fn new() -> Self {
            PartialBackend {
                display_address: "partial".to_string(),
                accepted: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Backend for PartialBackend {
        fn create_run(&self, _: &CreateRunRequest) -> Result<ApiExperiment> {
            unimplemented!()
        }
        fn create_model(&self, _: &CreateRunRequest) -> Result<ApiExperiment> {
            unimplemented!()
        }
        fn get_project(&self, _: &str) -> Result<serde_json::Value> {
            unimplemented!()
        }
        fn get_attributes(&self, _: &str) -> Result<serde_json::Value> {
            unimplemented!()
        }
        fn execute_operations(&self, _run_id: &str, operations: &[Operation]) -> Result<ExecuteOperationsOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let accepted: Vec<Operation> = operations.iter().take(1).cloned().collect();
            let processed_count = accepted.len();
            self.accepted.lock().unwrap().extend(accepted);
            let errors = operations
                .iter()
                .enumerate()
                .skip(processed_count)
                .map(|(i, _)| (i, "sys/state is read only".to_string()))
                .collect();
            Ok(ExecuteOperationsOutcome { processed_count, errors })
        }
        fn download_file(&self, _: &str, _: &str, _: &std::path::Path) -> Result<()> {
            unimplemented!()
        }
        fn search(&self, _: &str, _: &str) -> Result<Vec<SearchResult>> {
            unimplemented!()
        }
        fn get_run_url(&self, _: &str) -> Result<String> {
            unimplemented!()
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

    /// A backend that sleeps before applying everything it's given, used
    /// to stretch a `stop()` drain past one poll interval.
    struct SlowBackend {
        display_address: String,
        delay: Duration,
    }

    impl Backend for SlowBackend {
        fn create_run(&self, _: &CreateRunRequest) -> Result<ApiExperiment> {
            unimplemented!()
        }
        fn create_model(&self, _: &CreateRunRequest) -> Result<ApiExperiment> {
            unimplemented!()
        }
        fn get_project(&self, _: &str) -> Result<serde_json::Value> {
            unimplemented!()
        }
        fn get_attributes(&self, _: &str) -> Result<serde_json::Value> {
            unimplemented!()
        }
        fn execute_operations(&self, _run_id: &str, operations: &[Operation]) -> Result<ExecuteOperationsOutcome> {
            std::thread::sleep(self.delay);
            Ok(ExecuteOperationsOutcome {
                processed_count: operations.len(),
                errors: Vec::new(),
            })
        }
        fn download_file(&self, _: &str, _: &str, _: &std::path::Path) -> Result<()> {
            unimplemented!()
        }
        fn search(&self, _: &str, _: &str) -> Result<Vec<SearchResult>> {
            unimplemented!()
        }
        fn get_run_url(&self, run_id: &str) -> Result<String> {
            Ok(format!("slow://{run_id}"))
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

    #[test]
    fn partial_success_retries_unprocessed_tail_until_full_batch_lands() {
        let backend = Arc::new(PartialBackend::new());
        let backend_dyn: Arc<dyn Backend> = backend.clone();
        let queue: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new());
        let (tx, _rx) = signal_bus(16);
        let processor = AsyncOperationProcessor::new(
            "run-x",
            0,
            backend_dyn,
            queue,
            tx,
            10,
            1000,
            Duration::from_secs(5),
            Duration::from_secs(5),
            vec!["sys/state is read only".to_string()],
        );

        for i in 0..3 {
            processor
                .enqueue(Operation::new(serde_json::json!({"attr": "x", "i": i})))
                .unwrap();
        }

        assert!(processor.wait_for_version(3, Duration::from_secs(2)));
        assert_eq!(backend.accepted.lock().unwrap().len(), 3);
        assert!(backend.calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn stop_reports_still_waiting_and_sync_failure_during_slow_drain() {
        let backend: Arc<dyn Backend> = Arc::new(SlowBackend {
            display_address: "slow".to_string(),
            delay: Duration::from_millis(60),
        });
        let queue: Arc<dyn DurableQueue> = Arc::new(MemoryQueue::new());
        let (tx, _rx) = signal_bus(16);
        let processor = AsyncOperationProcessor::new(
            "run-e",
            0,
            backend,
            queue,
            tx,
            1,
            1000,
            Duration::from_millis(250),
            Duration::from_secs(5),
            Vec::new(),
        );

        for i in 0..20 {
            processor
                .enqueue(Operation::new(serde_json::json!({"attr": "metric", "step": i})))
                .unwrap();
        }

        let (stop_tx, stop_rx) = std::sync::mpsc::channel();
        processor.stop_with_signals(Some(&stop_tx)).unwrap();

        let received: Vec<_> = stop_rx.try_iter().collect();
        assert!(received.contains(&ProcessorStopSignal::WaitingForOperations));
        assert!(received.contains(&ProcessorStopSignal::StillWaiting));
        assert!(received.contains(&ProcessorStopSignal::SyncFailure));
    }
}
