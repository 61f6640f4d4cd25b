//! Public client facade: wires [`ClientConfig`] backends into a
//! [`Dispatcher`] and, per run, a [`MultiBackendOperationProcessor`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{ApiExperiment, Backend, HostedBackend, OfflineBackend};
use crate::config::{ClientConfig, Mode, QueueBackend};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::processor::async_processor::AsyncOperationProcessor;
use crate::processor::multi_processor::MultiBackendOperationProcessor;
use crate::queue::{DiskQueue, DurableQueue, MemoryQueue};
use crate::signals::signal_bus;
use crate::signals_monitor::SignalsMonitor;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The entry point: one client owns one [`Dispatcher`] over a fixed set of
/// backends and mints [`Run`]s against it.
pub struct Client {
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Client {
    /// Build backends from `config` and start the dispatcher's background
    /// health-check timer.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let backends: Vec<Arc<dyn Backend>> = if config.mode == Mode::Offline {
            vec![Arc::new(OfflineBackend::new())]
        } else {
            config
                .backends
                .iter()
                .map(|backend_config| {
                    Ok(Arc::new(HostedBackend::new(backend_config.clone())?) as Arc<dyn Backend>)
                })
                .collect::<Result<Vec<_>>>()?
        };

        let dispatcher = Arc::new(Dispatcher::new(backends)?);
        dispatcher.start_health_check_timer(HEALTH_CHECK_INTERVAL);

        Ok(Client { config, dispatcher })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Create a run, using the primary-then-secondary identifier protocol,
    /// and start whatever background processing its mode requires.
    pub fn create_run(&self, custom_id: Option<String>) -> Result<Run> {
        if self.config.mode == Mode::ReadOnly {
            return Err(Error::WriteDenied {
                message: "client is configured read-only".to_string(),
            });
        }

        let experiment = self.dispatcher.create_run(custom_id)?;
        Run::new(experiment, self.dispatcher.clone(), &self.config)
    }

    /// Stop the dispatcher's health-check timer and close every backend.
    /// Runs created from this client must be stopped individually first.
    pub fn close(&self) -> Result<()> {
        self.dispatcher.shutdown()
    }
}

/// A single run: the handle callers log operations against.
pub struct Run {
    pub id: String,
    pub sys_id: String,
    mode: Mode,
    dispatcher: Arc<Dispatcher>,
    processor: Option<Arc<MultiBackendOperationProcessor>>,
    monitors: Mutex<Vec<SignalsMonitor>>,
}

impl Run {
    fn new(experiment: ApiExperiment, dispatcher: Arc<Dispatcher>, config: &ClientConfig) -> Result<Self> {
        let (processor, monitors) = match config.mode {
            Mode::Async | Mode::Debug => {
                let mut members = Vec::new();
                let mut monitors = Vec::new();

                for (index, backend) in dispatcher.backend_refs().into_iter().enumerate() {
                    let run_dir = queue_dir(backend.display_address(), &experiment.id);
                    let queue: Arc<dyn DurableQueue> = match config.queue_backend {
                        QueueBackend::Disk => Arc::new(DiskQueue::open(run_dir.join("queue"))?),
                        QueueBackend::Memory => Arc::new(MemoryQueue::new()),
                    };

                    let (sender, receiver) = signal_bus(config.signal_bus_capacity);
                    let processor = AsyncOperationProcessor::new(
                        experiment.id.clone(),
                        index,
                        backend,
                        queue,
                        sender,
                        config.batch_size,
                        config.lag_threshold,
                        config.stop_timeout,
                        config.flush_period,
                        config.benign_error_substrings.clone(),
                    );

                    let monitor = SignalsMonitor::spawn(
                        index,
                        receiver,
                        config.callbacks_interval,
                        config.async_no_progress_threshold,
                        config.callback_mode,
                        None,
                        None,
                    );

                    members.push((Arc::new(processor), run_dir.join("uploads")));
                    monitors.push(monitor);
                }

                let multi = MultiBackendOperationProcessor::new(members, dispatcher.clone())?;
                (Some(Arc::new(multi)), monitors)
            }
            Mode::Sync | Mode::ReadOnly | Mode::Offline => (None, Vec::new()),
        };

        Ok(Run {
            id: experiment.id,
            sys_id: experiment.sys_id,
            mode: config.mode,
            dispatcher,
            processor,
            monitors: Mutex::new(monitors),
        })
    }

    /// Record an operation. In `Async`/`Debug` mode this enqueues it for
    /// background delivery; in `Sync` mode it is sent immediately and the
    /// call blocks until every routable backend has responded.
    pub fn log(&self, operation: Operation) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::WriteDenied {
                message: "run is read-only".to_string(),
            });
        }
        if self.mode == Mode::Offline {
            return Ok(());
        }

        match &self.processor {
            Some(processor) => {
                processor.enqueue(operation)?;
                Ok(())
            }
            None => {
                let run_id = self.id.clone();
                self.dispatcher.write_fanout(|backend| {
                    backend
                        .execute_operations(&run_id, std::slice::from_ref(&operation))
                        .map(|_| ())
                })
            }
        }
    }

    /// Read every attribute currently on this run from the first routable
    /// backend.
    pub fn attributes(&self) -> Result<serde_json::Value> {
        let run_id = self.id.clone();
        self.dispatcher
            .read_first_available(|backend| backend.get_attributes(&run_id))
    }

    /// This run's URL on every backend, skipping ones that fail to report
    /// it.
    pub fn urls(&self) -> Vec<String> {
        self.dispatcher.get_all_run_urls(&self.id)
    }

    /// Stop the run's background processors (if any), draining queued
    /// operations within the configured `stop_timeout`.
    pub fn stop(&self) -> Result<()> {
        if let Some(processor) = &self.processor {
            processor.stop()?;
        }
        for monitor in self.monitors.lock().unwrap().drain(..) {
            monitor.stop();
        }
        Ok(())
    }
}

fn queue_dir(display_address: &str, run_id: &str) -> PathBuf {
    let sanitized_address: String = display_address
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    std::env::temp_dir()
        .join("trackclient-queues")
        .join(sanitized_address)
        .join(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn offline_client_accepts_and_discards_writes() {
        let config = ClientConfig::new(vec![BackendConfig::new("http://unused", "token")], Mode::Offline).unwrap();
        let client = Client::new(config).unwrap();
        let run = client.create_run(None).unwrap();
        run.log(Operation::new(serde_json::json!({"attr": "loss"}))).unwrap();
        run.stop().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn read_only_client_rejects_create_run() {
        let config = ClientConfig::new(vec![BackendConfig::new("http://unused", "token")], Mode::ReadOnly).unwrap();
        let client = Client::new(config).unwrap();
        assert!(client.create_run(None).is_err());
    }
}
