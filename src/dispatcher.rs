//! Multi-backend dispatcher: health tracking, routable-backend selection,
//! and the primary-then-secondary `create_run`/`create_model` protocol.
//!
//! Reads go to the first routable backend, lowest index first; writes fan
//! out to every routable backend in parallel over a bounded `rayon` pool.
//! If no backend is currently routable, the dispatcher falls back to
//! trying all of them rather than refusing outright — operators are
//! expected to alert on the one-time warning this logs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::backend::{ApiExperiment, Backend, CreateRunRequest};
use crate::daemon::{Daemon, DaemonWork};
use crate::error::{Error, Result};
use crate::health::BackendHealth;

const MAX_FANOUT_WORKERS: usize = 10;
const SECONDARY_CREATE_RUN_TIMEOUT: Duration = Duration::from_secs(30);

struct BackendSlot {
    index: usize,
    backend: Arc<dyn Backend>,
    health: Mutex<BackendHealth>,
}

impl BackendSlot {
    fn record_success(&self) {
        let mut health = self.health.lock().unwrap();
        *health = health.on_success(Instant::now());
    }

    fn record_failure(&self, error: &Error) {
        let mut health = self.health.lock().unwrap();
        *health = health.on_failure(error.to_string());
    }

    fn is_routable(&self) -> bool {
        self.health.lock().unwrap().is_routable()
    }
}

/// Routes reads to the first healthy backend and fans out writes to every
/// routable one.
pub struct Dispatcher {
    slots: Vec<Arc<BackendSlot>>,
    pool: ThreadPool,
    warned_all_degraded: Arc<AtomicBool>,
    health_check_daemon: Mutex<Option<Daemon>>,
}

impl Dispatcher {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Configuration("at least one backend is required".to_string()));
        }

        let slots = backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| {
                Arc::new(BackendSlot {
                    index,
                    backend,
                    health: Mutex::new(BackendHealth::initial()),
                })
            })
            .collect::<Vec<_>>();

        let num_threads = slots.len().min(MAX_FANOUT_WORKERS).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::Other(format!("failed to build dispatcher thread pool: {e}")))?;

        Ok(Dispatcher {
            slots,
            pool,
            warned_all_degraded: Arc::new(AtomicBool::new(false)),
            health_check_daemon: Mutex::new(None),
        })
    }

    pub fn backend_count(&self) -> usize {
        self.slots.len()
    }

    pub fn health_snapshot(&self) -> Vec<BackendHealth> {
        self.slots.iter().map(|s| s.health.lock().unwrap().clone()).collect()
    }

    /// The underlying backend handles, in configuration order — used by
    /// [`crate::session`] to build one [`crate::processor::AsyncOperationProcessor`]
    /// per backend when a run starts.
    pub fn backend_refs(&self) -> Vec<Arc<dyn Backend>> {
        self.slots.iter().map(|s| s.backend.clone()).collect()
    }

    /// Indices of currently-routable backends, lowest first; falls back to
    /// every backend if none are routable.
    fn routable_indices(&self) -> Vec<usize> {
        let routable: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| s.is_routable())
            .map(|s| s.index)
            .collect();

        if routable.is_empty() {
            if !self.warned_all_degraded.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "all {} backends are degraded; falling back to trying all of them",
                    self.slots.len()
                );
            }
            self.slots.iter().map(|s| s.index).collect()
        } else {
            self.warned_all_degraded.store(false, Ordering::SeqCst);
            routable
        }
    }

    /// Try `f` against routable backends in order, lowest index first,
    /// returning the first success. If every attempted backend fails,
    /// returns [`Error::AllBackendsFailed`] — unwrapped to the bare cause
    /// when there is only one backend configured.
    pub fn read_first_available<T>(&self, f: impl Fn(&dyn Backend) -> Result<T>) -> Result<T> {
        let mut failures = Vec::new();
        for index in self.routable_indices() {
            let slot = &self.slots[index];
            match f(slot.backend.as_ref()) {
                Ok(value) => {
                    slot.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    slot.record_failure(&e);
                    failures.push((index, e.to_string()));
                }
            }
        }
        Err(Error::AllBackendsFailed(failures).into_single_backend_cause())
    }

    /// Fan out `f` to every routable backend in parallel. Returns `Ok(())`
    /// if at least one backend accepted the write; returns
    /// [`Error::AllBackendsFailed`] only if every routable backend failed.
    pub fn write_fanout(&self, f: impl Fn(&dyn Backend) -> Result<()> + Sync) -> Result<()> {
        let indices = self.routable_indices();
        let results: Vec<(usize, Result<()>)> = self.pool.install(|| {
            use rayon::prelude::*;
            indices
                .par_iter()
                .map(|&index| {
                    let slot = &self.slots[index];
                    let result = f(slot.backend.as_ref());
                    match &result {
                        Ok(()) => slot.record_success(),
                        Err(e) => slot.record_failure(e),
                    }
                    (index, result)
                })
                .collect()
        });

        let failures: Vec<(usize, String)> = results
            .iter()
            .filter_map(|(index, r)| r.as_ref().err().map(|e| (*index, e.to_string())))
            .collect();

        if failures.len() == results.len() {
            return Err(Error::AllBackendsFailed(failures).into_single_backend_cause());
        }
        for (index, message) in &failures {
            tracing::warn!("[backend {index}] write failed, other backends still replicated: {message}");
        }
        Ok(())
    }

    /// Create a run: the primary backend (index 0) is authoritative for
    /// the returned identifiers; secondaries are called in parallel and
    /// made to converge to the primary's `id`/`sys_id`. Primary
    /// failure is fatal; secondary failures mark that backend degraded but
    /// do not fail the call.
    pub fn create_run(&self, custom_id: Option<String>) -> Result<ApiExperiment> {
        let primary = &self.slots[0];
        let primary_request = CreateRunRequest {
            custom_id: custom_id.clone(),
            external_id: None,
            external_sys_id: None,
        };

        let primary_result = primary.backend.create_run(&primary_request);
        let primary_experiment = match primary_result {
            Ok(experiment) => {
                primary.record_success();
                experiment
            }
            Err(e) => {
                primary.record_failure(&e);
                return Err(e);
            }
        };

        if self.slots.len() == 1 {
            return Ok(primary_experiment);
        }

        let secondary_request = CreateRunRequest {
            custom_id,
            external_id: Some(primary_experiment.id.clone()),
            external_sys_id: Some(primary_experiment.sys_id.clone()),
        };

        self.pool.install(|| {
            use rayon::prelude::*;
            self.slots[1..].par_iter().for_each(|slot| {
                let deadline = Instant::now() + SECONDARY_CREATE_RUN_TIMEOUT;
                let result = slot.backend.create_run(&secondary_request);
                match result {
                    Ok(_) if Instant::now() <= deadline => slot.record_success(),
                    Ok(_) => {
                        tracing::warn!(
                            "[backend {}] create_run converged after the {}s secondary timeout",
                            slot.index,
                            SECONDARY_CREATE_RUN_TIMEOUT.as_secs()
                        );
                        slot.record_success();
                    }
                    Err(e) => {
                        tracing::warn!(
                            "[backend {}] secondary create_run failed, marking degraded: {e}",
                            slot.index
                        );
                        slot.record_failure(&e);
                    }
                }
            });
        });

        Ok(primary_experiment)
    }

    /// Register a model. Unlike [`Dispatcher::create_run`], there is no
    /// primary/secondary distinction: every backend is called in parallel,
    /// the call succeeds if any one of them does, and the returned
    /// experiment is the one from the lowest-indexed backend among the
    /// successes.
    pub fn create_model(&self, custom_id: Option<String>) -> Result<ApiExperiment> {
        let request = CreateRunRequest {
            custom_id,
            external_id: None,
            external_sys_id: None,
        };

        let results: Vec<(usize, Result<ApiExperiment>)> = self.pool.install(|| {
            use rayon::prelude::*;
            self.slots
                .par_iter()
                .map(|slot| {
                    let result = slot.backend.create_model(&request);
                    match &result {
                        Ok(_) => slot.record_success(),
                        Err(e) => slot.record_failure(e),
                    }
                    (slot.index, result)
                })
                .collect()
        });

        let mut failures = Vec::new();
        let mut successes: Vec<(usize, ApiExperiment)> = Vec::new();
        for (index, result) in results {
            match result {
                Ok(experiment) => successes.push((index, experiment)),
                Err(e) => failures.push((index, e.to_string())),
            }
        }

        if successes.is_empty() {
            return Err(Error::AllBackendsFailed(failures).into_single_backend_cause());
        }

        successes.sort_by_key(|(index, _)| *index);
        Ok(successes.into_iter().next().unwrap().1)
    }

    /// Collect this run's URL from every backend, skipping ones that fail,
    /// rather than stopping at the first routable backend as other reads
    /// do — a URL is useful from every mirror, not just the primary.
    pub fn get_all_run_urls(&self, run_id: &str) -> Vec<String> {
        self.pool.install(|| {
            use rayon::prelude::*;
            self.slots
                .par_iter()
                .filter_map(|slot| match slot.backend.get_run_url(run_id) {
                    Ok(url) => {
                        slot.record_success();
                        Some(url)
                    }
                    Err(e) => {
                        slot.record_failure(&e);
                        None
                    }
                })
                .collect()
        })
    }

    /// Force a backend's health to degraded, e.g. when a caller detects a
    /// disconnect out-of-band.
    pub fn mark_backend_disconnected(&self, index: usize, reason: impl Into<String>) {
        if let Some(slot) = self.slots.get(index) {
            let reason = reason.into();
            // A caller-confirmed disconnect should leave the routable set
            // immediately rather than waiting for the usual three strikes,
            // so drive the health straight to Degraded.
            let mut health = slot.health.lock().unwrap();
            while health.is_routable() {
                *health = health.on_failure(reason.clone());
            }
        }
    }

    /// Start a background timer pinging every degraded backend, healing it
    /// back to `Healthy` on a successful ping.
    pub fn start_health_check_timer(self: &Arc<Self>, interval: Duration) {
        let dispatcher = self.clone();
        let daemon = Daemon::spawn(
            "dispatcher-health-check",
            interval,
            Box::new(HealthCheckWork { dispatcher }),
        );
        *self.health_check_daemon.lock().unwrap() = Some(daemon);
    }

    /// Stop the health-check timer and close every backend.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(daemon) = self.health_check_daemon.lock().unwrap().take() {
            daemon.join();
        }
        for slot in &self.slots {
            if let Err(e) = slot.backend.close() {
                tracing::warn!("[backend {}] failed to close cleanly: {e}", slot.index);
            }
        }
        Ok(())
    }
}

struct HealthCheckWork {
    dispatcher: Arc<Dispatcher>,
}

impl DaemonWork for HealthCheckWork {
    fn work(&mut self) {
        for slot in &self.dispatcher.slots {
            if slot.is_routable() {
                continue;
            }
            match slot.backend.health_ping() {
                Ok(()) => {
                    tracing::info!("[backend {}] health check succeeded, marking healthy", slot.index);
                    slot.record_success();
                }
                Err(e) => {
                    tracing::debug!("[backend {}] health check still failing: {e}", slot.index);
                }
            }
        }
    }
}
