//! Drains the signal bus and fires user callbacks on lag/no-progress
//! conditions.
//!
//! The monitor tracks the last time each condition fired per backend and
//! only re-fires after `callbacks_interval` has passed, so a sustained lag
//! condition doesn't spam the callback on every signal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CallbackMode;
use crate::daemon::{Daemon, DaemonWork};
use crate::signals::{Signal, SignalReceiver};

/// A user-supplied callback, invoked with the backend index and the lag
/// that triggered it.
pub type LagCallback = Box<dyn Fn(usize, u64) + Send + Sync>;

/// A user-supplied callback, invoked with the backend index, fired when no
/// `BatchProcessed` signal has arrived within `callbacks_interval`.
pub type NoProgressCallback = Box<dyn Fn(usize) + Send + Sync>;

struct LastFired {
    lag: Option<Instant>,
    no_progress: Option<Instant>,
}

impl Default for LastFired {
    fn default() -> Self {
        LastFired {
            lag: None,
            no_progress: None,
        }
    }
}

/// Consumes [`Signal`]s from a backend's async processor and gates
/// callback firing on `callbacks_interval`.
pub struct SignalsMonitor {
    daemon: Option<Daemon>,
}

struct MonitorWork {
    backend_index: usize,
    receiver: SignalReceiver,
    callbacks_interval: Duration,
    async_no_progress_threshold: Duration,
    callback_mode: CallbackMode,
    last_fired: Mutex<LastFired>,
    on_lag: Option<Arc<LagCallback>>,
    on_no_progress: Option<Arc<NoProgressCallback>>,
    /// When a `BatchStarted` signal is outstanding (no matching
    /// `BatchProcessed` has arrived yet), the time it started. `None` means
    /// the queue is idle, which is never itself a no-progress condition.
    batch_started_at: Mutex<Option<Instant>>,
}

impl DaemonWork for MonitorWork {
    fn work(&mut self) {
        match self.receiver.recv_timeout(Duration::from_millis(200)) {
            Some(Signal::BatchLag { lag, .. }) => {
                self.maybe_fire_lag(lag);
            }
            Some(Signal::BatchStarted { at }) => {
                *self.batch_started_at.lock().unwrap() = Some(at);
            }
            Some(Signal::BatchProcessed { .. }) => {
                *self.batch_started_at.lock().unwrap() = None;
            }
            None => {
                let outstanding = *self.batch_started_at.lock().unwrap();
                if let Some(started_at) = outstanding {
                    if started_at.elapsed() >= self.async_no_progress_threshold {
                        self.maybe_fire_no_progress();
                    }
                }
            }
        }
    }
}

impl MonitorWork {
    fn maybe_fire_lag(&self, lag: u64) {
        let Some(callback) = &self.on_lag else { return };
        let mut last_fired = self.last_fired.lock().unwrap();
        let should_fire = last_fired
            .lag
            .map(|t| t.elapsed() >= self.callbacks_interval)
            .unwrap_or(true);
        if !should_fire {
            return;
        }
        last_fired.lag = Some(Instant::now());
        drop(last_fired);
        let callback = callback.clone();
        let backend_index = self.backend_index;
        self.invoke(move || callback(backend_index, lag));
    }

    fn maybe_fire_no_progress(&self) {
        let Some(callback) = &self.on_no_progress else { return };
        let mut last_fired = self.last_fired.lock().unwrap();
        let should_fire = last_fired
            .no_progress
            .map(|t| t.elapsed() >= self.callbacks_interval)
            .unwrap_or(true);
        if !should_fire {
            return;
        }
        last_fired.no_progress = Some(Instant::now());
        drop(last_fired);
        let callback = callback.clone();
        let backend_index = self.backend_index;
        self.invoke(move || callback(backend_index));
    }

    fn invoke(&self, call: impl FnOnce() + Send + 'static) {
        match self.callback_mode {
            CallbackMode::Inline => call(),
            CallbackMode::Spawned => {
                std::thread::spawn(call);
            }
        }
    }
}

impl SignalsMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        backend_index: usize,
        receiver: SignalReceiver,
        callbacks_interval: Duration,
        async_no_progress_threshold: Duration,
        callback_mode: CallbackMode,
        on_lag: Option<LagCallback>,
        on_no_progress: Option<NoProgressCallback>,
    ) -> Self {
        let work = MonitorWork {
            backend_index,
            receiver,
            callbacks_interval,
            async_no_progress_threshold,
            callback_mode,
            last_fired: Mutex::new(LastFired::default()),
            on_lag: on_lag.map(Arc::new),
            on_no_progress: on_no_progress.map(Arc::new),
            batch_started_at: Mutex::new(None),
        };

        let daemon = Daemon::spawn(
            format!("signals-monitor-{backend_index}"),
            Duration::from_millis(0),
            Box::new(work),
        );

        SignalsMonitor { daemon: Some(daemon) }
    }

    pub fn stop(mut self) {
        if let Some(daemon) = self.daemon.take() {
            daemon.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::signal_bus;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn fires_lag_callback_once_per_interval() {
        let (tx, rx) = signal_bus(8);
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();

        let monitor = SignalsMonitor::spawn(
            0,
            rx,
            Duration::from_secs(60),
            Duration::from_secs(300),
            CallbackMode::Inline,
            Some(Box::new(move |_index, lag| {
                fired2.fetch_add(lag, Ordering::SeqCst);
            })),
            None,
        );

        tx.send(Signal::BatchLag {
            at: Instant::now(),
            lag: 5000,
        });
        tx.send(Signal::BatchLag {
            at: Instant::now(),
            lag: 9000,
        });

        std::thread::sleep(Duration::from_millis(300));
        monitor.stop();

        // Only the first lag signal should have fired within the 60s
        // callbacks_interval.
        assert_eq!(fired.load(Ordering::SeqCst), 5000);
    }

    #[test]
    fn no_progress_only_fires_for_an_outstanding_batch_start() {
        let (tx, rx) = signal_bus(8);
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();

        let monitor = SignalsMonitor::spawn(
            0,
            rx,
            Duration::from_millis(50),
            Duration::from_millis(100),
            CallbackMode::Inline,
            None,
            Some(Box::new(move |_index| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        );

        // An idle channel (no BatchStarted ever sent) must never fire
        // no-progress, even though recv_timeout lapses repeatedly.
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tx.send(Signal::BatchStarted { at: Instant::now() });
        std::thread::sleep(Duration::from_millis(300));
        monitor.stop();

        assert!(fired.load(Ordering::SeqCst) >= 1);
    }
}
