//! Background worker thread with a pause/resume/interrupt state machine,
//! and the connection-retry wrapper used by every such worker to survive
//! transient backend outages.
//!
//! A daemon is a native OS thread guarded by one `Condvar`: its state
//! transitions (`Init` → `Working` → `Pausing` → `Paused` → `Working` →
//! `Stopped`, plus `Interrupted`) are all driven through that single
//! condition variable, so callers can `pause()`/`resume()`/`interrupt()`
//! from another thread without racing the worker loop. The retry wrapper
//! catches connection-lost and rate-limit errors, backs off, and retries
//! until the daemon is interrupted or a non-retryable error appears.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

/// The lifecycle state of a [`Daemon`] worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Constructed but not yet started.
    Init,
    /// Running `work()` in a loop.
    Working,
    /// Asked to pause; waiting for the worker to observe it.
    Pausing,
    /// Paused; `work()` is not being called.
    Paused,
    /// Asked to stop; will not run `work()` again.
    Interrupted,
    /// The worker thread has exited.
    Stopped,
}

impl DaemonState {
    /// Whether the daemon is in any state that counts as "alive" for
    /// `is_running()`.
    pub fn is_running(self) -> bool {
        matches!(self, DaemonState::Working | DaemonState::Pausing | DaemonState::Paused)
    }

    /// Whether the daemon has reached a terminal state and will not run
    /// `work()` again.
    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Interrupted | DaemonState::Stopped)
    }
}

/// Shared state a [`Daemon`] and its controlling handle coordinate through.
/// One `Condvar` guards all transitions.
pub struct DaemonShared {
    state: Mutex<DaemonState>,
    cond: Condvar,
    /// Backoff accumulated by the connection-retry wrapper; exposed here
    /// so the wrapper and the daemon's own logging share one counter and
    /// reset it to zero (logging "Communication restored!") together.
    last_backoff: Mutex<Duration>,
}

impl DaemonShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DaemonState::Init),
            cond: Condvar::new(),
            last_backoff: Mutex::new(Duration::ZERO),
        })
    }

    /// Current state, for a handle outside the worker thread.
    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_interrupted(&self) -> bool {
        self.state().is_terminal()
    }

    /// Ask the worker to stop. Idempotent.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        *state = DaemonState::Interrupted;
        self.cond.notify_all();
    }

    /// Ask the worker to pause, and block the caller until it has.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == DaemonState::Interrupted {
            return;
        }
        *state = DaemonState::Pausing;
        self.cond.notify_all();
        let _ = self
            .cond
            .wait_while(state, |s| *s == DaemonState::Pausing)
            .unwrap();
    }

    /// Resume a paused worker.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != DaemonState::Interrupted {
            *state = DaemonState::Working;
            self.cond.notify_all();
        }
    }

    /// Wake the worker without changing its state — used to cut short a
    /// sleep between `work()` calls.
    pub fn wake_up(&self) {
        self.cond.notify_all();
    }

    /// Currently accumulated connection-retry backoff. Greater than zero
    /// means the last attempt against this daemon's backend failed and has
    /// not yet recovered.
    pub fn last_backoff(&self) -> Duration {
        *self.last_backoff.lock().unwrap()
    }

    fn record_backoff_reset(&self) -> bool {
        let mut backoff = self.last_backoff.lock().unwrap();
        let was_backing_off = *backoff > Duration::ZERO;
        *backoff = Duration::ZERO;
        was_backing_off
    }

    fn advance_backoff(&self) -> Duration {
        let mut backoff = self.last_backoff.lock().unwrap();
        *backoff = if *backoff == Duration::ZERO {
            INITIAL_RETRY_BACKOFF
        } else {
            (*backoff * 2).min(MAX_RETRY_BACKOFF)
        };
        *backoff
    }

    /// Block for up to `timeout`, waking early if interrupted. Used by the
    /// retry wrapper instead of a plain sleep so an `interrupt()` during
    /// backoff takes effect immediately.
    fn wait_timeout_unless_interrupted(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.is_terminal())
            .unwrap();
    }
}

/// Work a [`Daemon`] performs on each iteration. Implementors provide the
/// per-tick action; the daemon handles the pause/resume/sleep loop around
/// it.
pub trait DaemonWork: Send {
    /// Run one unit of work. Called repeatedly while the daemon is in the
    /// `Working` state, with `sleep_time` between calls.
    fn work(&mut self);
}

/// A background worker thread with a pause/resume/interrupt state
/// machine.
pub struct Daemon {
    shared: Arc<DaemonShared>,
    sleep_time: Duration,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Daemon {
    /// Spawn the worker thread running `work` in a loop, sleeping
    /// `sleep_time` between iterations while `Working`.
    pub fn spawn(name: impl Into<String>, sleep_time: Duration, work: Box<dyn DaemonWork>) -> Self {
        Self::spawn_with(name, sleep_time, move |_shared| work)
    }

    /// Like [`Daemon::spawn`], but `build` receives the daemon's shared
    /// state before the thread starts — used by workers (the async
    /// processor's consumer) whose `work()` needs to call
    /// [`with_connection_retry`] against the same `DaemonShared` that
    /// `pause`/`interrupt` operate on.
    pub fn spawn_with(
        name: impl Into<String>,
        sleep_time: Duration,
        build: impl FnOnce(Arc<DaemonShared>) -> Box<dyn DaemonWork> + Send + 'static,
    ) -> Self {
        let shared = DaemonShared::new();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut work = build(worker_shared.clone());
                run_loop(worker_shared, sleep_time, &mut *work)
            })
            .expect("failed to spawn daemon thread");

        Daemon {
            shared,
            sleep_time,
            handle: Some(handle),
        }
    }

    pub fn shared(&self) -> Arc<DaemonShared> {
        self.shared.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn pause(&self) {
        self.shared.pause();
    }

    pub fn resume(&self) {
        self.shared.resume();
    }

    pub fn wake_up(&self) {
        self.shared.wake_up();
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }

    /// Interrupt the worker and block until its thread has exited.
    pub fn join(mut self) {
        self.shared.interrupt();
        self.shared.wake_up();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }
}

fn run_loop(shared: Arc<DaemonShared>, sleep_time: Duration, work: &mut dyn DaemonWork) {
    {
        let mut state = shared.state.lock().unwrap();
        if *state != DaemonState::Interrupted {
            *state = DaemonState::Working;
        }
    }

    loop {
        {
            let mut state = shared.state.lock().unwrap();
            if state.is_terminal() {
                break;
            }
            if *state == DaemonState::Pausing {
                *state = DaemonState::Paused;
                shared.cond.notify_all();
                state = shared
                    .cond
                    .wait_while(state, |s| *s == DaemonState::Paused)
                    .unwrap();
                if state.is_terminal() {
                    break;
                }
            }
        }

        if shared.state() == DaemonState::Working {
            work.work();

            if !sleep_time.is_zero() {
                let state = shared.state.lock().unwrap();
                if *state == DaemonState::Working {
                    let _ = shared.cond.wait_timeout(state, sleep_time).unwrap();
                }
            }
        }
    }

    let mut state = shared.state.lock().unwrap();
    *state = DaemonState::Stopped;
    shared.cond.notify_all();
}

/// First backoff applied after a connection is lost.
pub const INITIAL_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Ceiling the backoff doubles toward.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(120);

/// Run `attempt` in a loop, catching [`Error::is_connection_lost`]
/// failures, logging, and backing off (doubling from 2s to a 120s
/// ceiling) before retrying — forever, until `shared` is interrupted or
/// `attempt` returns `Ok` or a non-connection error.
///
/// `backend_prefix` is logged ahead of every message, in the
/// `[backend N] (display_address)` shape.
pub fn with_connection_retry<T>(
    shared: &DaemonShared,
    backend_prefix: &str,
    mut attempt: impl FnMut() -> Result<T, Error>,
) -> Option<T> {
    loop {
        if shared.is_interrupted() {
            return None;
        }

        match attempt() {
            Ok(value) => {
                if shared.record_backoff_reset() {
                    tracing::info!("{backend_prefix} Communication restored!");
                }
                return Some(value);
            }
            Err(e) if e.is_connection_lost() => {
                let backoff = shared.advance_backoff();
                if backoff == INITIAL_RETRY_BACKOFF {
                    tracing::warn!(
                        "{backend_prefix} Connection failed: {e}. Retrying in {}s...",
                        INITIAL_RETRY_BACKOFF.as_secs()
                    );
                } else if !shared.is_interrupted() {
                    tracing::warn!(
                        "{backend_prefix} Connection still failing: {e}. Retrying in {}s...",
                        backoff.as_secs()
                    );
                }
                shared.wait_timeout_unless_interrupted(backoff);
            }
            Err(Error::RateLimit { message }) => {
                tracing::warn!("{backend_prefix} rate limited: {message}. Backing off.");
                let backoff = shared.advance_backoff();
                shared.wait_timeout_unless_interrupted(backoff);
            }
            Err(e) => {
                tracing::error!("{backend_prefix} unexpected error, worker exiting: {e}");
                return None;
            }
        }
    }
}

/// Format the `[backend N] (display_address)` prefix used on every
/// background-worker log line.
pub fn backend_log_prefix(index: usize, display_address: &str) -> String {
    format!("[backend {index}] ({display_address})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWork {
        count: Arc<AtomicUsize>,
    }

    impl DaemonWork for CountingWork {
        fn work(&mut self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn daemon_runs_work_and_stops_on_join() {
        let count = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::spawn(
            "test-daemon",
            Duration::from_millis(5),
            Box::new(CountingWork { count: count.clone() }),
        );
        std::thread::sleep(Duration::from_millis(60));
        daemon.join();
        assert!(count.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn pause_blocks_until_worker_parks() {
        let count = Arc::new(AtomicUsize::new(0));
        let daemon = Daemon::spawn(
            "test-daemon-pause",
            Duration::from_millis(2),
            Box::new(CountingWork { count: count.clone() }),
        );
        std::thread::sleep(Duration::from_millis(20));
        daemon.pause();
        assert_eq!(daemon.state(), DaemonState::Paused);
        let observed = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), observed);
        daemon.resume();
        std::thread::sleep(Duration::from_millis(20));
        assert!(count.load(Ordering::SeqCst) > observed);
        daemon.join();
    }

    #[test]
    fn retry_wrapper_gives_up_when_interrupted() {
        let shared = DaemonShared::new();
        shared.interrupt();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let result = with_connection_retry(&shared, "[backend 0]", move || {
            attempts2.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::ConnectionLost {
                cause: "refused".into(),
            })
        });
        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retry_wrapper_succeeds_eventually() {
        let shared = DaemonShared::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let result = with_connection_retry(&shared, "[backend 0]", move || {
            let n = attempts2.fetch_add(1, Ordering::SeqCst);
            if n < 1 {
                Err(Error::ConnectionLost {
                    cause: "refused".into(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result, Some(42));
    }

    #[test]
    fn non_connection_error_aborts_retry_loop() {
        let shared = DaemonShared::new();
        let result: Option<()> = with_connection_retry(&shared, "[backend 0]", || {
            Err(Error::WriteDenied {
                message: "run is read only".into(),
            })
        });
        assert!(result.is_none());
    }
}
