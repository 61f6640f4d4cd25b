//! Signal bus for background-worker lifecycle observability.
//!
//! This is the programmatic counterpart to the `tracing` logs emitted
//! throughout the crate: a lossy, bounded channel that carries batch
//! progress and processor-stop events out to an optional
//! [`crate::signals_monitor::SignalsMonitor`]. It is a bounded `mpsc`
//! channel rather than an in-process handler call, so a slow or absent
//! consumer never blocks a producing worker thread.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Once;
use std::time::Instant;

/// Progress signals emitted by an async processor's consumer thread.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A new batch of operations started draining from the queue.
    BatchStarted {
        /// Wall-clock time the batch started.
        at: Instant,
    },
    /// A batch finished sending to the backend (successfully or not).
    BatchProcessed {
        /// Wall-clock time the batch finished.
        at: Instant,
        /// Number of operations in the batch.
        count: usize,
    },
    /// The consumer is falling behind: queue size minus last-acked version
    /// exceeds the configured lag threshold.
    BatchLag {
        /// Wall-clock time the lag was observed.
        at: Instant,
        /// How many operations are queued but not yet acknowledged.
        lag: u64,
    },
}

/// Terminal reasons a processor's consumer thread can report when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStopSignal {
    /// The daemon was interrupted while retrying a connection.
    ConnectionInterrupted,
    /// `stop()` is waiting for the queue to drain.
    WaitingForOperations,
    /// The queue drained and the consumer stopped cleanly.
    Success,
    /// The consumer could not reconnect before giving up.
    SyncFailure,
    /// A reconnect attempt itself failed.
    ReconnectFailure,
    /// Still waiting past the first `wait_for_empty` timeout.
    StillWaiting,
}

/// The sending half of the signal bus. Cheap to clone; every producer
/// thread (one per backend's consumer) holds its own clone.
#[derive(Clone)]
pub struct SignalSender {
    tx: SyncSender<Signal>,
    warned_once: std::sync::Arc<Once>,
}

impl SignalSender {
    /// Send a signal without blocking. If the channel is full — meaning no
    /// consumer is draining it fast enough, or none is attached — the
    /// signal is dropped and a one-time warning is logged.
    pub fn send(&self, signal: Signal) {
        match self.tx.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.warned_once.is_completed() {
                    self.warned_once.call_once(|| {
                        tracing::warn!(
                            "signal bus is full; dropping signals (no consumer keeping up)"
                        );
                    });
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                // No monitor was ever attached. Not an error.
            }
        }
    }
}

/// The receiving half of the signal bus, owned by a
/// [`crate::signals_monitor::SignalsMonitor`].
pub struct SignalReceiver {
    rx: Receiver<Signal>,
}

impl SignalReceiver {
    /// Drain the next signal, blocking up to `timeout`. Returns `None` on
    /// timeout or if every sender has been dropped.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Signal> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Create a bounded signal bus. `capacity` bounds how many unconsumed
/// signals may queue before new ones are dropped — kept small since
/// signals are progress indicators, not a durable log.
pub fn signal_bus(capacity: usize) -> (SignalSender, SignalReceiver) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (
        SignalSender {
            tx,
            warned_once: std::sync::Arc::new(Once::new()),
        },
        SignalReceiver { rx },
    )
}
