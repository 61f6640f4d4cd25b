//! Durable operation queue.
//!
//! One queue per backend's async processor. `put` assigns each entry a
//! monotonically increasing version; `ack` marks versions as delivered.
//! Two implementations: [`disk::DiskQueue`] (the default, crash-safe) and
//! [`memory::MemoryQueue`].

pub mod disk;
pub mod memory;

pub use disk::DiskQueue;
pub use memory::MemoryQueue;

use std::time::Instant;

use crate::error::Result;
use crate::operation::Operation;

/// One durably-queued operation, tagged with its assigned version and
/// enqueue time.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub version: u64,
    pub at: Instant,
    pub obj: Operation,
}

/// The contract every queue implementation satisfies.
///
/// Implementations must be `Send + Sync`: the owning processor's producer
/// thread calls `put` while its consumer thread calls `get_batch`/`ack`
/// concurrently.
pub trait DurableQueue: Send + Sync {
    /// Enqueue an operation, returning the version assigned to it.
    fn put(&self, operation: Operation) -> Result<u64>;

    /// Return up to `max` unacknowledged entries, oldest first. Does not
    /// remove them — call [`DurableQueue::ack`] once a batch has been
    /// durably accepted by a backend.
    fn get_batch(&self, max: usize) -> Result<Vec<QueueEntry>>;

    /// Mark every version up to and including `version` as delivered.
    /// Idempotent: acking an already-acked version is a no-op.
    fn ack(&self, version: u64) -> Result<()>;

    /// Force any buffered state to durable storage.
    fn flush(&self) -> Result<()>;

    /// Block the calling thread until every enqueued version has been
    /// acknowledged, or `timeout` elapses. Returns `true` if the queue
    /// drained in time.
    fn wait_for_empty(&self, timeout: std::time::Duration) -> bool;

    /// Number of entries enqueued but not yet acknowledged.
    fn size(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Mark the queue closed: no further `put` calls are accepted.
    fn close(&self) -> Result<()>;

    /// Remove any on-disk state backing this queue. Only valid once the
    /// queue is closed and fully drained.
    fn cleanup(&self) -> Result<()>;
}
