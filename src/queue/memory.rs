//! In-memory durable-queue variant.
//! Nothing survives a process restart; trades crash-safety for speed and
//! the absence of filesystem setup in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{DurableQueue, QueueEntry};
use crate::error::{Error, Result};
use crate::operation::Operation;

struct State {
    entries: VecDeque<QueueEntry>,
    next_version: u64,
    acked_through: u64,
}

pub struct MemoryQueue {
    state: Mutex<State>,
    empty_cond: Condvar,
    closed: AtomicBool,
    size: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                next_version: 1,
                acked_through: 0,
            }),
            empty_cond: Condvar::new(),
            closed: AtomicBool::new(false),
            size: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableQueue for MemoryQueue {
    fn put(&self, operation: Operation) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::MultiBackendClosed);
        }
        let mut state = self.state.lock().unwrap();
        let version = state.next_version;
        state.next_version += 1;
        state.entries.push_back(QueueEntry {
            version,
            at: Instant::now(),
            obj: operation,
        });
        self.size.store(state.entries.len() as u64, Ordering::SeqCst);
        Ok(version)
    }

    fn get_batch(&self, max: usize) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.iter().take(max).cloned().collect())
    }

    fn ack(&self, version: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if version <= state.acked_through {
            return Ok(());
        }
        state.acked_through = version;
        while matches!(state.entries.front(), Some(e) if e.version <= version) {
            state.entries.pop_front();
        }
        self.size.store(state.entries.len() as u64, Ordering::SeqCst);
        if state.entries.is_empty() {
            self.empty_cond.notify_all();
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn wait_for_empty(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        if state.entries.is_empty() {
            return true;
        }
        let (state, timeout_result) = self
            .empty_cond
            .wait_timeout_while(state, timeout, |s| !s.entries.is_empty())
            .unwrap();
        !timeout_result.timed_out() || state.entries.is_empty()
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_assigns_increasing_versions() {
        let queue = MemoryQueue::new();
        let v1 = queue.put(Operation::new(serde_json::json!({}))).unwrap();
        let v2 = queue.put(Operation::new(serde_json::json!({}))).unwrap();
        assert!(v2 > v1);
    }

    #[test]
    fn ack_removes_delivered_entries() {
        let queue = MemoryQueue::new();
        let v1 = queue.put(Operation::new(serde_json::json!({}))).unwrap();
        queue.put(Operation::new(serde_json::json!({}))).unwrap();
        assert_eq!(queue.size(), 2);
        queue.ack(v1).unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn ack_is_idempotent() {
        let queue = MemoryQueue::new();
        let v1 = queue.put(Operation::new(serde_json::json!({}))).unwrap();
        queue.ack(v1).unwrap();
        queue.ack(v1).unwrap();
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn wait_for_empty_returns_true_when_already_empty() {
        let queue = MemoryQueue::new();
        assert!(queue.wait_for_empty(Duration::from_millis(10)));
    }

    #[test]
    fn put_rejected_after_close() {
        let queue = MemoryQueue::new();
        queue.close().unwrap();
        assert!(queue.put(Operation::new(serde_json::json!({}))).is_err());
    }
}
