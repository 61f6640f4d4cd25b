//! Crash-safe, disk-backed durable-queue variant: an append-only JSON-lines log of entries, plus a
//! separately fsync'd cursor file holding the last acknowledged version as
//! ASCII decimal. On restart the log is replayed and anything at or below
//! the cursor is skipped, giving crash-safe at-least-once delivery without
//! needing a real embedded database.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{DurableQueue, QueueEntry};
use crate::error::Result;
use crate::operation::Operation;

const CURSOR_FILE: &str = "cursor";
const LOG_FILE: &str = "log";

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    version: u64,
    obj: Operation,
}

struct State {
    log_file: File,
    entries: VecDeque<QueueEntry>,
    next_version: u64,
    acked_through: u64,
    closed: bool,
}

/// An append-log-backed queue rooted at a per-backend directory.
pub struct DiskQueue {
    dir: PathBuf,
    state: Mutex<State>,
    empty_cond: Condvar,
}

impl DiskQueue {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let acked_through = read_cursor(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let mut read_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        let mut entries = VecDeque::new();
        let mut next_version = 1;
        {
            let reader = BufReader::new(&mut read_file);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: DiskEntry = serde_json::from_str(&line)?;
                next_version = next_version.max(parsed.version + 1);
                if parsed.version > acked_through {
                    entries.push_back(QueueEntry {
                        version: parsed.version,
                        at: Instant::now(),
                        obj: parsed.obj,
                    });
                }
            }
        }
        read_file.seek(SeekFrom::End(0))?;

        Ok(DiskQueue {
            dir,
            state: Mutex::new(State {
                log_file: read_file,
                entries,
                next_version,
                acked_through,
                closed: false,
            }),
            empty_cond: Condvar::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn read_cursor(dir: &Path) -> Result<u64> {
    let path = dir.join(CURSOR_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents.trim().parse().unwrap_or(0))
}

fn write_cursor(dir: &Path, version: u64) -> Result<()> {
    let path = dir.join(CURSOR_FILE);
    let tmp_path = dir.join(format!("{CURSOR_FILE}.tmp"));
    let mut file = File::create(&tmp_path)?;
    file.write_all(version.to_string().as_bytes())?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

impl DurableQueue for DiskQueue {
    fn put(&self, operation: Operation) -> Result<u64> {
        use crate::error::Error;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::MultiBackendClosed);
        }
        let version = state.next_version;
        state.next_version += 1;

        let line = serde_json::to_string(&DiskEntry {
            version,
            obj: operation.clone(),
        })?;
        writeln!(state.log_file, "{line}")?;

        state.entries.push_back(QueueEntry {
            version,
            at: Instant::now(),
            obj: operation,
        });
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
        write_cursor(&self.dir, version)?;
        if state.entries.is_empty() {
            self.empty_cond.notify_all();
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log_file.sync_all()?;
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
        self.state.lock().unwrap().entries.len() as u64
    }

    fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.closed || !state.entries.is_empty() {
            return Ok(());
        }
        drop(state);
        let _ = std::fs::remove_file(self.dir.join(LOG_FILE));
        let _ = std::fs::remove_file(self.dir.join(CURSOR_FILE));
        Ok(())
    }
}
