//! # trackfan
//!
//! Client library for a multi-backend experiment-tracking service. Writes
//! are replicated across N backend servers, reads are served from the
//! first healthy one. A single client typically talks to one primary
//! backend plus one or more mirrors; if the primary degrades, reads and
//! future writes transparently fail over to a mirror without the caller
//! noticing (beyond elevated latency during the failover window).
//!
//! ## Core Concepts
//!
//! - **[`session::Client`]** — the entry point. Wires [`config::ClientConfig`]
//!   into a [`dispatcher::Dispatcher`] over one [`backend::Backend`] per
//!   configured server.
//! - **[`session::Run`]** — a single experiment run. `log()` enqueues
//!   operations for background replication (`Mode::Async`/`Debug`) or
//!   sends them synchronously (`Mode::Sync`).
//! - **[`dispatcher::Dispatcher`]** — tracks per-backend [`health::BackendHealth`],
//!   routes reads to the first routable backend, and fans writes out to
//!   every routable one.
//! - **[`processor::AsyncOperationProcessor`]** — one per (run, backend)
//!   pair: a [`queue::DurableQueue`] plus a [`daemon::Daemon`] consumer
//!   thread draining it.
//! - **[`processor::MultiBackendOperationProcessor`]** — replicates a
//!   write across every backend's async processor.
//! - **[`signals::Signal`]** — lossy progress events a
//!   [`signals_monitor::SignalsMonitor`] turns into lag/no-progress
//!   callbacks.
//!
//! ## Quick Start
//!
//! ```no_run
//! use trackfan::{BackendConfig, Client, ClientConfig, Mode, Operation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = vec![
//!     BackendConfig::new("https://primary.example.com", "token-a"),
//!     BackendConfig::new("https://mirror.example.com", "token-b"),
//! ];
//! let config = ClientConfig::new(backends, Mode::Async)?;
//! let client = Client::new(config)?;
//!
//! let run = client.create_run(None)?;
//! run.log(Operation::new(serde_json::json!({ "metric": "loss", "value": 0.42 })))?;
//! run.stop()?;
//! client.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod logging;
pub mod operation;
pub mod processor;
pub mod queue;
pub mod session;
pub mod signals;
pub mod signals_monitor;

pub use config::{BackendConfig, ClientConfig, Mode};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use health::BackendHealth;
pub use operation::Operation;
pub use session::{Client, Run};
