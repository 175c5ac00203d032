//! Converter worker processes and the pool that supervises them.
//!
//! Binary forms are converted by an external program (a JVM wrapping the
//! Forms API). It is slow to start and occasionally dies mid-call, so a
//! fixed number of workers is kept warm and any worker that fails a call is
//! thrown away and replaced.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       WorkerPool (Converter)                    │
//! │  - one respawn loop per slot                                    │
//! │  - fresh / free queues, bounded                                 │
//! │  - retry with linear backoff, diagnostics on failure            │
//! └─────────────────────────────────────────────────────────────────┘
//!                │ WorkerSpawner                │ WorkerTransport
//!                ▼                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │ PipedWorker                  │  │ NetworkedWorker              │
//! │  "src" "dst" ──► stdin       │  │  POST / on 127.0.0.1:<port>  │
//! │  OK / ERR    ◄── stdout      │  │  GET ?src=&dst=              │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!                │ stderr                       │ stdout + stderr
//!                └──────────► DiagnosticsBuffer ◄┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use forms2xml::worker::{PoolConfig, ProcessSpawner, TransportKind, WorkerPool};
//!
//! let spawner = ProcessSpawner::new(command, TransportKind::Pipe, timeout, work_dir)?;
//! let pool = WorkerPool::start(Arc::new(spawner), PoolConfig::default(), &shutdown);
//!
//! // Converts through whichever worker is free; dropped workers are respawned
//! pool.convert_files(&cancel, Path::new("out.xml"), Path::new("in.fmb")).await?;
//! ```

mod error;
mod networked;
mod piped;
mod pool;
mod process;
pub mod protocol;
mod transport;

pub use error::{WorkerError, WorkerResult};
pub use networked::NetworkedWorker;
pub use piped::PipedWorker;
pub use pool::{PoolConfig, PoolStats, PooledClient, WorkerPool};
pub use process::{free_loopback_port, DiagnosticsBuffer, StdioMode, WorkerCommand, WorkerProcess};
pub use transport::{ProcessSpawner, TransportKind, WorkerId, WorkerSpawner, WorkerTransport};
