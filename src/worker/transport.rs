//! The seam between the pool and a concrete worker.
//!
//! A pool only ever sees [`WorkerTransport`] trait objects handed out by a
//! [`WorkerSpawner`]; which flavour of worker sits behind them is decided
//! once, when the spawner is built.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::WorkerResult;
use super::networked::NetworkedWorker;
use super::piped::PipedWorker;
use super::process::WorkerCommand;
use crate::convert::{ConversionRequest, ConvertResponse};

/// Identity of one worker incarnation within a pool.
pub type WorkerId = u64;

/// One started worker, able to serve one call at a time.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Convert a spooled payload.
    async fn convert(&self, request: &ConversionRequest) -> WorkerResult<ConvertResponse>;

    /// Convert the file at `src` into the file at `dst`.
    async fn convert_files(&self, dst: &Path, src: &Path) -> WorkerResult<()>;

    /// Whether the worker can still take calls.
    fn is_alive(&self) -> bool {
        true
    }

    /// Tear the worker down immediately.
    fn terminate(&self) {}

    /// Output captured since the last [`clear_diagnostics`](Self::clear_diagnostics).
    fn diagnostics(&self) -> String {
        String::new()
    }

    fn clear_diagnostics(&self) {}
}

/// Starts workers for a pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, id: WorkerId) -> WorkerResult<Box<dyn WorkerTransport>>;
}

/// How the pool talks to worker processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Request lines over stdin, status lines over stdout.
    #[default]
    Pipe,
    /// HTTP on a private loopback port.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Pipe => f.write_str("pipe"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// Spawns real worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    command: WorkerCommand,
    kind: TransportKind,
    startup_timeout: Duration,
    work_dir: PathBuf,
}

impl ProcessSpawner {
    /// Create a spawner.
    ///
    /// The worker runs inside `work_dir`, where payloads and results are
    /// staged; a relative `work_dir` is resolved against the current
    /// directory.
    pub fn new(
        mut command: WorkerCommand,
        kind: TransportKind,
        startup_timeout: Duration,
        work_dir: PathBuf,
    ) -> std::io::Result<Self> {
        let work_dir = if work_dir.is_absolute() {
            work_dir
        } else {
            std::env::current_dir()?.join(work_dir)
        };
        command.current_dir = Some(work_dir.clone());
        Ok(Self {
            command,
            kind,
            startup_timeout,
            work_dir,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, id: WorkerId) -> WorkerResult<Box<dyn WorkerTransport>> {
        match self.kind {
            TransportKind::Pipe => Ok(Box::new(PipedWorker::start(
                id,
                &self.command,
                self.work_dir.clone(),
            )?)),
            TransportKind::Http => Ok(Box::new(
                NetworkedWorker::start(id, &self.command, self.startup_timeout).await?,
            )),
        }
    }
}
