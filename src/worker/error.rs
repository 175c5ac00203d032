//! Worker-specific error types.

use std::io;
use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while converting through a worker or endpoint.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// The process started but never became usable.
    #[error("worker failed to start: {0}")]
    StartupFailed(String),

    /// I/O failure talking to the worker.
    #[error("worker transport broken: {0}")]
    Transport(#[source] io::Error),

    /// HTTP failure talking to a networked worker or remote endpoint.
    #[error("worker transport broken: {0}")]
    Http(#[from] reqwest::Error),

    /// The worker answered with a failure status.
    #[error("conversion failed ({status}): {detail}")]
    ConversionFailed {
        /// Status line or HTTP status.
        status: String,
        /// Failure detail reported by the worker.
        detail: String,
    },

    /// The endpoint address is unusable.
    #[error("invalid converter endpoint: {0}")]
    InvalidEndpoint(String),

    /// Worker process exited unexpectedly.
    #[error("worker process exited unexpectedly")]
    WorkerExited,

    /// Failed to stage the request payload locally.
    #[error("failed to stage conversion payload: {0}")]
    Spool(#[source] io::Error),

    /// Failed to copy the converted output to its destination.
    #[error("failed to deliver converted output: {0}")]
    Deliver(#[source] io::Error),

    /// The caller cancelled the call.
    #[error("conversion cancelled")]
    Cancelled,

    /// The pool was shut down while the call waited for a worker.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// A failed attempt together with the worker's captured stderr.
    #[error("{source}\nworker output:\n{diagnostics}")]
    Diagnosed {
        source: Box<WorkerError>,
        diagnostics: String,
    },
}

impl WorkerError {
    /// Create a conversion failure from a worker status.
    pub fn conversion(status: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ConversionFailed {
            status: status.into(),
            detail: detail.into(),
        }
    }

    /// Attach captured worker output, unless there is none.
    pub fn with_diagnostics(self, diagnostics: String) -> Self {
        if diagnostics.trim().is_empty() {
            return self;
        }
        Self::Diagnosed {
            source: Box::new(self),
            diagnostics,
        }
    }

    /// The error without any attached diagnostics.
    pub fn root(&self) -> &WorkerError {
        match self {
            Self::Diagnosed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error indicates the worker has exited.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self.root(), Self::WorkerExited)
    }

    /// Check if the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Check if this is a failure status reported by the worker itself.
    pub fn is_conversion_failure(&self) -> bool {
        matches!(self.root(), Self::ConversionFailed { .. })
    }

    /// Check if this error is retriable.
    ///
    /// Transport and conversion failures are retried with a fresh worker.
    /// Local staging, delivery and cancellation are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.root(),
            Self::Transport(_)
                | Self::Http(_)
                | Self::ConversionFailed { .. }
                | Self::WorkerExited
                | Self::StartupFailed(_)
        )
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err)
    }
}
