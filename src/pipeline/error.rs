//! Job error types.

use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

use super::pipe::is_pipe_error;
use crate::rewrite::RewriteError;
use crate::worker::WorkerError;

/// Result type for pipeline jobs.
pub type JobResult<T> = Result<T, JobError>;

/// One unit of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Rewrite,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => f.write_str("decode"),
            Stage::Rewrite => f.write_str("rewrite"),
            Stage::Encode => f.write_str("encode"),
        }
    }
}

/// Failure of a single stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Convert(#[from] WorkerError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("stage cancelled")]
    Cancelled,
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            StageError::Cancelled => true,
            StageError::Convert(err) => err.is_cancelled(),
            _ => false,
        }
    }

    /// Whether this failure was only received from a neighbouring stage.
    pub fn is_propagated(&self) -> bool {
        is_pipe_error(self)
    }
}

/// Failure classes reported for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ConversionFailed,
    TransportBroken,
    SchemaViolation,
    PreconditionFailed,
    Cancelled,
    Io,
}

impl FailureKind {
    /// Whether running the job again could change the outcome.
    pub fn is_retriable(self) -> bool {
        !matches!(
            self,
            FailureKind::SchemaViolation | FailureKind::PreconditionFailed | FailureKind::Cancelled
        )
    }
}

/// Errors that end a pipeline job.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job cannot run as specified; nothing was started.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The job was cancelled before it finished.
    #[error("job cancelled")]
    Cancelled,

    /// A stage failed.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    /// Creating or committing the destination failed.
    #[error("cannot write destination: {0}")]
    Destination(#[source] io::Error),
}

impl JobError {
    pub fn stage(stage: Stage, source: impl Into<StageError>) -> Self {
        JobError::Stage {
            stage,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Precondition(_) => FailureKind::PreconditionFailed,
            JobError::Cancelled => FailureKind::Cancelled,
            JobError::Destination(_) => FailureKind::Io,
            JobError::Stage { source, .. } => match source {
                StageError::Cancelled => FailureKind::Cancelled,
                StageError::Io(_) => FailureKind::Io,
                StageError::Rewrite(err) if err.is_schema_violation() => {
                    FailureKind::SchemaViolation
                }
                StageError::Rewrite(_) => FailureKind::Io,
                StageError::Convert(err) => match err.root() {
                    WorkerError::Cancelled => FailureKind::Cancelled,
                    WorkerError::ConversionFailed { .. } => FailureKind::ConversionFailed,
                    WorkerError::Spool(_) | WorkerError::Deliver(_) => FailureKind::Io,
                    _ => FailureKind::TransportBroken,
                },
            },
        }
    }

    /// The message of the deepest cause.
    pub fn root_cause(&self) -> String {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(source) = current.source() {
            current = source;
        }
        current.to_string()
    }

    /// The failing stage, when there is one, and the deepest cause.
    pub fn summary(&self) -> String {
        match self {
            JobError::Stage { stage, .. } => format!("{stage}: {}", self.root_cause()),
            other => other.to_string(),
        }
    }
}

/// Pick the error that explains a failed job.
///
/// `results` are in stage order. An original failure beats one that was
/// merely received through a pipe, and either beats a cancellation.
pub(crate) fn first_failure(results: Vec<(Stage, Result<(), StageError>)>) -> Option<JobError> {
    let mut original = None;
    let mut propagated = None;
    let mut cancelled = false;
    for (stage, result) in results {
        let Err(err) = result else { continue };
        if err.is_cancelled() {
            cancelled = true;
        } else if err.is_propagated() {
            propagated.get_or_insert((stage, err));
        } else {
            original.get_or_insert((stage, err));
        }
    }
    match original.or(propagated) {
        Some((stage, source)) => Some(JobError::Stage { stage, source }),
        None if cancelled => Some(JobError::Cancelled),
        None => None,
    }
}
