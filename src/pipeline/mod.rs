//! End-to-end conversion jobs.
//!
//! A job composes up to three stages connected by in-memory pipes:
//!
//! ```text
//!   source.fmb ──► decode ──pipe──► rewrite ──pipe──► encode ──► .dest.part ──rename──► dest.fmb
//!                    │                 │
//!                    ▼                 ▼
//!                source.xml         dest.xml        (optional snapshots)
//! ```
//!
//! Every stage runs concurrently with its neighbours. A failing stage closes
//! its pipe ends with its error and cancels the job, so the other stages stop
//! promptly and report what they observed; [`Orchestrator::run`] then picks
//! the error closest to the root cause.
//!
//! # Example
//!
//! ```ignore
//! use forms2xml::pipeline::{Direction, JobSpec, Orchestrator, PipelineJob};
//!
//! let orchestrator = Orchestrator::new(pool.clone(), pool, FormsXmlProcessor::default());
//! let spec = JobSpec::new("forms/ORDERS.fmb", Direction::Roundtrip).with_snapshots(true);
//! let outcome = orchestrator.run(PipelineJob::new(spec), &cancel).await?;
//! println!("wrote {}", outcome.destination.display());
//! ```

pub mod batch;
mod dest;
mod error;
mod job;
mod orchestrator;
mod pipe;
mod tee;

pub use batch::{run_batch, BatchOptions, JobReport};
pub use dest::{same_file, AtomicDestination};
pub use error::{FailureKind, JobError, JobResult, Stage, StageError};
pub use job::{Direction, JobSpec, JobState, PipelineJob, DEFAULT_SUFFIX};
pub use orchestrator::{JobOutcome, Orchestrator, DEFAULT_PIPE_CAPACITY};
pub use pipe::{is_pipe_error, pipe, PipeError, PipeReader, PipeWriter};
pub use tee::{snapshot_path, Snapshot, TeeWriter};
