//! Runs jobs: wires converters and the rewrite engine into stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::dest::{same_file, AtomicDestination};
use super::error::{first_failure, JobError, JobResult, Stage, StageError};
use super::job::{Direction, JobSpec, JobState, PipelineJob};
use super::pipe::{pipe, PipeError, PipeReader, PipeWriter};
use super::tee::{snapshot_path, Snapshot, TeeWriter};
use crate::convert::{Converter, MimeType};
use crate::rewrite::{FormsXmlProcessor, RewriteReport};

/// Chunks in flight between two stages.
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// A finished job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub id: Uuid,
    pub destination: PathBuf,
    /// Present when the rewrite stage ran.
    pub report: Option<RewriteReport>,
}

/// Composes decode, rewrite and encode stages into jobs.
///
/// The orchestrator holds no per-job state; any number of jobs may run
/// through one instance concurrently.
pub struct Orchestrator {
    decoder: Arc<dyn Converter>,
    encoder: Arc<dyn Converter>,
    processor: Arc<FormsXmlProcessor>,
    pipe_capacity: usize,
}

impl Orchestrator {
    pub fn new(
        decoder: Arc<dyn Converter>,
        encoder: Arc<dyn Converter>,
        processor: FormsXmlProcessor,
    ) -> Self {
        Self {
            decoder,
            encoder,
            processor: Arc::new(processor),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity.max(1);
        self
    }

    pub fn processor(&self) -> &FormsXmlProcessor {
        &self.processor
    }

    /// Run `job` to completion.
    ///
    /// The destination only appears once every stage succeeded. On failure
    /// or cancellation nothing is left next to it.
    pub async fn run(&self, job: PipelineJob, cancel: &CancellationToken) -> JobResult<JobOutcome> {
        let span = info_span!(
            "job",
            id = %job.id(),
            source = %job.spec().source.display()
        );
        self.run_job(job, cancel).instrument(span).await
    }

    async fn run_job(
        &self,
        mut job: PipelineJob,
        cancel: &CancellationToken,
    ) -> JobResult<JobOutcome> {
        let destination = job.spec().destination();
        let result = match check_preconditions(job.spec(), &destination).await {
            Ok(()) => {
                job.transition(JobState::Running);
                self.execute(job.spec(), &destination, cancel).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(report) => {
                job.transition(JobState::Succeeded);
                if let Some(report) = &report {
                    for parent in &report.unknown_parents {
                        warn!(parent = %parent, "unknown parent module");
                    }
                }
                info!(destination = %destination.display(), "job finished");
                Ok(JobOutcome {
                    id: job.id(),
                    destination,
                    report,
                })
            }
            Err(err) => {
                job.transition(JobState::Failed);
                error!(kind = ?err.kind(), error = %err, "job failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        spec: &JobSpec,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> JobResult<Option<RewriteReport>> {
        let cancel = cancel.child_token();
        // Stages spawned below stop if this future is dropped.
        let _guard = cancel.clone().drop_guard();

        let mut dest = AtomicDestination::create(destination).map_err(JobError::Destination)?;
        let first_stage = match spec.direction {
            Direction::Encode => Stage::Encode,
            Direction::Rewrite => Stage::Rewrite,
            Direction::Decode | Direction::Roundtrip => Stage::Decode,
        };
        let mut source = File::open(&spec.source)
            .await
            .map_err(|err| JobError::stage(first_stage, err))?;

        let (results, report) = match spec.direction {
            Direction::Decode => {
                let result = self
                    .decoder
                    .convert(&cancel, dest.file(), &mut source, MimeType::Form)
                    .await
                    .map_err(StageError::from);
                (vec![(Stage::Decode, result)], None)
            }
            Direction::Encode => {
                let result = self
                    .encoder
                    .convert(&cancel, dest.file(), &mut source, MimeType::Xml)
                    .await
                    .map_err(StageError::from);
                (vec![(Stage::Encode, result)], None)
            }
            Direction::Rewrite => {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StageError::Cancelled),
                    result = self.processor.process_stream(dest.file(), BufReader::new(source)) => {
                        result.map_err(StageError::from)
                    }
                };
                match result {
                    Ok(report) => (vec![(Stage::Rewrite, Ok(()))], Some(report)),
                    Err(err) => (vec![(Stage::Rewrite, Err(err))], None),
                }
            }
            Direction::Roundtrip => {
                self.roundtrip(spec, destination, source, &mut dest, &cancel)
                    .await
            }
        };

        if let Some(err) = first_failure(results) {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        dest.commit().await.map_err(JobError::Destination)?;
        Ok(report)
    }

    async fn roundtrip(
        &self,
        spec: &JobSpec,
        destination: &Path,
        source: File,
        dest: &mut AtomicDestination,
        cancel: &CancellationToken,
    ) -> (Vec<(Stage, Result<(), StageError>)>, Option<RewriteReport>) {
        let rewrite = spec.rewrites();
        let snapshot = |path: PathBuf| spec.snapshots.then(|| Snapshot::create(path));

        let (decoded_tx, decoded_rx) = pipe(self.pipe_capacity);
        let decoded_snapshot = if rewrite {
            snapshot(snapshot_path(&spec.source))
        } else {
            snapshot(snapshot_path(destination))
        };
        let decode = spawn_decode(
            self.decoder.clone(),
            source,
            TeeWriter::new(decoded_tx, decoded_snapshot),
            cancel.clone(),
        );

        let (rewrite_task, mut encode_input) = if rewrite {
            let (rewritten_tx, rewritten_rx) = pipe(self.pipe_capacity);
            let task = spawn_rewrite(
                self.processor.clone(),
                decoded_rx,
                TeeWriter::new(rewritten_tx, snapshot(snapshot_path(destination))),
                cancel.clone(),
            );
            (Some(task), rewritten_rx)
        } else {
            (None, decoded_rx)
        };

        let encoded = self
            .encoder
            .convert(cancel, dest.file(), &mut encode_input, MimeType::Xml)
            .await
            .map_err(StageError::from);
        if let Err(err) = &encoded {
            cancel.cancel();
            encode_input.close(PipeError::from_error(err));
        }
        drop(encode_input);

        let mut results = vec![(Stage::Decode, joined(decode.await))];
        let mut report = None;
        if let Some(task) = rewrite_task {
            let result = match joined(task.await) {
                Ok(rewritten) => {
                    report = Some(rewritten);
                    Ok(())
                }
                Err(err) => Err(err),
            };
            results.push((Stage::Rewrite, result));
        }
        results.push((Stage::Encode, encoded));
        (results, report)
    }
}

async fn check_preconditions(spec: &JobSpec, destination: &Path) -> JobResult<()> {
    if let Err(err) = tokio::fs::metadata(&spec.source).await {
        return Err(JobError::Precondition(format!(
            "cannot read source {}: {err}",
            spec.source.display()
        )));
    }
    match same_file(&spec.source, destination) {
        Ok(false) => Ok(()),
        Ok(true) => Err(JobError::Precondition(format!(
            "source {} and destination {} are the same file",
            spec.source.display(),
            destination.display()
        ))),
        Err(err) => Err(JobError::Precondition(format!(
            "cannot compare {} with {}: {err}",
            spec.source.display(),
            destination.display()
        ))),
    }
}

fn spawn_decode(
    decoder: Arc<dyn Converter>,
    mut source: File,
    mut output: TeeWriter<PipeWriter>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), StageError>> {
    tokio::spawn(async move {
        let result = decoder
            .convert(&cancel, &mut output, &mut source, MimeType::Form)
            .await
            .map_err(StageError::from);
        let mut writer = output.finish().await;
        settle_writer(&mut writer, &result, &cancel);
        result
    })
}

fn spawn_rewrite(
    processor: Arc<FormsXmlProcessor>,
    mut input: PipeReader,
    mut output: TeeWriter<PipeWriter>,
    cancel: CancellationToken,
) -> JoinHandle<Result<RewriteReport, StageError>> {
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            result = processor.process_stream(&mut output, BufReader::new(&mut input)) => {
                result.map_err(StageError::from)
            }
        };
        if let Err(err) = &result {
            input.close(PipeError::from_error(err));
        }
        let mut writer = output.finish().await;
        settle_writer(&mut writer, &result, &cancel);
        result
    })
}

/// Close a stage's output; a failure also stops the rest of the job.
fn settle_writer<T>(writer: &mut PipeWriter, result: &Result<T, StageError>, cancel: &CancellationToken) {
    match result {
        Ok(_) => writer.close(None),
        Err(err) => {
            writer.close(Some(PipeError::from_error(err)));
            cancel.cancel();
        }
    }
}

fn joined<T>(
    result: Result<Result<T, StageError>, tokio::task::JoinError>,
) -> Result<T, StageError> {
    result.unwrap_or_else(|err| Err(StageError::Io(std::io::Error::other(err))))
}
