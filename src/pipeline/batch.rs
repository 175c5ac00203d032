//! Bounded fan-out of many jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{FailureKind, JobError};
use super::job::{JobSpec, JobState, PipelineJob};
use super::orchestrator::Orchestrator;
use crate::rewrite::RewriteReport;

/// Limits for a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Jobs in flight at once; zero is treated as one.
    pub max_concurrent_jobs: usize,
    /// Extra attempts for a job that failed with a retriable error.
    pub job_retries: u32,
    /// Sleep after attempt `n` is `n * job_retry_backoff`.
    pub job_retry_backoff: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            job_retries: 10,
            job_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Result of one batch entry.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// Id of the last attempt.
    pub id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub attempts: u32,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RewriteReport>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.status == JobState::Succeeded
    }
}

/// Run every spec, at most `options.max_concurrent_jobs` at a time.
///
/// Reports come back in the order of `specs`. A failed job is run again as
/// a new [`PipelineJob`] unless its failure cannot change on a retry.
pub async fn run_batch(
    orchestrator: &Orchestrator,
    specs: Vec<JobSpec>,
    options: BatchOptions,
    cancel: &CancellationToken,
) -> Vec<JobReport> {
    let permits = Arc::new(Semaphore::new(options.max_concurrent_jobs.max(1)));
    let total = specs.len();
    let runs = specs.into_iter().map(|spec| {
        let permits = permits.clone();
        async move {
            // The semaphore is never closed.
            let _permit = permits.acquire_owned().await.ok();
            run_with_retries(orchestrator, spec, &options, cancel).await
        }
    });
    let reports = join_all(runs).await;

    let failed = reports.iter().filter(|report| !report.succeeded()).count();
    info!(total, failed, "batch finished");
    reports
}

async fn run_with_retries(
    orchestrator: &Orchestrator,
    spec: JobSpec,
    options: &BatchOptions,
    cancel: &CancellationToken,
) -> JobReport {
    let destination = spec.destination();
    let attempts = options.job_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let job = PipelineJob::new(spec.clone());
        let id = job.id().to_string();
        let err = match orchestrator.run(job, cancel).await {
            Ok(outcome) => {
                return JobReport {
                    id,
                    source: spec.source,
                    destination: outcome.destination,
                    attempts: attempt,
                    status: JobState::Succeeded,
                    kind: None,
                    error: None,
                    report: outcome.report,
                }
            }
            Err(err) => err,
        };

        if !err.kind().is_retriable() || attempt >= attempts {
            return failed(id, spec, destination, attempt, &err);
        }
        warn!(
            source = %spec.source.display(),
            attempt,
            error = %err,
            "job failed, running it again"
        );
        let pause = options.job_retry_backoff * attempt;
        let resumed = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        };
        if !resumed {
            return failed(id, spec, destination, attempt, &err);
        }
        attempt += 1;
    }
}

fn failed(id: String, spec: JobSpec, destination: PathBuf, attempts: u32, err: &JobError) -> JobReport {
    JobReport {
        id,
        source: spec.source,
        destination,
        attempts,
        status: JobState::Failed,
        kind: Some(err.kind()),
        error: Some(err.summary()),
        report: None,
    }
}
