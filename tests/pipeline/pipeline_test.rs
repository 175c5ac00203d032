//! Integration tests for job orchestration.
//!
//! Converters are in-process fakes; the rewrite stage is the real one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forms2xml::convert::{ConvertResult, Converter, MimeType};
use forms2xml::pipeline::{
    run_batch, BatchOptions, Direction, FailureKind, JobError, JobSpec, JobState, Orchestrator,
    PipelineJob, Stage,
};
use forms2xml::rewrite::FormsXmlProcessor;
use forms2xml::worker::WorkerError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const MODULE: &str = r#"<Module><FormModule Name="ORDERS"><Coordinate CoordinateSystem="Real" RealUnit="Pixel"/><Block Name="B"><Item Name="I" Prompt="Customer"/></Block><Window Name="W1"/></FormModule></Module>"#;

/// Rewrites cleanly except that nothing can declare the required entities.
const NO_ANCHORS: &str = r#"<Module><FormModule Name="BAD"><Block Name="B"/></FormModule></Module>"#;

#[derive(Debug, Clone, Copy)]
enum Mode {
    Identity,
    Fail,
    WaitForCancel,
}

/// A converter that copies its input unchanged, after failing a scripted
/// number of calls.
struct FakeConverter {
    mode: Mode,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeConverter {
    fn new(mode: Mode) -> Arc<Self> {
        Self::flaky(mode, 0)
    }

    fn flaky(mode: Mode, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn copy_flush(
    src: &mut (dyn AsyncRead + Send + Unpin),
    dst: &mut (dyn AsyncWrite + Send + Unpin),
) -> std::io::Result<()> {
    tokio::io::copy(src, dst).await?;
    dst.flush().await
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
        _mime: MimeType,
    ) -> ConvertResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(WorkerError::conversion("ERR", "FRM-41800: scripted failure"));
        }

        match self.mode {
            Mode::Identity => {
                let copied = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                    copied = copy_flush(src, dst) => copied,
                };
                copied.map_err(WorkerError::from)
            }
            Mode::Fail => Err(WorkerError::conversion("ERR", "FRM-41800: scripted failure")),
            Mode::WaitForCancel => {
                dst.write_all(b"<Module>").await?;
                cancel.cancelled().await;
                Err(WorkerError::Cancelled)
            }
        }
    }

    async fn convert_files(
        &self,
        _cancel: &CancellationToken,
        dst: &Path,
        src: &Path,
    ) -> ConvertResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(src, dst).await?;
        Ok(())
    }
}

fn orchestrator(decoder: &Arc<FakeConverter>, encoder: &Arc<FakeConverter>) -> Orchestrator {
    Orchestrator::new(
        decoder.clone(),
        encoder.clone(),
        FormsXmlProcessor::default(),
    )
    .with_pipe_capacity(2)
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn leftover_parts(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".part"))
        .collect()
}

fn expected_rewrite(input: &str) -> String {
    FormsXmlProcessor::default().process_str(input).unwrap().0
}

#[tokio::test]
async fn test_roundtrip_rewrites_between_converters() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let (decoder, encoder) = (FakeConverter::new(Mode::Identity), FakeConverter::new(Mode::Identity));

    let job = PipelineJob::new(JobSpec::new(&source, Direction::Roundtrip));
    let outcome = orchestrator(&decoder, &encoder)
        .run(job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.destination, dir.path().join("ORDERS-v11.fmb"));
    let written = std::fs::read_to_string(&outcome.destination).unwrap();
    assert_eq!(written, expected_rewrite(MODULE));
    assert!(outcome.report.unwrap().synthesized.contains(&"VisualAttribute NORMAL_PROMPT".to_string()));
    assert_eq!((decoder.calls(), encoder.calls()), (1, 1));
    assert!(leftover_parts(dir.path()).is_empty());
}

#[tokio::test]
async fn test_roundtrip_without_rewrite_copies_through() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let identity = FakeConverter::new(Mode::Identity);

    let spec = JobSpec::new(&source, Direction::Roundtrip).with_rewrite(false);
    let outcome = orchestrator(&identity, &identity)
        .run(PipelineJob::new(spec), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.report.is_none());
    assert_eq!(std::fs::read_to_string(&outcome.destination).unwrap(), MODULE);
}

#[tokio::test]
async fn test_snapshots_written_at_stage_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let identity = FakeConverter::new(Mode::Identity);

    let spec = JobSpec::new(&source, Direction::Roundtrip).with_snapshots(true);
    orchestrator(&identity, &identity)
        .run(PipelineJob::new(spec), &CancellationToken::new())
        .await
        .unwrap();

    let decoded = std::fs::read_to_string(dir.path().join("ORDERS.xml")).unwrap();
    assert_eq!(decoded, MODULE);
    let rewritten = std::fs::read_to_string(dir.path().join("ORDERS-v11.xml")).unwrap();
    assert_eq!(rewritten, expected_rewrite(MODULE));
}

#[tokio::test]
async fn test_unusable_snapshot_does_not_fail_job() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    std::fs::create_dir(dir.path().join("ORDERS.xml")).unwrap();
    let identity = FakeConverter::new(Mode::Identity);

    let spec = JobSpec::new(&source, Direction::Roundtrip).with_snapshots(true);
    let outcome = orchestrator(&identity, &identity)
        .run(PipelineJob::new(spec), &CancellationToken::new())
        .await
        .unwrap();

    let written = std::fs::read_to_string(&outcome.destination).unwrap();
    assert_eq!(written, expected_rewrite(MODULE));
    assert!(dir.path().join("ORDERS.xml").is_dir());
    assert!(leftover_parts(dir.path()).is_empty());
}

#[tokio::test]
async fn test_same_file_rejected_before_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let link = dir.path().join("LINKED.fmb");
    std::fs::hard_link(&source, &link).unwrap();
    let identity = FakeConverter::new(Mode::Identity);
    let orchestrator = orchestrator(&identity, &identity);

    for destination in [&source, &link] {
        let spec = JobSpec::new(&source, Direction::Roundtrip).with_destination(destination);
        let err = orchestrator
            .run(PipelineJob::new(spec), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::PreconditionFailed);
        assert!(matches!(err, JobError::Precondition(_)));
    }
    assert_eq!(identity.calls(), 0);
    assert_eq!(std::fs::read_to_string(&source).unwrap(), MODULE);
}

#[tokio::test]
async fn test_missing_source_is_precondition() {
    let dir = tempfile::tempdir().unwrap();
    let identity = FakeConverter::new(Mode::Identity);

    let spec = JobSpec::new(dir.path().join("NOPE.fmb"), Direction::Decode);
    let err = orchestrator(&identity, &identity)
        .run(PipelineJob::new(spec), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::PreconditionFailed);
    assert_eq!(identity.calls(), 0);
}

#[tokio::test]
async fn test_decode_failure_reported_over_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let decoder = FakeConverter::new(Mode::Fail);
    let encoder = FakeConverter::new(Mode::Identity);

    let job = PipelineJob::new(JobSpec::new(&source, Direction::Roundtrip));
    let err = orchestrator(&decoder, &encoder)
        .run(job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, JobError::Stage { stage: Stage::Decode, .. }),
        "{err}"
    );
    assert_eq!(err.kind(), FailureKind::ConversionFailed);
    assert!(err.summary().starts_with("decode: "), "{}", err.summary());
    assert!(!dir.path().join("ORDERS-v11.fmb").exists());
    assert!(leftover_parts(dir.path()).is_empty());
}

#[tokio::test]
async fn test_encode_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let decoder = FakeConverter::new(Mode::Identity);
    let encoder = FakeConverter::new(Mode::Fail);

    let job = PipelineJob::new(JobSpec::new(&source, Direction::Roundtrip));
    let err = orchestrator(&decoder, &encoder)
        .run(job, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, JobError::Stage { stage: Stage::Encode, .. }),
        "{err}"
    );
    assert!(!dir.path().join("ORDERS-v11.fmb").exists());
}

#[tokio::test]
async fn test_cancellation_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.fmb", MODULE);
    let decoder = FakeConverter::new(Mode::WaitForCancel);
    let encoder = FakeConverter::new(Mode::Identity);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let job = PipelineJob::new(JobSpec::new(&source, Direction::Roundtrip));
    let err = orchestrator(&decoder, &encoder)
        .run(job, &cancel)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Cancelled, "{err}");
    assert!(!dir.path().join("ORDERS-v11.fmb").exists());
    assert!(leftover_parts(dir.path()).is_empty());
}

#[tokio::test]
async fn test_rewrite_only_job() {
    let dir = tempfile::tempdir().unwrap();
    let source = write(dir.path(), "ORDERS.xml", MODULE);
    let unused = FakeConverter::new(Mode::Fail);

    let job = PipelineJob::new(JobSpec::new(&source, Direction::Rewrite));
    let outcome = orchestrator(&unused, &unused)
        .run(job, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.destination, dir.path().join("ORDERS-v11.xml"));
    assert_eq!(
        std::fs::read_to_string(&outcome.destination).unwrap(),
        expected_rewrite(MODULE)
    );
    assert_eq!(unused.calls(), 0);
}

#[tokio::test]
async fn test_batch_keeps_order_and_retries_transient_failures() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = write(dir.path(), "FLAKY.fmb", MODULE);
    let bad = write(dir.path(), "BAD.xml", NO_ANCHORS);
    let good = write(dir.path(), "GOOD.xml", MODULE);
    let decoder = FakeConverter::flaky(Mode::Identity, 1);
    let encoder = FakeConverter::new(Mode::Identity);

    let specs = vec![
        JobSpec::new(&flaky, Direction::Roundtrip),
        JobSpec::new(&bad, Direction::Rewrite),
        JobSpec::new(&good, Direction::Rewrite),
    ];
    let options = BatchOptions {
        max_concurrent_jobs: 1,
        job_retries: 3,
        job_retry_backoff: Duration::from_millis(1),
    };
    let reports = run_batch(
        &orchestrator(&decoder, &encoder),
        specs,
        options,
        &CancellationToken::new(),
    )
    .await;

    let sources: Vec<&Path> = reports.iter().map(|r| r.source.as_path()).collect();
    assert_eq!(sources, vec![flaky.as_path(), bad.as_path(), good.as_path()]);

    assert!(reports[0].succeeded());
    assert_eq!(reports[0].attempts, 2);
    assert_eq!(decoder.calls(), 2);

    assert!(!reports[1].succeeded());
    assert!(matches!(reports[1].status, JobState::Failed));
    assert_eq!(reports[1].kind, Some(FailureKind::SchemaViolation));
    assert_eq!(reports[1].attempts, 1);
    assert!(reports[1].error.as_deref().unwrap().starts_with("rewrite: "));
    assert!(!dir.path().join("BAD-v11.xml").exists());

    assert!(reports[2].succeeded());
    assert!(dir.path().join("GOOD-v11.xml").exists());

    let json = serde_json::to_value(&reports[1]).unwrap();
    assert_eq!(json["kind"], "schema_violation");
    assert!(json.get("report").is_none());
}
