//! Integration tests for the worker pool.
//!
//! Workers are scripted in-process fakes, so these tests exercise the
//! supervision logic (leases, retries, respawns) without a converter binary.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forms2xml::convert::{ConversionRequest, ConvertResponse, Converter, MimeType, RetryPolicy};
use forms2xml::worker::{
    PoolConfig, WorkerError, WorkerId, WorkerPool, WorkerResult, WorkerSpawner, WorkerTransport,
};
use tokio_util::sync::CancellationToken;

const CONVERTED: &[u8] = b"<Module><FormModule Name=\"F\"/></Module>";

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Fail,
    Fatal,
    Hang,
}

/// Shared script and counters for every worker a spawner starts.
#[derive(Default)]
struct Script {
    outcomes: Mutex<VecDeque<Outcome>>,
    failing_spawns: AtomicUsize,
    calls: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl Script {
    fn new(outcomes: &[Outcome]) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            ..Default::default()
        })
    }

    async fn next(&self) -> WorkerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Ok);
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Fail => Err(WorkerError::conversion("ERR", "FRM-10043: cannot open file")),
            Outcome::Fatal => Err(WorkerError::InvalidEndpoint("scripted".into())),
            Outcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

struct FakeWorker {
    script: Arc<Script>,
    alive: AtomicBool,
}

#[async_trait]
impl WorkerTransport for FakeWorker {
    async fn convert(&self, request: &ConversionRequest) -> WorkerResult<ConvertResponse> {
        assert!(request.payload().exists());
        self.script.next().await?;
        Ok(ConvertResponse::Inline(Box::pin(CONVERTED)))
    }

    async fn convert_files(&self, dst: &Path, _src: &Path) -> WorkerResult<()> {
        self.script.next().await?;
        tokio::fs::write(dst, CONVERTED).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.script.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn diagnostics(&self) -> String {
        "java.io.IOException: stream closed".to_string()
    }
}

struct FakeSpawner(Arc<Script>);

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self, _id: WorkerId) -> WorkerResult<Box<dyn WorkerTransport>> {
        let script = &self.0;
        let failing = script
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(WorkerError::StartupFailed("scripted".into()));
        }
        let live = script.live.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeWorker {
            script: script.clone(),
            alive: AtomicBool::new(true),
        }))
    }
}

fn start(script: &Arc<Script>, work_dir: &Path, shutdown: &CancellationToken) -> WorkerPool {
    let config = PoolConfig {
        concurrency: 2,
        retry: RetryPolicy {
            max_retries: 3,
            backoff_step: Duration::from_millis(10),
        },
        respawn_backoff: Duration::from_millis(10),
        work_dir: work_dir.to_path_buf(),
    };
    WorkerPool::start(Arc::new(FakeSpawner(script.clone())), config, shutdown)
}

async fn convert(pool: &WorkerPool, cancel: &CancellationToken) -> WorkerResult<Vec<u8>> {
    let mut src: &[u8] = b"\x00\x01FORM";
    let mut out = Vec::new();
    pool.convert(cancel, &mut out, &mut src, MimeType::Form).await?;
    Ok(out)
}

#[tokio::test]
async fn test_failed_attempts_replace_workers() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[Outcome::Fail, Outcome::Fail, Outcome::Ok]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let out = convert(&pool, &CancellationToken::new()).await.unwrap();
    assert_eq!(out, CONVERTED);

    let stats = pool.stats();
    assert_eq!(stats.returned, 1);
    assert_eq!(stats.discarded, 2);
    assert!(stats.spawned >= 3);
    assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    assert!(script.max_live() <= 2);
    shutdown.cancel();
}

#[tokio::test]
async fn test_attempts_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[Outcome::Fail; 5]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let err = convert(&pool, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_conversion_failure());
    assert!(err.to_string().contains("java.io.IOException"));
    assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().discarded, 3);
    assert!(script.max_live() <= 2);
}

#[tokio::test]
async fn test_permanent_error_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[Outcome::Fatal]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let err = convert(&pool, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.root(), WorkerError::InvalidEndpoint(_)));
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_kills_leased_worker() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[Outcome::Hang]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = convert(&pool, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(pool.stats().returned, 0);
    assert_eq!(pool.stats().discarded, 1);
}

#[tokio::test]
async fn test_recovers_from_spawn_failures() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[]);
    script.failing_spawns.store(2, Ordering::SeqCst);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let dst = dir.path().join("ORDERS.xml");
    pool.convert_files(&CancellationToken::new(), &dst, Path::new("ORDERS.fmb"))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dst).unwrap(), CONVERTED);
    assert_eq!(pool.stats().spawn_failures, 2);
}

#[tokio::test]
async fn test_workers_reused_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    for _ in 0..5 {
        convert(&pool, &CancellationToken::new()).await.unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.returned, 5);
    assert_eq!(stats.discarded, 0);
    assert!(stats.spawned <= 2);
    assert!(script.max_live() <= 2);
}

#[tokio::test]
async fn test_checkout_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    shutdown.cancel();
    let err = pool.checkout(&CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, WorkerError::PoolClosed));
}

#[tokio::test]
async fn test_shutdown_kills_idle_workers() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    convert(&pool, &CancellationToken::new()).await.unwrap();
    assert_eq!(pool.stats().returned, 1);

    pool.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(script.live.load(Ordering::SeqCst), 0);
    assert_eq!(pool.stats().live, 0);

    let err = pool.checkout(&CancellationToken::new()).await.err().unwrap();
    assert!(matches!(err, WorkerError::PoolClosed));
}

/// Sink that refuses every write.
struct BrokenSink;

impl tokio::io::AsyncWrite for BrokenSink {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_failed_delivery_discards_worker() {
    let dir = tempfile::tempdir().unwrap();
    let script = Script::new(&[]);
    let shutdown = CancellationToken::new();
    let pool = start(&script, dir.path(), &shutdown);

    let mut src: &[u8] = b"\x00\x01FORM";
    let err = pool
        .convert(&CancellationToken::new(), &mut BrokenSink, &mut src, MimeType::Form)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), WorkerError::Deliver(_)));

    let stats = pool.stats();
    assert_eq!(stats.returned, 0);
    assert_eq!(stats.discarded, 1);
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
    shutdown.cancel();
}
