//! Supervised pool of converter workers.
//!
//! Each pool slot runs a respawn loop: start a worker (retrying with a fixed
//! backoff for as long as starting fails), hand it to the *fresh* queue, wait
//! for it to be destroyed, start the next one. Callers check workers out,
//! preferring the *free* queue of workers returned after a successful call.
//! A worker that fails a call is dropped, which kills its process and wakes
//! its slot. A lease on a conversion ends only after the result has been
//! copied to the caller, so a failed copy discards the worker too.
//!
//! ```text
//!  slot 0 ──spawn──┐                          ┌── give_back (ok) ──┐
//!  slot 1 ──spawn──┼──► fresh ──┐             │                    │
//!  slot N ──spawn──┘            ├─► checkout ─┴── discard (err) ──► slot respawns
//!                       free ───┘      ▲
//!                        ▲             │
//!                        └─────────────┴──── returned workers
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::error::{WorkerError, WorkerResult};
use super::transport::{WorkerId, WorkerSpawner, WorkerTransport};
use crate::convert::{
    deliver, ConversionRequest, ConvertResult, Converter, MimeType, RetryPolicy,
};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker slots; raised to at least 2.
    pub concurrency: usize,
    /// Attempts per call and backoff between them.
    pub retry: RetryPolicy,
    /// Wait after a failed spawn.
    pub respawn_backoff: Duration,
    /// Where payloads are spooled.
    pub work_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
            respawn_backoff: Duration::from_secs(3),
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Counters kept by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Workers started.
    pub spawned: u64,
    /// Failed start attempts.
    pub spawn_failures: u64,
    /// Workers put back into the free queue after a successful call.
    pub returned: u64,
    /// Workers destroyed because a call failed or they died idle.
    pub discarded: u64,
    /// Healthy workers destroyed because the free queue was full.
    pub retired: u64,
    /// Workers currently alive.
    pub live: usize,
}

struct Bookkeeping {
    stats: PoolStats,
    next_id: WorkerId,
}

struct Shared {
    book: Mutex<Bookkeeping>,
}

impl Shared {
    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> WorkerId {
        let mut book = self.book();
        book.next_id += 1;
        book.next_id
    }
}

/// A started worker owned by the pool.
struct Worker {
    id: WorkerId,
    transport: Arc<dyn WorkerTransport>,
    shared: Arc<Shared>,
    _slot: DropGuard,
}

impl Worker {
    fn new(
        id: WorkerId,
        transport: Box<dyn WorkerTransport>,
        shared: Arc<Shared>,
        slot: DropGuard,
    ) -> Self {
        {
            let mut book = shared.book();
            book.stats.spawned += 1;
            book.stats.live += 1;
        }
        Self {
            id,
            transport: Arc::from(transport),
            shared,
            _slot: slot,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.transport.terminate();
        self.shared.book().stats.live -= 1;
    }
}

/// An exclusive lease on one worker for one call.
///
/// While the lease is held, cancelling the caller's token kills the worker.
pub struct PooledClient {
    worker: Worker,
    _watch: DropGuard,
}

impl PooledClient {
    pub fn id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn transport(&self) -> &dyn WorkerTransport {
        self.worker.transport.as_ref()
    }

    /// Worker output captured during this lease.
    pub fn diagnostics(&self) -> String {
        self.worker.transport.diagnostics()
    }
}

/// One kind of call the pool can retry.
#[async_trait]
trait Call: Send {
    type Output: Send;

    async fn run(&mut self, transport: &dyn WorkerTransport) -> WorkerResult<Self::Output>;
}

/// Convert a spooled payload and copy the result to `dst`, all on one lease.
struct ConvertCall<'a> {
    request: &'a ConversionRequest,
    cancel: &'a CancellationToken,
    dst: &'a mut (dyn AsyncWrite + Send + Unpin),
}

#[async_trait]
impl Call for ConvertCall<'_> {
    type Output = u64;

    async fn run(&mut self, transport: &dyn WorkerTransport) -> WorkerResult<u64> {
        let response = transport.convert(self.request).await?;
        deliver(self.cancel, response, &mut *self.dst).await
    }
}

struct ConvertFilesCall<'a> {
    dst: &'a Path,
    src: &'a Path,
}

#[async_trait]
impl Call for ConvertFilesCall<'_> {
    type Output = ();

    async fn run(&mut self, transport: &dyn WorkerTransport) -> WorkerResult<()> {
        transport.convert_files(self.dst, self.src).await
    }
}

/// A supervised pool of converter workers.
///
/// # Example
///
/// ```ignore
/// use forms2xml::worker::{PoolConfig, ProcessSpawner, WorkerPool};
///
/// let pool = WorkerPool::start(Arc::new(spawner), PoolConfig::default(), &shutdown);
/// pool.convert(&cancel, &mut xml_out, &mut fmb_in, MimeType::Form).await?;
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    fresh: tokio::sync::Mutex<mpsc::Receiver<Worker>>,
    free: tokio::sync::Mutex<mpsc::Receiver<Worker>>,
    free_tx: mpsc::Sender<Worker>,
    config: PoolConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start the respawn loops. Must be called inside a tokio runtime.
    ///
    /// The pool stops when `parent` is cancelled, [`shutdown`] is called or
    /// the pool is dropped.
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn start(
        spawner: Arc<dyn WorkerSpawner>,
        mut config: PoolConfig,
        parent: &CancellationToken,
    ) -> Self {
        config.concurrency = config.concurrency.max(2);
        let queue = (config.concurrency / 2).max(1);
        let (fresh_tx, fresh_rx) = mpsc::channel(queue);
        let (free_tx, free_rx) = mpsc::channel(queue);
        let shutdown = parent.child_token();
        let shared = Arc::new(Shared {
            book: Mutex::new(Bookkeeping {
                stats: PoolStats::default(),
                next_id: 0,
            }),
        });

        for slot in 0..config.concurrency {
            tokio::spawn(respawn_loop(
                slot,
                spawner.clone(),
                fresh_tx.clone(),
                shared.clone(),
                config.respawn_backoff,
                shutdown.clone(),
            ));
        }
        info!(slots = config.concurrency, queue, "worker pool started");

        Self {
            shared,
            fresh: tokio::sync::Mutex::new(fresh_rx),
            free: tokio::sync::Mutex::new(free_rx),
            free_tx,
            config,
            shutdown,
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.book().stats
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Stop respawning and kill every worker not currently leased.
    ///
    /// Leased workers are killed when their lease ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for queue in [&self.fresh, &self.free] {
            // A checkout holding the lock drains the queue itself.
            if let Ok(mut rx) = queue.try_lock() {
                drain(&mut rx);
            }
        }
    }

    /// Lease a worker, waiting until one is ready.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Cancelled`] if `cancel` fires first and
    /// [`WorkerError::PoolClosed`] if the pool shuts down.
    pub async fn checkout(&self, cancel: &CancellationToken) -> WorkerResult<PooledClient> {
        loop {
            let worker = self.next_worker(cancel).await?;
            if worker.transport.is_alive() {
                return Ok(self.lease(worker, cancel));
            }
            debug!(worker = worker.id, "discarding worker that died idle");
            self.shared.book().stats.discarded += 1;
        }
    }

    async fn next_worker(&self, cancel: &CancellationToken) -> WorkerResult<Worker> {
        let mut free = self.free.lock().await;
        let mut fresh = self.fresh.lock().await;
        if self.shutdown.is_cancelled() {
            drain(&mut free);
            drain(&mut fresh);
            return Err(WorkerError::PoolClosed);
        }
        if let Ok(worker) = free.try_recv() {
            return Ok(worker);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
            _ = self.shutdown.cancelled() => Err(WorkerError::PoolClosed),
            Some(worker) = free.recv() => Ok(worker),
            Some(worker) = fresh.recv() => Ok(worker),
            else => Err(WorkerError::PoolClosed),
        };
        if self.shutdown.is_cancelled() {
            drain(&mut free);
            drain(&mut fresh);
        }
        next
    }

    fn lease(&self, worker: Worker, cancel: &CancellationToken) -> PooledClient {
        worker.transport.clear_diagnostics();

        let released = CancellationToken::new();
        let watch = released.clone();
        let caller = cancel.clone();
        let transport = worker.transport.clone();
        let id = worker.id;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = watch.cancelled() => {}
                _ = caller.cancelled() => {
                    debug!(worker = id, "lease cancelled, killing worker");
                    transport.terminate();
                }
            }
        });

        PooledClient {
            worker,
            _watch: released.drop_guard(),
        }
    }

    /// Return a worker after a successful call.
    fn give_back(&self, client: PooledClient) {
        let PooledClient { worker, _watch } = client;
        drop(_watch);
        if self.shutdown.is_cancelled() {
            debug!(worker = worker.id, "pool shut down, retiring worker");
            self.shared.book().stats.retired += 1;
            return;
        }
        match self.free_tx.try_send(worker) {
            Ok(()) => self.shared.book().stats.returned += 1,
            Err(TrySendError::Full(worker)) | Err(TrySendError::Closed(worker)) => {
                debug!(worker = worker.id, "free queue full, retiring worker");
                self.shared.book().stats.retired += 1;
                drop(worker);
            }
        }
    }

    /// Destroy a worker after a failed call.
    fn discard(&self, client: PooledClient) {
        debug!(worker = client.id(), "discarding worker");
        self.shared.book().stats.discarded += 1;
        drop(client);
    }

    /// Run `call` on leased workers until it succeeds or attempts run out.
    async fn execute<C: Call>(
        &self,
        cancel: &CancellationToken,
        call: &mut C,
    ) -> WorkerResult<C::Output> {
        let retry = self.config.retry;
        let attempts = retry.attempts();
        let mut attempt = 1;
        loop {
            let client = self.checkout(cancel).await?;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WorkerError::Cancelled),
                result = call.run(client.transport()) => result,
            };

            let err = match result {
                Ok(output) => {
                    self.give_back(client);
                    return Ok(output);
                }
                Err(err) => err,
            };

            let id = client.id();
            if matches!(err, WorkerError::Spool(_)) {
                // Local staging failed; the worker never saw the call.
                self.give_back(client);
                return Err(err);
            }
            let diagnostics = client.diagnostics();
            self.discard(client);
            if err.is_cancelled() || cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }

            let err = err.with_diagnostics(diagnostics);
            if !err.is_retriable() || attempt >= attempts {
                warn!(worker = id, attempt, error = %err, "worker call failed");
                return Err(err);
            }
            warn!(worker = id, attempt, error = %err, "worker call failed, retrying");
            retry.pause(cancel, attempt).await?;
            attempt += 1;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Converter for WorkerPool {
    async fn convert(
        &self,
        cancel: &CancellationToken,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
        mime: MimeType,
    ) -> ConvertResult<()> {
        let request = ConversionRequest::spool(cancel, src, mime, &self.config.work_dir).await?;
        let mut call = ConvertCall {
            request: &request,
            cancel,
            dst,
        };
        let copied = self.execute(cancel, &mut call).await?;
        debug!(%mime, copied, "pooled conversion finished");
        Ok(())
    }

    async fn convert_files(
        &self,
        cancel: &CancellationToken,
        dst: &Path,
        src: &Path,
    ) -> ConvertResult<()> {
        self.execute(cancel, &mut ConvertFilesCall { dst, src }).await
    }
}

/// Close a queue and kill the workers waiting in it.
fn drain(rx: &mut mpsc::Receiver<Worker>) {
    rx.close();
    while let Ok(worker) = rx.try_recv() {
        debug!(worker = worker.id, "pool shut down, killing idle worker");
        drop(worker);
    }
}

async fn respawn_loop(
    slot: usize,
    spawner: Arc<dyn WorkerSpawner>,
    fresh: mpsc::Sender<Worker>,
    shared: Arc<Shared>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let id = shared.next_id();
        let spawned = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            spawned = spawner.spawn(id) => spawned,
        };

        let transport = match spawned {
            Ok(transport) => transport,
            Err(err) => {
                shared.book().stats.spawn_failures += 1;
                warn!(slot, worker = id, error = %err, ?backoff, "failed to start worker");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        let gone = CancellationToken::new();
        let worker = Worker::new(id, transport, shared.clone(), gone.clone().drop_guard());
        debug!(slot, worker = id, "worker ready");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            sent = fresh.send(worker) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = gone.cancelled() => {}
        }
    }
}
