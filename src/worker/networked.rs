//! Worker listening for HTTP on a private loopback port.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::error::{WorkerError, WorkerResult};
use super::process::{free_loopback_port, StdioMode, WorkerCommand, WorkerProcess};
use super::transport::{WorkerId, WorkerTransport};
use crate::convert::{ConversionRequest, ConvertResponse, HttpEndpoint};

const READY_POLL: Duration = Duration::from_millis(100);

/// A worker process serving the converter HTTP protocol.
pub struct NetworkedWorker {
    id: WorkerId,
    process: WorkerProcess,
    endpoint: HttpEndpoint,
}

impl NetworkedWorker {
    /// Spawn the worker on a free loopback port and wait until it listens.
    ///
    /// # Errors
    ///
    /// Fails if the process cannot be spawned, exits before listening, or is
    /// not listening within `startup_timeout`.
    pub async fn start(
        id: WorkerId,
        command: &WorkerCommand,
        startup_timeout: Duration,
    ) -> WorkerResult<Self> {
        let port = free_loopback_port().map_err(WorkerError::SpawnFailed)?;
        let address = format!("127.0.0.1:{port}");
        let (process, _) = WorkerProcess::spawn(command, &address, StdioMode::Detached)?;
        let endpoint = HttpEndpoint::new(&format!("http://{address}/"))?;

        let deadline = Instant::now() + startup_timeout;
        loop {
            if !process.is_alive() {
                return Err(WorkerError::StartupFailed(format!(
                    "exited before listening on {address}"
                ))
                .with_diagnostics(process.diagnostics().snapshot()));
            }
            if TcpStream::connect(&address).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::StartupFailed(format!(
                    "not listening on {address} after {startup_timeout:?}"
                ))
                .with_diagnostics(process.diagnostics().snapshot()));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        debug!(worker = id, %address, "networked worker listening");
        Ok(Self {
            id,
            process,
            endpoint,
        })
    }
}

#[async_trait]
impl WorkerTransport for NetworkedWorker {
    async fn convert(&self, request: &ConversionRequest) -> WorkerResult<ConvertResponse> {
        debug!(worker = self.id, mime = %request.mime(), len = request.len(), "posting payload");
        self.endpoint.convert(request).await
    }

    async fn convert_files(&self, dst: &Path, src: &Path) -> WorkerResult<()> {
        self.endpoint.convert_files(dst, src).await
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    fn terminate(&self) {
        self.process.terminate();
    }

    fn diagnostics(&self) -> String {
        self.process.diagnostics().snapshot()
    }

    fn clear_diagnostics(&self) {
        self.process.diagnostics().clear();
    }
}
