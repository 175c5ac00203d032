//! Worker speaking the line protocol over its stdin/stdout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{WorkerError, WorkerResult};
use super::process::{StdioMode, WorkerCommand, WorkerProcess};
use super::protocol::{parse_status, request_line, Status};
use super::transport::{WorkerId, WorkerTransport};
use crate::convert::{ConversionRequest, ConvertResponse};

struct Channel {
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// A long-lived worker taking one `src dst` request per line.
pub struct PipedWorker {
    id: WorkerId,
    process: WorkerProcess,
    channel: Mutex<Channel>,
    work_dir: PathBuf,
}

impl PipedWorker {
    /// Spawn the worker with `-` as its address.
    pub fn start(id: WorkerId, command: &WorkerCommand, work_dir: PathBuf) -> WorkerResult<Self> {
        let (process, pipes) = WorkerProcess::spawn(command, "-", StdioMode::Piped)?;
        let (stdin, stdout) = pipes.ok_or_else(|| {
            WorkerError::StartupFailed("worker stdio not captured".to_string())
        })?;

        Ok(Self {
            id,
            process,
            channel: Mutex::new(Channel {
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
            }),
            work_dir,
        })
    }
}

#[async_trait]
impl WorkerTransport for PipedWorker {
    async fn convert(&self, request: &ConversionRequest) -> WorkerResult<ConvertResponse> {
        // The worker refuses to write into a destination that does not exist.
        let output = tempfile::Builder::new()
            .prefix("forms2xml-")
            .suffix(request.mime().opposite().extension())
            .tempfile_in(&self.work_dir)
            .map_err(WorkerError::Spool)?
            .into_temp_path();

        self.convert_files(&output, request.payload()).await?;

        let path = output.keep().map_err(|err| WorkerError::Spool(err.error))?;
        Ok(ConvertResponse::Artifact(path))
    }

    async fn convert_files(&self, dst: &Path, src: &Path) -> WorkerResult<()> {
        let mut channel = self.channel.lock().await;
        let request = request_line(src, dst);
        channel.stdin.write_all(request.as_bytes()).await?;
        channel.stdin.flush().await?;

        let mut line = String::new();
        loop {
            line.clear();
            if channel.stdout.read_line(&mut line).await? == 0 {
                return Err(WorkerError::WorkerExited);
            }
            match parse_status(&line) {
                Some(Status::Ok(message)) => {
                    debug!(worker = self.id, %message, "conversion done");
                    return Ok(());
                }
                Some(Status::Err(detail)) => return Err(WorkerError::conversion("ERR", detail)),
                None => debug!(worker = self.id, line = line.trim_end(), "worker noise"),
            }
        }
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
