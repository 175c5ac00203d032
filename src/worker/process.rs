//! Child process management for converter workers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::error::{WorkerError, WorkerResult};

/// Captured worker output kept per process.
const DIAGNOSTICS_LIMIT: usize = 16 * 1024;

/// How to start a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments placed before the transport address.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Working directory; piped workers write their output relative to it.
    pub current_dir: Option<PathBuf>,
}

/// Whether the worker's stdin/stdout are the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Hand stdin/stdout to the caller.
    Piped,
    /// Close stdin and fold stdout into the diagnostics buffer.
    Detached,
}

/// Bounded tail of a worker's stderr.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsBuffer {
    inner: Arc<Mutex<String>>,
}

impl DiagnosticsBuffer {
    pub fn push_line(&self, line: &str) {
        let mut buf = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > DIAGNOSTICS_LIMIT {
            let mut cut = buf.len() - DIAGNOSTICS_LIMIT;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A running worker process.
///
/// The process is killed when this handle is dropped or [`terminate`]d;
/// nothing waits for it to finish in-flight work.
///
/// [`terminate`]: WorkerProcess::terminate
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
    diagnostics: DiagnosticsBuffer,
}

impl WorkerProcess {
    /// Start `command` with `address` as its last argument.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn spawn(
        command: &WorkerCommand,
        address: &str,
        mode: StdioMode,
    ) -> WorkerResult<(Self, Option<(ChildStdin, ChildStdout)>)> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .arg(address)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(match mode {
                StdioMode::Piped => Stdio::piped(),
                StdioMode::Detached => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            std::fs::create_dir_all(dir).map_err(WorkerError::SpawnFailed)?;
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(WorkerError::SpawnFailed)?;
        let pid = child.id();
        let diagnostics = DiagnosticsBuffer::default();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture(stderr, diagnostics.clone(), pid));
        }
        let stdout = child.stdout.take();
        let pipes = match mode {
            StdioMode::Piped => {
                let stdin = child.stdin.take();
                stdin.zip(stdout)
            }
            StdioMode::Detached => {
                if let Some(stdout) = stdout {
                    tokio::spawn(capture(stdout, diagnostics.clone(), pid));
                }
                None
            }
        };
        if mode == StdioMode::Piped && pipes.is_none() {
            return Err(WorkerError::StartupFailed(
                "worker stdio not captured".to_string(),
            ));
        }

        let kill = CancellationToken::new();
        let exited = CancellationToken::new();
        {
            let kill = kill.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        debug!(?pid, ?status, "worker process exited");
                    }
                    _ = kill.cancelled() => {
                        let _ = child.start_kill();
                        let status = child.wait().await;
                        debug!(?pid, ?status, "worker process killed");
                    }
                }
                exited.cancel();
            });
        }

        debug!(?pid, program = %command.program.display(), address, "worker process started");
        Ok((
            Self {
                pid,
                kill,
                exited,
                diagnostics,
            },
            pipes,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process is still running.
    pub fn is_alive(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Kill the process without waiting for it.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Resolves once the process has exited.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    pub fn diagnostics(&self) -> &DiagnosticsBuffer {
        &self.diagnostics
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

async fn capture<R>(stream: R, buffer: DiagnosticsBuffer, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(?pid, %line, "worker output");
        buffer.push_line(&line);
    }
}

/// Pick a currently unused loopback port.
pub fn free_loopback_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
