use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use agent_bridge_error::BridgeError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const LINE_BUFFER: usize = 256;
const STDERR_TAIL_BYTES: usize = 4096;

/// One backend invocation: program, arguments, working directory and the
/// prompt written to stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, current_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: current_dir.into(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display(&self) -> String {
        format_command_for_display(&self.program, &self.args)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
    #[error("failed to write subprocess stdin: {0}")]
    Write(std::io::Error),
    #[error("failed to read subprocess output: {0}")]
    Read(std::io::Error),
    #[error("subprocess exited with {status}")]
    Exited { status: String, stderr: String },
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl RunnerError {
    pub fn into_bridge_error(self, backend: &str) -> BridgeError {
        let backend = backend.to_string();
        match self {
            Self::Spawn { error, .. } => BridgeError::BackendUnavailable {
                backend,
                message: error.to_string(),
            },
            Self::MissingStdout | Self::MissingStderr | Self::Write(_) => {
                BridgeError::BackendUnavailable {
                    backend,
                    message: self.to_string(),
                }
            }
            Self::Read(_) => BridgeError::MalformedOutput {
                backend,
                message: self.to_string(),
            },
            Self::Exited { status, stderr } => BridgeError::BackendExited {
                backend,
                status,
                stderr: (!stderr.trim().is_empty()).then_some(stderr),
            },
            Self::Timeout(timeout) => BridgeError::Timeout {
                backend,
                seconds: timeout.as_secs(),
            },
        }
    }
}

/// Stdout lines of a running backend. An abnormal end (non-zero exit, I/O
/// failure, timeout) arrives as a final `Err` item.
pub type LineStream = BoxStream<'static, Result<String, RunnerError>>;

/// Output of a backend run awaited to completion.
#[derive(Debug, Default)]
pub struct CompletedRun {
    pub lines: Vec<String>,
    pub failure: Option<RunnerError>,
}

/// Starts backend processes. Adapters only see this seam so tests can script
/// backend output.
#[async_trait]
pub trait AgentRunner: Send + Sync + std::fmt::Debug {
    async fn spawn(&self, spec: LaunchSpec) -> Result<LineStream, RunnerError>;

    /// Runs to completion, keeping every line emitted before a failure.
    async fn run_to_end(&self, spec: LaunchSpec) -> Result<CompletedRun, RunnerError> {
        let mut stream = self.spawn(spec).await?;
        let mut run = CompletedRun::default();
        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => run.lines.push(line),
                Err(err) => {
                    run.failure = Some(err);
                    break;
                }
            }
        }
        Ok(run)
    }
}

/// Runs backends as local subprocesses.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn spawn(&self, spec: LaunchSpec) -> Result<LineStream, RunnerError> {
        let spawn_start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.current_dir)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command_for_display = spec.display();
        tracing::debug!(
            command = %command_for_display,
            cwd = %spec.current_dir.display(),
            "spawning backend process"
        );

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                command = %command_for_display,
                error = %err,
                "failed to spawn backend process"
            );
            RunnerError::Spawn {
                command: command_for_display.clone(),
                error: err,
            }
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::debug!(
            pid = pid,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "backend process spawned"
        );

        let stdout = child.stdout.take().ok_or(RunnerError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(RunnerError::MissingStderr)?;
        let stdin = child.stdin.take();

        let (sender, receiver) = mpsc::channel(LINE_BUFFER);

        // A failed prompt write is reported only when the process exits cleanly.
        let writer = match (stdin, spec.stdin) {
            (Some(mut stdin), Some(input)) => Some(tokio::spawn(async move {
                let result = async {
                    stdin.write_all(input.as_bytes()).await?;
                    stdin.shutdown().await
                }
                .await;
                if let Err(err) = &result {
                    tracing::debug!(pid = pid, error = %err, "failed to write backend stdin");
                }
                result.err()
            })),
            _ => None,
        };

        let timeout = spec.timeout;
        tokio::spawn(async move {
            let stderr_task = tokio::spawn(read_stderr_tail(stderr, pid));
            let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
            let mut lines = BufReader::new(stdout).lines();

            loop {
                let next = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, lines.next_line()).await {
                            Ok(next) => next,
                            Err(_) => {
                                tracing::warn!(pid = pid, "backend turn timed out, killing process");
                                let _ = child.kill().await;
                                let _ = sender
                                    .send(Err(RunnerError::Timeout(timeout.unwrap_or_default())))
                                    .await;
                                return;
                            }
                        }
                    }
                    None => lines.next_line().await,
                };

                match next {
                    Ok(Some(line)) => {
                        if sender.send(Ok(line)).await.is_err() {
                            tracing::debug!(pid = pid, "line consumer dropped, killing process");
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = sender.send(Err(RunnerError::Read(err))).await;
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    tracing::debug!(pid = pid, "backend process exited cleanly");
                    let write_error = match writer {
                        Some(writer) => writer.await.ok().flatten(),
                        None => None,
                    };
                    if let Some(err) = write_error {
                        let _ = sender.send(Err(RunnerError::Write(err))).await;
                    }
                }
                Ok(status) => {
                    tracing::warn!(
                        pid = pid,
                        status = %format_exit_status(&status),
                        "backend process exited unsuccessfully"
                    );
                    let _ = sender
                        .send(Err(RunnerError::Exited {
                            status: format_exit_status(&status),
                            stderr,
                        }))
                        .await;
                }
                Err(err) => {
                    let _ = sender.send(Err(RunnerError::Read(err))).await;
                }
            }
        });

        Ok(ReceiverStream::new(receiver).boxed())
    }
}

async fn read_stderr_tail(stderr: ChildStderr, pid: u32) -> String {
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > STDERR_TAIL_BYTES {
                    let excess = buffer.len() - STDERR_TAIL_BYTES;
                    buffer.drain(..excess);
                }
            }
            Err(err) => {
                tracing::debug!(pid = pid, error = %err, "stopped reading backend stderr");
                break;
            }
        }
    }
    let tail = String::from_utf8_lossy(&buffer).into_owned();
    if !tail.trim().is_empty() {
        tracing::debug!(pid = pid, stderr = %tail.trim(), "backend stderr");
    }
    tail
}

fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string_lossy().to_string());
    parts.extend(args.iter().cloned());
    parts.join(" ")
}
