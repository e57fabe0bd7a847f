//! Payload process runner
//!
//! Executes a scraper payload as an isolated child process:
//! - The payload source is written to a private temp file that is removed on
//!   every exit path, timeouts and panics included
//! - The child runs from a fixed working directory with a forced UTF-8 locale
//! - A wall-clock timeout bounds the run; on expiry the child's whole process
//!   group is killed and whatever it had already written is kept as partial
//!   output

use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to keep draining pipes after the child is gone
///
/// Grandchildren that inherited the pipes can keep them open indefinitely.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Process runner settings
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Program (and leading arguments) used to run the payload file.
    /// Empty means the payload file is executed directly.
    pub interpreter: Vec<String>,

    /// Working directory of the child process
    pub working_dir: PathBuf,

    /// Wall-clock budget for a scrape run
    pub timeout: Duration,

    /// Suffix of the materialized payload file
    pub file_suffix: String,
}

impl RunnerSettings {
    /// Creates settings for Python payloads
    pub fn new(interpreter: Vec<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            interpreter,
            working_dir,
            timeout,
            file_suffix: ".py".to_string(),
        }
    }

    /// Overrides the payload file suffix
    pub fn with_file_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.file_suffix = suffix.into();
        self
    }
}

/// Captured output of a finished (or killed) payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `-1` when the process was terminated by a signal
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// Errors raised while running a payload
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to write payload file: {0}")]
    Materialize(#[source] io::Error),

    #[error("failed to serialize execution context: {0}")]
    Context(#[from] serde_json::Error),

    #[error("failed to launch payload: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed while waiting for payload: {0}")]
    Wait(#[source] io::Error),

    /// The payload exceeded its wall-clock budget and was killed
    #[error("payload timed out after {} seconds", .timeout.as_secs())]
    Timeout {
        timeout: Duration,
        partial: ProcessOutput,
    },
}

/// Runs scraper payloads as child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    settings: RunnerSettings,
}

impl ProcessRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    /// Runs `<payload> scrape --context=<json>` within the configured timeout
    ///
    /// # Arguments
    /// * `payload` - Payload source code
    /// * `context` - Execution context, serialized as a single JSON argument
    pub async fn run<C: Serialize>(
        &self,
        payload: &str,
        context: &C,
    ) -> Result<ProcessOutput, ProcessError> {
        let context_json = serde_json::to_string(context)?;
        let args = [
            "scrape".to_string(),
            format!("--context={}", context_json),
        ];
        self.run_with_args(payload, &args, self.settings.timeout)
            .await
    }

    /// Runs the payload with arbitrary arguments
    ///
    /// The payload file exists only for the duration of this call.
    pub async fn run_with_args(
        &self,
        payload: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let payload_path = self.materialize(payload).map_err(ProcessError::Materialize)?;
        debug!("Materialized payload at {}", payload_path.display());

        let result = self.execute(&payload_path, args, timeout).await;

        let shown = payload_path.display().to_string();
        match payload_path.close() {
            Ok(()) => debug!("Removed payload file {}", shown),
            Err(e) => warn!("Failed to remove payload file {}: {}", shown, e),
        }

        result
    }

    /// Writes the payload to a private, uniquely named file
    fn materialize(&self, payload: &str) -> io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("harvest-payload-")
            .suffix(&self.settings.file_suffix)
            .tempfile()?;

        file.write_all(payload.as_bytes())?;
        file.as_file().sync_all()?;

        if self.settings.interpreter.is_empty() {
            make_executable(file.as_file())?;
        }

        // Closing the handle before exec avoids ETXTBSY on direct execution
        Ok(file.into_temp_path())
    }

    fn command(&self, payload_path: &Path, args: &[String]) -> Command {
        let mut command = match self.settings.interpreter.split_first() {
            Some((program, leading)) => {
                let mut command = Command::new(program);
                command.args(leading).arg(payload_path);
                command
            }
            None => Command::new(payload_path),
        };

        command
            .args(args)
            .current_dir(&self.settings.working_dir)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1")
            .env("LANG", "C.UTF-8")
            .env("LC_ALL", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own group, so a timeout also reaches processes the payload forked
        #[cfg(unix)]
        command.process_group(0);

        command
    }

    async fn execute(
        &self,
        payload_path: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let started = Instant::now();
        let mut child = self
            .command(payload_path, args)
            .spawn()
            .map_err(ProcessError::Spawn)?;

        info!(
            "Spawned payload (pid {:?}) in {}",
            child.id(),
            self.settings.working_dir.display()
        );

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(ProcessError::Wait)?;
                let output = ProcessOutput {
                    stdout: stdout.finish().await,
                    stderr: stderr.finish().await,
                    exit_code: status.code().unwrap_or(-1),
                    elapsed: started.elapsed(),
                };

                info!(
                    "Payload exited with code {} after {:?} (stdout {} bytes, stderr {} bytes)",
                    output.exit_code,
                    output.elapsed,
                    output.stdout.len(),
                    output.stderr.len()
                );

                Ok(output)
            }
            Err(_) => {
                warn!("Payload exceeded {:?}, killing it", timeout);
                if let Some(pid) = child.id() {
                    kill_process_group(pid).await;
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill payload process: {}", e);
                }

                let partial = ProcessOutput {
                    stdout: stdout.finish().await,
                    stderr: stderr.finish().await,
                    exit_code: -1,
                    elapsed: started.elapsed(),
                };

                Err(ProcessError::Timeout { timeout, partial })
            }
        }
    }
}

/// Sends SIGKILL to every process in the payload's group
#[cfg(unix)]
async fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => debug!("Killed process group {}", pgid),
        Ok(status) => warn!("Killing process group {} exited with {}", pgid, status),
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pgid: u32) {}

#[cfg(unix)]
fn make_executable(file: &File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn make_executable(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Background reader collecting one output stream
///
/// Bytes land in a shared buffer as they arrive so a partial result survives
/// an aborted read.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };

            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("Stopped reading payload output: {}", e);
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Waits for the stream to close and decodes it, replacing invalid UTF-8
    async fn finish(self) -> String {
        let mut task = self.task;
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            warn!(
                "Payload output still open after {:?}, keeping partial output",
                DRAIN_GRACE
            );
            task.abort();
        }

        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
