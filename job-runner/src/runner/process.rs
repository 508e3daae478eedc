//! Process runner for task scripts.
//!
//! A task program is started with one argument (the JSON task input). Its
//! standard output is read record by record while it runs; every record goes
//! to the [`TASK_OUTPUT_TARGET`] log target and the last non-empty one is kept
//! as the candidate result. Standard error is captured in full, and both
//! streams feed the optional progress tap.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use process_utils::{CommandExt, OutputRecordReader, tokio_command};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::progress::{ProgressParser, ProgressSink, ProgressTap, pump_records};
use crate::registry::ScriptTask;
use crate::{Error, Result};

/// Log target receiving task program output.
pub const TASK_OUTPUT_TARGET: &str = "job_runner::task_output";

/// Failure text of a streamed task that exits cleanly without any output.
pub const NO_OUTPUT_MESSAGE: &str = "No output returned from job script";

const STREAM_CHANNEL_CAPACITY: usize = 256;
const STDERR_CHUNK: usize = 4096;

/// Process runner settings.
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Path-list variable augmented for the child, e.g. `PYTHONPATH`.
    pub search_path_var: String,
    /// Directories prepended to `search_path_var`.
    pub search_path: Vec<PathBuf>,
    /// Liveness poll interval of the streaming form.
    pub poll_interval: Duration,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            search_path_var: "PYTHONPATH".to_string(),
            search_path: vec![std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))],
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Progress parser and sink for one run.
pub struct ProgressHook {
    pub parser: Box<dyn ProgressParser>,
    pub sink: Arc<dyn ProgressSink>,
}

impl ProgressHook {
    pub fn new(parser: Box<dyn ProgressParser>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { parser, sink }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Last non-empty standard output record.
    pub result_line: Option<String>,
    /// `result_line` parsed as JSON; `None` when absent or not JSON.
    pub result: Option<Value>,
}

impl RunOutput {
    fn from_line(result_line: Option<String>) -> Self {
        let result = result_line.as_deref().and_then(|line| {
            serde_json::from_str::<Value>(line)
                .map_err(|e| debug!(error = %e, "Final output line is not JSON"))
                .ok()
        });
        Self {
            result_line,
            result,
        }
    }
}

struct Running {
    child: Child,
    stderr: JoinHandle<Vec<u8>>,
    tap: Option<ProgressTap>,
}

impl Running {
    fn tap_sender(&self) -> Option<mpsc::Sender<String>> {
        self.tap.as_ref().and_then(ProgressTap::sender)
    }

    /// Collect stderr, stop the progress reader and map the exit status.
    async fn finish(
        self,
        status: std::io::Result<ExitStatus>,
        result_line: Option<String>,
    ) -> Result<RunOutput> {
        let stderr = self.stderr.await.unwrap_or_else(|e| {
            warn!(error = %e, "Stderr reader task failed");
            Vec::new()
        });
        if let Some(tap) = self.tap {
            tap.finish().await;
        }

        let status = status?;
        if !status.success() {
            return Err(Error::TaskFailed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(RunOutput::from_line(result_line))
    }
}

/// Spawns task programs and collects their results.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessRunnerConfig {
        &self.config
    }

    /// Command line for `task` with its single argument.
    pub fn command(&self, task: &ScriptTask, argument: &str) -> Command {
        let mut cmd = match task.interpreter.split_first() {
            Some((launcher, args)) => {
                let mut cmd = tokio_command(launcher);
                cmd.args(args).arg(&task.program);
                cmd
            }
            None => tokio_command(&task.program),
        };
        cmd.arg(argument);
        cmd.search_path(&self.config.search_path_var, &self.config.search_path);
        cmd
    }

    fn start(
        &self,
        job_id: &str,
        task: &ScriptTask,
        argument: &str,
        progress: Option<ProgressHook>,
    ) -> Result<(Running, ChildStdout)> {
        let mut command = self.command(task, argument);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            Error::Other(format!(
                "Failed to start task program {}: {}",
                task.program.display(),
                e
            ))
        })?;
        debug!(job_id, program = %task.program.display(), pid = ?child.id(), "Task program started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("Task stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other("Task stderr was not captured".to_string()))?;

        let tap = progress.map(|hook| ProgressTap::start(hook.parser, hook.sink));
        let stderr = tokio::spawn(capture_stderr(
            stderr,
            job_id.to_string(),
            tap.as_ref().and_then(ProgressTap::sender),
        ));

        Ok((Running { child, stderr, tap }, stdout))
    }

    /// Run `task` to completion.
    ///
    /// Fails with [`Error::TaskFailed`] carrying the captured standard error
    /// when the program exits unsuccessfully.
    pub async fn run(
        &self,
        job_id: &str,
        task: &ScriptTask,
        argument: &str,
        progress: Option<ProgressHook>,
    ) -> Result<RunOutput> {
        let (mut running, stdout) = self.start(job_id, task, argument, progress)?;
        let tap = running.tap_sender();

        let mut reader = OutputRecordReader::new(BufReader::new(stdout));
        let mut last = None;
        loop {
            match reader.next_record().await {
                Ok(Some(line)) => {
                    forward_line(job_id, &line, tap.as_ref()).await;
                    last = Some(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(job_id, error = %e, "Failed reading task output");
                    break;
                }
            }
        }
        drop(reader);
        drop(tap);

        let status = running.child.wait().await;
        running.finish(status, last).await
    }

    /// Like [`ProcessRunner::run`], additionally forwarding every output
    /// record to `lines`.
    ///
    /// Completion is detected by polling the process rather than waiting for
    /// the end of its output. A closed `lines` receiver does not stop the task.
    /// A program that exits successfully without writing any output fails
    /// with [`NO_OUTPUT_MESSAGE`].
    pub async fn run_streaming(
        &self,
        job_id: &str,
        task: &ScriptTask,
        argument: &str,
        progress: Option<ProgressHook>,
        lines: mpsc::Sender<String>,
    ) -> Result<RunOutput> {
        let (mut running, stdout) = self.start(job_id, task, argument, progress)?;
        let tap = running.tap_sender();

        let (tx, mut rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_records(stdout, tx));

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        let mut last = None;
        let status = loop {
            tokio::select! {
                Some(line) = rx.recv() => {
                    forward_line(job_id, &line, tap.as_ref()).await;
                    let _ = lines.send(line.clone()).await;
                    last = Some(line);
                }
                _ = ticker.tick() => {
                    match running.child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        // Output written just before exit may still be in flight.
        if let Err(e) = pump.await {
            warn!(job_id, error = %e, "Output reader task failed");
        }
        while let Some(line) = rx.recv().await {
            forward_line(job_id, &line, tap.as_ref()).await;
            let _ = lines.send(line.clone()).await;
            last = Some(line);
        }
        drop(tap);

        let output = running.finish(status, last).await?;
        if output.result_line.is_none() {
            return Err(Error::Other(NO_OUTPUT_MESSAGE.to_string()));
        }
        Ok(output)
    }
}

async fn forward_line(job_id: &str, line: &str, tap: Option<&mpsc::Sender<String>>) {
    info!(target: TASK_OUTPUT_TARGET, job_id, "{}", line);
    if let Some(tx) = tap {
        let _ = tx.send(line.to_string()).await;
    }
}

/// Read `stream` to the end, returning everything it produced.
///
/// When `tap` is set, complete CR/LF-delimited records are forwarded to it as
/// they arrive.
async fn capture_stderr<R>(mut stream: R, job_id: String, tap: Option<mpsc::Sender<String>>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut pending = Vec::new();
    let mut chunk = [0u8; STDERR_CHUNK];

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                captured.extend_from_slice(&chunk[..n]);
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
                    let record: Vec<u8> = pending.drain(..=pos).collect();
                    emit_stderr_record(&job_id, &record[..pos], tap.as_ref()).await;
                }
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Stderr closed with error");
                break;
            }
        }
    }
    emit_stderr_record(&job_id, &pending, tap.as_ref()).await;
    captured
}

async fn emit_stderr_record(job_id: &str, record: &[u8], tap: Option<&mpsc::Sender<String>>) {
    let text = String::from_utf8_lossy(record);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    debug!(target: TASK_OUTPUT_TARGET, job_id, stream = "stderr", "{}", text);
    if let Some(tx) = tap {
        let _ = tx.send(text.to_string()).await;
    }
}
