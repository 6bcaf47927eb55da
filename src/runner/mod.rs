//! Background execution of the containerized tool.
//!
//! One submitted job becomes one supervised tokio task, gated by a semaphore
//! so at most `max_concurrent_jobs` tool processes exist at a time. The task
//! spawns the container runtime as a child process, drains stdout and stderr
//! concurrently (a full pipe buffer would deadlock the child) into the job's
//! `run.log`, enforces the wall-clock timeout, and classifies the outcome
//! into the job record. Nothing in here propagates: every failure ends as a
//! terminal Failed record.
//!
//! ```text
//! submit ──▶ spawn ──▶ [permit] ──▶ docker run … ──▶ exit 0 ──▶ package ──▶ Complete
//!                                       │                │
//!                                       │ stdout/stderr  └─ non-zero / timeout / no output
//!                                       ▼                                  ──▶ Failed
//!                                   run.log + WS broadcast
//! ```

pub mod invocation;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Semaphore, broadcast, mpsc};
use uuid::Uuid;

use crate::bundle::Workspace;
use crate::config::ToolConfig;
use crate::error::ExecutionError;
use crate::package;
use crate::store::{JobRecord, JobTracker};

pub use self::invocation::{ToolInvocation, build_tool_invocation};

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One captured output line, broadcast to log-stream listeners.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub job_id: Uuid,
    pub stream: StreamKind,
    pub line: String,
}

/// How many trailing stderr lines feed the record-visible error. The full
/// capture always lands in `run.log`.
const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_MAX_BYTES: usize = 2048;

/// Ring of the last few stderr lines, bounded so job records stay small.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: &str) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn joined(&self) -> String {
        if self.lines.is_empty() {
            return "<no stderr captured>".to_string();
        }
        let mut joined = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if joined.len() > STDERR_TAIL_MAX_BYTES {
            let mut start = joined.len() - STDERR_TAIL_MAX_BYTES;
            while !joined.is_char_boundary(start) {
                start += 1;
            }
            joined = joined[start..].to_string();
        }
        joined
    }
}

/// Bounded pool of background job runners.
pub struct RunnerPool {
    tool: ToolConfig,
    tracker: JobTracker,
    permits: Arc<Semaphore>,
    log_tx: broadcast::Sender<LogLine>,
}

impl RunnerPool {
    pub fn new(tool: ToolConfig, tracker: JobTracker, log_tx: broadcast::Sender<LogLine>) -> Self {
        let permits = Arc::new(Semaphore::new(tool.max_concurrent_jobs.max(1)));
        Self {
            tool,
            tracker,
            permits,
            log_tx,
        }
    }

    /// Number of jobs currently holding a run slot.
    pub fn active_jobs(&self) -> usize {
        self.tool
            .max_concurrent_jobs
            .saturating_sub(self.permits.available_permits())
    }

    /// Launch the background task for a job whose intake just succeeded.
    ///
    /// Called exactly once per job. The inner task never returns an error;
    /// the outer supervisor only exists so a panic becomes a Failed record
    /// instead of a silently stuck job.
    pub fn spawn(self: &Arc<Self>, record: JobRecord, data_root: PathBuf) {
        let pool = Arc::clone(self);
        let tracker = self.tracker.clone();
        let job_id = record.id;

        let worker = tokio::spawn(async move { pool.run_job(record, data_root).await });
        tokio::spawn(async move {
            if let Err(join_err) = worker.await {
                tracing::error!(job_id = %job_id, "job task crashed: {join_err}");
                tracker
                    .fail(job_id, format!("job task crashed: {join_err}"))
                    .await;
            }
        });
    }

    async fn run_job(self: Arc<Self>, record: JobRecord, data_root: PathBuf) {
        let job_id = record.id;

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.tracker
                    .fail(job_id, "runner pool shut down before the job could start")
                    .await;
                return;
            }
        };

        // The job may have been deleted while waiting for a slot.
        match self.tracker.get(job_id).await {
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "job deleted while queued, skipping run");
                return;
            }
            Ok(Some(_)) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, "store read failed before run: {e}");
            }
        }

        let workspace = Workspace::open(record.workspace.clone());
        if let Err(e) = tokio::fs::create_dir_all(workspace.output_dir()).await {
            self.tracker
                .fail(job_id, format!("failed to create output directory: {e}"))
                .await;
            return;
        }

        let invocation =
            build_tool_invocation(&self.tool, &record.params, &data_root, &workspace.output_dir());
        let timeout = Duration::from_secs(
            record
                .params
                .timeout_secs
                .unwrap_or(self.tool.timeout_secs),
        );

        self.tracker.mark_running(job_id).await;
        tracing::info!(job_id = %job_id, "launching tool: {invocation}");

        match execute(&invocation, &workspace.run_log(), timeout, &self.log_tx, job_id).await {
            Ok(()) => finish_successful_run(&self.tracker, job_id, &workspace).await,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "tool run failed: {e}");
                self.tracker.fail(job_id, e.to_string()).await;
            }
        }
    }
}

/// Post-exit handling for an exit-zero run: verify output exists, package
/// it, and only then record Complete.
async fn finish_successful_run(tracker: &JobTracker, job_id: Uuid, workspace: &Workspace) {
    match has_tool_output(&workspace.output_dir()).await {
        Ok(true) => {}
        Ok(false) => {
            tracker
                .fail(job_id, ExecutionError::EmptyOutput.to_string())
                .await;
            return;
        }
        Err(e) => {
            tracker
                .fail(job_id, format!("failed to inspect output directory: {e}"))
                .await;
            return;
        }
    }

    match package::archive_output(&workspace.output_dir(), &workspace.result_zip()).await {
        Ok(bytes) => {
            tracing::info!(job_id = %job_id, bytes, "results packaged");
            tracker.complete(job_id).await;
        }
        Err(e) => {
            tracker.fail(job_id, e.to_string()).await;
        }
    }
}

/// True if the output directory contains anything besides the run log.
async fn has_tool_output(output_dir: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() != "run.log" {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run one tool invocation to completion.
///
/// The exact command is recorded at the top of `run.log`; both output pipes
/// are drained concurrently into the log (and the broadcast channel) while
/// the process runs. On timeout the child is killed and reaped so no orphan
/// remains.
async fn execute(
    invocation: &ToolInvocation,
    run_log: &Path,
    timeout: Duration,
    log_tx: &broadcast::Sender<LogLine>,
    job_id: Uuid,
) -> Result<(), ExecutionError> {
    let io_err = |reason: String| ExecutionError::Io { reason };

    let mut log_file = tokio::fs::File::create(run_log)
        .await
        .map_err(|e| io_err(format!("cannot create run log: {e}")))?;
    log_file
        .write_all(format!("$ {invocation}\n\n").as_bytes())
        .await
        .map_err(|e| io_err(format!("cannot write run log: {e}")))?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = log_file
                .write_all(format!("failed to launch: {e}\n").as_bytes())
                .await;
            return Err(ExecutionError::Launch {
                program: invocation.program.clone(),
                reason: e.to_string(),
            });
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_err("failed to capture tool stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_err("failed to capture tool stderr".to_string()))?;

    let (line_tx, mut line_rx) = mpsc::channel::<(StreamKind, String)>(256);
    spawn_line_reader(stdout, StreamKind::Stdout, line_tx.clone());
    spawn_line_reader(stderr, StreamKind::Stderr, line_tx);

    // Single writer keeps log lines whole; it also feeds the WS broadcast
    // (fire-and-forget: no listeners is fine) and retains the stderr tail.
    let broadcast_tx = log_tx.clone();
    let writer = tokio::spawn(async move {
        let mut tail = StderrTail::default();
        while let Some((stream, line)) = line_rx.recv().await {
            let _ = log_file.write_all(line.as_bytes()).await;
            let _ = log_file.write_all(b"\n").await;
            if stream == StreamKind::Stderr {
                tail.push(&line);
            }
            let _ = broadcast_tx.send(LogLine {
                job_id,
                stream,
                line,
            });
        }
        let _ = log_file.flush().await;
        tail
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            let _ = writer.await;
            return Err(io_err(format!("failed waiting for tool process: {e}")));
        }
        Err(_) => {
            tracing::warn!(
                job_id = %job_id,
                "tool run exceeded {}s timeout, killing process",
                timeout.as_secs()
            );
            if let Err(e) = child.start_kill() {
                tracing::warn!(job_id = %job_id, "failed to kill timed-out tool: {e}");
            }
            let _ = child.wait().await;
            let _ = writer.await;
            return Err(ExecutionError::TimedOut {
                secs: timeout.as_secs(),
            });
        }
    };

    let tail = writer.await.unwrap_or_default();

    if status.success() {
        Ok(())
    } else {
        Err(ExecutionError::NonZeroExit {
            code: status.code().unwrap_or(-1),
            stderr_tail: tail.joined(),
        })
    }
}

fn spawn_line_reader<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).await.is_err() {
                break;
            }
        }
    });
}
