//! Background Task Manager - durable, pollable commands
//!
//! `start` spawns through the shared launcher and returns as soon as the
//! process exists. A finalizer task per entry waits for the exit report,
//! drains the readers and performs the only transition into a terminal
//! state. `kill` moves a running task to `killing` and leaves finalization to
//! the finalizer, so the two never race to complete the same task.
//!
//! Registry: one `RwLock` over the map, one `Mutex` per task. Status
//! transitions happen under the task's own lock.

use crate::buffer::SharedBuffer;
use crate::foreground::ForegroundResult;
use crate::output::{filter_text, OutputFilter};
use crate::process::{HandleId, Launcher, ProcessHandle};
use crate::request::ExecutionRequest;
use crate::signal::{ExitReport, Signal, TerminateOutcome};
use crate::state::TaskStatus;
use crate::tracker::ResourceMetrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_foundation::{Error, Result};

/// Terminal result of a background task
pub type TaskResult = ForegroundResult;

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| Error::InvalidInput(format!("invalid task id: {}", s)))
    }
}

/// A command running (or finished) in the background
#[derive(Debug)]
struct BackgroundTask {
    id: TaskId,
    command: String,
    status: TaskStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    handle_id: HandleId,
    /// Present while running or killing
    handle: Option<ProcessHandle>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    output_filter: Option<String>,
    result: Option<TaskResult>,
    metrics: ResourceMetrics,
}

impl BackgroundTask {
    fn output_bytes(&self) -> u64 {
        self.stdout.lock().total_written() + self.stderr.lock().total_written()
    }

    /// Move to `next` if the state machine allows it
    fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            debug!(task_id = %self.id, from = %self.status, to = %next, "Transition refused");
            return false;
        }
        self.status = next;
        true
    }

    /// The single transition into a terminal state
    fn finalize(&mut self, report: ExitReport, metrics: Option<ResourceMetrics>) {
        let next = if report.success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if !self.transition(next) {
            return;
        }

        let mut metrics = metrics.unwrap_or_default();
        metrics.output_bytes = self.output_bytes();

        self.result = Some(ForegroundResult::assemble(
            &report,
            &self.stdout,
            &self.stderr,
            None,
        ));
        self.metrics = metrics;
        self.finished_at = Some(Utc::now());
        self.handle = None;

        info!(
            task_id = %self.id,
            pid = ?self.pid,
            status = %next,
            exit_code = ?report.exit_code,
            signal = ?report.signal,
            "Background task finished"
        );
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub command: String,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub metrics: ResourceMetrics,
    pub result: Option<TaskResult>,
}

/// Row of `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub command: String,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// Per-stream positions in a task's output, as total bytes written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMark {
    pub stdout: u64,
    pub stderr: u64,
}

/// Output written after an `OutputMark`, unfiltered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTail {
    pub stdout: String,
    pub stderr: String,
    /// Pass back on the next call
    pub mark: OutputMark,
    /// Part of the requested range was overwritten before it was read
    pub skipped: bool,
}

/// Text written after `mark`. An incomplete UTF-8 sequence at the end is
/// held back for the next read.
fn take_since(buffer: &SharedBuffer, mark: u64) -> (String, u64, bool) {
    let buffer = buffer.lock();
    let (bytes, skipped) = buffer.read_since(mark);
    let start = buffer.total_written() - bytes.len() as u64;
    let end = match std::str::from_utf8(&bytes) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => bytes.len(),
    };
    (
        String::from_utf8_lossy(&bytes[..end]).into_owned(),
        start + end as u64,
        skipped,
    )
}

/// Answer to a kill request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KillOutcome {
    fn accepted() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn refused(reason: &str) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Owns the task registry
#[derive(Debug, Clone)]
pub struct BackgroundTaskManager {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<Mutex<BackgroundTask>>>>>,
    launcher: Launcher,
}

impl BackgroundTaskManager {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            launcher,
        }
    }

    /// Spawn `request` and return its id once the process exists.
    /// Rejected or unspawnable commands leave no registry entry.
    pub async fn start(&self, request: &ExecutionRequest) -> Result<TaskId> {
        OutputFilter::compile(request.output_filter.as_deref())?;

        let launched = self
            .launcher
            .launch(request, request.timeout, "background")?;
        let id = TaskId::new();
        let pid = launched.handle.pid();
        let handle_id = launched.handle.id();
        let exit = launched.handle.exit_watch();

        let task = Arc::new(Mutex::new(BackgroundTask {
            id,
            command: request.command.clone(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            pid,
            handle_id,
            handle: Some(launched.handle),
            stdout: launched.stdout,
            stderr: launched.stderr,
            output_filter: request.output_filter.clone(),
            result: None,
            metrics: ResourceMetrics::default(),
        }));
        self.tasks.write().await.insert(id, Arc::clone(&task));

        let readers = launched.readers;
        let tracker = self.launcher.tracker().clone();
        let drain_timeout = self.launcher.drain_timeout();
        tokio::spawn(async move {
            let report = exit.wait().await;
            readers.drain(drain_timeout).await;
            let metrics = tracker.metrics(handle_id);
            task.lock().await.finalize(report, metrics);
        });

        info!(task_id = %id, ?pid, command = %request.command, "Background task started");
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Arc<Mutex<BackgroundTask>>> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Current output, metrics and status. `filter` overrides the filter
    /// given at start.
    pub async fn status(&self, id: TaskId, filter: Option<&str>) -> Result<TaskSnapshot> {
        let task = self.get(id).await?;
        let task = task.lock().await;

        let filter = OutputFilter::compile(filter.or(task.output_filter.as_deref()))?;
        let (stdout, stdout_truncated) = {
            let buffer = task.stdout.lock();
            (buffer.read_string(), buffer.is_truncated())
        };
        let (stderr, stderr_truncated) = {
            let buffer = task.stderr.lock();
            (buffer.read_string(), buffer.is_truncated())
        };

        let metrics = if task.status.is_terminal() {
            task.metrics.clone()
        } else {
            let mut live = self
                .launcher
                .tracker()
                .metrics(task.handle_id)
                .unwrap_or_default();
            live.output_bytes = task.output_bytes();
            live
        };

        let result = task.result.clone().map(|mut result| {
            result.stdout = filter_text(result.stdout, filter.as_ref());
            result.stderr = filter_text(result.stderr, filter.as_ref());
            result
        });

        Ok(TaskSnapshot {
            id: task.id,
            command: task.command.clone(),
            status: task.status,
            pid: task.pid,
            started_at: task.started_at,
            finished_at: task.finished_at,
            stdout: filter_text(stdout, filter.as_ref()),
            stderr: filter_text(stderr, filter.as_ref()),
            stdout_truncated,
            stderr_truncated,
            metrics,
            result,
        })
    }

    /// Output written since `since`, for streaming a task as it runs
    pub async fn output_since(&self, id: TaskId, since: OutputMark) -> Result<OutputTail> {
        let task = self.get(id).await?;
        let task = task.lock().await;

        let (stdout, stdout_mark, stdout_skipped) = take_since(&task.stdout, since.stdout);
        let (stderr, stderr_mark, stderr_skipped) = take_since(&task.stderr, since.stderr);
        Ok(OutputTail {
            stdout,
            stderr,
            mark: OutputMark {
                stdout: stdout_mark,
                stderr: stderr_mark,
            },
            skipped: stdout_skipped || stderr_skipped,
        })
    }

    /// Request termination. `None` means SIGTERM with escalation; `KILL`
    /// skips the grace window and may follow an earlier graceful request.
    pub async fn kill(&self, id: TaskId, signal: Option<Signal>) -> Result<KillOutcome> {
        let task = self.get(id).await?;
        let mut task = task.lock().await;
        let signal = signal.unwrap_or(Signal::Term);
        let signals = self.launcher.signals();

        let outcome = match task.status {
            TaskStatus::Running => {
                let delivered = task
                    .handle
                    .as_ref()
                    .map(|handle| signals.terminate_with(handle, signal));
                match delivered {
                    Some(TerminateOutcome::Signalled) => {
                        task.transition(TaskStatus::Killing);
                        KillOutcome::accepted()
                    }
                    // Exited; the finalizer has not run yet
                    _ => KillOutcome::refused("not running"),
                }
            }
            TaskStatus::Killing if signal.is_forceful() => {
                if let Some(handle) = &task.handle {
                    signals.terminate_with(handle, signal);
                }
                KillOutcome::accepted()
            }
            TaskStatus::Killing => KillOutcome::refused("already killing"),
            TaskStatus::Completed | TaskStatus::Failed => KillOutcome::refused("not running"),
        };

        debug!(task_id = %id, %signal, success = outcome.success, "Kill requested");
        Ok(outcome)
    }

    /// All tasks, oldest first
    pub async fn list(&self) -> Vec<TaskSummary> {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let task = entry.lock().await;
            summaries.push(TaskSummary {
                id: task.id,
                command: task.command.clone(),
                status: task.status,
                pid: task.pid,
                started_at: task.started_at,
                exit_code: task.result.as_ref().and_then(|r| r.exit_code),
            });
        }
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Evict a finished task
    pub async fn remove(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        if !entry.lock().await.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "task {} is still running; kill it first",
                id
            )));
        }
        tasks.remove(&id);
        debug!(task_id = %id, "Background task removed");
        Ok(())
    }

    pub async fn running_count(&self) -> usize {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut count = 0;
        for entry in entries {
            if !entry.lock().await.status.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Terminate every live task, wait for the exits and clear the registry
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let signals = self.launcher.signals();
        let mut pending = Vec::new();

        for entry in entries {
            let mut task = entry.lock().await;
            if task.status.is_terminal() {
                continue;
            }
            if let Some(handle) = &task.handle {
                signals.terminate(handle);
                pending.push(handle.exit_watch().wait());
            }
            if task.status.is_running() {
                task.transition(TaskStatus::Killing);
            }
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Terminating background tasks");
            let limit = signals.grace_period() + Duration::from_secs(1);
            if tokio::time::timeout(limit, join_all(pending)).await.is_err() {
                warn!("Background tasks still running after shutdown grace period");
            }
        }
        self.tasks.write().await.clear();
    }
}
