//! Supervisor - the mode-independent entry point
//!
//! Wires one launcher (validator, limiter, signal manager, tracker) into the
//! three execution modes and exposes their operations side by side.

use crate::background::{
    BackgroundTaskManager, KillOutcome, OutputMark, OutputTail, TaskId, TaskSnapshot, TaskSummary,
};
use crate::foreground::{ForegroundExecutor, ForegroundResult};
use crate::output::{filter_text, OutputFilter};
use crate::process::Launcher;
use crate::request::{ExecutionMode, ExecutionRequest};
use crate::session::{CommandRecord, SessionInfo, SessionOutput, ShellSessionPool};
use crate::signal::Signal;
use crate::tracker::{ProcessTracker, ResourceMetrics};
use crate::validator::Verdict;
use serde::{Deserialize, Serialize};
use tracing::info;
use warden_foundation::{Result, SupervisorConfig};

/// What `submit` produced, by mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    Completed(ForegroundResult),
    Started { task_id: TaskId },
    Session(SessionOutput),
}

/// Command execution supervisor
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Launcher,
    foreground: ForegroundExecutor,
    background: BackgroundTaskManager,
    sessions: ShellSessionPool,
}

impl Supervisor {
    /// Build from `config` and start the tracker and idle sweeper.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        config.validate()?;

        let tracker = ProcessTracker::new(&config.tracker);
        let launcher = Launcher::new(&config, tracker.clone())?;
        let foreground = ForegroundExecutor::new(launcher.clone(), config.execution.default_timeout());
        let background = BackgroundTaskManager::new(launcher.clone());
        let sessions = ShellSessionPool::new(launcher.clone(), &config.sessions);

        tracker.start();
        sessions.start_idle_sweeper();
        info!(
            limits = %launcher.limiter().policy().describe(),
            max_sessions = config.sessions.max_sessions,
            "Supervisor started"
        );

        Ok(Self {
            config,
            launcher,
            foreground,
            background,
            sessions,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(SupervisorConfig::default())
    }

    /// Build from the global and project configuration files
    pub fn load() -> Result<Self> {
        Self::new(SupervisorConfig::load()?)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ProcessTracker {
        self.launcher.tracker()
    }

    /// Validator verdict without running anything
    pub fn validate(&self, command: &str) -> Verdict {
        self.launcher.validator().validate(command)
    }

    // ========================================================================
    // Foreground
    // ========================================================================

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ForegroundResult> {
        self.foreground.run(request).await
    }

    // ========================================================================
    // Background
    // ========================================================================

    pub async fn execute_background(&self, request: &ExecutionRequest) -> Result<TaskId> {
        self.background.start(request).await
    }

    pub async fn get_background_status(
        &self,
        task_id: TaskId,
        output_filter: Option<&str>,
    ) -> Result<TaskSnapshot> {
        self.background.status(task_id, output_filter).await
    }

    pub async fn background_output(&self, task_id: TaskId, since: OutputMark) -> Result<OutputTail> {
        self.background.output_since(task_id, since).await
    }

    pub async fn kill_background(
        &self,
        task_id: TaskId,
        signal: Option<Signal>,
    ) -> Result<KillOutcome> {
        self.background.kill(task_id, signal).await
    }

    pub async fn list_background(&self) -> Vec<TaskSummary> {
        self.background.list().await
    }

    pub async fn remove_background(&self, task_id: TaskId) -> Result<()> {
        self.background.remove(task_id).await
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub async fn acquire_session(&self, session_id: Option<&str>) -> Result<String> {
        self.sessions.acquire(session_id).await
    }

    pub async fn run_in_session(&self, session_id: &str, command: &str) -> Result<SessionOutput> {
        self.sessions.execute(session_id, command).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        self.sessions.close(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list().await
    }

    pub async fn session_metrics(&self, session_id: &str) -> Result<ResourceMetrics> {
        self.sessions.metrics(session_id).await
    }

    pub async fn session_history(&self, session_id: &str) -> Result<Vec<CommandRecord>> {
        self.sessions.history(session_id).await
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route a request by its mode
    pub async fn submit(&self, request: &ExecutionRequest) -> Result<Submission> {
        match &request.mode {
            ExecutionMode::Foreground => self.execute(request).await.map(Submission::Completed),
            ExecutionMode::Background => self
                .execute_background(request)
                .await
                .map(|task_id| Submission::Started { task_id }),
            ExecutionMode::Session { session_id } => {
                // Reject before a shell is spawned or another one evicted
                self.launcher.validator().check(&request.command)?;
                let filter = OutputFilter::compile(request.output_filter.as_deref())?;
                let id = self
                    .sessions
                    .acquire_with(
                        session_id.as_deref(),
                        request.working_dir.as_deref(),
                        &request.env,
                    )
                    .await?;
                let mut output = self.sessions.execute(&id, &request.command).await?;
                output.stdout = filter_text(output.stdout, filter.as_ref());
                output.stderr = filter_text(output.stderr, filter.as_ref());
                Ok(Submission::Session(output))
            }
        }
    }

    /// Terminate everything and stop the background loops
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.sessions.shutdown().await;
        self.background.shutdown().await;
        self.launcher.tracker().stop();
    }
}
