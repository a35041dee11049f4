//! Lifecycle states for background tasks and shell sessions

use serde::{Deserialize, Serialize};

/// Background task state.
///
/// `Running -> Killing -> {Completed, Failed}` or `Running -> {Completed, Failed}`.
/// Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Process is running
    Running,

    /// Termination requested, waiting for exit
    Killing,

    /// Exited with code 0
    Completed,

    /// Exited non-zero, by signal, or could not be waited on
    Failed,
}

impl TaskStatus {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Running => next != TaskStatus::Running,
            TaskStatus::Killing => next.is_terminal(),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Killing => "killing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Get a symbol for the state (for CLI output)
    pub fn symbol(&self) -> &'static str {
        match self {
            TaskStatus::Running => "⟳",
            TaskStatus::Killing => "⊘",
            TaskStatus::Completed => "✓",
            TaskStatus::Failed => "✗",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Shell session state: `Initializing -> Ready -> Terminating -> Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Terminating,
    Terminated,
}

impl SessionStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionStatus::Ready)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Ready => "ready",
            SessionStatus::Terminating => "terminating",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
