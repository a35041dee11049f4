//! # warden-task
//!
//! Command execution supervisor for Warden.
//! Spawns, watches, buffers and terminates OS processes on behalf of an agent.
//!
//! ## Features
//!
//! - Command validation before any spawn
//! - Foreground execution with timeout and signal escalation
//! - Background tasks with pollable output and kill-by-id
//! - Pool of persistent interactive shell sessions (LRU + idle eviction)
//! - OS resource limits and per-process resource sampling
//! - Bounded output through circular buffers

pub mod background;
pub mod buffer;
pub mod foreground;
pub mod limits;
pub mod output;
pub mod process;
pub mod request;
pub mod session;
pub mod signal;
pub mod state;
pub mod supervisor;
pub mod tracker;
pub mod validator;

// Facade
pub use supervisor::{Submission, Supervisor};

// Requests and results
pub use foreground::{ForegroundExecutor, ForegroundResult};
pub use request::{ExecutionMode, ExecutionRequest};

// Background tasks
pub use background::{
    BackgroundTaskManager, KillOutcome, OutputMark, OutputTail, TaskId, TaskResult, TaskSnapshot,
    TaskSummary,
};
pub use state::{SessionStatus, TaskStatus};

// Sessions
pub use session::{CommandRecord, SessionInfo, SessionOutput, ShellSessionPool};

// Process control
pub use buffer::{CircularBuffer, SharedBuffer};
pub use limits::{format_bytes, ResourceLimiter, ResourcePolicy};
pub use output::{strip_ansi, OutputFilter};
pub use process::{HandleId, Launcher, ProcessHandle};
pub use signal::{ExitReport, Signal, SignalManager, TerminateOutcome};
pub use tracker::{ProcessTracker, ResourceMetrics, TrackedProcess};
pub use validator::{CommandValidator, Verdict};
