//! Execution requests

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where a request runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run to completion while the caller waits
    #[default]
    Foreground,

    /// Start and return a task id to poll
    Background,

    /// Run inside a pooled interactive shell
    Session {
        /// Reuse this session; a new one is created when absent
        session_id: Option<String>,
    },
}

/// A command submitted to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Command line passed to the shell
    pub command: String,

    /// Working directory (inherits the supervisor's when unset)
    pub working_dir: Option<PathBuf>,

    /// Overrides merged over the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub timeout: Option<Duration>,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Regex; only matching output lines are returned
    pub output_filter: Option<String>,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
            mode: ExecutionMode::Foreground,
            output_filter: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(ms))
    }

    pub fn with_output_filter(mut self, pattern: impl Into<String>) -> Self {
        self.output_filter = Some(pattern.into());
        self
    }

    pub fn background(mut self) -> Self {
        self.mode = ExecutionMode::Background;
        self
    }

    pub fn in_session(mut self, session_id: Option<String>) -> Self {
        self.mode = ExecutionMode::Session { session_id };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let request = ExecutionRequest::new("make test")
            .with_working_dir("/tmp")
            .with_env("RUST_LOG", "debug")
            .with_timeout_ms(5000)
            .with_output_filter("error")
            .background();

        assert_eq!(request.command, "make test");
        assert_eq!(request.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(request.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.mode, ExecutionMode::Background);
    }

    #[test]
    fn test_deserialize_minimal() {
        let request: ExecutionRequest =
            serde_json::from_str(r#"{"command": "ls", "working_dir": null, "timeout": null, "output_filter": null}"#)
                .unwrap();
        assert_eq!(request.mode, ExecutionMode::Foreground);
        assert!(request.env.is_empty());

        let mode: ExecutionMode =
            serde_json::from_str(r#"{"mode": "session", "session_id": "s1"}"#).unwrap();
        assert_eq!(
            mode,
            ExecutionMode::Session {
                session_id: Some("s1".to_string())
            }
        );
    }
}
