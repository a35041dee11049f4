//! Error types for Warden
//!
//! Every failure the supervisor can surface is described here. Once a process
//! is running, failures are captured into result/status structures instead of
//! being raised; only the variants below cross the public API.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Which validator rule rejected a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Matched a destructive-command pattern
    DangerousPattern,
    /// First token of a simple command is a restricted program
    RestrictedExecutable,
    /// Output is redirected into a protected location
    ProtectedPath,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::DangerousPattern => "dangerous pattern",
            RuleKind::RestrictedExecutable => "restricted executable",
            RuleKind::ProtectedPath => "protected path",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warden error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation
    // ========================================================================
    #[error("Command rejected ({rule}): {reason}")]
    ValidationRejected { rule: RuleKind, reason: String },

    // ========================================================================
    // Process lifecycle
    // ========================================================================
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Kill failed: {0}")]
    KillFailed(String),

    #[error("Session pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    // ========================================================================
    // Lookup
    // ========================================================================
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // ========================================================================
    // General
    // ========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted(_) | Error::TimedOut(_))
    }

    /// Whether the message is meant to be shown to the user as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::ValidationRejected { .. }
                | Error::SpawnFailed(_)
                | Error::TaskNotFound(_)
                | Error::SessionNotFound(_)
                | Error::InvalidInput(_)
        )
    }

    /// Validation rejection helper
    pub fn rejected(rule: RuleKind, reason: impl Into<String>) -> Self {
        Error::ValidationRejected {
            rule,
            reason: reason.into(),
        }
    }

    /// Rule that fired, if this is a validation rejection
    pub fn rule(&self) -> Option<RuleKind> {
        match self {
            Error::ValidationRejected { rule, .. } => Some(*rule),
            _ => None,
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message_names_rule() {
        let err = Error::rejected(RuleKind::ProtectedPath, "redirect into /etc/passwd");
        assert_eq!(
            err.to_string(),
            "Command rejected (protected path): redirect into /etc/passwd"
        );
        assert_eq!(err.rule(), Some(RuleKind::ProtectedPath));
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::PoolExhausted("all busy".into()).is_retryable());
        assert!(!Error::SpawnFailed("no such file".into()).is_retryable());
        assert!(Error::Internal("x".into()).rule().is_none());
    }
}
