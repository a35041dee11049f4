//! Foreground executor - run one command to completion or timeout

use crate::buffer::SharedBuffer;
use crate::output::{filter_text, OutputFilter};
use crate::process::Launcher;
use crate::request::ExecutionRequest;
use crate::signal::{signal_name, ExitReport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use warden_foundation::{Error, Result};

/// Outcome of a finished command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForegroundResult {
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    /// Termination was initiated by the supervisor
    pub killed: bool,
    /// ...because of the timeout
    pub timed_out: bool,
    pub error: Option<String>,
}

impl ForegroundResult {
    /// Assemble from an exit report and the captured streams
    pub(crate) fn assemble(
        report: &ExitReport,
        stdout: &SharedBuffer,
        stderr: &SharedBuffer,
        filter: Option<&OutputFilter>,
    ) -> Self {
        let (stdout_text, stdout_truncated) = {
            let buffer = stdout.lock();
            (buffer.read_string(), buffer.is_truncated())
        };
        let (stderr_text, stderr_truncated) = {
            let buffer = stderr.lock();
            (buffer.read_string(), buffer.is_truncated())
        };

        Self {
            exit_code: report.exit_code,
            signal: report.signal,
            stdout: filter_text(stdout_text, filter),
            stderr: filter_text(stderr_text, filter),
            stdout_truncated,
            stderr_truncated,
            duration: report.duration,
            killed: report.killed,
            timed_out: report.timed_out,
            error: report.error.clone(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn signal_name(&self) -> Option<String> {
        self.signal.map(signal_name)
    }

    /// Convert a timeout or limit breach into an error
    pub fn into_checked(self) -> Result<Self> {
        if self.timed_out {
            return Err(Error::TimedOut(format!(
                "command killed after {:.1}s",
                self.duration.as_secs_f64()
            )));
        }
        if let Some(error) = &self.error {
            if error.starts_with("Resource limit exceeded") {
                return Err(Error::ResourceLimitExceeded(
                    error.trim_start_matches("Resource limit exceeded: ").to_string(),
                ));
            }
        }
        Ok(self)
    }
}

/// Runs requests synchronously from the caller's point of view
#[derive(Debug, Clone)]
pub struct ForegroundExecutor {
    launcher: Launcher,
    default_timeout: Option<Duration>,
}

impl ForegroundExecutor {
    pub fn new(launcher: Launcher, default_timeout: Option<Duration>) -> Self {
        Self {
            launcher,
            default_timeout,
        }
    }

    /// Run `request` until it exits or is killed. Validation and spawn
    /// problems are errors; a command that ran and failed is a result.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ForegroundResult> {
        let filter = OutputFilter::compile(request.output_filter.as_deref())?;
        let timeout = request.timeout.or(self.default_timeout);

        let launched = self.launcher.launch(request, timeout, "foreground")?;
        let pid = launched.handle.pid();

        let report = launched.handle.wait().await;
        launched.readers.drain(self.launcher.drain_timeout()).await;

        let result =
            ForegroundResult::assemble(&report, &launched.stdout, &launched.stderr, filter.as_ref());
        info!(
            ?pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "Foreground command finished"
        );
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tracker::ProcessTracker;
    use std::time::Instant;
    use warden_foundation::SupervisorConfig;

    fn executor(config: SupervisorConfig) -> ForegroundExecutor {
        let tracker = ProcessTracker::new(&config.tracker);
        let launcher = Launcher::new(&config, tracker).unwrap();
        ForegroundExecutor::new(launcher, config.execution.default_timeout())
    }

    fn config_with_grace(grace_ms: u64) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.execution.grace_period_ms = grace_ms;
        config
    }

    #[tokio::test]
    async fn test_echo() {
        let executor = executor(SupervisorConfig::default());
        let result = executor
            .run(&ExecutionRequest::new("echo hello").with_timeout_ms(5000))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert!(!result.killed);
        assert!(!result.timed_out);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_with_signal() {
        let executor = executor(config_with_grace(1000));
        let result = executor
            .run(&ExecutionRequest::new("sleep 10").with_timeout_ms(100))
            .await
            .unwrap();

        assert!(result.killed);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.signal, Some(libc::SIGTERM));
        assert!(result.duration < Duration::from_secs(5));
        assert!(matches!(result.into_checked(), Err(Error::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_escalates_when_term_is_ignored() {
        let executor = executor(config_with_grace(50));
        let started = Instant::now();
        let result = executor
            .run(&ExecutionRequest::new("trap '' TERM; sleep 5").with_timeout_ms(100))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(result.timed_out);
        assert_eq!(result.signal, Some(libc::SIGKILL));
        assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let executor = executor(SupervisorConfig::default());
        let result = executor
            .run(&ExecutionRequest::new("echo oops >&2; exit 4"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(4));
        assert_eq!(result.stderr, "oops\n");
        assert!(!result.killed);
    }

    #[tokio::test]
    async fn test_env_override_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(SupervisorConfig::default());
        let request = ExecutionRequest::new("echo $WARDEN_TEST_VAR; pwd")
            .with_env("WARDEN_TEST_VAR", "override")
            .with_working_dir(dir.path());

        let result = executor.run(&request).await.unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();

        assert_eq!(lines[0], "override");
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(lines[1]).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_inherits_environment() {
        let executor = executor(SupervisorConfig::default());
        let result = executor
            .run(&ExecutionRequest::new("echo \"$PATH\""))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim_end(), std::env::var("PATH").unwrap_or_default());
    }

    #[tokio::test]
    async fn test_output_truncation_flag() {
        let mut config = SupervisorConfig::default();
        config.output.max_buffer_bytes = 16;
        let executor = executor(config);

        let result = executor
            .run(&ExecutionRequest::new("printf '0123456789abcdefXYZ'"))
            .await
            .unwrap();

        assert_eq!(result.stdout, "3456789abcdefXYZ");
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_output_filter() {
        let executor = executor(SupervisorConfig::default());
        let request = ExecutionRequest::new("printf 'ok 1\\nerror: bad\\nok 2\\n'")
            .with_output_filter("^error");

        let result = executor.run(&request).await.unwrap();
        assert_eq!(result.stdout, "error: bad\n");

        let invalid = ExecutionRequest::new("echo x").with_output_filter("(");
        assert!(matches!(
            executor.run(&invalid).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejected_before_spawn() {
        let executor = executor(SupervisorConfig::default());
        let err = executor
            .run(&ExecutionRequest::new("shutdown -h now"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ValidationRejected { .. }));
        assert!(err.to_string().contains("restricted executable"));
    }

    #[tokio::test]
    async fn test_cpu_limit_reported() {
        let mut config = SupervisorConfig::default();
        config.limits.cpu_time_secs = Some(1);
        let executor = executor(config);
        // SIGXCPU may dump core; keep it out of the source tree
        let dir = tempfile::tempdir().unwrap();

        let result = executor
            .run(
                &ExecutionRequest::new("while :; do :; done")
                    .with_working_dir(dir.path())
                    .with_timeout_ms(20_000),
            )
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert!(result.error.as_deref().unwrap_or("").contains("CPU time limit"));
        assert!(matches!(
            result.into_checked(),
            Err(Error::ResourceLimitExceeded(_))
        ));
    }
}
