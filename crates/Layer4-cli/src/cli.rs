//! Subcommand handlers
//!
//! Each handler returns the process exit code for `warden`.

use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use warden_task::{ExecutionRequest, ForegroundResult, OutputMark, Supervisor, Verdict};

/// Exit code for a command the validator rejected
const EXIT_REJECTED: i32 = 2;

/// Options shared by `run` and `bg`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub command: String,
    pub timeout_ms: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub filter: Option<String>,
}

impl RunOptions {
    fn into_request(self) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(self.command);
        if let Some(ms) = self.timeout_ms {
            request = request.with_timeout_ms(ms);
        }
        if let Some(dir) = self.cwd {
            request = request.with_working_dir(dir);
        }
        for (key, value) in self.env {
            request = request.with_env(key, value);
        }
        if let Some(filter) = self.filter {
            request = request.with_output_filter(filter);
        }
        request
    }
}

/// Parse `KEY=VALUE`
pub fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

/// Shell convention: the exit code, or 128 + signal
fn exit_code(result: &ForegroundResult) -> i32 {
    match (result.exit_code, result.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

fn print_result(result: &ForegroundResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    let _ = std::io::stdout().flush();

    if result.stdout_truncated || result.stderr_truncated {
        eprintln!("[output truncated to the most recent bytes]");
    }
    if result.timed_out {
        eprintln!(
            "[timed out after {:.1}s, terminated by {}]",
            result.duration.as_secs_f64(),
            result.signal_name().unwrap_or_else(|| "signal".to_string())
        );
    } else if result.killed {
        eprintln!("[killed]");
    }
    if let Some(error) = &result.error {
        eprintln!("[{}]", error);
    }
}

/// `warden run`
pub async fn run(supervisor: &Supervisor, options: RunOptions, json: bool) -> Result<i32> {
    let result = supervisor.execute(&options.into_request()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(exit_code(&result))
}

/// `warden check`
pub fn check(supervisor: &Supervisor, command: &str, json: bool) -> Result<i32> {
    let verdict = supervisor.validate(command);
    if json {
        let value = match &verdict {
            Verdict::Allowed => serde_json::json!({ "allowed": true }),
            Verdict::Rejected { rule, reason } => serde_json::json!({
                "allowed": false,
                "rule": rule.as_str(),
                "reason": reason,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match verdict.message() {
            None => println!("allowed"),
            Some(message) => println!("rejected: {}", message),
        }
    }
    Ok(if verdict.is_allowed() { 0 } else { EXIT_REJECTED })
}

/// `warden bg`: start, stream new output while polling, Ctrl-C kills the task.
/// With a filter nothing is streamed; the filtered result is printed at exit.
pub async fn background(
    supervisor: &Supervisor,
    options: RunOptions,
    poll: Duration,
    json: bool,
) -> Result<i32> {
    let stream = !json && options.filter.is_none();
    let task_id = supervisor.execute_background(&options.into_request()).await?;
    if !json {
        eprintln!("[started task {}]", task_id);
    }

    let mut mark = OutputMark::default();
    let mut interrupted = false;
    loop {
        // Status first: once terminal, the tail read below is complete
        let snapshot = supervisor.get_background_status(task_id, None).await?;
        debug!(task_id = %task_id, status = %snapshot.status, "Polled task");

        if stream {
            let tail = supervisor.background_output(task_id, mark).await?;
            if tail.skipped {
                eprintln!("[some output was dropped before it could be shown]");
            }
            print!("{}", tail.stdout);
            eprint!("{}", tail.stderr);
            let _ = std::io::stdout().flush();
            mark = tail.mark;
        }

        if snapshot.status.is_terminal() {
            let Some(result) = snapshot.result else {
                return Ok(1);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                if !stream {
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                }
                eprintln!(
                    "[{} task {} {} in {:.1}s, cpu {:.2}s, peak rss {}]",
                    snapshot.status.symbol(),
                    task_id,
                    snapshot.status,
                    result.duration.as_secs_f64(),
                    snapshot.metrics.cpu_time.as_secs_f64(),
                    warden_task::format_bytes(snapshot.metrics.peak_rss_bytes)
                );
            }
            return Ok(exit_code(&result));
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                let outcome = supervisor.kill_background(task_id, None).await?;
                if !json {
                    eprintln!(
                        "[interrupt: {}]",
                        outcome.reason.as_deref().unwrap_or("terminating task")
                    );
                }
            }
        }
    }
}

/// `warden session`
pub async fn session(
    supervisor: &Supervisor,
    id: Option<String>,
    commands: &[String],
    json: bool,
) -> Result<i32> {
    let session_id = supervisor.acquire_session(id.as_deref()).await?;
    if !json {
        eprintln!("[session {}]", session_id);
    }

    let mut outputs = Vec::with_capacity(commands.len());
    for command in commands {
        let output = supervisor.run_in_session(&session_id, command).await?;
        if !json {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            let _ = std::io::stdout().flush();
            if output.timed_out {
                eprintln!("[still producing output at timeout: {}]", command);
            }
        }
        outputs.push(output);
    }

    if json {
        let history = supervisor.session_history(&session_id).await?;
        let value = serde_json::json!({
            "session_id": session_id,
            "outputs": outputs,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    supervisor.close_session(&session_id).await?;
    Ok(0)
}
