//! Process spawning and handles
//!
//! `Launcher` is the single spawn path used by the foreground executor, the
//! background manager and the session pool. It runs the validator, checks
//! the working directory, merges the environment, applies the resource
//! policy, starts one reader task per stream and hands the child to a
//! supervising task (see `signal::supervise`). Callers get back an exclusive
//! `ProcessHandle` plus the two output buffers.

use crate::buffer::{CircularBuffer, SharedBuffer};
use crate::limits::{ResourceLimiter, ResourcePolicy};
use crate::request::ExecutionRequest;
use crate::signal::{supervise, Control, ExitReport, SignalManager, SuperviseOptions};
use crate::tracker::ProcessTracker;
use crate::validator::{leading_program, leading_word, CommandValidator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_foundation::{Error, Result, ShellConfig, SupervisorConfig};

const READ_CHUNK: usize = 8 * 1024;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifier of a process handle, unique for the supervisor's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Exclusive handle to one spawned process. Not `Clone`: exactly one owner.
#[derive(Debug)]
pub struct ProcessHandle {
    id: HandleId,
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
    exit: watch::Receiver<Option<ExitReport>>,
    started_at: Instant,
}

impl ProcessHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exited and reaped
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the exit report
    pub async fn wait(&self) -> ExitReport {
        wait_exit(self.exit.clone(), self.started_at).await
    }

    pub(crate) fn send_control(&self, request: Control) -> bool {
        self.control.send(request).is_ok()
    }

    /// Exit notifications without borrowing the handle
    pub(crate) fn exit_watch(&self) -> ExitWatch {
        ExitWatch {
            rx: self.exit.clone(),
            started_at: self.started_at,
        }
    }
}

/// Detached view of a handle's exit
#[derive(Debug, Clone)]
pub(crate) struct ExitWatch {
    rx: watch::Receiver<Option<ExitReport>>,
    started_at: Instant,
}

impl ExitWatch {
    pub fn has_exited(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn wait(self) -> ExitReport {
        wait_exit(self.rx, self.started_at).await
    }
}

async fn wait_exit(
    mut rx: watch::Receiver<Option<ExitReport>>,
    started_at: Instant,
) -> ExitReport {
    let report = rx.wait_for(|report| report.is_some()).await.map(|r| r.clone());
    match report {
        Ok(Some(report)) => report,
        _ => ExitReport::lost(started_at.elapsed()),
    }
}

/// Reader tasks for stdout and stderr
#[derive(Debug)]
pub(crate) struct Readers {
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl Readers {
    /// Wait for both streams to hit EOF, aborting them after `timeout`.
    /// Grandchildren that inherited the pipes can keep them open forever.
    pub async fn drain(self, timeout: Duration) {
        let stdout_abort = self.stdout.abort_handle();
        let stderr_abort = self.stderr.abort_handle();
        let both = async {
            let _ = self.stdout.await;
            let _ = self.stderr.await;
        };
        if tokio::time::timeout(timeout, both).await.is_err() {
            debug!("Output drain timed out");
            stdout_abort.abort();
            stderr_abort.abort();
        }
    }

    pub fn abort(&self) {
        self.stdout.abort();
        self.stderr.abort();
    }
}

/// Copy a stream into a buffer chunk by chunk, bumping `activity` per chunk
fn spawn_reader<R>(
    mut stream: R,
    buffer: SharedBuffer,
    activity: Option<Arc<watch::Sender<u64>>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.lock().write(&chunk[..n]);
                    if let Some(activity) = &activity {
                        activity.send_modify(|count| *count = count.wrapping_add(1));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// A freshly spawned process
#[derive(Debug)]
pub(crate) struct Launched {
    pub handle: ProcessHandle,
    pub stdout: SharedBuffer,
    pub stderr: SharedBuffer,
    pub readers: Readers,
    /// Only for interactive shells
    pub stdin: Option<ChildStdin>,
    /// Bumped on every chunk from either stream; only for interactive shells
    pub activity: Option<watch::Receiver<u64>>,
}

/// Spawn path shared by every execution mode
#[derive(Debug, Clone)]
pub struct Launcher {
    validator: Arc<CommandValidator>,
    limiter: ResourceLimiter,
    signals: SignalManager,
    tracker: ProcessTracker,
    shell: ShellConfig,
    buffer_capacity: usize,
    drain_timeout: Duration,
}

impl Launcher {
    pub fn new(config: &SupervisorConfig, tracker: ProcessTracker) -> Result<Self> {
        Ok(Self {
            validator: Arc::new(CommandValidator::with_config(&config.security)?),
            limiter: ResourceLimiter::new(ResourcePolicy::from_config(&config.limits)?),
            signals: SignalManager::new(config.execution.grace_period()),
            tracker,
            shell: config.shell.clone(),
            buffer_capacity: config.output.max_buffer_bytes,
            drain_timeout: config.execution.drain_timeout(),
        })
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn signals(&self) -> &SignalManager {
        &self.signals
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    pub fn limiter(&self) -> &ResourceLimiter {
        &self.limiter
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Validate and spawn `request.command` under the one-shot shell
    pub(crate) fn launch(
        &self,
        request: &ExecutionRequest,
        timeout: Option<Duration>,
        label: &str,
    ) -> Result<Launched> {
        self.validator.check(&request.command)?;
        preflight(&request.command, request.working_dir.as_deref(), &request.env)?;

        let mut command = Command::new(&self.shell.program);
        command.arg(&self.shell.command_flag).arg(&request.command);
        self.prepare(&mut command, request.working_dir.as_deref(), &request.env)?;
        command.stdin(Stdio::null());

        info!(label, command = %request.command, ?timeout, "Spawning process");
        self.start(command, timeout, false, label)
    }

    /// Spawn a persistent interactive shell with piped stdin
    pub(crate) fn launch_shell(
        &self,
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
        label: &str,
    ) -> Result<Launched> {
        let mut command = Command::new(&self.shell.session_program);
        command.args(&self.shell.session_args);
        self.prepare(&mut command, working_dir, env)?;
        command.stdin(Stdio::piped());

        info!(label, shell = %self.shell.session_program, "Spawning shell");
        self.start(command, None, true, label)
    }

    fn prepare(
        &self,
        command: &mut Command,
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        if let Some(dir) = working_dir {
            if !dir.is_dir() {
                return Err(Error::SpawnFailed(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
            command.current_dir(dir);
        }

        // Inherit the supervisor's environment, then apply overrides
        command.envs(std::env::vars_os());
        command.envs(env);

        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.limiter.apply_policy(command);
        Ok(())
    }

    fn start(
        &self,
        mut command: Command,
        timeout: Option<Duration>,
        interactive: bool,
        label: &str,
    ) -> Result<Launched> {
        let started_at = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {}", label, e)))?;
        let pid = child.id();
        let id = HandleId::next();

        let stdout = CircularBuffer::shared(self.buffer_capacity);
        let stderr = CircularBuffer::shared(self.buffer_capacity);
        let (activity_tx, activity_rx) = if interactive {
            let (tx, rx) = watch::channel(0u64);
            (Some(Arc::new(tx)), Some(rx))
        } else {
            (None, None)
        };

        let readers = Readers {
            stdout: match child.stdout.take() {
                Some(stream) => spawn_reader(stream, stdout.clone(), activity_tx.clone()),
                None => tokio::spawn(async {}),
            },
            stderr: match child.stderr.take() {
                Some(stream) => spawn_reader(stream, stderr.clone(), activity_tx),
                None => tokio::spawn(async {}),
            },
        };
        let stdin = child.stdin.take();

        if let Some(pid) = pid {
            self.tracker.register(id, pid, label);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let options = SuperviseOptions {
            timeout,
            grace: self.signals.grace_period(),
            memory_capped: self.limiter.caps_memory(),
        };
        let tracker = self.tracker.clone();

        tokio::spawn(async move {
            let report = supervise(child, control_rx, options, started_at).await;
            debug!(
                handle = %id,
                ?pid,
                exit_code = ?report.exit_code,
                signal = ?report.signal,
                killed = report.killed,
                "Process exited"
            );
            if report.limit_exceeded {
                warn!(handle = %id, ?pid, error = ?report.error, "Resource limit exceeded");
            }
            tracker.retire(id);
            let _ = exit_tx.send(Some(report));
        });

        Ok(Launched {
            handle: ProcessHandle {
                id,
                pid,
                control: control_tx,
                exit: exit_rx,
                started_at,
            },
            stdout,
            stderr,
            readers,
            stdin,
            activity: activity_rx,
        })
    }
}

/// Builtins and reserved words the shell resolves without a PATH lookup
const SHELL_BUILTINS: &[&str] = &[
    "!", ".", ":", "[", "[[", "{", "}", "((", "alias", "bg", "break", "builtin", "case", "cd",
    "command", "continue", "declare", "do", "done", "echo", "elif", "else", "esac", "eval",
    "exec", "exit", "export", "false", "fg", "fi", "for", "function", "getopts", "hash", "if",
    "in", "jobs", "kill", "let", "local", "printf", "pwd", "read", "readonly", "return",
    "select", "set", "shift", "source", "test", "then", "time", "times", "trap", "true",
    "type", "typeset", "ulimit", "umask", "unalias", "unset", "until", "wait", "while",
];

/// Catch a missing or non-executable leading program before handing the
/// line to the shell. Path-qualified programs are checked on disk, bare
/// names are looked up on the effective `PATH`. Builtins, keywords and
/// words the shell still has to expand are left alone.
fn preflight(
    command: &str,
    working_dir: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    match leading_word(command) {
        Some(word) if SHELL_BUILTINS.contains(&word) => return Ok(()),
        None => return Ok(()),
        _ => {}
    }
    let Some(program) = leading_program(command) else {
        return Ok(());
    };
    if SHELL_BUILTINS.contains(&program) || program.contains(&['$', '`', '*', '?', '~', '<', '>'][..]) {
        return Ok(());
    }

    let cwd = match working_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };

    if !program.contains('/') {
        let search = env
            .get("PATH")
            .map(std::ffi::OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        let resolved = which::which_in(program, search, &cwd)
            .map_err(|_| Error::SpawnFailed(format!("{}: command not found", program)))?;
        debug!(program, path = %resolved.display(), "Resolved program");
        return Ok(());
    }

    let path = if Path::new(program).is_absolute() {
        PathBuf::from(program)
    } else {
        cwd.join(program)
    };

    let metadata = std::fs::metadata(&path)
        .map_err(|e| Error::SpawnFailed(format!("{}: {}", program, e)))?;
    if metadata.is_dir() {
        return Err(Error::SpawnFailed(format!("{}: is a directory", program)));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(Error::SpawnFailed(format!("{}: permission denied", program)));
        }
    }
    Ok(())
}
