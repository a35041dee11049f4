//! Shell Session Pool - persistent interactive shells
//!
//! Each session is a long-lived shell reading commands from a pipe. A command
//! is written to its stdin and considered finished once both output streams
//! have been silent for the configured window, bounded by a per-command
//! timeout. There is no exit-code boundary: completion is best effort, and a
//! command that pauses longer than the silence window is cut short.
//!
//! The pool holds at most `max_sessions` shells. When full, `acquire` evicts
//! the least recently used session that is not running a command; a periodic
//! sweep closes sessions idle for longer than the idle timeout.

use crate::buffer::SharedBuffer;
use crate::output::strip_ansi;
use crate::process::{ExitWatch, HandleId, Launched, Launcher, ProcessHandle, Readers};
use crate::state::SessionStatus;
use crate::tracker::{ProcessTracker, ResourceMetrics};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_foundation::{Error, Result, SessionConfig};

/// How long a closing shell gets to exit on EOF before it is signalled
const EOF_EXIT_WAIT: Duration = Duration::from_millis(100);

/// Allowance beyond the grace period when stopping a shell
const STOP_SLACK: Duration = Duration::from_secs(1);

/// Output of one command run in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutput {
    pub session_id: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    /// The command timeout fired before output went quiet
    pub timed_out: bool,
}

/// Entry in a session's command history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub output_bytes: u64,
    pub timed_out: bool,
}

/// Row of `list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub commands: usize,
    pub busy: bool,
    /// Sampled usage of the shell plus all output it has produced
    pub metrics: ResourceMetrics,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    history: Vec<CommandRecord>,
}

/// The shell process; locked for the duration of a command
#[derive(Debug)]
struct ShellProcess {
    handle: ProcessHandle,
    stdin: Option<ChildStdin>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    activity: watch::Receiver<u64>,
    readers: Option<Readers>,
}

#[derive(Debug)]
struct ShellSession {
    id: String,
    pid: Option<u32>,
    handle_id: HandleId,
    created_at: DateTime<Utc>,
    exit: ExitWatch,
    /// Shared with `process`, readable while a command holds it
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    /// Readable while a command holds `process`
    state: parking_lot::Mutex<SessionState>,
    process: Mutex<ShellProcess>,
}

impl ShellSession {
    fn status(&self) -> SessionStatus {
        if self.exit.has_exited() {
            return SessionStatus::Terminated;
        }
        self.state.lock().status
    }

    fn set_status(&self, status: SessionStatus) {
        self.state.lock().status = status;
    }

    fn touch(&self) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        state.last_activity_at = Utc::now();
    }

    fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    fn is_busy(&self) -> bool {
        self.process.try_lock().is_err()
    }

    fn record(&self, record: CommandRecord) {
        let mut state = self.state.lock();
        state.last_activity = Instant::now();
        state.last_activity_at = Utc::now();
        state.history.push(record);
    }

    fn metrics(&self, tracker: &ProcessTracker) -> ResourceMetrics {
        let mut metrics = tracker.metrics(self.handle_id).unwrap_or_default();
        metrics.output_bytes =
            self.stdout.lock().total_written() + self.stderr.lock().total_written();
        metrics
    }

    fn info(&self, tracker: &ProcessTracker) -> SessionInfo {
        let status = self.status();
        let metrics = self.metrics(tracker);
        let state = self.state.lock();
        SessionInfo {
            id: self.id.clone(),
            status,
            pid: self.pid,
            created_at: self.created_at,
            last_activity: state.last_activity_at,
            commands: state.history.len(),
            busy: self.is_busy(),
            metrics,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    sessions: RwLock<HashMap<String, Arc<ShellSession>>>,
    /// Serializes acquire, eviction and sweeps so the size bound holds
    acquire_lock: Mutex<()>,
    launcher: Launcher,
    config: SessionConfig,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Bounded pool of interactive shells; clones share the pool
#[derive(Debug, Clone)]
pub struct ShellSessionPool {
    inner: Arc<PoolInner>,
}

impl ShellSessionPool {
    pub fn new(launcher: Launcher, config: &SessionConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sessions: RwLock::new(HashMap::new()),
                acquire_lock: Mutex::new(()),
                launcher,
                config: config.clone(),
                sweeper: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.config.max_sessions
    }

    /// Existing ready session by id, or a new one (evicting if full)
    pub async fn acquire(&self, session_id: Option<&str>) -> Result<String> {
        self.acquire_with(session_id, None, &BTreeMap::new()).await
    }

    /// `acquire` with the working directory and environment used if a new
    /// shell has to be started
    pub async fn acquire_with(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        if matches!(session_id, Some(id) if id.trim().is_empty()) {
            return Err(Error::InvalidInput("session id cannot be empty".to_string()));
        }
        let _guard = self.inner.acquire_lock.lock().await;
        self.prune_terminated().await;

        if let Some(id) = session_id {
            let existing = self.inner.sessions.read().await.get(id).cloned();
            if let Some(session) = existing {
                let status = session.status();
                if !status.is_usable() {
                    return Err(Error::SessionNotFound(format!("{} is {}", id, status)));
                }
                session.touch();
                debug!(session_id = id, "Reusing session");
                return Ok(id.to_string());
            }
        }

        let count = self.inner.sessions.read().await.len();
        if count >= self.inner.config.max_sessions {
            self.evict_lru().await?;
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("session-{}", &Uuid::new_v4().simple().to_string()[..8]));
        let session = self.spawn(&id, working_dir, env)?;
        session.set_status(SessionStatus::Ready);
        info!(session_id = %id, pid = ?session.pid, "Session ready");

        self.inner
            .sessions
            .write()
            .await
            .insert(id.clone(), Arc::new(session));
        Ok(id)
    }

    fn spawn(
        &self,
        id: &str,
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<ShellSession> {
        let label = format!("session:{}", id);
        let Launched {
            handle,
            stdout,
            stderr,
            readers,
            stdin,
            activity,
        } = self.inner.launcher.launch_shell(working_dir, env, &label)?;

        let (stdin, activity) = match (stdin, activity) {
            (Some(stdin), Some(activity)) => (stdin, activity),
            _ => {
                self.inner.launcher.signals().terminate(&handle);
                return Err(Error::Internal(format!("{}: shell has no input pipe", label)));
            }
        };

        let now = Instant::now();
        Ok(ShellSession {
            id: id.to_string(),
            pid: handle.pid(),
            handle_id: handle.id(),
            created_at: Utc::now(),
            exit: handle.exit_watch(),
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            state: parking_lot::Mutex::new(SessionState {
                status: SessionStatus::Initializing,
                last_activity: now,
                last_activity_at: Utc::now(),
                history: Vec::new(),
            }),
            process: Mutex::new(ShellProcess {
                handle,
                stdin: Some(stdin),
                stdout,
                stderr,
                activity,
                readers: Some(readers),
            }),
        })
    }

    /// Drop sessions whose shell has already exited
    async fn prune_terminated(&self) -> Vec<String> {
        let mut sessions = self.inner.sessions.write().await;
        let dead: Vec<String> = sessions
            .values()
            .filter(|s| s.status() == SessionStatus::Terminated)
            .map(|s| s.id.clone())
            .collect();
        for id in &dead {
            sessions.remove(id);
            debug!(session_id = %id, "Removed exited session");
        }
        dead
    }

    /// Stop the least recently used idle session. Caller holds `acquire_lock`.
    async fn evict_lru(&self) -> Result<()> {
        let candidates: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        let victim = candidates
            .into_iter()
            .filter(|s| s.status().is_usable() && !s.is_busy())
            .min_by_key(|s| s.last_activity());

        let Some(victim) = victim else {
            return Err(Error::PoolExhausted(format!(
                "all {} sessions are busy",
                self.inner.config.max_sessions
            )));
        };
        let Ok(mut process) = victim.process.try_lock() else {
            return Err(Error::PoolExhausted(format!(
                "session {} became busy during eviction",
                victim.id
            )));
        };

        info!(
            session_id = %victim.id,
            idle_ms = victim.idle_for().as_millis() as u64,
            "Evicting least recently used session"
        );
        self.stop(&victim, &mut process).await.map_err(|e| {
            Error::PoolExhausted(format!("could not evict session {}: {}", victim.id, e))
        })?;
        drop(process);

        self.inner.sessions.write().await.remove(&victim.id);
        Ok(())
    }

    /// Close stdin, then signal if the shell does not leave on its own
    async fn stop(&self, session: &ShellSession, process: &mut ShellProcess) -> Result<()> {
        session.set_status(SessionStatus::Terminating);
        process.stdin.take();

        let exited = tokio::time::timeout(EOF_EXIT_WAIT, process.handle.wait())
            .await
            .is_ok();
        if !exited {
            self.inner
                .launcher
                .signals()
                .terminate_and_wait(&process.handle, STOP_SLACK)
                .await?;
        }
        if let Some(readers) = process.readers.take() {
            readers.drain(self.inner.launcher.drain_timeout()).await;
        }

        session.set_status(SessionStatus::Terminated);
        debug!(session_id = %session.id, handle = %session.handle_id, "Session terminated");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Arc<ShellSession>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Run one command line and return its output once the shell goes quiet
    pub async fn execute(&self, id: &str, command: &str) -> Result<SessionOutput> {
        let session = self.get(id).await?;
        let mut process = session.process.lock().await;

        let status = session.status();
        if !status.is_usable() {
            return Err(Error::SessionNotFound(format!("{} is {}", id, status)));
        }
        self.inner.launcher.validator().check(command)?;
        session.touch();

        let stdout_mark = process.stdout.lock().total_written();
        let stderr_mark = process.stderr.lock().total_written();
        process.activity.borrow_and_update();

        let started = Instant::now();
        let started_at = Utc::now();
        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| Error::SessionNotFound(format!("{} has no input", id)))?;
        let mut line = command.trim_end().to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let timed_out = wait_for_quiet(
            &mut process.activity,
            self.inner.config.silence_window(),
            self.inner.config.command_timeout(),
        )
        .await;
        let duration = started.elapsed();

        let (stdout, stdout_truncated) = process.stdout.lock().read_since(stdout_mark);
        let (stderr, stderr_truncated) = process.stderr.lock().read_since(stderr_mark);
        let output_bytes = (stdout.len() + stderr.len()) as u64;

        session.record(CommandRecord {
            command: command.to_string(),
            started_at,
            duration,
            output_bytes,
            timed_out,
        });
        if timed_out {
            warn!(session_id = id, command, "Session command still producing output at timeout");
        } else {
            debug!(session_id = id, output_bytes, "Session command finished");
        }

        Ok(SessionOutput {
            session_id: id.to_string(),
            command: command.to_string(),
            stdout: strip_ansi(&String::from_utf8_lossy(&stdout)),
            stderr: strip_ansi(&String::from_utf8_lossy(&stderr)),
            stdout_truncated,
            stderr_truncated,
            duration,
            timed_out,
        })
    }

    /// Terminate a session and drop it from the pool
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self.get(id).await?;
        let mut process = session.process.lock().await;
        // A failed stop leaves the entry for the sweeper to reap
        self.stop(&session, &mut process).await?;
        drop(process);

        self.inner.sessions.write().await.remove(id);
        info!(session_id = id, "Session closed");
        Ok(())
    }

    /// Sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let tracker = self.inner.launcher.tracker();
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info(tracker))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Resource usage of one session's shell
    pub async fn metrics(&self, id: &str) -> Result<ResourceMetrics> {
        let session = self.get(id).await?;
        Ok(session.metrics(self.inner.launcher.tracker()))
    }

    pub async fn history(&self, id: &str) -> Result<Vec<CommandRecord>> {
        let session = self.get(id).await?;
        let history = session.state.lock().history.clone();
        Ok(history)
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close sessions idle past the timeout and drop exited ones.
    /// Returns the ids removed.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let _guard = self.inner.acquire_lock.lock().await;
        let mut removed = self.prune_terminated().await;

        let idle_timeout = self.inner.config.idle_timeout();
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        for session in sessions {
            if !session.status().is_usable() || session.idle_for() < idle_timeout {
                continue;
            }
            let Ok(mut process) = session.process.try_lock() else {
                continue;
            };

            info!(
                session_id = %session.id,
                idle_ms = session.idle_for().as_millis() as u64,
                "Closing idle session"
            );
            match self.stop(&session, &mut process).await {
                Ok(()) => {
                    drop(process);
                    self.inner.sessions.write().await.remove(&session.id);
                    removed.push(session.id.clone());
                }
                Err(e) => warn!(session_id = %session.id, error = %e, "Idle session did not stop"),
            }
        }
        removed
    }

    /// Run `sweep_idle` periodically (idempotent). Needs a Tokio runtime.
    pub fn start_idle_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let removed = ShellSessionPool { inner }.sweep_idle().await;
                if !removed.is_empty() {
                    debug!(count = removed.len(), "Idle sweep removed sessions");
                }
            }
        }));
    }

    pub fn stop_idle_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Stop the sweeper and terminate every session
    pub async fn shutdown(&self) {
        self.stop_idle_sweeper();
        let _guard = self.inner.acquire_lock.lock().await;
        let sessions: Vec<_> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        if sessions.is_empty() {
            return;
        }

        info!(count = sessions.len(), "Closing sessions");
        let closing = sessions.iter().map(|session| async move {
            let mut process = session.process.lock().await;
            if let Err(e) = self.stop(session, &mut process).await {
                warn!(session_id = %session.id, error = %e, "Session did not stop");
            }
        });
        join_all(closing).await;
    }
}

/// Wait until no chunk has arrived for `silence`, or `limit` has passed.
/// Returns true when the limit was hit first.
async fn wait_for_quiet(
    activity: &mut watch::Receiver<u64>,
    silence: Duration,
    limit: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let window_end = (tokio::time::Instant::now() + silence).min(deadline);
        match tokio::time::timeout_at(window_end, activity.changed()).await {
            Ok(Ok(())) => {
                activity.borrow_and_update();
                if tokio::time::Instant::now() >= deadline {
                    return true;
                }
            }
            // Both streams closed: the shell is gone
            Ok(Err(_)) => return false,
            Err(_) => return tokio::time::Instant::now() >= deadline,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tracker::ProcessTracker;
    use warden_foundation::SupervisorConfig;

    fn pool_with(configure: impl FnOnce(&mut SupervisorConfig)) -> ShellSessionPool {
        let mut config = SupervisorConfig::default();
        config.execution.grace_period_ms = 500;
        configure(&mut config);
        let launcher = Launcher::new(&config, ProcessTracker::new(&config.tracker)).unwrap();
        ShellSessionPool::new(launcher, &config.sessions)
    }

    fn pool() -> ShellSessionPool {
        pool_with(|_| {})
    }

    #[tokio::test]
    async fn test_state_persists_between_commands() {
        let pool = pool();
        let id = pool.acquire(None).await.unwrap();
        assert!(id.starts_with("session-"));

        let out = pool.execute(&id, "echo hello").await.unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert!(!out.timed_out);

        pool.execute(&id, "cd /tmp && export WARDEN_SESSION_VAR=kept")
            .await
            .unwrap();
        let out = pool
            .execute(&id, "pwd; echo $WARDEN_SESSION_VAR")
            .await
            .unwrap();
        assert_eq!(out.stdout, "/tmp\nkept\n");

        let history = pool.history(&id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].command, "echo hello");
        assert_eq!(history[0].output_bytes, 6);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_metrics() {
        let pool = pool();
        let id = pool.acquire(Some("metered")).await.unwrap();
        pool.execute(&id, "echo hello; echo oops >&2").await.unwrap();

        pool.inner.launcher.tracker().sample_once();
        let metrics = pool.metrics(&id).await.unwrap();
        assert_eq!(metrics.output_bytes, 11);
        assert_eq!(metrics.samples, 1);
        assert!(metrics.peak_rss_bytes > 0);

        let info = &pool.list().await[0];
        assert_eq!(info.metrics.output_bytes, 11);
        assert_eq!(info.metrics.samples, 1);
        assert!(matches!(
            pool.metrics("missing").await,
            Err(Error::SessionNotFound(_))
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_output_is_isolated_per_command() {
        let pool = pool();
        let id = pool.acquire(Some("build")).await.unwrap();
        assert_eq!(id, "build");

        pool.execute(&id, "echo first").await.unwrap();
        let out = pool.execute(&id, "echo second >&2").await.unwrap();
        assert_eq!(out.stdout, "");
        assert_eq!(out.stderr, "second\n");

        // Same id returns the same session
        assert_eq!(pool.acquire(Some("build")).await.unwrap(), "build");
        assert_eq!(pool.len().await, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_ansi_is_stripped() {
        let pool = pool();
        let id = pool.acquire(None).await.unwrap();
        let out = pool
            .execute(&id, "printf '\\033[31mred\\033[0m\\n'")
            .await
            .unwrap();
        assert_eq!(out.stdout, "red\n");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_capacity() {
        let pool = pool_with(|c| c.sessions.max_sessions = 2);
        let a = pool.acquire(Some("a")).await.unwrap();
        pool.acquire(Some("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.execute(&a, "true").await.unwrap();

        pool.acquire(Some("c")).await.unwrap();
        let ids: Vec<String> = pool.list().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"c".to_string()));

        assert!(matches!(
            pool.execute("b", "echo gone").await,
            Err(Error::SessionNotFound(_))
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_sessions_are_not_evicted() {
        let pool = pool_with(|c| c.sessions.max_sessions = 1);
        let id = pool.acquire(None).await.unwrap();

        let worker = pool.clone();
        let busy_id = id.clone();
        let running = tokio::spawn(async move {
            worker
                .execute(&busy_id, "for i in 1 2 3 4 5 6 7 8; do echo $i; sleep 0.1; done")
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(matches!(
            pool.acquire(None).await,
            Err(Error::PoolExhausted(_))
        ));
        assert_eq!(pool.len().await, 1);

        let out = running.await.unwrap().unwrap();
        assert!(out.stdout.ends_with("8\n"), "{:?}", out.stdout);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_sweep() {
        let pool = pool_with(|c| c.sessions.idle_timeout_ms = 100);
        let id = pool.acquire(None).await.unwrap();

        assert!(pool.sweep_idle().await.is_empty());
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(pool.sweep_idle().await, vec![id.clone()]);
        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.execute(&id, "echo x").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let pool = pool_with(|c| {
            c.sessions.idle_timeout_ms = 100;
            c.sessions.sweep_interval_ms = 50;
        });
        pool.acquire(None).await.unwrap();
        pool.start_idle_sweeper();

        for _ in 0..60 {
            if pool.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(pool.is_empty().await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_session() {
        let pool = pool();
        let id = pool.acquire(None).await.unwrap();
        pool.close(&id).await.unwrap();

        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.close(&id).await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            pool.execute("missing", "echo x").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_command_timeout_keeps_session() {
        let pool = pool_with(|c| c.sessions.command_timeout_ms = 500);
        let id = pool.acquire(None).await.unwrap();

        let out = pool
            .execute(
                &id,
                "i=0; while [ $i -lt 15 ]; do echo $i; i=$((i+1)); sleep 0.1; done",
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(pool.history(&id).await.unwrap()[0].timed_out);

        let info = &pool.list().await[0];
        assert_eq!(info.status, SessionStatus::Ready);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_command_keeps_session() {
        let pool = pool();
        let id = pool.acquire(None).await.unwrap();

        assert!(matches!(
            pool.execute(&id, "reboot").await,
            Err(Error::ValidationRejected { .. })
        ));
        assert_eq!(pool.execute(&id, "echo ok").await.unwrap().stdout, "ok\n");
        assert!(pool.history(&id).await.unwrap().len() == 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_shell_is_replaced() {
        let pool = pool();
        let id = pool.acquire(Some("short")).await.unwrap();
        pool.execute(&id, "exit 0").await.unwrap();

        for _ in 0..40 {
            if pool.list().await[0].status == SessionStatus::Terminated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(pool.acquire(Some("short")).await.unwrap(), "short");
        assert_eq!(pool.execute("short", "echo back").await.unwrap().stdout, "back\n");
        pool.shutdown().await;
    }
}
