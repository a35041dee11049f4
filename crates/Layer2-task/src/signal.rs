//! Signal Manager - graceful termination with forceful escalation
//!
//! Every spawned process is owned by one supervising task that both reaps
//! the child and sends it signals. Termination requests reach that task over
//! a channel, so the grace timer and the exit event are handled by the same
//! `select!` loop: once the child is reaped the loop is gone and no signal
//! can reach a recycled pid.

use crate::process::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use warden_foundation::{Error, Result};

/// Signals a caller may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Term,
    Int,
    Hup,
    Quit,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Int => "SIGINT",
            Signal::Hup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
        }
    }

    /// KILL cannot be caught, so it skips the grace window
    pub fn is_forceful(&self) -> bool {
        matches!(self, Signal::Kill)
    }

    #[cfg(unix)]
    pub fn as_raw(&self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Int => libc::SIGINT,
            Signal::Hup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Ok(Signal::Term),
            "INT" => Ok(Signal::Int),
            "HUP" => Ok(Signal::Hup),
            "QUIT" => Ok(Signal::Quit),
            "KILL" => Ok(Signal::Kill),
            _ => Err(Error::InvalidInput(format!("unsupported signal: {}", s))),
        }
    }
}

/// Name of a raw signal number, for reports
pub fn signal_name(raw: i32) -> String {
    #[cfg(unix)]
    {
        let name = match raw {
            libc::SIGHUP => "SIGHUP",
            libc::SIGINT => "SIGINT",
            libc::SIGQUIT => "SIGQUIT",
            libc::SIGABRT => "SIGABRT",
            libc::SIGKILL => "SIGKILL",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGPIPE => "SIGPIPE",
            libc::SIGTERM => "SIGTERM",
            libc::SIGXCPU => "SIGXCPU",
            libc::SIGXFSZ => "SIGXFSZ",
            _ => return format!("signal {}", raw),
        };
        name.to_string()
    }
    #[cfg(not(unix))]
    {
        format!("signal {}", raw)
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReport {
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Raw terminating signal
    pub signal: Option<i32>,
    /// Termination was initiated by the supervisor before the process exited
    pub killed: bool,
    /// ...and that initiation came from the timeout
    pub timed_out: bool,
    pub duration: Duration,
    pub error: Option<String>,
    /// Exit attributed to an OS resource limit
    pub limit_exceeded: bool,
}

impl ExitReport {
    /// Report for a process whose supervising task vanished
    pub(crate) fn lost(duration: Duration) -> Self {
        Self {
            exit_code: Some(-1),
            signal: None,
            killed: false,
            timed_out: false,
            duration,
            error: Some("process supervisor ended without an exit status".to_string()),
            limit_exceeded: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn signal_name(&self) -> Option<String> {
        self.signal.map(signal_name)
    }
}

/// Requests sent to the supervising task
#[derive(Debug)]
pub(crate) enum Control {
    Terminate { signal: Signal, grace: Duration },
}

/// Whether a terminate request reached a live process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Signalled,
    AlreadyExited,
}

/// Termination protocol shared by foreground timeouts, background kills and
/// session shutdown
#[derive(Debug, Clone)]
pub struct SignalManager {
    grace_period: Duration,
}

impl SignalManager {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// SIGTERM now, SIGKILL after the grace period. Idempotent; a no-op once
    /// the process has exited.
    pub fn terminate(&self, handle: &ProcessHandle) -> TerminateOutcome {
        self.terminate_with(handle, Signal::Term)
    }

    /// Like `terminate` with a caller-chosen first signal
    pub fn terminate_with(&self, handle: &ProcessHandle, signal: Signal) -> TerminateOutcome {
        self.terminate_within(handle, signal, self.grace_period)
    }

    /// Like `terminate_with` with a caller-chosen grace period. Only the
    /// first request for a process arms the escalation timer.
    pub fn terminate_within(
        &self,
        handle: &ProcessHandle,
        signal: Signal,
        grace: Duration,
    ) -> TerminateOutcome {
        if handle.has_exited() {
            return TerminateOutcome::AlreadyExited;
        }
        let request = Control::Terminate { signal, grace };
        if handle.send_control(request) {
            debug!(pid = ?handle.pid(), %signal, "Termination requested");
            TerminateOutcome::Signalled
        } else {
            TerminateOutcome::AlreadyExited
        }
    }

    /// Terminate and wait for the exit, allowing `slack` beyond the grace period
    pub async fn terminate_and_wait(
        &self,
        handle: &ProcessHandle,
        slack: Duration,
    ) -> Result<ExitReport> {
        self.terminate(handle);
        tokio::time::timeout(self.grace_period + slack, handle.wait())
            .await
            .map_err(|_| {
                Error::TimedOut(format!(
                    "process {:?} did not exit within {:?}",
                    handle.pid(),
                    self.grace_period + slack
                ))
            })
    }
}

/// Options for one supervised process
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuperviseOptions {
    pub timeout: Option<Duration>,
    pub grace: Duration,
    /// A memory cap is in force, so an unexplained SIGKILL is attributed to it
    pub memory_capped: bool,
}

/// Own `child` until it exits: deliver termination requests, enforce the
/// timeout, escalate to SIGKILL once per process.
pub(crate) async fn supervise(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Control>,
    options: SuperviseOptions,
    started: Instant,
) -> ExitReport {
    let pid = child.id();
    let deadline = options.timeout.map(|t| started + t);
    let mut escalation: Option<Instant> = None;
    let mut killed = false;
    let mut timed_out = false;
    let mut forced = false;
    let mut control_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,

            request = control.recv(), if control_open => match request {
                Some(Control::Terminate { signal, grace }) => {
                    if forced {
                        continue;
                    }
                    killed = true;
                    if signal.is_forceful() {
                        forced = true;
                        deliver(&mut child, pid, Signal::Kill);
                    } else if escalation.is_none() {
                        deliver(&mut child, pid, signal);
                        escalation = Some(Instant::now() + grace);
                    }
                }
                None => control_open = false,
            },

            _ = sleep_until_opt(deadline), if !killed => {
                info!(?pid, "Timeout reached, terminating");
                killed = true;
                timed_out = true;
                deliver(&mut child, pid, Signal::Term);
                escalation = Some(Instant::now() + options.grace);
            }

            _ = sleep_until_opt(escalation), if !forced => {
                warn!(?pid, "Grace period elapsed, sending SIGKILL");
                forced = true;
                deliver(&mut child, pid, Signal::Kill);
            }
        }
    };

    let duration = started.elapsed();
    match status {
        Ok(status) => build_report(status, killed, timed_out, forced, duration, options),
        Err(e) => ExitReport {
            exit_code: Some(-1),
            signal: None,
            killed,
            timed_out,
            duration,
            error: Some(format!("failed to wait for process: {}", e)),
            limit_exceeded: false,
        },
    }
}

async fn sleep_until_opt(when: Option<Instant>) {
    match when {
        Some(when) => sleep_until(when).await,
        None => std::future::pending().await,
    }
}

fn deliver(child: &mut Child, pid: Option<u32>, signal: Signal) {
    #[cfg(unix)]
    {
        let _ = child;
        if let Some(pid) = pid {
            if let Err(e) = send_signal(pid, signal) {
                warn!(pid, %signal, error = %e, "Signal delivery failed");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        if let Err(e) = child.start_kill() {
            warn!(?pid, error = %e, "Kill failed");
        }
    }
}

/// Signal the process group led by `pid`, falling back to the process itself
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: plain syscalls on a pid this process still owns (not yet reaped)
    if unsafe { libc::killpg(pid, signal.as_raw()) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal.as_raw()) } == 0 {
        return Ok(());
    }
    Err(Error::KillFailed(format!(
        "{} to {}: {}",
        signal,
        pid,
        std::io::Error::last_os_error()
    )))
}

fn build_report(
    status: ExitStatus,
    killed: bool,
    timed_out: bool,
    forced: bool,
    duration: Duration,
    options: SuperviseOptions,
) -> ExitReport {
    let exit_code = status.code();
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let limit = signal.and_then(|raw| limit_violation(raw, forced, options.memory_capped));
    let error = limit
        .as_ref()
        .map(|what| Error::ResourceLimitExceeded(what.clone()).to_string());

    ExitReport {
        exit_code,
        signal,
        killed,
        timed_out,
        duration,
        error,
        limit_exceeded: limit.is_some(),
    }
}

/// Which OS limit a terminating signal points to
fn limit_violation(raw: i32, forced: bool, memory_capped: bool) -> Option<String> {
    #[cfg(unix)]
    {
        match raw {
            libc::SIGXCPU => Some("CPU time limit reached (SIGXCPU)".to_string()),
            libc::SIGXFSZ => Some("file size limit reached (SIGXFSZ)".to_string()),
            libc::SIGKILL if !forced && memory_capped => {
                Some("killed by SIGKILL while a memory limit was set".to_string())
            }
            _ => None,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (raw, forced, memory_capped);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parse() {
        assert_eq!("TERM".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("sigkill".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!(" Hup ".parse::<Signal>().unwrap(), Signal::Hup);
        assert!(matches!(
            "USR1".parse::<Signal>(),
            Err(Error::InvalidInput(_))
        ));
        assert!(Signal::Kill.is_forceful());
        assert!(!Signal::Int.is_forceful());
    }

    #[cfg(unix)]
    mod termination {
        use super::*;
        use crate::process::{Launched, Launcher};
        use crate::request::ExecutionRequest;
        use crate::tracker::ProcessTracker;
        use warden_foundation::SupervisorConfig;

        fn launch(command: &str) -> Launched {
            let config = SupervisorConfig::default();
            let launcher = Launcher::new(&config, ProcessTracker::new(&config.tracker)).unwrap();
            launcher
                .launch(&ExecutionRequest::new(command), None, "test")
                .unwrap()
        }

        async fn wait_for_output(launched: &Launched, needle: &str) {
            for _ in 0..200 {
                if launched.stdout.lock().read_string().contains(needle) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("no {:?} in output", needle);
        }

        #[tokio::test]
        async fn test_repeated_terminate_escalates_once() {
            let launched = launch("trap '' TERM; echo ready; sleep 10");
            wait_for_output(&launched, "ready").await;

            let signals = SignalManager::new(Duration::from_secs(30));
            let grace = Duration::from_millis(200);
            let first = signals.terminate_within(&launched.handle, Signal::Term, grace);
            let second = signals.terminate_within(&launched.handle, Signal::Term, grace);
            assert_eq!(first, TerminateOutcome::Signalled);
            assert_eq!(second, TerminateOutcome::Signalled);

            let report = tokio::time::timeout(Duration::from_secs(5), launched.handle.wait())
                .await
                .expect("escalation never fired");
            assert!(report.killed);
            assert!(!report.timed_out);
            assert_eq!(report.signal, Some(libc::SIGKILL));
            assert!(report.duration >= grace, "{:?}", report.duration);
            assert!(!report.limit_exceeded);

            assert_eq!(
                signals.terminate(&launched.handle),
                TerminateOutcome::AlreadyExited
            );
            assert_eq!(
                signals.terminate_with(&launched.handle, Signal::Kill),
                TerminateOutcome::AlreadyExited
            );
        }

        #[tokio::test]
        async fn test_terminate_after_natural_exit() {
            let launched = launch("exit 0");
            let report = launched.handle.wait().await;
            assert_eq!(report.exit_code, Some(0));

            let signals = SignalManager::new(Duration::from_millis(100));
            assert_eq!(
                signals.terminate(&launched.handle),
                TerminateOutcome::AlreadyExited
            );
            assert_eq!(
                signals.terminate(&launched.handle),
                TerminateOutcome::AlreadyExited
            );
        }

        #[tokio::test]
        async fn test_honored_term_cancels_escalation() {
            let launched = launch("sleep 10");
            let signals = SignalManager::new(Duration::from_secs(5));

            assert_eq!(signals.terminate(&launched.handle), TerminateOutcome::Signalled);
            let report = tokio::time::timeout(Duration::from_secs(2), launched.handle.wait())
                .await
                .expect("TERM was not honored");

            assert_eq!(report.signal, Some(libc::SIGTERM));
            assert_eq!(report.signal_name().as_deref(), Some("SIGTERM"));
            assert!(report.killed);
            assert!(report.duration < Duration::from_secs(5));
            assert_eq!(
                signals.terminate(&launched.handle),
                TerminateOutcome::AlreadyExited
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_limit_violation() {
        assert!(limit_violation(libc::SIGXCPU, false, false).is_some());
        assert!(limit_violation(libc::SIGXFSZ, true, false).is_some());
        assert!(limit_violation(libc::SIGKILL, false, true).is_some());
        // Our own escalation is not a limit breach
        assert!(limit_violation(libc::SIGKILL, true, true).is_none());
        assert!(limit_violation(libc::SIGTERM, false, true).is_none());
        assert_eq!(signal_name(libc::SIGXCPU), "SIGXCPU");
    }
}
