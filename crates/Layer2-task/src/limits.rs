//! Resource Limiter - OS-level ceilings applied at spawn time
//!
//! Limits are installed with `setrlimit` in the child between fork and exec,
//! so a breach is enforced by the kernel (SIGXCPU, SIGXFSZ, failed
//! allocations) rather than by polling. Output size is capped separately by
//! the per-stream ring buffers.
//!
//! Every child also becomes the leader of a new process group so that
//! signals reach the whole tree started by `sh -c`.

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;
#[cfg(not(unix))]
use tracing::warn;
use warden_foundation::{ResourceLimitConfig, Result};

/// Limits applied to every spawned process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    pub cpu_time_secs: Option<u64>,
    pub virtual_memory_bytes: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
    pub max_processes: Option<u64>,
}

impl ResourcePolicy {
    /// No limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Tight limits for untrusted commands
    pub fn strict() -> Self {
        Self {
            cpu_time_secs: Some(120),
            virtual_memory_bytes: Some(2 * 1024 * 1024 * 1024), // 2GB
            max_file_size_bytes: Some(512 * 1024 * 1024),       // 512MB
            max_processes: Some(256),
        }
    }

    pub fn from_config(config: &ResourceLimitConfig) -> Result<Self> {
        Ok(Self {
            cpu_time_secs: config.cpu_time_secs,
            virtual_memory_bytes: config.virtual_memory_bytes()?,
            max_file_size_bytes: config.max_file_size_bytes()?,
            max_processes: config.max_processes,
        })
    }

    pub fn with_cpu_time(mut self, secs: u64) -> Self {
        self.cpu_time_secs = Some(secs);
        self
    }

    pub fn with_virtual_memory(mut self, bytes: u64) -> Self {
        self.virtual_memory_bytes = Some(bytes);
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = Some(bytes);
        self
    }

    pub fn with_max_processes(mut self, count: u64) -> Self {
        self.max_processes = Some(count);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.cpu_time_secs.is_none()
            && self.virtual_memory_bytes.is_none()
            && self.max_file_size_bytes.is_none()
            && self.max_processes.is_none()
    }

    /// One-line description for logs
    pub fn describe(&self) -> String {
        if self.is_unlimited() {
            return "unlimited".to_string();
        }
        let mut parts = Vec::new();
        if let Some(secs) = self.cpu_time_secs {
            parts.push(format!("cpu={}s", secs));
        }
        if let Some(bytes) = self.virtual_memory_bytes {
            parts.push(format!("vmem={}", format_bytes(bytes)));
        }
        if let Some(bytes) = self.max_file_size_bytes {
            parts.push(format!("fsize={}", format_bytes(bytes)));
        }
        if let Some(count) = self.max_processes {
            parts.push(format!("nproc={}", count));
        }
        parts.join(" ")
    }
}

/// Applies a `ResourcePolicy` to commands before spawn
#[derive(Debug, Clone, Default)]
pub struct ResourceLimiter {
    policy: ResourcePolicy,
}

impl ResourceLimiter {
    pub fn new(policy: ResourcePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    /// A memory cap is set; used to attribute an unexplained SIGKILL
    pub fn caps_memory(&self) -> bool {
        self.policy.virtual_memory_bytes.is_some()
    }

    /// Install process-group and rlimit setup on `command`
    #[cfg(unix)]
    pub fn apply_policy(&self, command: &mut Command) {
        command.process_group(0);

        let limits = self.rlimits();
        if limits.is_empty() {
            return;
        }
        debug!(policy = %self.policy.describe(), "Applying resource limits");

        // SAFETY: the closure only calls getrlimit/setrlimit, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            command.pre_exec(move || {
                for &(limit, value) in limits.iter() {
                    set_rlimit(limit, value)?;
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply_policy(&self, _command: &mut Command) {
        if !self.policy.is_unlimited() {
            warn!(policy = %self.policy.describe(), "Resource limits are not supported on this platform");
        }
    }

    #[cfg(unix)]
    fn rlimits(&self) -> Vec<(Limit, u64)> {
        let p = &self.policy;
        [
            (Limit::CpuTime, p.cpu_time_secs),
            (Limit::AddressSpace, p.virtual_memory_bytes),
            (Limit::FileSize, p.max_file_size_bytes),
            (Limit::Processes, p.max_processes),
        ]
        .into_iter()
        .filter_map(|(limit, value)| value.map(|v| (limit, v)))
        .collect()
    }
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
enum Limit {
    CpuTime,
    AddressSpace,
    FileSize,
    Processes,
}

/// Lower one limit, never above the inherited hard limit. The CPU hard limit
/// sits one second past the soft one so SIGXCPU arrives before SIGKILL.
#[cfg(unix)]
fn set_rlimit(limit: Limit, value: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    macro_rules! with_resource {
        ($call:ident, $arg:expr) => {
            match limit {
                Limit::CpuTime => libc::$call(libc::RLIMIT_CPU, $arg),
                Limit::AddressSpace => libc::$call(libc::RLIMIT_AS, $arg),
                Limit::FileSize => libc::$call(libc::RLIMIT_FSIZE, $arg),
                Limit::Processes => libc::$call(libc::RLIMIT_NPROC, $arg),
            }
        };
    }

    // SAFETY: valid pointers to a stack-allocated rlimit
    if unsafe { with_resource!(getrlimit, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let hard_cap = current.rlim_max;
    let soft = (value as libc::rlim_t).min(hard_cap);
    let hard = match limit {
        Limit::CpuTime => soft.saturating_add(1).min(hard_cap),
        _ => soft,
    };
    let wanted = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };

    // SAFETY: as above
    if unsafe { with_resource!(setrlimit, &wanted) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Human readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_config() {
        let config = ResourceLimitConfig {
            cpu_time_secs: Some(30),
            virtual_memory: Some("512m".to_string()),
            max_file_size: Some("10m".to_string()),
            max_processes: None,
        };
        let policy = ResourcePolicy::from_config(&config).unwrap();

        assert_eq!(policy.cpu_time_secs, Some(30));
        assert_eq!(policy.virtual_memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(policy.max_file_size_bytes, Some(10 * 1024 * 1024));
        assert!(!policy.is_unlimited());
        assert_eq!(policy.describe(), "cpu=30s vmem=512.00 MB fsize=10.00 MB");
    }

    #[test]
    fn test_builder_describe() {
        let policy = ResourcePolicy::unlimited()
            .with_virtual_memory(256 * 1024 * 1024)
            .with_max_processes(64);
        assert_eq!(policy.describe(), "vmem=256.00 MB nproc=64");
        assert_eq!(policy.max_processes, Some(64));
    }

    #[test]
    fn test_unlimited() {
        let limiter = ResourceLimiter::default();
        assert!(limiter.policy().is_unlimited());
        assert!(!limiter.caps_memory());
        assert_eq!(limiter.policy().describe(), "unlimited");
        assert!(ResourceLimiter::new(ResourcePolicy::strict()).caps_memory());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_limits_visible_in_child() {
        let limiter = ResourceLimiter::new(
            ResourcePolicy::unlimited()
                .with_cpu_time(7)
                .with_max_file_size(1024 * 1024),
        );
        let mut command = Command::new("sh");
        command.arg("-c").arg("ulimit -t; ulimit -f");
        limiter.apply_policy(&mut command);

        let output = command.output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().collect();

        assert_eq!(lines[0], "7");
        // `ulimit -f` reports 512- or 1024-byte blocks depending on the shell
        assert!(lines[1] == "2048" || lines[1] == "1024", "{}", lines[1]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_leads_own_process_group() {
        let limiter = ResourceLimiter::default();
        let mut command = Command::new("sh");
        command.arg("-c").arg("cut -d' ' -f5 /proc/$$/stat");
        limiter.apply_policy(&mut command);

        let child = command.stdout(std::process::Stdio::piped()).spawn().unwrap();
        let pid = child.id().unwrap();
        let output = child.wait_with_output().await.unwrap();
        let pgid = String::from_utf8_lossy(&output.stdout).trim().to_string();

        assert_eq!(pgid, pid.to_string());
    }
}
