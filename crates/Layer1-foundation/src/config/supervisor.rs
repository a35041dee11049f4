//! Supervisor Configuration - shell, timeout, buffer, pool and limit settings
//!
//! Loaded from a global file merged with a project file. Project values win
//! for scalars; the `security` lists are unioned so that a project can only
//! tighten the command gate, never loosen it.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Supervisor configuration file name
pub const SUPERVISOR_FILE: &str = "supervisor.json";

/// Shell used to run commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Program for one-shot commands (`sh -c <command>`)
    pub program: String,
    /// Flag that makes `program` run a command string
    pub command_flag: String,
    /// Program started for interactive sessions
    pub session_program: String,
    /// Arguments passed to the session program
    pub session_args: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                program: "cmd".to_string(),
                command_flag: "/C".to_string(),
                session_program: "cmd".to_string(),
                session_args: vec!["/Q".to_string()],
            }
        } else {
            Self {
                program: "sh".to_string(),
                command_flag: "-c".to_string(),
                session_program: "sh".to_string(),
                session_args: Vec::new(),
            }
        }
    }
}

/// Foreground / background execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout applied when a foreground request carries none
    pub default_timeout_ms: Option<u64>,
    /// Window between the graceful signal and the forceful kill
    pub grace_period_ms: u64,
    /// How long to keep reading pipes after the process exits
    pub drain_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Some(120_000), // 2 minutes
            grace_period_ms: 5_000,
            drain_timeout_ms: 500,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Output buffering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Capacity of each per-stream ring buffer
    pub max_buffer_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024, // 1 MiB per stream
        }
    }
}

/// Interactive session pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_timeout_ms: u64,
    /// No new output for this long means the command is done
    pub silence_window_ms: u64,
    pub command_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            idle_timeout_ms: 300_000, // 5 minutes
            silence_window_ms: 300,
            command_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn silence_window(&self) -> Duration {
        Duration::from_millis(self.silence_window_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Process sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub sample_interval_ms: u64,
    /// Retired entries kept for inspection
    pub history_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 500,
            history_size: 100,
        }
    }
}

impl TrackerConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// OS-level resource ceilings applied at spawn time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    pub cpu_time_secs: Option<u64>,
    /// Human size, e.g. "2g", "512m"
    pub virtual_memory: Option<String>,
    /// Human size, e.g. "100m"
    pub max_file_size: Option<String>,
    pub max_processes: Option<u64>,
}

impl ResourceLimitConfig {
    pub fn virtual_memory_bytes(&self) -> Result<Option<u64>> {
        parse_optional_size("limits.virtual_memory", self.virtual_memory.as_deref())
    }

    pub fn max_file_size_bytes(&self) -> Result<Option<u64>> {
        parse_optional_size("limits.max_file_size", self.max_file_size.as_deref())
    }
}

/// Additional rules for the command gate; additive only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Regex patterns rejected as dangerous
    pub extra_dangerous_patterns: Vec<String>,
    pub extra_restricted_executables: Vec<String>,
    pub extra_protected_paths: Vec<String>,
}

/// Full supervisor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub shell: ShellConfig,
    pub execution: ExecutionConfig,
    pub output: OutputConfig,
    pub sessions: SessionConfig,
    pub tracker: TrackerConfig,
    pub limits: ResourceLimitConfig,
    pub security: SecurityConfig,
}

impl SupervisorConfig {
    /// Load global + project configuration
    pub fn load() -> Result<Self> {
        let global = match JsonStore::global() {
            Ok(store) => store.load_optional::<Value>(SUPERVISOR_FILE)?,
            Err(_) => None,
        };
        let project = JsonStore::current_project()?.load_optional::<Value>(SUPERVISOR_FILE)?;
        Self::from_layers(global, project)
    }

    /// Load from explicit stores (project overrides global)
    pub fn load_from(global: &JsonStore, project: &JsonStore) -> Result<Self> {
        let global = global.load_optional::<Value>(SUPERVISOR_FILE)?;
        let project = project.load_optional::<Value>(SUPERVISOR_FILE)?;
        Self::from_layers(global, project)
    }

    fn from_layers(global: Option<Value>, project: Option<Value>) -> Result<Self> {
        let mut merged = Value::Object(Default::default());
        for layer in [global, project].into_iter().flatten() {
            merge_layer(&mut merged, layer, false);
        }

        let config: Self = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid {}: {}", SUPERVISOR_FILE, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the supervisor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.output.max_buffer_bytes == 0 {
            return Err(Error::Config(
                "output.max_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(Error::Config(
                "sessions.max_sessions must be greater than zero".to_string(),
            ));
        }
        if self.sessions.silence_window_ms == 0 {
            return Err(Error::Config(
                "sessions.silence_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.shell.program.trim().is_empty() || self.shell.session_program.trim().is_empty() {
            return Err(Error::Config("shell program must not be empty".to_string()));
        }
        self.limits.virtual_memory_bytes()?;
        self.limits.max_file_size_bytes()?;
        Ok(())
    }

    /// Save to the global store
    pub fn save_global(&self) -> Result<()> {
        JsonStore::global()?.save(SUPERVISOR_FILE, self)
    }

    /// Save to the project store
    pub fn save_project(&self) -> Result<()> {
        JsonStore::current_project()?.save(SUPERVISOR_FILE, self)
    }
}

/// Overlay `layer` onto `base`; arrays are unioned inside `security`
fn merge_layer(base: &mut Value, layer: Value, union_arrays: bool) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                let union = union_arrays || key == "security";
                match base_map.get_mut(&key) {
                    Some(existing) => merge_layer(existing, value, union),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(layer_items)) if union_arrays => {
            for item in layer_items {
                if !base_items.contains(&item) {
                    base_items.push(item);
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn parse_optional_size(field: &str, value: Option<&str>) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(raw) => parse_byte_size(raw)
            .map(Some)
            .ok_or_else(|| Error::Config(format!("{}: invalid size '{}'", field, raw))),
    }
}

/// Parse a human size such as "512m", "2g", "1024k" or "4096"
pub fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim().to_lowercase();

    if s.is_empty() {
        return None;
    }

    let (num_str, unit) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024u64)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024u64)
    } else if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let n = num_str.trim().parse::<f64>().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some((n * unit as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_byte_size("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("1024k"), Some(1024 * 1024));
        assert_eq!(parse_byte_size("4096"), Some(4096));
        assert_eq!(parse_byte_size("1.5KB"), Some(1536));
        assert_eq!(parse_byte_size("lots"), None);
        assert_eq!(parse_byte_size(""), None);
    }

    #[test]
    fn test_defaults_validate() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sessions.max_sessions, 4);
        assert_eq!(config.execution.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_project_overrides_scalars() {
        let global = json!({ "sessions": { "max_sessions": 8, "idle_timeout_ms": 1000 } });
        let project = json!({ "sessions": { "max_sessions": 2 } });

        let config = SupervisorConfig::from_layers(Some(global), Some(project)).unwrap();
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.sessions.idle_timeout_ms, 1000);
    }

    #[test]
    fn test_security_lists_are_unioned() {
        let global = json!({ "security": { "extra_restricted_executables": ["kubectl"] } });
        let project = json!({ "security": { "extra_restricted_executables": ["terraform", "kubectl"] } });

        let config = SupervisorConfig::from_layers(Some(global), Some(project)).unwrap();
        assert_eq!(
            config.security.extra_restricted_executables,
            vec!["kubectl".to_string(), "terraform".to_string()]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_pool = json!({ "sessions": { "max_sessions": 0 } });
        assert!(matches!(
            SupervisorConfig::from_layers(Some(zero_pool), None),
            Err(Error::Config(_))
        ));

        let bad_size = json!({ "limits": { "virtual_memory": "huge" } });
        assert!(matches!(
            SupervisorConfig::from_layers(None, Some(bad_size)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_from_stores() {
        let global_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let global = JsonStore::new(global_dir.path());
        let project = JsonStore::new(project_dir.path());

        let mut config = SupervisorConfig::default();
        config.output.max_buffer_bytes = 4096;
        global.save(SUPERVISOR_FILE, &config).unwrap();

        let loaded = SupervisorConfig::load_from(&global, &project).unwrap();
        assert_eq!(loaded.output.max_buffer_bytes, 4096);

        std::fs::write(project.file_path(SUPERVISOR_FILE), "{ not json").unwrap();
        assert!(matches!(
            SupervisorConfig::load_from(&global, &project),
            Err(Error::Config(_))
        ));
    }
}
