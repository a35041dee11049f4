//! # warden-foundation
//!
//! Foundation layer for Warden:
//! - Error: the error type shared by every layer
//! - Config: `SupervisorConfig` (shell, timeouts, buffers, pool, limits, security)
//! - Storage: `JsonStore` for global and project configuration files

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result, RuleKind};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    parse_byte_size, ExecutionConfig, OutputConfig, ResourceLimitConfig, SecurityConfig,
    SessionConfig, ShellConfig, SupervisorConfig, TrackerConfig, SUPERVISOR_FILE,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
