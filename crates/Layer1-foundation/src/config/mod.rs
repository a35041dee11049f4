//! Config - supervisor settings
//!
//! - `supervisor.rs` - SupervisorConfig and its sections

mod supervisor;

pub use supervisor::{
    parse_byte_size, ExecutionConfig, OutputConfig, ResourceLimitConfig, SecurityConfig,
    SessionConfig, ShellConfig, SupervisorConfig, TrackerConfig, SUPERVISOR_FILE,
};
