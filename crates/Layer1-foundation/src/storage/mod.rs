//! Storage module for Warden
//!
//! - `json`: JSON - configuration file load/save

mod json;

pub use json::JsonStore;
