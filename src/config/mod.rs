//! Supervisor configuration
//!
//! This module handles loading the supervisor configuration from a simple
//! `key = value` file with built-in defaults and environment overrides.

mod parser;

pub use parser::{Config, DEFAULT_CONFIG_PATH, ENV_STARTUP_TIMEOUT};
