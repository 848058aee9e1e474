//! ProxyTray Core Library
//!
//! Shared functionality for the ProxyTray processes
//!
//! Architecture:
//! - The tray process owns the supervisor and talks to the engine's control API
//! - The same executable, relaunched with `--pm=`, runs as the helper that
//!   owns the engine's console (process::helper)

pub mod config;
pub mod control_api;
pub mod launch_spec;
pub mod process;
pub mod startup;

pub use launch_spec::LaunchSpec;
