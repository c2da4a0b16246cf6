//! Polling runner for DIGIsens weight controllers.
//!
//! Loads a YAML [`PollConfig`], turns it into a bus plan and drives a
//! coordinator over it. The `digisens` binary is a thin clap front end over
//! [`app`].

pub mod app;
pub mod config;

pub use app::{RunnerError, RunnerResult};
pub use config::{BusEntry, ConfigError, DeviceEntry, PollConfig, PollModeConfig};
