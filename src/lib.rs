#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
pub mod bootstrap;
mod error;
mod executor;
pub mod image;
pub mod process;
pub mod profile;
pub mod qemu;
mod task;

pub use crate::blueprint::{Blueprint, Outcome, TaskBinder, TaskDef, Workbench};
pub use crate::error::{BuildError, ConfigError, ImageError, RunError, ToolError};
pub use crate::process::{CancelToken, Invocation, SystemTools, ToolRunner};
pub use crate::task::{Dependencies, Handle, TaskContext};

/// Installs an env-filtered `tracing` subscriber, defaulting to `info`.
///
/// Call once at startup; diagnostics from tool invocations and the scheduler
/// are emitted through `tracing` either way.
#[cfg(feature = "logging")]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
