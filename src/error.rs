use std::process::ExitStatus;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors in the declarative setup, detected before any task runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task graph contains a cycle through task '{0}'")]
    Cycle(String),

    #[error("Couldn't read profile '{0}':\n{1}")]
    ProfileRead(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse profile:\n{0}")]
    ProfileParse(#[from] toml::de::Error),
}

/// Failure of an external tool invocation. Carries the program name so the
/// caller can tell which collaborator misbehaved.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("'{program}' could not be located")]
    NotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't spawn '{program}':\n{source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: ExitStatus },

    #[error("'{program}' was cancelled")]
    Cancelled { program: String },
}

/// Errors while packing a linked binary into a bootable image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Linked binary '{0}' does not exist")]
    MissingBinary(Utf8PathBuf),

    #[error("Couldn't stage the image tree:\n{0}")]
    Stage(#[from] std::io::Error),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Errors while booting an image under the emulator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Errors surfaced by the task scheduler.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Build was cancelled")]
    Cancelled,
}
