//! The effectful edge of the crate: spawning external tools.
//!
//! Everything above this module is pure bookkeeping; only implementations of
//! [`ToolRunner`] actually touch processes. Tests substitute recording stubs
//! for [`SystemTools`] so the orchestration logic can be exercised without
//! spawning anything.

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::error::ToolError;

/// Cooperative cancellation flag shared between the scheduler and running
/// tool invocations. Cancelling kills child processes at the next poll.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A fully described external tool invocation, built before any side effect
/// takes place.
#[derive(Clone, Debug, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// One-line rendering for diagnostics.
    pub fn display(&self) -> String {
        let mut acc = self.program.clone();
        for arg in &self.args {
            acc.push(' ');
            acc.push_str(arg);
        }
        acc
    }
}

/// The seam between task logic and the operating system.
pub trait ToolRunner: Send + Sync {
    /// Run the tool and wait for a clean exit.
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<(), ToolError>;

    /// Start the tool and leave it running. Returns the child pid; ownership
    /// of the process stays with the caller's debugging session.
    fn spawn(&self, invocation: &Invocation) -> Result<u32, ToolError>;
}

/// [`ToolRunner`] backed by [`std::process::Command`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTools;

impl SystemTools {
    fn command(invocation: &Invocation) -> Command {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }
        command
    }

    fn spawn_error(invocation: &Invocation, source: std::io::Error) -> ToolError {
        if source.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                program: invocation.program.clone(),
                source,
            }
        } else {
            ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            }
        }
    }
}

impl ToolRunner for SystemTools {
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<(), ToolError> {
        tracing::debug!(command = %invocation.display(), "running external tool");

        let mut child = Self::command(invocation)
            .spawn()
            .map_err(|e| Self::spawn_error(invocation, e))?;

        loop {
            if cancel.is_cancelled() {
                child.kill().ok();
                child.wait().ok();
                return Err(ToolError::Cancelled {
                    program: invocation.program.clone(),
                });
            }

            match child.try_wait().map_err(|e| ToolError::Spawn {
                program: invocation.program.clone(),
                source: e,
            })? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => {
                    return Err(ToolError::Failed {
                        program: invocation.program.clone(),
                        status,
                    });
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn spawn(&self, invocation: &Invocation) -> Result<u32, ToolError> {
        tracing::debug!(command = %invocation.display(), "spawning external tool");

        let child = Self::command(invocation)
            .stdin(Stdio::inherit())
            .spawn()
            .map_err(|e| Self::spawn_error(invocation, e))?;

        Ok(child.id())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A [`ToolRunner`] that records invocations instead of spawning anything.
    #[derive(Default)]
    pub(crate) struct RecordingTools {
        pub(crate) invocations: Mutex<Vec<Invocation>>,
        detached: AtomicUsize,
    }

    impl RecordingTools {
        /// How many times `program` was invoked, by either entry point.
        pub(crate) fn count(&self, program: &str) -> usize {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .filter(|invocation| invocation.program == program)
                .count()
        }

        /// Invocation order, by program name.
        pub(crate) fn programs(&self) -> Vec<String> {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .map(|invocation| invocation.program.clone())
                .collect()
        }

        /// How many invocations were left running detached.
        pub(crate) fn spawned(&self) -> usize {
            self.detached.load(Ordering::SeqCst)
        }
    }

    impl ToolRunner for RecordingTools {
        fn run(&self, invocation: &Invocation, _: &CancelToken) -> Result<(), ToolError> {
            self.invocations.lock().unwrap().push(invocation.clone());
            Ok(())
        }

        fn spawn(&self, invocation: &Invocation) -> Result<u32, ToolError> {
            self.invocations.lock().unwrap().push(invocation.clone());
            self.detached.fetch_add(1, Ordering::SeqCst);
            Ok(4242)
        }
    }
}
