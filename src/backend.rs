//! Process backend trait and implementations.
//!
//! A backend runs one phase (compile or run) of a job: it spawns an argv in
//! the job's workspace, captures bounded output, and tears down the whole
//! process tree on timeout or cancellation.

mod local;

pub use local::LocalRunner;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One process invocation.
#[derive(Debug, Clone)]
pub struct PhaseCommand {
    /// Program followed by its arguments. Never passed through a shell.
    pub argv: Vec<String>,
    /// Working directory, always the job's workspace.
    pub working_dir: PathBuf,
    /// Wall-clock limit for the whole invocation.
    pub timeout: Duration,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
}

impl PhaseCommand {
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

/// Why a process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own.
    Exited,
    /// Killed at its deadline.
    TimedOut,
    /// Killed after exceeding the output cap.
    OutputLimit,
    /// Killed on request.
    Cancelled,
}

/// Captured result of one process invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Termination,
    /// Either stream hit the cap.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("empty command")]
    EmptyCommand,

    /// The binary is missing or not executable.
    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Trait for process backends.
///
/// Implementations must not return until every process they spawned for the
/// call has been reaped or killed.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `command` to completion, its deadline, or `cancel`, whichever
    /// comes first.
    async fn run(
        &self,
        command: &PhaseCommand,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RunnerError>;
}
