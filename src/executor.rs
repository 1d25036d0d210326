//! Per-job phase state machine.
//!
//! ```text
//! Idle -> (Compiling) -> Running -> Completed | CompileFailed | RuntimeFailed
//!                                   | TimedOut | Cancelled | SpawnFailed
//! ```
//!
//! A failed or timed-out compile ends the job without entering `Running`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backend::{PhaseCommand, ProcessOutput, ProcessRunner, RunnerError, Termination};
use crate::error::ExecError;
use crate::toolchain::{CommandTemplate, ToolchainSpec};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Compile => "compile",
            Self::Run => "run",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Compiling,
    Running,
    Completed,
    CompileFailed,
    RuntimeFailed,
    TimedOut,
    Cancelled,
    SpawnFailed,
}

impl JobState {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Compiling | Self::Running)
    }
}

/// What the executor observed for the last phase it ran.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub phase: Phase,
    pub state: JobState,
    /// Deadline that applied to `phase`.
    pub time_limit: Duration,
    /// Per-stream cap that applied to `phase`.
    pub output_limit: usize,
}

/// Drives compile and run phases through a [`ProcessRunner`].
pub struct Executor<R> {
    runner: Arc<R>,
}

impl<R> Clone for Executor<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: ProcessRunner> Executor<R> {
    pub const fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run every phase of `spec` inside `workspace`.
    ///
    /// Compile, runtime and timeout failures are `Ok` outcomes. `Err` is
    /// reserved for a toolchain that cannot be spawned or broken pipes.
    #[instrument(skip_all, fields(job = %workspace.job_id(), language = %spec.language))]
    pub async fn execute(
        &self,
        spec: &ToolchainSpec,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecError> {
        let mut state = JobState::Idle;

        if let Some(compile) = &spec.compile {
            state = transition(state, JobState::Compiling);
            let phase =
                phase_command(compile, workspace, spec.compile_timeout, spec.max_output_bytes);
            let output = self.run_phase(spec, &phase, cancel, &mut state).await?;

            if !output.success() {
                let terminal = match output.termination {
                    Termination::TimedOut => JobState::TimedOut,
                    Termination::Cancelled => JobState::Cancelled,
                    Termination::Exited | Termination::OutputLimit => JobState::CompileFailed,
                };
                state = transition(state, terminal);
                return Ok(outcome(output, Phase::Compile, state, &phase));
            }
            debug!(elapsed = ?output.elapsed, "Compilation succeeded");
        }

        state = transition(state, JobState::Running);
        let phase = phase_command(&spec.run, workspace, spec.run_timeout, spec.max_output_bytes);
        let output = self.run_phase(spec, &phase, cancel, &mut state).await?;

        let terminal = match output.termination {
            Termination::TimedOut => JobState::TimedOut,
            Termination::Cancelled => JobState::Cancelled,
            // Killed for flooding output; what was kept is still the answer.
            Termination::OutputLimit => JobState::Completed,
            Termination::Exited if output.exit_code == Some(0) => JobState::Completed,
            Termination::Exited => JobState::RuntimeFailed,
        };
        state = transition(state, terminal);
        Ok(outcome(output, Phase::Run, state, &phase))
    }

    async fn run_phase(
        &self,
        spec: &ToolchainSpec,
        phase: &PhaseCommand,
        cancel: &CancellationToken,
        state: &mut JobState,
    ) -> Result<ProcessOutput, ExecError> {
        match self.runner.run(phase, cancel).await {
            Ok(output) => Ok(output),
            Err(RunnerError::Spawn { program, source }) => {
                *state = transition(*state, JobState::SpawnFailed);
                warn!(program = %program, error = %source, "Toolchain binary could not be spawned");
                Err(ExecError::ToolchainUnavailable {
                    language: spec.language,
                    program,
                    source,
                })
            }
            Err(RunnerError::EmptyCommand) => Err(ExecError::Internal(format!(
                "{} toolchain has an empty command",
                spec.language
            ))),
            Err(RunnerError::Io(e)) => Err(ExecError::Io(e)),
        }
    }
}

fn transition(from: JobState, to: JobState) -> JobState {
    debug_assert!(!from.is_terminal(), "transition out of terminal state {from:?}");
    debug!(from = ?from, to = ?to, "Job state");
    to
}

fn phase_command(
    template: &CommandTemplate,
    workspace: &Workspace,
    timeout: Duration,
    max_output_bytes: usize,
) -> PhaseCommand {
    PhaseCommand {
        argv: template.expand(workspace.root(), workspace.source_path()),
        working_dir: workspace.root().to_path_buf(),
        timeout,
        max_output_bytes,
    }
}

fn outcome(
    output: ProcessOutput,
    phase: Phase,
    state: JobState,
    cmd: &PhaseCommand,
) -> ExecutionOutcome {
    ExecutionOutcome {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
        signal: output.signal,
        timed_out: output.termination == Termination::TimedOut,
        truncated: output.truncated,
        phase,
        state,
        time_limit: cmd.timeout,
        output_limit: cmd.max_output_bytes,
    }
}
