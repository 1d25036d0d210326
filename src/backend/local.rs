//! Local process backend.
//!
//! Spawns toolchain binaries directly on the host, each invocation in its
//! own process group so the whole tree can be killed with one signal. Real
//! kernel isolation (namespaces, cgroups) is left to the deployment.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{PhaseCommand, ProcessOutput, ProcessRunner, RunnerError, Termination};
use crate::normalize::decode_output;

const READ_CHUNK: usize = 8 * 1024;

/// Host variables passed through to toolchains. Everything else is dropped.
const DEFAULT_INHERITED_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "JAVA_HOME", "NODE_PATH"];

/// Backend that runs toolchains as plain child processes.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    inherit_env: Vec<String>,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    /// Create a runner with the default environment allowlist.
    pub fn new() -> Self {
        Self {
            inherit_env: DEFAULT_INHERITED_ENV.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Replace the environment allowlist.
    #[must_use]
    pub fn with_inherited_env(mut self, vars: Vec<String>) -> Self {
        self.inherit_env = vars;
        self
    }

    fn command(&self, phase: &PhaseCommand) -> Result<Command, RunnerError> {
        let (program, args) = phase.argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&phase.working_dir)
            .env_clear()
            .env("HOME", &phase.working_dir)
            .env("TMPDIR", &phase.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        for var in &self.inherit_env {
            if let Some(value) = std::env::var_os(var) {
                cmd.env(var, value);
            }
        }
        Ok(cmd)
    }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    #[instrument(
        skip(self, phase, cancel),
        fields(program = %phase.program(), timeout = ?phase.timeout)
    )]
    async fn run(
        &self,
        phase: &PhaseCommand,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RunnerError> {
        let mut cmd = self.command(phase)?;
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: phase.program().to_string(),
            source,
        })?;

        // The child leads its own group, so its pid is also the pgid.
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        debug!(pgid, "Spawned process");
        // Dropped before `child` on every early exit, including an abandoned future.
        let group = GroupGuard::new(pgid);

        // Take pipe handles out so `child` stays usable for kill-on-timeout
        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let mut child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        let mut stdout = CappedBuffer::new(phase.max_output_bytes);
        let mut stderr = CappedBuffer::new(phase.max_output_bytes);

        let read_all = async {
            let (r1, r2) = tokio::join!(
                capture(&mut child_stdout, &mut stdout, pgid),
                capture(&mut child_stderr, &mut stderr, pgid),
            );
            r1?;
            r2?;
            child.wait().await
        };

        let waited = tokio::select! {
            res = tokio::time::timeout(phase.timeout, read_all) => match res {
                Ok(status) => Waited::Exited(status?),
                Err(_) => Waited::TimedOut,
            },
            () = cancel.cancelled() => Waited::Cancelled,
        };

        let truncated = stdout.truncated || stderr.truncated;
        let (status, termination) = match waited {
            Waited::Exited(status) => {
                // Reap stragglers that detached from our pipes.
                kill_tree(pgid);
                let termination = if truncated {
                    Termination::OutputLimit
                } else {
                    Termination::Exited
                };
                (status, termination)
            }
            Waited::TimedOut => {
                warn!(timeout = ?phase.timeout, "Process timed out, killing tree");
                (terminate(&mut child, pgid).await?, Termination::TimedOut)
            }
            Waited::Cancelled => {
                debug!("Process cancelled, killing tree");
                (terminate(&mut child, pgid).await?, Termination::Cancelled)
            }
        };
        group.disarm();

        let output = ProcessOutput {
            stdout: decode_output(&stdout.bytes, phase.max_output_bytes),
            stderr: decode_output(&stderr.bytes, phase.max_output_bytes),
            exit_code: status.code(),
            signal: status.signal(),
            termination,
            truncated,
            elapsed: started.elapsed(),
        };

        debug!(
            exit_code = ?output.exit_code,
            termination = ?output.termination,
            elapsed = ?output.elapsed,
            "Process finished"
        );

        Ok(output)
    }
}

/// Bounded capture buffer. Bytes past the cap are dropped and flagged.
struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    const fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append a chunk. Returns `false` once the cap has been exceeded.
    fn push(&mut self, chunk: &[u8]) -> bool {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
            return false;
        }
        self.bytes.extend_from_slice(chunk);
        true
    }
}

/// Read a stream into `buf` until EOF, or until the cap is exceeded, in
/// which case the process tree is killed since nothing more would be kept.
async fn capture<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut CappedBuffer,
    pgid: Option<i32>,
) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if !buf.push(&chunk[..n]) {
            debug!(cap = buf.cap, "Output cap exceeded, killing tree");
            kill_tree(pgid);
            return Ok(());
        }
    }
}

/// SIGKILLs the process group when dropped while still armed, so a run
/// future that is dropped mid-flight cannot leave descendants behind.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    const fn new(pgid: Option<i32>) -> Self {
        Self { pgid }
    }

    /// The caller has taken over killing and reaping the group.
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pgid.is_some() {
            debug!(pgid = self.pgid, "Run abandoned, killing process group");
            kill_tree(self.pgid);
        }
    }
}

/// Kill the tree and reap the group leader.
async fn terminate(child: &mut Child, pgid: Option<i32>) -> io::Result<ExitStatus> {
    kill_tree(pgid);
    // Covers the case where the group could not be signalled.
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Direct kill failed");
    }
    child.wait().await
}

/// SIGKILL every process in the group.
fn kill_tree(pgid: Option<i32>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill process group"),
    }
}
