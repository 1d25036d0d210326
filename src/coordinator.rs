//! Job coordinator: the single entry point for executing submitted code.
//!
//! Validates the request, resolves the toolchain, applies admission
//! control, then runs the job on its own task so a slow job never blocks
//! the caller that accepts new requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::backend::ProcessRunner;
use crate::config::{AdmissionConfig, AdmissionPolicy, Config};
use crate::error::ExecError;
use crate::executor::Executor;
use crate::job::{Job, JobId};
use crate::normalize::{normalize, ExecutionResult};
use crate::toolchain::{ToolchainRegistry, ToolchainSpec};
use crate::workspace::WorkspaceAllocator;

/// Incoming request body. Both fields are required; `Option` lets a
/// missing field reach validation instead of failing deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ExecuteRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
            code: Some(code.into()),
        }
    }
}

/// Bounds how many jobs run at once.
#[derive(Debug)]
struct Admission {
    slots: Arc<Semaphore>,
    limit: usize,
    policy: AdmissionPolicy,
    queue_timeout: Option<Duration>,
}

impl Admission {
    fn new(config: &AdmissionConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            limit: config.max_concurrent_jobs,
            policy: config.policy,
            queue_timeout: config.queue_timeout(),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, ExecError> {
        let overloaded = || ExecError::Overloaded { limit: self.limit };
        let slots = Arc::clone(&self.slots);

        let acquired = match (self.policy, self.queue_timeout) {
            (AdmissionPolicy::Reject, _) => {
                return slots.try_acquire_owned().map_err(|_| overloaded());
            }
            (AdmissionPolicy::Queue, None) => slots.acquire_owned().await,
            (AdmissionPolicy::Queue, Some(wait)) => {
                tokio::time::timeout(wait, slots.acquire_owned())
                    .await
                    .map_err(|_| overloaded())?
            }
        };
        acquired.map_err(|_| ExecError::Internal("admission semaphore closed".into()))
    }
}

type ActiveJobs = Arc<Mutex<HashMap<JobId, CancellationToken>>>;

/// Keeps a job's cancellation token registered for as long as it runs.
struct Registration {
    id: JobId,
    active: ActiveJobs,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A job that has been admitted and is running on its own task.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    task: JoinHandle<Result<ExecutionResult, ExecError>>,
}

impl JobHandle {
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Wait for the job's result.
    pub async fn wait(self) -> Result<ExecutionResult, ExecError> {
        self.task
            .await
            .map_err(|e| ExecError::Internal(format!("job {} worker failed: {e}", self.id)))?
    }
}

/// Orchestrates registry, workspace, executor and normalizer per job.
pub struct JobCoordinator<R> {
    registry: Arc<ToolchainRegistry>,
    allocator: Arc<WorkspaceAllocator>,
    executor: Executor<R>,
    admission: Arc<Admission>,
    active: ActiveJobs,
    /// Parent of every job's cancellation token.
    shutdown: CancellationToken,
    max_source_bytes: usize,
}

impl<R> Clone for JobCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            allocator: Arc::clone(&self.allocator),
            executor: self.executor.clone(),
            admission: Arc::clone(&self.admission),
            active: Arc::clone(&self.active),
            shutdown: self.shutdown.clone(),
            max_source_bytes: self.max_source_bytes,
        }
    }
}

impl<R: ProcessRunner + 'static> JobCoordinator<R> {
    /// Build a coordinator from validated configuration.
    pub fn new(config: &Config, runner: R) -> anyhow::Result<Self> {
        Ok(Self {
            registry: Arc::new(config.registry()?),
            allocator: Arc::new(
                WorkspaceAllocator::new(&config.sandbox_root)
                    .context("Failed to resolve sandbox root")?,
            ),
            executor: Executor::new(Arc::new(runner)),
            admission: Arc::new(Admission::new(&config.admission)),
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            max_source_bytes: config.max_source_bytes,
        })
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &WorkspaceAllocator {
        &self.allocator
    }

    /// Execute a request and wait for its result.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecError> {
        self.start(request).await?.wait().await
    }

    /// Validate and admit a request, then run it in the background.
    ///
    /// Validation and language lookup happen before any filesystem or
    /// process action. With the queue policy this waits for a free slot.
    pub async fn start(&self, request: ExecuteRequest) -> Result<JobHandle, ExecError> {
        let (spec, code) = self.validate(request)?;
        let job = Job::new(spec.language, code);
        let spec = spec.clone();

        if self.shutdown.is_cancelled() {
            return Err(ExecError::ShuttingDown);
        }
        let permit = self.admission.admit().await?;
        // A queued job may be admitted after shutdown began.
        if self.shutdown.is_cancelled() {
            return Err(ExecError::ShuttingDown);
        }

        let cancel = self.shutdown.child_token();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id, cancel.clone());
        let registration = Registration {
            id: job.id,
            active: Arc::clone(&self.active),
        };

        let id = job.id;
        let this = self.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let _registration = registration;
            this.run_job(&job, &spec, &cancel).await
        });

        Ok(JobHandle { id, task })
    }

    /// Request cancellation of a running job. Returns `false` if no such
    /// job is running.
    pub fn cancel(&self, id: &JobId) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.get(id).map_or(false, |token| {
            info!(job = %id, "Cancelling job");
            token.cancel();
            true
        })
    }

    /// Stop admitting jobs, cancel every running one and wait up to `grace`
    /// for them to finish cleaning up. Returns `false` if the wait timed out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(active = self.active_jobs(), "Cancelling running jobs");
        self.shutdown.cancel();

        // Every admitted job holds a slot until its workspace is released.
        let slots = u32::try_from(self.admission.limit).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.admission.slots.acquire_many(slots)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(active = self.active_jobs(), ?grace, "Jobs still running at shutdown");
                false
            }
        }
    }

    /// Number of admitted jobs that have not finished.
    pub fn active_jobs(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn validate(&self, request: ExecuteRequest) -> Result<(&ToolchainSpec, String), ExecError> {
        let (Some(language), Some(code)) = (request.language, request.code) else {
            return Err(ExecError::Validation("language and code are required".into()));
        };
        if language.is_empty() || code.is_empty() {
            return Err(ExecError::Validation("language and code are required".into()));
        }
        if code.len() > self.max_source_bytes {
            return Err(ExecError::Validation(format!(
                "code exceeds the {} byte limit",
                self.max_source_bytes
            )));
        }

        let spec = self.registry.lookup(&language)?;
        Ok((spec, code))
    }

    #[instrument(skip_all, fields(job = %job.id, language = %job.language))]
    async fn run_job(
        &self,
        job: &Job,
        spec: &ToolchainSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        info!(code_len = job.source_code.len(), "Executing job");

        let workspace = self
            .allocator
            .allocate(&job.id, spec, &job.source_code)
            .await?;

        let outcome = self.executor.execute(spec, &workspace, cancel).await;

        // Release before inspecting the outcome so every exit path cleans up.
        if let Err(e) = workspace.release().await {
            warn!(error = %e, "Failed to release workspace");
        }

        let outcome = outcome?;
        info!(
            state = ?outcome.state,
            phase = %outcome.phase,
            elapsed = ?job.created_at.elapsed(),
            "Job finished"
        );

        let result = normalize(outcome);
        debug!(
            output_len = result.output.len(),
            error_len = result.error.len(),
            "Normalized result"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RunnerError;
    use crate::executor::tests::{exited, BlockingRunner, ScriptedRunner};
    use tokio_test::{assert_err, assert_ok};

    fn config(root: &std::path::Path) -> Config {
        Config {
            sandbox_root: root.to_path_buf(),
            ..Config::default()
        }
    }

    fn sandbox_is_empty(root: &std::path::Path) -> bool {
        std::fs::read_dir(root).map_or(true, |mut entries| entries.next().is_none())
    }

    #[tokio::test]
    async fn missing_fields_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator =
            JobCoordinator::new(&config(dir.path()), ScriptedRunner::default()).unwrap();

        for request in [
            ExecuteRequest::default(),
            ExecuteRequest {
                language: Some("python".into()),
                code: None,
            },
            ExecuteRequest::new("", "print(1)"),
            ExecuteRequest::new("python", ""),
        ] {
            let err = coordinator.execute(request).await.unwrap_err();
            assert!(matches!(err, ExecError::Validation(_)), "{err:?}");
        }
        assert!(sandbox_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_source_bytes = 8;
        let coordinator = JobCoordinator::new(&cfg, ScriptedRunner::default()).unwrap();

        let err = coordinator
            .execute(ExecuteRequest::new("python", "print('too long')"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[tokio::test]
    async fn unsupported_language_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sandbox");
        let runner = ScriptedRunner::default();
        let coordinator = JobCoordinator::new(&config(&root), runner).unwrap();

        let err = coordinator
            .execute(ExecuteRequest::new("ruby", "puts 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::UnsupportedLanguage(_)));
        assert!(err.is_client_error());
        assert!(!root.exists());
        assert_eq!(coordinator.executor_calls(), 0);
    }

    #[tokio::test]
    async fn compile_error_never_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::replying(vec![Ok(exited(
            1,
            "",
            "main.cpp:1:23: error: expected ';' before '}' token",
        ))]);
        let coordinator = JobCoordinator::new(&config(dir.path()), runner).unwrap();

        let result = coordinator
            .execute(ExecuteRequest::new("cpp", "int main() { return 0 }"))
            .await
            .unwrap();
        assert!(result.output.is_empty());
        assert!(result.error.contains("expected ';'"));
        assert_eq!(coordinator.executor_calls(), 1);
        assert!(sandbox_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn successful_job_releases_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::replying(vec![Ok(exited(0, "4\n", ""))]);
        let coordinator = JobCoordinator::new(&config(dir.path()), runner).unwrap();

        let result = assert_ok!(
            coordinator
                .execute(ExecuteRequest::new("javascript", "console.log(2+2)"))
                .await
        );
        assert_eq!(result.output, "4\n");
        assert_eq!(result.error, "");
        assert!(sandbox_is_empty(dir.path()));
        assert_eq!(coordinator.active_jobs(), 0);
    }

    #[tokio::test]
    async fn missing_toolchain_is_server_fault() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::replying(vec![Err(RunnerError::Spawn {
            program: "javac".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })]);
        let coordinator = JobCoordinator::new(&config(dir.path()), runner).unwrap();

        let err = assert_err!(
            coordinator
                .execute(ExecuteRequest::new("java", "class Solution {}"))
                .await
        );
        assert!(matches!(err, ExecError::ToolchainUnavailable { .. }));
        assert!(!err.is_client_error());
        assert!(sandbox_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn workspace_fault_is_server_fault() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let coordinator =
            JobCoordinator::new(&config(&blocker.join("sandbox")), ScriptedRunner::default())
                .unwrap();

        let err = assert_err!(
            coordinator
                .execute(ExecuteRequest::new("python", "print(1)"))
                .await
        );
        assert!(matches!(err, ExecError::Workspace { .. }));
        assert_eq!(err.class(), crate::error::FaultClass::Server);
        assert_eq!(coordinator.executor_calls(), 0);
        assert_eq!(coordinator.active_jobs(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.admission.max_concurrent_jobs = 2;
        let coordinator = JobCoordinator::new(&cfg, BlockingRunner).unwrap();

        let first = coordinator
            .start(ExecuteRequest::new("python", "while True: pass"))
            .await
            .unwrap();
        let second = coordinator
            .start(ExecuteRequest::new("cpp", "int main() { for (;;); }"))
            .await
            .unwrap();
        assert_eq!(coordinator.active_jobs(), 2);

        assert!(coordinator.shutdown(Duration::from_secs(5)).await);
        assert_eq!(coordinator.active_jobs(), 0);
        assert!(sandbox_is_empty(dir.path()));
        assert_eq!(first.wait().await.unwrap().error, "execution cancelled");
        assert_eq!(second.wait().await.unwrap().error, "execution cancelled");

        let err = assert_err!(
            coordinator
                .start(ExecuteRequest::new("python", "print(1)"))
                .await
        );
        assert!(matches!(err, ExecError::ShuttingDown));
    }

    #[tokio::test]
    async fn reject_policy_signals_overload() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.admission.max_concurrent_jobs = 1;
        cfg.admission.policy = AdmissionPolicy::Reject;
        let coordinator = JobCoordinator::new(&cfg, BlockingRunner).unwrap();

        let first = coordinator
            .start(ExecuteRequest::new("python", "while True: pass"))
            .await
            .unwrap();
        assert_eq!(coordinator.active_jobs(), 1);

        let err = coordinator
            .start(ExecuteRequest::new("python", "print(1)"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Overloaded { limit: 1 }));

        assert!(coordinator.cancel(first.id()));
        let result = first.wait().await.unwrap();
        assert_eq!(result.error, "execution cancelled");
        assert_eq!(coordinator.active_jobs(), 0);

        // The slot is free again.
        let again = coordinator
            .start(ExecuteRequest::new("python", "print(1)"))
            .await
            .unwrap();
        assert!(coordinator.cancel(again.id()));
        again.wait().await.unwrap();
    }

    #[tokio::test]
    async fn queue_timeout_signals_overload() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.admission.max_concurrent_jobs = 1;
        cfg.admission.queue_timeout_ms = Some(50);
        let coordinator = JobCoordinator::new(&cfg, BlockingRunner).unwrap();

        let first = coordinator
            .start(ExecuteRequest::new("python", "while True: pass"))
            .await
            .unwrap();
        let err = coordinator
            .execute(ExecuteRequest::new("python", "print(1)"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Overloaded { .. }));

        coordinator.cancel(first.id());
        first.wait().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator =
            JobCoordinator::new(&config(dir.path()), ScriptedRunner::default()).unwrap();
        assert!(!coordinator.cancel(&JobId::new()));
    }

    impl JobCoordinator<ScriptedRunner> {
        fn executor_calls(&self) -> usize {
            self.executor.runner().call_count()
        }
    }
}
