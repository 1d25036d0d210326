//! Service configuration.
//!
//! Loaded once at startup from a JSON file (`--config`) or the
//! `CODE_RUNNER_CONFIG` environment variable. Every field has a default, so
//! an empty object is a valid configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::toolchain::{Language, ToolchainRegistry};

/// Top-level configuration for the service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory under which per-job workspaces are created.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,

    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Largest accepted source submission, in bytes.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Concurrency bound for running jobs.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Leftover workspaces at least this old are removed at startup. The
    /// default of zero removes all of them, since one process owns the root.
    #[serde(default)]
    pub stale_workspace_age_secs: u64,

    /// Per-language overrides of the built-in toolchain recipes.
    #[serde(default)]
    pub toolchains: HashMap<Language, ToolchainOverride>,
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum number of jobs executing at once.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// What to do with a job that arrives when every slot is taken.
    #[serde(default)]
    pub policy: AdmissionPolicy,

    /// Upper bound on time spent queued. Unbounded when absent.
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            policy: AdmissionPolicy::default(),
            queue_timeout_ms: None,
        }
    }
}

impl AdmissionConfig {
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }
}

/// Behaviour when the concurrency bound is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for a free slot.
    #[default]
    Queue,
    /// Fail immediately with an overload error.
    Reject,
}

/// Overrides for one language's recipe. Unset fields keep the built-in value.
///
/// An empty `compile` list turns a compiled language into a run-only one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolchainOverride {
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    #[serde(default)]
    pub run: Option<Vec<String>>,
    #[serde(default)]
    pub compile_timeout_ms: Option<u64>,
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            listen: default_listen(),
            max_source_bytes: default_max_source_bytes(),
            admission: AdmissionConfig::default(),
            stale_workspace_age_secs: 0,
            toolchains: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then the environment.
    ///
    /// Priority: `path` > `CODE_RUNNER_CONFIG` JSON > defaults. The
    /// `CODE_RUNNER_SANDBOX_ROOT` and `CODE_RUNNER_MAX_JOBS` variables are
    /// applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with environment lookups routed through `env`.
    pub fn load_with(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if let Some(json) = env("CODE_RUNNER_CONFIG") {
            Self::from_json(&json).context("Failed to parse CODE_RUNNER_CONFIG")?
        } else {
            debug!("No configuration supplied, using defaults");
            Self::default()
        };

        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = env("CODE_RUNNER_SANDBOX_ROOT") {
            self.sandbox_root = PathBuf::from(root);
        }
        if let Some(jobs) = env("CODE_RUNNER_MAX_JOBS") {
            self.admission.max_concurrent_jobs = jobs
                .parse()
                .with_context(|| format!("CODE_RUNNER_MAX_JOBS is not a number: '{jobs}'"))?;
        }
        Ok(())
    }

    /// Reject settings that would make the service unusable.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.admission.max_concurrent_jobs > 0,
            "admission.max_concurrent_jobs must be at least 1"
        );
        ensure!(self.max_source_bytes > 0, "max_source_bytes must be positive");
        self.registry().map(|_| ())
    }

    pub const fn stale_workspace_age(&self) -> Duration {
        Duration::from_secs(self.stale_workspace_age_secs)
    }

    /// Build the toolchain registry described by this configuration.
    pub fn registry(&self) -> Result<ToolchainRegistry> {
        ToolchainRegistry::with_overrides(&self.toolchains)
    }
}

fn default_sandbox_root() -> PathBuf {
    std::env::temp_dir().join("code-runner")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

const fn default_max_source_bytes() -> usize {
    256 * 1024
}

fn default_max_concurrent_jobs() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.max_source_bytes, 256 * 1024);
        assert_eq!(config.admission.policy, AdmissionPolicy::Queue);
        assert!(config.admission.max_concurrent_jobs >= 1);
        assert!(config.admission.queue_timeout().is_none());
        assert!(config.toolchains.is_empty());
        assert!(config.sandbox_root.ends_with("code-runner"));
        assert_eq!(config.stale_workspace_age(), Duration::ZERO);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "sandbox_root": "/var/lib/code-runner",
            "listen": "0.0.0.0:8080",
            "admission": {
                "max_concurrent_jobs": 8,
                "policy": "reject",
                "queue_timeout_ms": 500
            },
            "toolchains": {
                "python": {
                    "run": ["python", "{source}"],
                    "run_timeout_ms": 2000
                },
                "cpp": {
                    "max_output_bytes": 4096
                }
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.sandbox_root, PathBuf::from("/var/lib/code-runner"));
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.admission.max_concurrent_jobs, 8);
        assert_eq!(config.admission.policy, AdmissionPolicy::Reject);
        assert_eq!(
            config.admission.queue_timeout(),
            Some(Duration::from_millis(500))
        );

        let registry = config.registry().unwrap();
        let python = registry.get(Language::Python).unwrap();
        assert_eq!(python.run.program(), "python");
        assert_eq!(python.run_timeout, Duration::from_millis(2000));
        assert_eq!(registry.get(Language::Cpp).unwrap().max_output_bytes, 4096);
    }

    #[test]
    fn unknown_language_key_is_rejected() {
        let json = r#"{"toolchains": {"ruby": {"run": ["ruby", "{source}"]}}}"#;
        assert!(Config::from_json(json).is_err());
    }

    #[test]
    fn validate_rejects_zero_jobs() {
        let mut config = Config::default();
        config.admission.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_source_bytes": 1024}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_source_bytes, 1024);
    }

    fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn load_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_source_bytes": 100}"#).unwrap();
        let env = env_from(&[("CODE_RUNNER_CONFIG", r#"{"max_source_bytes": 200}"#)]);

        // File beats the env var.
        let config = Config::load_with(Some(path.as_path()), &env).unwrap();
        assert_eq!(config.max_source_bytes, 100);

        // Env var beats defaults.
        let config = Config::load_with(None, &env).unwrap();
        assert_eq!(config.max_source_bytes, 200);

        let config = Config::load_with(None, env_from(&[])).unwrap();
        assert_eq!(config.max_source_bytes, default_max_source_bytes());
    }

    #[test]
    fn load_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"sandbox_root": "/srv/jobs", "admission": {"max_concurrent_jobs": 2}}"#,
        )
        .unwrap();
        let env = env_from(&[
            ("CODE_RUNNER_SANDBOX_ROOT", "/tmp/override"),
            ("CODE_RUNNER_MAX_JOBS", "7"),
        ]);

        let config = Config::load_with(Some(path.as_path()), env).unwrap();
        assert_eq!(config.sandbox_root, PathBuf::from("/tmp/override"));
        assert_eq!(config.admission.max_concurrent_jobs, 7);
    }

    #[test]
    fn load_rejects_bad_env() {
        let err = Config::load_with(None, env_from(&[("CODE_RUNNER_MAX_JOBS", "many")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("CODE_RUNNER_MAX_JOBS"));

        assert!(Config::load_with(None, env_from(&[("CODE_RUNNER_MAX_JOBS", "0")])).is_err());
        assert!(Config::load_with(None, env_from(&[("CODE_RUNNER_CONFIG", "{oops")])).is_err());
    }

    #[test]
    fn parse_stale_workspace_age() {
        let config = Config::from_json(r#"{"stale_workspace_age_secs": 600}"#).unwrap();
        assert_eq!(config.stale_workspace_age(), Duration::from_secs(600));
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(Config::from_file(Path::new("/nonexistent/config.json")).is_err());
    }
}
