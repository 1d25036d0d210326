//! Error taxonomy for the execution pipeline.
//!
//! Only faults live here. A program that fails to compile, exits non-zero,
//! runs past its deadline or floods its output is a valid outcome and is
//! reported through [`crate::executor::JobState`] instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::toolchain::Language;

/// Faults that stop a job from producing an [`crate::normalize::ExecutionResult`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// Missing or malformed input. Raised before any side effect.
    #[error("{0}")]
    Validation(String),

    /// Language identifier is not registered.
    #[error("unsupported language: '{0}'")]
    UnsupportedLanguage(String),

    /// A registered toolchain binary could not be spawned.
    #[error("toolchain for {language} is unavailable: cannot spawn '{program}'")]
    ToolchainUnavailable {
        language: Language,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Admission control rejected the job.
    #[error("server is at capacity ({limit} concurrent jobs)")]
    Overloaded { limit: usize },

    /// The coordinator is shutting down and admits no more jobs.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Filesystem fault while preparing a workspace.
    #[error("workspace error at {}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Pipe or wait failure on a process that did spawn.
    #[error("process I/O failed")]
    Io(#[from] std::io::Error),

    /// The job worker died (panic or runtime shutdown).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Who is to blame for an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Client,
    Overload,
    Server,
}

impl ExecError {
    pub const fn class(&self) -> FaultClass {
        match self {
            Self::Validation(_) | Self::UnsupportedLanguage(_) => FaultClass::Client,
            Self::Overloaded { .. } | Self::ShuttingDown => FaultClass::Overload,
            Self::ToolchainUnavailable { .. }
            | Self::Workspace { .. }
            | Self::Io(_)
            | Self::Internal(_) => FaultClass::Server,
        }
    }

    pub const fn is_client_error(&self) -> bool {
        matches!(self.class(), FaultClass::Client)
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;
