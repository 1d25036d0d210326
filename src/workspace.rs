//! Per-job workspace directories.
//!
//! Each job gets `<sandbox_root>/job-<id>/` holding its source file and any
//! build artifacts. The directory is owned by a [`Workspace`] guard and
//! removed when the guard is released or dropped, whichever comes first.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::job::JobId;
use crate::toolchain::ToolchainSpec;

const DIR_PREFIX: &str = "job-";

/// Creates workspaces under a sandbox root.
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    root: PathBuf,
}

impl WorkspaceAllocator {
    /// The root is created lazily on first allocation. Relative roots are
    /// resolved against the current directory so toolchain argv stay valid
    /// inside each workspace; failing to read it is an error.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a job's workspace would occupy.
    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{DIR_PREFIX}{job_id}"))
    }

    /// Create the job's directory and write its source file.
    ///
    /// Fails if the directory already exists; two jobs never share a path.
    pub async fn allocate(
        &self,
        job_id: &JobId,
        spec: &ToolchainSpec,
        code: &str,
    ) -> Result<Workspace, ExecError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| ExecError::Workspace {
                path: self.root.clone(),
                source,
            })?;

        let root = self.path_for(job_id);
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(&root)
            .await
            .map_err(|source| ExecError::Workspace {
                path: root.clone(),
                source,
            })?;

        // From here on the guard owns the directory.
        let workspace = Workspace {
            job_id: *job_id,
            source_path: root.join(&spec.source_filename),
            root,
            released: false,
        };

        fs::write(&workspace.source_path, code)
            .await
            .map_err(|source| ExecError::Workspace {
                path: workspace.source_path.clone(),
                source,
            })?;

        debug!(job = %job_id, path = %workspace.root.display(), "Allocated workspace");
        Ok(workspace)
    }

    /// Remove workspace directories older than `max_age`.
    ///
    /// Only entries carrying the job prefix are considered. Returns how many
    /// were removed; unreadable entries are logged and skipped.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %self.root.display(), error = %e, "Nothing to sweep");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Error reading sandbox root entry");
                    break;
                }
            };

            if !entry.file_name().to_string_lossy().starts_with(DIR_PREFIX) {
                continue;
            }

            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Cannot stat workspace");
                    continue;
                }
            };

            if age >= max_age {
                match fs::remove_dir_all(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(
                            path = %entry.path().display(),
                            error = %e,
                            "Failed to remove stale workspace"
                        );
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "Swept stale workspaces");
        }
        removed
    }
}

/// Exclusive filesystem area for one job.
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    root: PathBuf,
    source_path: PathBuf,
    released: bool,
}

impl Workspace {
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Delete the whole workspace subtree.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => {
                debug!(job = %self.job_id, "Released workspace");
                Ok(())
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    job = %self.job_id,
                    path = %self.root.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
    }
}
