//! A single execution request.

use std::fmt;
use std::time::Instant;

use uuid::Uuid;

use crate::toolchain::Language;

/// Unique per request. Also names the job's workspace directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// Immutable once created; dropped after the response is produced.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub language: Language,
    pub source_code: String,
    pub created_at: Instant,
}

impl Job {
    pub fn new(language: Language, source_code: String) -> Self {
        Self {
            id: JobId::new(),
            language,
            source_code,
            created_at: Instant::now(),
        }
    }
}
