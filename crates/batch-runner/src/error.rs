use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors: nothing runs when one of these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("batch file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("batch file contains no jobs: {}", .0.display())]
    NoJobs(PathBuf),
}

/// Job-scoped failures. The loop logs them and moves on to the next job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("model {model_id} not ready after {timeout_secs}s")]
    ReadinessTimeout { model_id: u32, timeout_secs: u64 },

    #[error("model server for {model_id} exited before becoming ready ({status})")]
    ServerExited { model_id: u32, status: String },

    #[error("malformed job: {reason}")]
    Malformed { reason: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        JobError::Malformed {
            reason: reason.into(),
        }
    }

    /// Readiness failures tear the half-started server down and skip the job.
    pub fn is_readiness_failure(&self) -> bool {
        matches!(
            self,
            JobError::ReadinessTimeout { .. } | JobError::ServerExited { .. }
        )
    }
}
