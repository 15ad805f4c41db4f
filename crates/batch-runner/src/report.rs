use crate::exec::InvocationOutcome;
use crate::plan::DriverInvocation;
use crate::server::ServerAction;
use crate::store::atomic_write_json_pretty;
use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub dataset: String,
    pub experiment: String,
    pub argv: Vec<String>,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub error: Option<String>,
}

impl InvocationRecord {
    pub fn finished(invocation: &DriverInvocation, outcome: InvocationOutcome) -> Self {
        Self {
            dataset: invocation.dataset.as_str().to_string(),
            experiment: invocation.experiment.clone(),
            argv: invocation.argv(),
            log_path: outcome.log_path,
            exit_code: outcome.exit_code,
            success: outcome.success,
            error: None,
        }
    }

    pub fn errored(invocation: &DriverInvocation, error: String) -> Self {
        Self {
            dataset: invocation.dataset.as_str().to_string(),
            experiment: invocation.experiment.clone(),
            argv: invocation.argv(),
            log_path: None,
            exit_code: None,
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub index: usize,
    pub name: String,
    pub status: JobStatus,
    pub target: Option<String>,
    #[serde(rename = "server_action")]
    pub server: ServerAction,
    pub reason: Option<String>,
    pub invocations: Vec<InvocationRecord>,
}

impl JobRecord {
    pub fn skipped(index: usize, name: &str, server: ServerAction, reason: String) -> Self {
        Self {
            index,
            name: name.to_string(),
            status: JobStatus::Skipped,
            target: None,
            server,
            reason: Some(reason),
            invocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub batch_file: PathBuf,
    pub description: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub strict: bool,
    pub aborted: bool,
    pub jobs: Vec<JobRecord>,
}

impl BatchReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "schema_version": "batch_report_v1",
            "batch_id": self.batch_id,
            "batch_file": self.batch_file.display().to_string(),
            "description": self.description,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "strict": self.strict,
            "aborted": self.aborted,
            "counts": {
                "jobs": self.jobs.len(),
                "completed": self.count(JobStatus::Completed),
                "failed": self.count(JobStatus::Failed),
                "skipped": self.count(JobStatus::Skipped),
            },
            "jobs": self.jobs,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, &self.to_json())
    }
}
