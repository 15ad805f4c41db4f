use crate::error::JobError;
use crate::plan::DriverInvocation;
use crate::settings::RunnerSettings;
use crate::tee::{never_quiet, open_log, spawn_tee, Echo};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationOutcome {
    /// `None` when the driver was terminated by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub log_path: Option<PathBuf>,
}

/// Runs one driver invocation to completion.
pub trait DriverExecutor {
    fn execute(&mut self, invocation: &DriverInvocation) -> Result<InvocationOutcome, JobError>;
}

/// Spawns the driver and waits on its handle, tee-ing its output to the
/// console and a per-invocation log file.
pub struct ProcessExecutor {
    cwd: PathBuf,
    log_root: PathBuf,
}

impl ProcessExecutor {
    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self {
            cwd: settings.project_root.clone(),
            log_root: settings.log_root(),
        }
    }
}

impl DriverExecutor for ProcessExecutor {
    fn execute(&mut self, invocation: &DriverInvocation) -> Result<InvocationOutcome, JobError> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = invocation.log_path(&self.log_root, &timestamp);
        let log = open_log(&log_path).map_err(|source| JobError::Spawn {
            program: log_path.display().to_string(),
            source,
        })?;

        info!(
            dataset = invocation.dataset.as_str(),
            experiment = %invocation.experiment,
            log = %log_path.display(),
            "exec: {}",
            invocation.display()
        );
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_tee(out, log.clone(), Echo::Stdout, None, never_quiet));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_tee(err, log, Echo::Stderr, None, never_quiet));
        }
        let status = child.wait().map_err(|source| JobError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        for handle in readers {
            let _ = handle.join();
        }

        Ok(InvocationOutcome {
            exit_code: status.code(),
            success: status.success(),
            log_path: Some(log_path),
        })
    }
}
