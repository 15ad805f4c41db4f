//! Batch runner for LLM survey experiments.
//!
//! A batch file lists jobs; each job names a local model (served by a
//! vLLM process this crate manages) or a remote provider, plus the survey
//! experiments to run against it. Jobs run strictly in order and a loaded
//! model is reused while consecutive jobs ask for the same one.

pub mod error;
pub mod exec;
pub mod features;
pub mod job;
pub mod plan;
pub mod provider;
pub mod report;
pub mod runner;
pub mod server;
pub mod settings;
mod store;
mod tee;

pub use error::{ConfigError, JobError};
pub use job::{load_batch, BatchFile, JobDescriptor, Mode, ThinkMode};
pub use plan::{plan_job, DriverInvocation, JobPlan};
pub use report::{BatchReport, JobStatus};
pub use runner::BatchRunner;
pub use server::{ServerAction, ServerGroup, ServerSession, VllmServer};
pub use settings::{Dataset, RunnerSettings};

use anyhow::Result;
use exec::ProcessExecutor;
use provider::ProviderCatalog;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use store::{atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub strict: bool,
    /// Receives the running server's process group for out-of-band teardown.
    pub server_group: ServerGroup,
}

pub struct BatchRun {
    pub report: BatchReport,
    pub run_dir: Option<PathBuf>,
}

/// Loads the batch file and runs every job against real processes.
///
/// Only configuration problems are returned as errors; everything that
/// happens inside a job ends up in the report.
pub fn run_batch(batch_path: &Path, settings: &RunnerSettings, options: &RunOptions) -> Result<BatchRun> {
    let batch = load_batch(batch_path)?;
    info!(path = %batch_path.display(), jobs = batch.jobs.len(), "loaded batch");
    let catalog = ProviderCatalog::load_or_empty(&settings.resolve(&settings.providers_file));

    let session = ServerSession::new(
        VllmServer::from_settings(settings).with_group(options.server_group.clone()),
        Duration::from_secs(settings.server.readiness_timeout_secs),
    );
    let executor = ProcessExecutor::from_settings(settings);
    let mut runner = BatchRunner::new(settings, &catalog, session, executor).strict(options.strict);

    let run_dir = settings.runs_root().join(runner.batch_id());
    let run_dir = match prepare_run_dir(&run_dir, &batch) {
        Ok(()) => {
            runner = runner.report_to(run_dir.join("batch_report.json"));
            Some(run_dir)
        }
        Err(err) => {
            warn!(run_dir = %run_dir.display(), error = %err, "run directory unavailable, no report will be written");
            None
        }
    };

    let report = runner.run(&batch);
    Ok(BatchRun { report, run_dir })
}

fn prepare_run_dir(run_dir: &Path, batch: &BatchFile) -> Result<()> {
    ensure_dir(run_dir)?;
    atomic_write_json_pretty(&run_dir.join("resolved_jobs.json"), &batch.raw)?;
    atomic_write_bytes(
        &run_dir.join("resolved_jobs.digest"),
        canonical_json_digest(&batch.raw).as_bytes(),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub index: usize,
    pub name: String,
    pub server: ServerAction,
    pub plan: Option<JobPlan>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub batch_file: PathBuf,
    pub description: Option<String>,
    pub jobs: Vec<PlannedJob>,
    pub server_starts: usize,
}

/// Plans every job without running anything. Server actions assume every
/// start succeeds.
pub fn describe_batch(batch_path: &Path, settings: &RunnerSettings) -> Result<BatchPlan> {
    let batch = load_batch(batch_path)?;
    let catalog = ProviderCatalog::load_or_empty(&settings.resolve(&settings.providers_file));
    Ok(plan_batch(&batch, settings, &catalog))
}

pub fn plan_batch(batch: &BatchFile, settings: &RunnerSettings, catalog: &ProviderCatalog) -> BatchPlan {
    let mut current: Option<u32> = None;
    let mut server_starts = 0;
    let mut jobs = Vec::with_capacity(batch.jobs.len());

    for loaded in &batch.jobs {
        let planned = loaded
            .descriptor
            .as_ref()
            .map_err(|e| JobError::malformed(e.clone()))
            .and_then(|job| plan_job(loaded.index, &loaded.name, job, settings, catalog));
        let (server, plan, error) = match planned {
            Ok(plan) => {
                let server = match plan.target.model_id() {
                    Some(id) if current == Some(id) => ServerAction::Reused,
                    Some(id) => {
                        server_starts += 1;
                        match current.replace(id) {
                            Some(previous) => ServerAction::Restarted { previous },
                            None => ServerAction::Started,
                        }
                    }
                    None => match current.take() {
                        Some(previous) => ServerAction::Stopped { previous },
                        None => ServerAction::None,
                    },
                };
                (server, Some(plan), None)
            }
            Err(err) => (ServerAction::None, None, Some(err.to_string())),
        };
        jobs.push(PlannedJob {
            index: loaded.index,
            name: loaded.name.clone(),
            server,
            plan,
            error,
        });
    }

    BatchPlan {
        batch_file: batch.path.clone(),
        description: batch.description.clone(),
        jobs,
        server_starts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::parse_batch;
    use chrono::Utc;
    use std::fs;

    #[test]
    fn plan_batch_tracks_server_reuse() {
        let batch = parse_batch(
            Path::new("jobs.yaml"),
            "jobs:\n  - {mode: local_vllm, model_id: 3, sce_experiments: [labor]}\n  - {mode: local_vllm, model_id: 3, sce_experiments: [credit]}\n  - {mode: local_vllm, model_id: 1, sce_experiments: [credit]}\n  - {mode: api, provider: openai, sce_experiments: [labor]}\n  - {mode: api}\n",
        )
        .expect("batch");
        let plan = plan_batch(&batch, &RunnerSettings::default(), &ProviderCatalog::default());
        let actions: Vec<ServerAction> = plan.jobs.iter().map(|j| j.server).collect();
        assert_eq!(
            actions,
            vec![
                ServerAction::Started,
                ServerAction::Reused,
                ServerAction::Restarted { previous: 3 },
                ServerAction::Stopped { previous: 1 },
                ServerAction::None,
            ]
        );
        assert_eq!(plan.server_starts, 2);
        assert!(plan.jobs[4].error.as_deref().unwrap_or_default().contains("provider"));
    }

    #[test]
    fn sample_config_plans_cleanly() {
        let config = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
        let settings = RunnerSettings::load(&config.join("settings.example.yaml")).expect("settings");
        assert_eq!(
            settings.server.health_url.as_deref(),
            Some("http://localhost:8000/v1/models")
        );
        let plan = describe_batch(&config.join("batch.example.yaml"), &settings).expect("plan");

        assert_eq!(plan.jobs.len(), 4);
        assert!(plan.jobs.iter().all(|j| j.error.is_none()));
        assert_eq!(plan.server_starts, 2);
        let counts: Vec<usize> = plan
            .jobs
            .iter()
            .map(|j| j.plan.as_ref().map(|p| p.invocations.len()).unwrap_or(0))
            .collect();
        assert_eq!(counts, vec![3, 2, 2, 5]);

        let ablation = plan.jobs[1].plan.as_ref().expect("ablation plan");
        let args = &ablation.invocations[0].args;
        assert!(args.windows(2).any(|w| w[0] == "--suffix" && w[1] == "NOgender_SEED42"));
        assert!(args.windows(2).any(|w| w[0] == "--sample-ratio" && w[1] == "0.2"));
        assert_eq!(plan.jobs[3].server, ServerAction::Stopped { previous: 1 });
    }

    #[test]
    fn run_batch_fails_fast_on_missing_config() {
        let missing = std::env::temp_dir().join(format!("batch_none_{}.yaml", std::process::id()));
        let err = run_batch(&missing, &RunnerSettings::default(), &RunOptions::default())
            .err()
            .expect("missing config must fail");
        assert!(matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Missing(_))));
    }

    #[cfg(unix)]
    #[test]
    fn run_batch_end_to_end_with_shell_stand_ins() {
        let root = std::env::temp_dir().join(format!(
            "batch_e2e_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        let batch_path = root.join("jobs.yaml");
        fs::write(
            &batch_path,
            "jobs:\n  - {name: first, mode: local_vllm, model_id: 3, sce_experiments: [labor]}\n  - {name: second, mode: local_vllm, model_id: 3, sce_experiments: [credit]}\n",
        )
        .expect("write batch");

        let mut settings = RunnerSettings::default();
        settings.project_root = root.clone();
        settings.server.drain_secs = 0;
        settings.server.readiness_timeout_secs = 10;
        settings.server.launch = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo started >> server_starts.txt; echo 'Application startup complete.'; sleep 60".to_string(),
        ];
        // The driver records its arguments; `$@` after `sh -c script _`.
        settings.datasets.get_mut(&Dataset::Sce).expect("sce").driver = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo \"$@\" >> driver_calls.txt".to_string(),
            "driver".to_string(),
        ];

        let options = RunOptions::default();
        let run = run_batch(&batch_path, &settings, &options).expect("run");
        assert_eq!(options.server_group.pgid(), None, "server group left published");
        assert_eq!(run.report.count(JobStatus::Completed), 2);
        assert_eq!(run.report.jobs[1].server, ServerAction::Reused);

        let starts = fs::read_to_string(root.join("server_starts.txt")).expect("starts");
        assert_eq!(starts.lines().count(), 1);
        let calls = fs::read_to_string(root.join("driver_calls.txt")).expect("calls");
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("--experiment labor --provider local_vllm"));
        assert!(calls[1].starts_with("--experiment credit --provider local_vllm"));

        let run_dir = run.run_dir.expect("run dir");
        assert!(run_dir.join("batch_report.json").is_file());
        let digest = fs::read_to_string(run_dir.join("resolved_jobs.digest")).expect("digest");
        assert!(digest.starts_with("sha256:"));
        let _ = fs::remove_dir_all(root);
    }
}
