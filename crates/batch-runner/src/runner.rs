//! The job loop: plan each job, line up the model server, run its driver
//! invocations in order, record the outcome, move on.

use crate::error::JobError;
use crate::exec::DriverExecutor;
use crate::job::{BatchFile, Mode};
use crate::plan::{plan_job, JobPlan};
use crate::provider::ProviderCatalog;
use crate::report::{BatchReport, InvocationRecord, JobRecord, JobStatus};
use crate::server::{ModelServer, ServerAction, ServerSession};
use crate::settings::RunnerSettings;
use chrono::{Local, Utc};
use std::path::PathBuf;
use tracing::{error, info, warn};

pub struct BatchRunner<'a, S: ModelServer, E: DriverExecutor> {
    settings: &'a RunnerSettings,
    catalog: &'a ProviderCatalog,
    session: ServerSession<S>,
    executor: E,
    strict: bool,
    report_path: Option<PathBuf>,
    batch_id: String,
}

impl<'a, S: ModelServer, E: DriverExecutor> BatchRunner<'a, S, E> {
    pub fn new(
        settings: &'a RunnerSettings,
        catalog: &'a ProviderCatalog,
        session: ServerSession<S>,
        executor: E,
    ) -> Self {
        Self {
            settings,
            catalog,
            session,
            executor,
            strict: false,
            report_path: None,
            batch_id: format!("batch_{}", Local::now().format("%Y%m%d_%H%M%S")),
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Stop the batch at the first failed driver invocation.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Rewrite the report at `path` after every job.
    pub fn report_to(mut self, path: PathBuf) -> Self {
        self.report_path = Some(path);
        self
    }

    pub fn run(&mut self, batch: &BatchFile) -> BatchReport {
        let mut report = BatchReport {
            batch_id: self.batch_id.clone(),
            batch_file: batch.path.clone(),
            description: batch.description.clone(),
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
            strict: self.strict,
            aborted: false,
            jobs: Vec::with_capacity(batch.jobs.len()),
        };
        if let Some(desc) = &batch.description {
            info!(description = %desc, "batch");
        }
        let total = batch.jobs.len();

        for loaded in &batch.jobs {
            info!(job = %loaded.name, "job {}/{}", loaded.index + 1, total);
            let planned = loaded
                .descriptor
                .as_ref()
                .map_err(|e| JobError::malformed(e.clone()))
                .and_then(|job| {
                    plan_job(loaded.index, &loaded.name, job, self.settings, self.catalog)
                });
            let record = match planned {
                Ok(plan) => self.run_job(&plan),
                Err(err) => {
                    error!(job = %loaded.name, error = %err, "skipping job");
                    JobRecord::skipped(loaded.index, &loaded.name, ServerAction::None, err.to_string())
                }
            };
            let failed = record.status == JobStatus::Failed;
            report.jobs.push(record);
            self.persist(&report);
            if failed && self.strict {
                error!(job = %loaded.name, "strict mode: stopping batch after failed job");
                report.aborted = true;
                break;
            }
        }

        self.session.release();
        report.finished_at = Some(Utc::now().to_rfc3339());
        self.persist(&report);
        info!(
            completed = report.count(JobStatus::Completed),
            failed = report.count(JobStatus::Failed),
            skipped = report.count(JobStatus::Skipped),
            "batch finished"
        );
        report
    }

    fn run_job(&mut self, plan: &JobPlan) -> JobRecord {
        let server = match plan.mode {
            Mode::LocalVllm => {
                let model_id = match plan.target.model_id() {
                    Some(id) => id,
                    None => {
                        return JobRecord::skipped(
                            plan.index,
                            &plan.name,
                            ServerAction::None,
                            "local job without model".to_string(),
                        )
                    }
                };
                match self.session.ensure_model(model_id) {
                    Ok(action) => action,
                    Err(err) => {
                        if err.is_readiness_failure() {
                            error!(job = %plan.name, model_id, error = %err, "model server never became ready, skipping job");
                        } else {
                            error!(job = %plan.name, model_id, error = %err, "model server could not be launched, skipping job");
                        }
                        return JobRecord::skipped(
                            plan.index,
                            &plan.name,
                            ServerAction::None,
                            err.to_string(),
                        );
                    }
                }
            }
            Mode::Api => {
                let provider = plan.target.provider_arg();
                if self.catalog.contains(provider) {
                    info!(
                        job = %plan.name,
                        provider,
                        api_base = self.catalog.api_base(provider).unwrap_or("default"),
                        "using remote provider"
                    );
                } else {
                    warn!(job = %plan.name, provider, "provider not in catalog, driver falls back to its own defaults");
                }
                match self.session.release() {
                    Some(previous) => ServerAction::Stopped { previous },
                    None => ServerAction::None,
                }
            }
        };

        if plan.invocations.is_empty() {
            warn!(job = %plan.name, "job selects no experiments for any dataset");
        }

        let mut invocations = Vec::with_capacity(plan.invocations.len());
        let mut failed = false;
        for invocation in &plan.invocations {
            let record = match self.executor.execute(invocation) {
                Ok(outcome) => {
                    if !outcome.success {
                        warn!(
                            job = %plan.name,
                            experiment = %invocation.experiment,
                            exit_code = ?outcome.exit_code,
                            "driver exited unsuccessfully"
                        );
                    }
                    InvocationRecord::finished(invocation, outcome)
                }
                Err(err) => {
                    error!(job = %plan.name, experiment = %invocation.experiment, error = %err, "driver did not run");
                    InvocationRecord::errored(invocation, err.to_string())
                }
            };
            failed |= !record.success;
            invocations.push(record);
            if failed && self.strict {
                break;
            }
        }

        JobRecord {
            index: plan.index,
            name: plan.name.clone(),
            status: if failed {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            },
            target: Some(format!(
                "{}:{}",
                plan.mode.as_str(),
                plan.target.display_name()
            )),
            server,
            reason: None,
            invocations,
        }
    }

    fn persist(&self, report: &BatchReport) {
        if let Some(path) = &self.report_path {
            if let Err(err) = report.write(path) {
                warn!(path = %path.display(), error = %err, "failed to write batch report");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::InvocationOutcome;
    use crate::job::parse_batch;
    use crate::plan::DriverInvocation;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Start(u32),
        Stop,
        Exec(String, String),
    }

    type Events = Rc<RefCell<Vec<Event>>>;

    struct FakeServer {
        events: Events,
        never_ready: Vec<u32>,
        running: bool,
        pending: u32,
    }

    impl ModelServer for FakeServer {
        fn start(&mut self, model_id: u32) -> Result<(), JobError> {
            self.events.borrow_mut().push(Event::Start(model_id));
            self.running = true;
            self.pending = model_id;
            Ok(())
        }

        fn wait_ready(&mut self, timeout: Duration) -> Result<(), JobError> {
            if self.never_ready.contains(&self.pending) {
                return Err(JobError::ReadinessTimeout {
                    model_id: self.pending,
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            self.running
        }

        fn stop(&mut self) {
            if self.running {
                self.running = false;
                self.events.borrow_mut().push(Event::Stop);
            }
        }
    }

    struct FakeExecutor {
        events: Events,
        failing: Vec<String>,
    }

    impl DriverExecutor for FakeExecutor {
        fn execute(&mut self, invocation: &DriverInvocation) -> Result<InvocationOutcome, JobError> {
            self.events.borrow_mut().push(Event::Exec(
                invocation.dataset.as_str().to_string(),
                invocation.experiment.clone(),
            ));
            let success = !self.failing.contains(&invocation.experiment);
            Ok(InvocationOutcome {
                exit_code: Some(if success { 0 } else { 1 }),
                success,
                log_path: None,
            })
        }
    }

    fn run_yaml(yaml: &str, never_ready: Vec<u32>, failing: &[&str], strict: bool) -> (BatchReport, Vec<Event>) {
        let settings = RunnerSettings::default();
        let catalog = ProviderCatalog::default();
        let events: Events = Rc::new(RefCell::new(Vec::new()));
        let server = FakeServer {
            events: events.clone(),
            never_ready,
            running: false,
            pending: 0,
        };
        let executor = FakeExecutor {
            events: events.clone(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
        };
        let batch = parse_batch(Path::new("jobs.yaml"), yaml).expect("batch");
        let session = ServerSession::new(server, Duration::from_secs(300));
        let report = BatchRunner::new(&settings, &catalog, session, executor)
            .strict(strict)
            .run(&batch);
        let recorded = events.borrow().clone();
        (report, recorded)
    }

    fn exec(dataset: &str, experiment: &str) -> Event {
        Event::Exec(dataset.to_string(), experiment.to_string())
    }

    #[test]
    fn consecutive_jobs_on_same_model_share_one_server() {
        let yaml = "jobs:\n  - {name: one, mode: local_vllm, model_id: 3, sce_experiments: [labor]}\n  - {name: two, mode: local_vllm, model_id: 3, sce_experiments: [credit]}\n";
        let (report, events) = run_yaml(yaml, vec![], &[], false);
        assert_eq!(
            events,
            vec![
                Event::Start(3),
                exec("sce", "labor"),
                exec("sce", "credit"),
                Event::Stop
            ]
        );
        assert_eq!(report.count(JobStatus::Completed), 2);
        assert_eq!(report.jobs[0].server, ServerAction::Started);
        assert_eq!(report.jobs[1].server, ServerAction::Reused);
    }

    #[test]
    fn model_change_stops_then_starts_before_commands() {
        let yaml = "jobs:\n  - {mode: local_vllm, model_id: 1, sce_experiments: [labor]}\n  - {mode: local_vllm, model_id: 4, cex_experiments: [saving]}\n";
        let (report, events) = run_yaml(yaml, vec![], &[], false);
        assert_eq!(
            events,
            vec![
                Event::Start(1),
                exec("sce", "labor"),
                Event::Stop,
                Event::Start(4),
                exec("cex", "saving"),
                Event::Stop
            ]
        );
        assert_eq!(report.jobs[1].server, ServerAction::Restarted { previous: 1 });
    }

    #[test]
    fn readiness_timeout_skips_job_and_continues() {
        let yaml = "jobs:\n  - {name: slow, mode: local_vllm, model_id: 5, sce_experiments: [labor]}\n  - {name: next, mode: local_vllm, model_id: 2, sce_experiments: [credit]}\n";
        let (report, events) = run_yaml(yaml, vec![5], &[], false);
        assert_eq!(
            events,
            vec![
                Event::Start(5),
                Event::Stop,
                Event::Start(2),
                exec("sce", "credit"),
                Event::Stop
            ]
        );
        assert_eq!(report.jobs[0].status, JobStatus::Skipped);
        assert!(report.jobs[0]
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("not ready after 300s"));
        assert_eq!(report.jobs[1].status, JobStatus::Completed);
        assert_eq!(report.jobs[1].server, ServerAction::Started);
    }

    #[test]
    fn api_job_stops_local_server_first() {
        let yaml = "jobs:\n  - {mode: local_vllm, model_id: 3, sce_experiments: [labor]}\n  - {mode: api, provider: openai, sce_experiments: [spending]}\n  - {mode: local_vllm, model_id: 3, sce_experiments: [credit]}\n";
        let (report, events) = run_yaml(yaml, vec![], &[], false);
        assert_eq!(
            events,
            vec![
                Event::Start(3),
                exec("sce", "labor"),
                Event::Stop,
                exec("sce", "spending"),
                Event::Start(3),
                exec("sce", "credit"),
                Event::Stop
            ]
        );
        assert_eq!(report.jobs[1].server, ServerAction::Stopped { previous: 3 });
        assert_eq!(report.jobs[1].target.as_deref(), Some("api:openai"));
    }

    #[test]
    fn driver_failure_is_recorded_but_not_escalated() {
        let yaml = "jobs:\n  - {mode: local_vllm, model_id: 4, sce_experiments: all}\n  - {mode: local_vllm, model_id: 4, sce_experiments: [labor]}\n";
        let (report, events) = run_yaml(yaml, vec![], &["credit"], false);
        assert_eq!(
            events,
            vec![
                Event::Start(4),
                exec("sce", "credit"),
                exec("sce", "spending"),
                exec("sce", "labor"),
                exec("sce", "labor"),
                Event::Stop
            ]
        );
        assert_eq!(report.jobs[0].status, JobStatus::Failed);
        assert_eq!(report.jobs[0].invocations[0].exit_code, Some(1));
        assert_eq!(report.jobs[1].status, JobStatus::Completed);
        assert!(!report.aborted);
    }

    #[test]
    fn strict_mode_stops_at_first_failure() {
        let yaml = "jobs:\n  - {mode: local_vllm, model_id: 4, sce_experiments: all}\n  - {mode: local_vllm, model_id: 4, sce_experiments: [labor]}\n";
        let (report, events) = run_yaml(yaml, vec![], &["credit"], true);
        assert_eq!(
            events,
            vec![Event::Start(4), exec("sce", "credit"), Event::Stop]
        );
        assert!(report.aborted);
        assert_eq!(report.jobs.len(), 1);
    }

    #[test]
    fn malformed_jobs_are_skipped_and_empty_jobs_complete() {
        let yaml = "jobs:\n  - {name: broken, mode: cluster}\n  - {name: nomodel, mode: local_vllm}\n  - {name: idle, mode: local_vllm, model_id: 2}\n";
        let (report, events) = run_yaml(yaml, vec![], &[], false);
        assert_eq!(events, vec![Event::Start(2), Event::Stop]);
        assert_eq!(report.jobs[0].status, JobStatus::Skipped);
        assert_eq!(report.jobs[1].status, JobStatus::Skipped);
        assert_eq!(report.jobs[2].status, JobStatus::Completed);
        assert!(report.jobs[2].invocations.is_empty());
    }

    #[test]
    fn report_is_written_after_run() {
        let dir = std::env::temp_dir().join(format!(
            "batch_runner_report_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("batch_report.json");
        let settings = RunnerSettings::default();
        let catalog = ProviderCatalog::default();
        let events: Events = Rc::new(RefCell::new(Vec::new()));
        let server = FakeServer {
            events: events.clone(),
            never_ready: vec![],
            running: false,
            pending: 0,
        };
        let executor = FakeExecutor {
            events,
            failing: vec![],
        };
        let batch = parse_batch(
            Path::new("jobs.yaml"),
            "description: smoke\njobs:\n  - {mode: local_vllm, model_id: 5, sce_experiments: [labor], debug_limit: 5}\n",
        )
        .expect("batch");
        BatchRunner::new(&settings, &catalog, ServerSession::new(server, Duration::from_secs(1)), executor)
            .report_to(path.clone())
            .run(&batch);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("report")).expect("json");
        assert_eq!(value["description"], "smoke");
        assert_eq!(value["counts"]["completed"], 1);
        assert!(value["finished_at"].is_string());
        let argv = value["jobs"][0]["invocations"][0]["argv"]
            .as_array()
            .expect("argv")
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>();
        assert!(argv.contains(&"--debug-limit"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
