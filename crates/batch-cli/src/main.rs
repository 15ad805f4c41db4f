use anyhow::Result;
use batch_runner::{
    describe_batch, run_batch, BatchPlan, BatchReport, JobStatus, RunOptions, RunnerSettings,
    ServerGroup,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "batch", version = "0.3.0", about = "Sequential LLM experiment batch runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct SettingsArgs {
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    project_root: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    readiness_timeout: Option<u64>,
    #[arg(long)]
    drain_secs: Option<u64>,
}

impl SettingsArgs {
    fn load(&self) -> Result<RunnerSettings> {
        let mut settings = RunnerSettings::load_or_default(self.settings.as_deref())?;
        if let Some(root) = &self.project_root {
            settings.project_root = root.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = dir.clone();
        }
        if let Some(secs) = self.readiness_timeout {
            settings.server.readiness_timeout_secs = secs;
        }
        if let Some(secs) = self.drain_secs {
            settings.server.drain_secs = secs;
        }
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job in the batch file in order.
    Run {
        batch: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
        /// Stop at the first failed job and exit with status 2.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the planned server actions and driver commands without running them.
    Describe {
        batch: PathBuf,
        #[command(flatten)]
        settings: SettingsArgs,
        #[arg(long)]
        json: bool,
    },
    /// List the local model registry.
    Models {
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

enum Outcome {
    Done(Option<Value>),
    Aborted(Option<Value>),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Outcome::Done(payload)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            Ok(())
        }
        Ok(Outcome::Aborted(payload)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            std::process::exit(2);
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The server lives in its own process group, so a terminal Ctrl-C never
/// reaches it; tear it down here before exiting.
fn install_interrupt_handler(group: ServerGroup, drain: Duration) -> Result<()> {
    ctrlc::set_handler(move || {
        warn!("interrupted, stopping model server");
        if let Some(pgid) = group.terminate(drain) {
            warn!(pgid, "model server process group terminated");
        }
        std::process::exit(130);
    })?;
    Ok(())
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            batch,
            settings,
            strict,
            json,
        } => {
            let settings = settings.load()?;
            let server_group = ServerGroup::default();
            install_interrupt_handler(
                server_group.clone(),
                Duration::from_secs(settings.server.drain_secs),
            )?;
            let run = run_batch(&batch, &settings, &RunOptions { strict, server_group })?;
            let aborted = run.report.aborted;
            let payload = if json {
                let mut value = run.report.to_json();
                value["ok"] = json!(!aborted);
                value["command"] = json!("run");
                value["run_dir"] = json!(run.run_dir.as_ref().map(|p| p.display().to_string()));
                Some(value)
            } else {
                print_report_summary(&run.report, run.run_dir.as_ref());
                None
            };
            Ok(if aborted {
                Outcome::Aborted(payload)
            } else {
                Outcome::Done(payload)
            })
        }
        Commands::Describe {
            batch,
            settings,
            json,
        } => {
            let settings = settings.load()?;
            let plan = describe_batch(&batch, &settings)?;
            if json {
                let mut value = serde_json::to_value(&plan)?;
                value["ok"] = json!(true);
                value["command"] = json!("describe");
                return Ok(Outcome::Done(Some(value)));
            }
            print_plan(&plan);
            Ok(Outcome::Done(None))
        }
        Commands::Models { settings, json } => {
            let settings = RunnerSettings::load_or_default(settings.as_deref())?;
            if json {
                return Ok(Outcome::Done(Some(json!({
                    "ok": true,
                    "command": "models",
                    "models": settings.models,
                }))));
            }
            for (key, model) in &settings.models {
                let reasoning = if model.reasoning { "  (reasoning)" } else { "" };
                println!("{:>3}  {}{}", key, model.name, reasoning);
            }
            Ok(Outcome::Done(None))
        }
    }
}

fn print_plan(plan: &BatchPlan) {
    println!("batch: {}", plan.batch_file.display());
    if let Some(desc) = &plan.description {
        println!("description: {}", desc);
    }
    println!("jobs: {}", plan.jobs.len());
    println!("server_starts: {}", plan.server_starts);
    for job in &plan.jobs {
        println!();
        println!("[{}] {}", job.index + 1, job.name);
        match (&job.plan, &job.error) {
            (Some(p), _) => {
                println!("  target: {} ({})", p.target.display_name(), p.mode.as_str());
                println!("  server: {}", server_action_label(&serde_json::to_value(job.server).unwrap_or_default()));
                if let Some(think) = p.think_mode {
                    println!("  think_mode: {}", think);
                }
                if p.invocations.is_empty() {
                    println!("  (no experiments)");
                }
                for inv in &p.invocations {
                    println!("  $ {}", inv.display());
                }
            }
            (None, Some(err)) => println!("  skipped: {}", err),
            (None, None) => println!("  skipped"),
        }
    }
}

fn server_action_label(action: &Value) -> String {
    let name = action["action"].as_str().unwrap_or("none");
    match action.get("previous").and_then(Value::as_u64) {
        Some(previous) => format!("{} (previous model {})", name, previous),
        None => name.to_string(),
    }
}

fn print_report_summary(report: &BatchReport, run_dir: Option<&PathBuf>) {
    println!("batch_id: {}", report.batch_id);
    if let Some(dir) = run_dir {
        println!("run_dir: {}", dir.display());
    }
    println!(
        "jobs: {}  completed: {}  failed: {}  skipped: {}",
        report.jobs.len(),
        report.count(JobStatus::Completed),
        report.count(JobStatus::Failed),
        report.count(JobStatus::Skipped)
    );
    for job in &report.jobs {
        if job.status == JobStatus::Completed {
            continue;
        }
        let reason = job.reason.as_deref().unwrap_or("driver failure");
        println!("  [{}] {}: {:?} ({})", job.index + 1, job.name, job.status, reason);
    }
    if report.aborted {
        println!("aborted: strict mode stopped the batch after a failed job");
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } => *json,
        Commands::Describe { json, .. } => *json,
        Commands::Models { json, .. } => *json,
    }
}
