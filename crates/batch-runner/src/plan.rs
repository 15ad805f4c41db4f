//! Turns one job descriptor into the concrete driver invocations it implies.
//!
//! Planning is pure: it touches neither processes nor the filesystem, so the
//! same plan backs both `describe` and `run`.

use crate::error::JobError;
use crate::features::{resolve_features, FeatureFilter};
use crate::job::{JobDescriptor, Mode, ThinkMode};
use crate::provider::{model_supports_reasoning, ProviderCatalog};
use crate::settings::{Dataset, RunnerSettings};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const LOCAL_PROVIDER: &str = "local_vllm";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Local {
        model_id: u32,
        model_name: String,
    },
    Api {
        provider: String,
        model_name: Option<String>,
    },
}

impl Target {
    pub fn provider_arg(&self) -> &str {
        match self {
            Target::Local { .. } => LOCAL_PROVIDER,
            Target::Api { provider, .. } => provider,
        }
    }

    /// Name used in log file names.
    pub fn display_name(&self) -> &str {
        match self {
            Target::Local { model_name, .. } => model_name,
            Target::Api {
                provider,
                model_name,
            } => model_name.as_deref().unwrap_or(provider),
        }
    }

    pub fn model_id(&self) -> Option<u32> {
        match self {
            Target::Local { model_id, .. } => Some(*model_id),
            Target::Api { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverInvocation {
    pub dataset: Dataset,
    pub experiment: String,
    pub program: String,
    pub args: Vec<String>,
    /// `<experiment>_<safe model name>[_<think mode>]`
    pub log_stem: String,
}

impl DriverInvocation {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn display(&self) -> String {
        shell_join(&self.argv())
    }

    pub fn log_path(&self, log_root: &Path, timestamp: &str) -> PathBuf {
        log_root
            .join(self.dataset.as_str())
            .join(format!("{}_{}.log", timestamp, self.log_stem))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPlan {
    pub index: usize,
    pub name: String,
    pub mode: Mode,
    pub target: Target,
    pub think_mode: Option<ThinkMode>,
    pub datasets: Vec<Dataset>,
    pub invocations: Vec<DriverInvocation>,
}

/// Ordered flag/value pairs for one driver command line.
#[derive(Debug, Default)]
struct ArgList {
    args: Vec<String>,
}

impl ArgList {
    fn flag(&mut self, name: &str, value: impl ToString) -> &mut Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    fn flag_opt<T: ToString>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        if let Some(v) = value {
            self.flag(name, v);
        }
        self
    }
}

pub fn plan_job(
    index: usize,
    name: &str,
    job: &JobDescriptor,
    settings: &RunnerSettings,
    catalog: &ProviderCatalog,
) -> Result<JobPlan, JobError> {
    let (target, reasoning) = resolve_target(job, settings, catalog)?;
    if let Some(ratio) = job.sample_ratio.as_ref().filter(|r| !r.is_valid()) {
        return Err(JobError::malformed(format!("sample_ratio {} is not a number", ratio)));
    }
    let think_mode = job.think_mode.filter(|_| reasoning);
    let suffix = job.effective_suffix();
    let safe_name = sanitize_name(target.display_name());

    let mut datasets = Vec::new();
    let mut invocations = Vec::new();
    for dataset in Dataset::ALL {
        let spec = match dataset {
            Dataset::Sce => job.sce_experiments.as_ref(),
            Dataset::Cex => job.cex_experiments.as_ref(),
        };
        let ds = settings
            .dataset(dataset)
            .map_err(|e| JobError::malformed(e.to_string()))?;
        let experiments = spec.map(|s| s.expand(&ds.experiments)).unwrap_or_default();
        if experiments.is_empty() {
            continue;
        }
        let (program, driver_args) = ds.driver.split_first().ok_or_else(|| {
            JobError::malformed(format!("driver command for {} is empty", dataset.as_str()))
        })?;
        datasets.push(dataset);

        let profile = resolve_features(job.profile_features.as_ref(), &ds.profile_features);
        let env = resolve_features(job.env_features.as_ref(), &ds.env_features);

        for experiment in experiments {
            let args = driver_args_for(
                driver_args,
                &experiment,
                &target,
                think_mode,
                job,
                &profile,
                &env,
                suffix.as_deref(),
            );
            let log_stem = match think_mode {
                Some(t) => format!("{}_{}_{}", experiment, safe_name, t.as_str()),
                None => format!("{}_{}", experiment, safe_name),
            };
            invocations.push(DriverInvocation {
                dataset,
                experiment,
                program: program.clone(),
                args,
                log_stem,
            });
        }
    }

    Ok(JobPlan {
        index,
        name: name.to_string(),
        mode: job.mode,
        target,
        think_mode,
        datasets,
        invocations,
    })
}

fn resolve_target(
    job: &JobDescriptor,
    settings: &RunnerSettings,
    catalog: &ProviderCatalog,
) -> Result<(Target, bool), JobError> {
    match job.mode {
        Mode::LocalVllm => {
            let model_id = job
                .model_id
                .ok_or_else(|| JobError::malformed("local_vllm job without model_id"))?;
            let entry = settings
                .model(model_id)
                .ok_or_else(|| JobError::malformed(format!("unknown model_id {}", model_id)))?;
            Ok((
                Target::Local {
                    model_id,
                    model_name: entry.name.clone(),
                },
                entry.reasoning,
            ))
        }
        Mode::Api => {
            let provider = job
                .provider
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| JobError::malformed("api job without provider"))?
                .to_string();
            let model_name = catalog.default_model(&provider, &settings.models);
            let reasoning = model_name
                .as_deref()
                .map(model_supports_reasoning)
                .unwrap_or(false);
            Ok((
                Target::Api {
                    provider,
                    model_name,
                },
                reasoning,
            ))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn driver_args_for(
    driver_args: &[String],
    experiment: &str,
    target: &Target,
    think_mode: Option<ThinkMode>,
    job: &JobDescriptor,
    profile: &FeatureFilter,
    env: &FeatureFilter,
    suffix: Option<&str>,
) -> Vec<String> {
    let mut list = ArgList {
        args: driver_args.to_vec(),
    };
    list.flag("--experiment", experiment)
        .flag("--provider", target.provider_arg())
        .flag_opt("--think-mode", think_mode.map(|t| t.as_str()))
        .flag_opt("--debug-limit", job.debug_limit.filter(|n| *n > 0))
        .flag_opt("--profile-features", profile.flag_value())
        .flag_opt("--env-features", env.flag_value());
    if let Some(ratio) = &job.sample_ratio {
        list.flag("--sample-ratio", ratio).flag_opt("--seed", job.seed);
    }
    list.flag_opt("--output-dir", job.output_dir.as_deref())
        .flag_opt("--suffix", suffix);
    list.args
}

/// Path separators and whitespace become `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() {
                '-'
            } else {
                c
            }
        })
        .collect()
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:,=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
