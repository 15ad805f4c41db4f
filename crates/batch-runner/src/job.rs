use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    LocalVllm,
    Api,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::LocalVllm => "local_vllm",
            Mode::Api => "api",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkMode {
    Think,
    NoThink,
}

impl ThinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkMode::Think => "think",
            ThinkMode::NoThink => "no_think",
        }
    }
}

impl fmt::Display for ThinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a feature list: a 1-based table index or a feature name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureItem {
    Index(i64),
    Name(String),
}

/// `profile_features` / `env_features` as written in the batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureSpec {
    Keyword(String),
    List(Vec<FeatureItem>),
}

impl FeatureSpec {
    /// `None` means no filter. A keyword other than `all` is read as a
    /// comma-separated list.
    pub fn entries(&self) -> Option<Vec<FeatureItem>> {
        match self {
            FeatureSpec::Keyword(raw) if raw.trim().eq_ignore_ascii_case("all") => None,
            FeatureSpec::Keyword(raw) => Some(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| FeatureItem::Name(s.to_string()))
                    .collect(),
            ),
            FeatureSpec::List(items) => Some(items.clone()),
        }
    }
}

/// `sample_ratio` as handed to the driver. Quoted values pass through as
/// written; bare numbers keep their float form (`1.0`, `1e-5`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleRatio {
    Number(f64),
    Text(String),
}

impl SampleRatio {
    pub fn is_valid(&self) -> bool {
        match self {
            SampleRatio::Number(v) => v.is_finite(),
            SampleRatio::Text(s) => s.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false),
        }
    }
}

impl fmt::Display for SampleRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleRatio::Number(v) => write!(f, "{:?}", v),
            SampleRatio::Text(s) => f.write_str(s.trim()),
        }
    }
}

/// `sce_experiments` / `cex_experiments` as written in the batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExperimentSpec {
    Keyword(String),
    List(Vec<String>),
}

impl ExperimentSpec {
    pub fn expand(&self, all: &[String]) -> Vec<String> {
        match self {
            ExperimentSpec::Keyword(raw) if raw.trim().eq_ignore_ascii_case("all") => all.to_vec(),
            ExperimentSpec::Keyword(raw) => raw
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            ExperimentSpec::List(items) => items
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub mode: Mode,
    #[serde(default)]
    pub model_id: Option<u32>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub think_mode: Option<ThinkMode>,
    #[serde(default)]
    pub debug_limit: Option<u64>,
    #[serde(default)]
    pub profile_features: Option<FeatureSpec>,
    #[serde(default)]
    pub env_features: Option<FeatureSpec>,
    #[serde(default)]
    pub sample_ratio: Option<SampleRatio>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub sce_experiments: Option<ExperimentSpec>,
    #[serde(default)]
    pub cex_experiments: Option<ExperimentSpec>,
}

impl JobDescriptor {
    /// Explicit `suffix` wins; otherwise `No_<word>` in the name becomes
    /// `NO<word>`, with `_SEED<seed>` appended when a seed is set.
    pub fn effective_suffix(&self) -> Option<String> {
        if let Some(explicit) = &self.suffix {
            return Some(explicit.clone());
        }
        let feature = ablated_feature(self.name.as_deref()?)?;
        Some(match self.seed {
            Some(seed) => format!("NO{}_SEED{}", feature, seed),
            None => format!("NO{}", feature),
        })
    }
}

fn ablated_feature(name: &str) -> Option<&str> {
    let mut rest = name;
    while let Some(pos) = rest.find("No_") {
        let tail = &rest[pos + 3..];
        let end = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        if end > 0 {
            return Some(&tail[..end]);
        }
        rest = tail;
    }
    None
}

/// A job entry as loaded. Entries that do not deserialize are kept so the
/// loop can report and skip them at their position.
#[derive(Debug, Clone)]
pub struct LoadedJob {
    pub index: usize,
    pub name: String,
    pub descriptor: Result<JobDescriptor, String>,
}

#[derive(Debug, Clone)]
pub struct BatchFile {
    pub path: PathBuf,
    pub description: Option<String>,
    pub jobs: Vec<LoadedJob>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    jobs: Option<Vec<serde_yaml::Value>>,
}

pub fn load_batch(path: &Path) -> Result<BatchFile, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let raw_yaml = fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
    parse_batch(path, &raw_yaml)
}

pub fn parse_batch(path: &Path, raw_yaml: &str) -> Result<BatchFile, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(raw_yaml).map_err(|e| parse_err(e.to_string()))?;
    let raw: serde_json::Value =
        serde_json::to_value(&yaml_value).map_err(|e| parse_err(e.to_string()))?;
    let batch: RawBatch =
        serde_yaml::from_value(yaml_value).map_err(|e| parse_err(e.to_string()))?;

    let entries = batch.jobs.unwrap_or_default();
    if entries.is_empty() {
        return Err(ConfigError::NoJobs(path.to_path_buf()));
    }

    let jobs = entries
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let name = value
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("job_{}", index + 1));
            let descriptor = serde_yaml::from_value::<JobDescriptor>(value).map_err(|e| e.to_string());
            LoadedJob {
                index,
                name,
                descriptor,
            }
        })
        .collect();

    Ok(BatchFile {
        path: path.to_path_buf(),
        description: batch.description,
        jobs,
        raw,
    })
}
