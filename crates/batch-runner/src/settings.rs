//! Runner settings: where things live, how the server is launched, and the
//! fixed registries (models, dataset experiment lists, feature tables).
//!
//! Every field has a default, so an absent settings file is equivalent to an
//! empty one.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Sce,
    Cex,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::Sce, Dataset::Cex];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Sce => "sce",
            Dataset::Cex => "cex",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSettings {
    pub driver: Vec<String>,
    pub experiments: Vec<String>,
    pub profile_features: Vec<String>,
    pub env_features: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DatasetOverlay {
    driver: Option<Vec<String>>,
    experiments: Option<Vec<String>>,
    profile_features: Option<Vec<String>>,
    env_features: Option<Vec<String>>,
}

impl DatasetSettings {
    fn apply(&mut self, overlay: DatasetOverlay) {
        if let Some(v) = overlay.driver {
            self.driver = v;
        }
        if let Some(v) = overlay.experiments {
            self.experiments = v;
        }
        if let Some(v) = overlay.profile_features {
            self.profile_features = v;
        }
        if let Some(v) = overlay.env_features {
            self.env_features = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub launch: Vec<String>,
    pub readiness_markers: Vec<String>,
    pub readiness_timeout_secs: u64,
    pub drain_secs: u64,
    pub health_url: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            launch: strings(&["python", "server/launch_model.py"]),
            readiness_markers: strings(&["Application startup complete", "Uvicorn running on"]),
            readiness_timeout_secs: 300,
            drain_secs: 10,
            health_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerSettings {
    pub project_root: PathBuf,
    pub log_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub providers_file: PathBuf,
    pub server: ServerSettings,
    pub models: BTreeMap<u32, ModelEntry>,
    pub datasets: BTreeMap<Dataset, DatasetSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    project_root: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    runs_dir: Option<PathBuf>,
    providers_file: Option<PathBuf>,
    server: Option<ServerSettings>,
    models: Option<BTreeMap<u32, ModelEntry>>,
    #[serde(default)]
    datasets: BTreeMap<Dataset, DatasetOverlay>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            runs_dir: PathBuf::from("runs"),
            providers_file: PathBuf::from("server/config/llm_providers.yaml"),
            server: ServerSettings::default(),
            models: default_models(),
            datasets: Dataset::ALL
                .iter()
                .map(|d| (*d, default_dataset(*d)))
                .collect(),
        }
    }
}

impl RunnerSettings {
    /// Reads a settings file on top of the defaults. Dataset entries are
    /// merged field by field; a `models` table replaces the built-in registry.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        let file: SettingsFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse settings {}", path.display()))?;

        let mut settings = Self::default();
        if let Some(v) = file.project_root {
            settings.project_root = v;
        }
        if let Some(v) = file.log_dir {
            settings.log_dir = v;
        }
        if let Some(v) = file.runs_dir {
            settings.runs_dir = v;
        }
        if let Some(v) = file.providers_file {
            settings.providers_file = v;
        }
        if let Some(v) = file.server {
            settings.server = v;
        }
        if let Some(models) = file.models.filter(|m| !m.is_empty()) {
            settings.models = models;
        }
        for (dataset, overlay) in file.datasets {
            settings
                .datasets
                .entry(dataset)
                .or_insert_with(|| default_dataset(dataset))
                .apply(overlay);
        }
        Ok(settings)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn dataset(&self, dataset: Dataset) -> Result<&DatasetSettings> {
        self.datasets
            .get(&dataset)
            .ok_or_else(|| anyhow!("no settings for dataset {}", dataset.as_str()))
    }

    pub fn model(&self, model_id: u32) -> Option<&ModelEntry> {
        self.models.get(&model_id)
    }

    /// Relative paths are taken from the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn log_root(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn runs_root(&self) -> PathBuf {
        self.resolve(&self.runs_dir)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_models() -> BTreeMap<u32, ModelEntry> {
    [
        (1, "Meta-Llama-3.1-70B-bnb-4bit", false),
        (2, "Meta-Llama-3.1-70B-Instruct-bnb-4bit", false),
        (3, "Qwen3-30B-A3B-FP8", true),
        (4, "Qwen3-30B-A3B-Instruct-2507-FP8", false),
        (5, "Qwen3-0.6B", true),
        (6, "Meta-Llama-3.1-70B-Instruct-GPTQ-INT4", false),
    ]
    .into_iter()
    .map(|(key, name, reasoning)| {
        (
            key,
            ModelEntry {
                name: name.to_string(),
                reasoning,
            },
        )
    })
    .collect()
}

fn default_dataset(dataset: Dataset) -> DatasetSettings {
    match dataset {
        Dataset::Sce => DatasetSettings {
            driver: strings(&["python", "sce/main.py"]),
            experiments: strings(&["credit", "spending", "labor"]),
            profile_features: strings(&[
                "age",
                "gender",
                "education",
                "marital_status",
                "state_residence",
                "housing_status",
                "own_other_home",
                "health_status",
                "employment_status",
                "income",
            ]),
            env_features: strings(&["inflation", "unemployment", "interest_rate"]),
        },
        Dataset::Cex => DatasetSettings {
            driver: strings(&["python", "cex/main.py"]),
            experiments: strings(&["spending", "saving"]),
            profile_features: strings(&[
                "age",
                "sex",
                "education",
                "marital_status",
                "region",
                "family_size",
                "housing_tenure",
                "earners",
                "income",
            ]),
            env_features: strings(&["inflation", "unemployment", "interest_rate"]),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn default_registry_flags_reasoning_models() {
        let settings = RunnerSettings::default();
        let reasoning: Vec<u32> = settings
            .models
            .iter()
            .filter(|(_, m)| m.reasoning)
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(reasoning, vec![3, 5]);
        assert_eq!(settings.models.len(), 6);
    }

    #[test]
    fn default_sce_tables_match_survey_layout() {
        let settings = RunnerSettings::default();
        let sce = settings.dataset(Dataset::Sce).expect("sce");
        assert_eq!(sce.experiments, vec!["credit", "spending", "labor"]);
        assert_eq!(sce.profile_features.len(), 10);
        assert_eq!(sce.profile_features[4], "state_residence");
        assert_eq!(sce.env_features, vec!["inflation", "unemployment", "interest_rate"]);
    }

    #[test]
    fn partial_settings_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "batch_settings_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("settings.yaml");
        fs::write(
            &path,
            "project_root: /srv/econ\nserver:\n  drain_secs: 2\ndatasets:\n  cex:\n    experiments: [durables]\n",
        )
        .expect("write settings");

        let settings = RunnerSettings::load(&path).expect("load");
        assert_eq!(settings.project_root, PathBuf::from("/srv/econ"));
        assert_eq!(settings.server.drain_secs, 2);
        assert_eq!(settings.server.readiness_timeout_secs, 300);
        assert_eq!(settings.dataset(Dataset::Cex).unwrap().experiments, vec!["durables"]);
        assert_eq!(settings.dataset(Dataset::Sce).unwrap().experiments.len(), 3);
        assert_eq!(settings.models.len(), 6);
        assert_eq!(settings.log_root(), PathBuf::from("/srv/econ/logs"));
        let _ = fs::remove_dir_all(dir);
    }
}
