use crate::settings::ModelEntry;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderEntry>,
}

/// Remote provider metadata read from `llm_providers.yaml`.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    providers: BTreeMap<String, ProviderEntry>,
}

impl ProviderCatalog {
    pub fn from_entries(providers: BTreeMap<String, ProviderEntry>) -> Self {
        Self { providers }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read provider config {}", path.display()))?;
        let file: ProvidersFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse provider config {}", path.display()))?;
        Ok(Self {
            providers: file.providers,
        })
    }

    /// An unreadable catalog degrades to empty lookups.
    pub fn load_or_empty(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "provider config unusable, continuing without it");
                Self::default()
            }
        }
    }

    /// `local_<name>` providers bind a registry model by its served name.
    pub fn default_model(
        &self,
        provider: &str,
        models: &BTreeMap<u32, ModelEntry>,
    ) -> Option<String> {
        if let Some(id) = provider.strip_prefix("local_") {
            if provider != "local_vllm" {
                let registry_hit = models
                    .iter()
                    .find(|(key, entry)| {
                        entry.name.eq_ignore_ascii_case(id) || key.to_string() == id
                    })
                    .map(|(_, entry)| entry.name.clone());
                if registry_hit.is_some() {
                    return registry_hit;
                }
            }
        }
        self.providers
            .get(provider)
            .and_then(|p| p.default_model.clone())
            .filter(|m| !m.trim().is_empty())
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    pub fn api_base(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .and_then(|p| p.api_base.as_deref())
            .filter(|b| !b.trim().is_empty())
    }
}

/// Qwen3 base builds take a thinking switch; Instruct builds do not.
pub fn model_supports_reasoning(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("qwen3") && !lower.contains("instruct")
}
