use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dio_connectors::{ConnectorKind, ConnectorSettings};
use dio_intel::LlmSettings;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/intel.yaml";
const MAX_COOLDOWN_HOURS: u64 = 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: ConnectorKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the key, never the key itself.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_results() -> usize {
    10
}

impl SourceConfig {
    pub fn connector_settings(&self, lookup: impl Fn(&str) -> Option<String>) -> ConnectorSettings {
        ConnectorSettings {
            source_id: self.source_id.clone(),
            kind: self.kind,
            base_url: self.base_url.clone(),
            api_key: self
                .api_key_env
                .as_deref()
                .and_then(|name| lookup(name))
                .filter(|key| !key.trim().is_empty()),
            max_results: self.max_results,
            fixture_dir: self.fixture_dir.clone(),
        }
    }
}

/// Which sources a due entity re-fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Only sources whose cooldown has elapsed.
    #[default]
    StaleOnly,
    /// Every enabled source once any one of them is due.
    AllSources,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntelConfig {
    pub sources: Vec<SourceConfig>,
    pub cooldown_hours: u64,
    pub refresh_policy: RefreshPolicy,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Entities researched at once per cycle; defaults to `batch_size`.
    pub research_concurrency: Option<usize>,
    pub connector_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub taxonomy: String,
    pub rules_path: Option<PathBuf>,
    pub industries_path: Option<PathBuf>,
    pub research_cron: String,
    pub scoring_cron: String,
    pub artifacts_dir: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub roster_path: PathBuf,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    #[serde(skip)]
    pub llm: LlmSettings,
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            cooldown_hours: 12,
            refresh_policy: RefreshPolicy::StaleOnly,
            batch_size: 5,
            batch_delay_ms: 1000,
            research_concurrency: None,
            connector_timeout_secs: 20,
            generation_timeout_secs: 30,
            taxonomy: "default".to_string(),
            rules_path: None,
            industries_path: None,
            research_cron: "0 0 */4 * * *".to_string(),
            scoring_cron: "0 30 6 * * *".to_string(),
            artifacts_dir: None,
            store_dir: PathBuf::from("./data/research"),
            roster_path: PathBuf::from("./data/roster.yaml"),
            user_agent: "dio-bot/0.1".to_string(),
            scheduler_enabled: false,
            llm: LlmSettings::default(),
        }
    }
}

impl IntelConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing intel config yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `DIO_CONFIG` (or `config/intel.yaml`) plus environment overrides.
    ///
    /// An explicitly named file must exist; a missing default file falls back to built-in defaults.
    pub async fn load() -> Result<Self> {
        let mut config = match std::env::var("DIO_CONFIG") {
            Ok(path) => Self::from_path(&path).await?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_path(DEFAULT_CONFIG_PATH).await?
            }
            Err(_) => {
                warn!(path = DEFAULT_CONFIG_PATH, "no config file found, using defaults with no sources");
                Self::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DIO_STORE_DIR") {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("DIO_ROSTER") {
            self.roster_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("DIO_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(agent) = lookup("DIO_USER_AGENT") {
            self.user_agent = agent;
        }
        self.llm.api_key = lookup("DIO_LLM_API_KEY").filter(|k| !k.trim().is_empty());
        if let Some(url) = lookup("DIO_LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("DIO_LLM_MODEL") {
            self.llm.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.research_concurrency == Some(0) {
            bail!("research_concurrency must be at least 1");
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("source {} is configured twice", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cooldown_hours.min(MAX_COOLDOWN_HOURS) as i64)
    }

    pub fn research_concurrency(&self) -> usize {
        self.research_concurrency.unwrap_or(self.batch_size).max(1)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
sources:
  - source_id: news
    kind: news
    api_key_env: NEWS_KEY
    max_results: 5
  - source_id: offline
    kind: fixture
    enabled: false
    fixture_dir: ./fixtures
cooldown_hours: 6
refresh_policy: all_sources
batch_size: 3
"#;

    #[test]
    fn yaml_fills_unset_fields_with_defaults() {
        let config = IntelConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.enabled_sources().count(), 1);
        assert_eq!(config.cooldown(), chrono::Duration::hours(6));
        assert_eq!(config.refresh_policy, RefreshPolicy::AllSources);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.research_concurrency(), 3);
        assert_eq!(config.batch_delay(), Duration::from_millis(1000));
        assert_eq!(config.generation_timeout(), Duration::from_secs(30));
        assert_eq!(config.taxonomy, "default");
        assert!(config.sources[0].enabled);
    }

    #[test]
    fn empty_yaml_matches_defaults() {
        let config = IntelConfig::from_yaml("{}").unwrap();
        assert_eq!(config.cooldown_hours, 12);
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.refresh_policy, RefreshPolicy::StaleOnly);
    }

    #[test]
    fn api_key_is_read_from_the_named_variable() {
        let config = IntelConfig::from_yaml(SAMPLE).unwrap();
        let env = HashMap::from([("NEWS_KEY", "k-123".to_string())]);
        let settings = config.sources[0].connector_settings(|name| env.get(name).cloned());
        assert_eq!(settings.api_key.as_deref(), Some("k-123"));
        assert_eq!(settings.max_results, 5);

        let unset = config.sources[0].connector_settings(|_| None);
        assert_eq!(unset.api_key, None);
    }

    #[test]
    fn environment_overrides_paths_scheduler_and_llm() {
        let mut config = IntelConfig::default();
        let env = HashMap::from([
            ("DIO_STORE_DIR", "/tmp/store".to_string()),
            ("DIO_SCHEDULER_ENABLED", "True".to_string()),
            ("DIO_LLM_API_KEY", "sk-test".to_string()),
            ("DIO_LLM_MODEL", "local-model".to_string()),
        ]);
        config.apply_overrides(|name| env.get(name).cloned());
        assert_eq!(config.store_dir, PathBuf::from("/tmp/store"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.base_url, dio_intel::DEFAULT_LLM_BASE_URL);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(IntelConfig::from_yaml("batch_size: 0").is_err());
        assert!(IntelConfig::from_yaml("research_concurrency: 0").is_err());
        let wide = IntelConfig::from_yaml("research_concurrency: 8").unwrap();
        assert_eq!(wide.research_concurrency(), 8);
        let dup = "sources:\n  - {source_id: a, kind: news}\n  - {source_id: a, kind: discussion}\n";
        assert!(IntelConfig::from_yaml(dup).is_err());
    }
}
