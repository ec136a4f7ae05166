use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level runtime configuration, loaded from `<config_root>/config.yaml`.
/// Every field has a default so a missing file yields a working runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub skills_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub router: RouterConfig,
    pub swarm: SwarmConfig,
    pub indexer: IndexerConfig,
    pub ooda: OodaConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            skills_dir: PathBuf::from("./skills"),
            cache_dir: default_cache_dir(),
            embedding: EmbeddingConfig::default(),
            router: RouterConfig::default(),
            swarm: SwarmConfig::default(),
            indexer: IndexerConfig::default(),
            ooda: OodaConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".omnihive")
        .join("cache")
}

/// Resolve the config root: `PRJ_CONFIG_HOME` wins, then `~/.omnihive`.
pub fn config_root() -> PathBuf {
    if let Some(root) = std::env::var_os("PRJ_CONFIG_HOME") {
        return PathBuf::from(root);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".omnihive")
}

impl RuntimeConfig {
    /// Load config from `<root>/config.yaml`, falling back to defaults
    /// when the file does not exist. Malformed YAML and malformed
    /// confidence profiles are startup errors.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.yaml");
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(model) = std::env::var("OMNI_EMBEDDING_MODEL") {
            if !model.is_empty() {
                config.embedding.model = model;
            }
        }

        config.router.validate()?;
        Ok(config)
    }

    /// Path of the single SQLite file holding vector + checkpoint tables.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("omnihive.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `openai` | `ollama` | `hash`
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            timeout_secs: 30,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub translation_enabled: bool,
    pub default_threshold: f64,
    pub default_limit: usize,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub rrf_k: f64,
    pub adaptive_threshold_step: f64,
    pub adaptive_max_attempts: usize,
    pub active_profile: String,
    pub cache_ttl_secs: u64,
    pub cache_enabled: bool,
    pub profiles: HashMap<String, ConfidenceProfile>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("balanced".to_string(), ConfidenceProfile::balanced());
        Self {
            translation_enabled: true,
            default_threshold: 0.30,
            default_limit: 5,
            semantic_weight: 1.0,
            keyword_weight: 1.5,
            rrf_k: 60.0,
            adaptive_threshold_step: 0.1,
            adaptive_max_attempts: 2,
            active_profile: "balanced".into(),
            cache_ttl_secs: 30,
            cache_enabled: true,
            profiles,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            anyhow::bail!("router.profiles must define at least one profile");
        }
        if !self.profiles.contains_key(&self.active_profile) {
            anyhow::bail!("router.active_profile {:?} is not defined", self.active_profile);
        }
        for (name, profile) in &self.profiles {
            profile
                .validate()
                .with_context(|| format!("router profile {name:?}"))?;
        }
        Ok(())
    }

    pub fn active_confidence_profile(&self) -> &ConfidenceProfile {
        // validate() guarantees presence.
        &self.profiles[&self.active_profile]
    }
}

/// Named mapping from fused score to confidence label and displayed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceProfile {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub high_base: f64,
    pub high_scale: f64,
    pub high_cap: f64,
    pub medium_base: f64,
    pub medium_scale: f64,
    pub medium_cap: f64,
    pub low_floor: f64,
}

impl ConfidenceProfile {
    pub fn balanced() -> Self {
        Self {
            high_threshold: 0.75,
            medium_threshold: 0.50,
            high_base: 0.90,
            high_scale: 0.05,
            high_cap: 0.99,
            medium_base: 0.60,
            medium_scale: 0.30,
            medium_cap: 0.89,
            low_floor: 0.10,
        }
    }

    /// Thresholds must be strictly decreasing and caps never exceed 1.0.
    pub fn validate(&self) -> Result<()> {
        if self.high_threshold <= self.medium_threshold {
            anyhow::bail!(
                "high_threshold ({}) must be greater than medium_threshold ({})",
                self.high_threshold,
                self.medium_threshold
            );
        }
        if self.medium_threshold <= self.low_floor {
            anyhow::bail!(
                "medium_threshold ({}) must be greater than low_floor ({})",
                self.medium_threshold,
                self.low_floor
            );
        }
        if self.high_cap > 1.0 || self.medium_cap > 1.0 {
            anyhow::bail!("confidence caps must not exceed 1.0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub connect_timeout_secs: u64,
    pub execute_timeout_secs: u64,
    pub max_retries: usize,
    pub circuit_cooldown_secs: u64,
    /// Worker scripts keyed by node name.
    pub nodes: HashMap<String, PathBuf>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            execute_timeout_secs: 120,
            max_retries: 2,
            circuit_cooldown_secs: 30,
            nodes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub debounce_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OodaConfig {
    pub max_steps: usize,
    pub retained_turns: usize,
    pub max_context_tokens: usize,
    pub llm_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub recall_limit: usize,
}

impl Default for OodaConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            retained_turns: 10,
            max_context_tokens: 32_000,
            llm_timeout_secs: 60,
            tool_timeout_secs: 60,
            recall_limit: 3,
        }
    }
}
