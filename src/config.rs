//! Configuration management
//!
//! All numeric thresholds the components use (similarity cutoff, observation
//! minimums, grace periods, score weights) live here as tunable settings
//! rather than constants.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::embeddings::EmbeddingConfig;
use crate::llm::LlmConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AceConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub refiner: RefinerConfig,
    #[serde(default)]
    pub reflector: ReflectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Bullet store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// How long pruned bullets stay queryable before physical compaction
    #[serde(default = "default_pruned_retention_secs")]
    pub pruned_retention_secs: u64,
    /// Page size used by the active-bullet scan cursor
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_database_path() -> PathBuf {
    data_dir().join("playbook.db")
}

fn default_pruned_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_scan_page_size() -> usize {
    256
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pruned_retention_secs: default_pruned_retention_secs(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

/// Retrieval scoring weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Weight of cosine similarity between query and bullet (w1)
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    /// Weight of the bullet's quality score (w2)
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    /// Weight of last-use recency (w3)
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    /// Half-life for recency decay, in seconds
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: u64,
}

fn default_similarity_weight() -> f64 {
    0.6
}

fn default_quality_weight() -> f64 {
    0.3
}

fn default_recency_weight() -> f64 {
    0.1
}

fn default_recency_half_life_secs() -> u64 {
    7 * 24 * 3600
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            quality_weight: default_quality_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_secs: default_recency_half_life_secs(),
        }
    }
}

/// Compaction pass settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerConfig {
    /// Cosine similarity at or above which two bullets are duplicates
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Minimum helpful + harmful observations before a bullet may be pruned
    #[serde(default = "default_min_observations")]
    pub min_observations: u32,
    /// Minimum age before a bullet may be pruned, in seconds
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Maximum active bullets per section; excess is evicted lowest-quality first
    #[serde(default = "default_section_ceiling")]
    pub section_ceiling: usize,
    /// Section size up to which duplicate pairing is brute-force O(n^2);
    /// larger sections go through hyperplane bucketing
    #[serde(default = "default_brute_force_limit")]
    pub brute_force_limit: usize,
    /// Number of hyperplanes for the bucketing signature
    #[serde(default = "default_lsh_planes")]
    pub lsh_planes: usize,
    /// Seed for the hyperplane generator, fixed so bucketing is reproducible
    #[serde(default = "default_lsh_seed")]
    pub lsh_seed: u64,
    /// Interval between scheduled refinement passes, in seconds
    #[serde(default = "default_refine_interval_secs")]
    pub interval_secs: u64,
}

fn default_similarity_threshold() -> f32 {
    0.92
}

fn default_min_observations() -> u32 {
    5
}

fn default_grace_period_secs() -> u64 {
    24 * 3600
}

fn default_section_ceiling() -> usize {
    500
}

fn default_brute_force_limit() -> usize {
    512
}

fn default_lsh_planes() -> usize {
    12
}

fn default_lsh_seed() -> u64 {
    0x5eed_ace0
}

fn default_refine_interval_secs() -> u64 {
    15 * 60
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_observations: default_min_observations(),
            grace_period_secs: default_grace_period_secs(),
            section_ceiling: default_section_ceiling(),
            brute_force_limit: default_brute_force_limit(),
            lsh_planes: default_lsh_planes(),
            lsh_seed: default_lsh_seed(),
            interval_secs: default_refine_interval_secs(),
        }
    }
}

/// Reflection loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorConfig {
    /// Hard upper bound on critique iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Cap on insights admitted from one reflection
    #[serde(default = "default_max_insights")]
    pub max_insights: usize,
    /// Token budget per reflection call
    #[serde(default = "default_reflect_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_insights() -> usize {
    10
}

fn default_reflect_max_tokens() -> u32 {
    1024
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_insights: default_max_insights(),
            max_tokens: default_reflect_max_tokens(),
        }
    }
}

/// Data directory for the playbook (database, config)
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ace-playbook")
}

/// Default config file location
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ace-playbook")
        .join("config.toml")
}

impl AceConfig {
    /// Load configuration from the given path, or the default location.
    /// A missing file yields the default configuration.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(config_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the given path, or the default location
    pub fn save(&self, path: Option<&std::path::Path>) -> Result<()> {
        let path = path.map(PathBuf::from).unwrap_or_else(config_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AceConfig::default();
        assert_eq!(config.refiner.similarity_threshold, 0.92);
        assert_eq!(config.refiner.min_observations, 5);
        assert_eq!(config.refiner.grace_period_secs, 24 * 3600);
        assert_eq!(config.reflector.max_iterations, 5);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = AceConfig::default();
        config.refiner.similarity_threshold = 0.88;
        config.retriever.similarity_weight = 0.5;

        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: AceConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.refiner.similarity_threshold, 0.88);
        assert_eq!(decoded.retriever.similarity_weight, 0.5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let decoded: AceConfig = toml::from_str("[refiner]\nmin_observations = 3\n").unwrap();
        assert_eq!(decoded.refiner.min_observations, 3);
        assert_eq!(decoded.refiner.similarity_threshold, 0.92);
        assert_eq!(decoded.reflector.max_iterations, 5);
    }
}
