//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::policy::{
    BanditPolicy, LinearConfig, LinearPolicy, PolicyFactory, PolicyKind, ThompsonConfig,
    ThompsonPolicy, TreeConfig, TreePolicy,
};
use crate::routing::RouterConfig;

/// Switchyard configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub linear: LinearConfig,
    pub tree: TreeSettings,
    pub thompson: ThompsonConfig,
    pub router: RouterConfig,
}

/// Tree growth limits plus the policy its leaves run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSettings {
    pub max_depth: usize,
    pub min_samples_split: u64,
    pub split_variance_threshold: f64,
    pub leaf_policy: PolicyKind,
}

impl Default for TreeSettings {
    fn default() -> Self {
        let limits = TreeConfig::default();
        Self {
            max_depth: limits.max_depth,
            min_samples_split: limits.min_samples_split,
            split_variance_threshold: limits.split_variance_threshold,
            leaf_policy: PolicyKind::Thompson,
        }
    }
}

impl TreeSettings {
    /// Growth limits handed to [`TreePolicy`]
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            split_variance_threshold: self.split_variance_threshold,
        }
    }
}

const KEYS: [&str; 14] = [
    "linear.alpha",
    "linear.dim",
    "linear.learning_rate",
    "linear.step_cap",
    "tree.max_depth",
    "tree.min_samples_split",
    "tree.split_variance_threshold",
    "tree.leaf_policy",
    "thompson.exploration_factor",
    "router.policy",
    "router.snapshot_name",
    "router.snapshot_dir",
    "router.max_pending_decisions",
    "router.persist_on_outcome",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SWITCHYARD_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("switchyard")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or default if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| {
                format!("Failed to create config directory: {}", dir.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.linear.alpha.is_nan() || self.linear.alpha < 0.0 {
            return Err(anyhow!("linear.alpha must be non-negative"));
        }
        if self.linear.dim == 0 {
            return Err(anyhow!("linear.dim must be at least 1"));
        }
        if self.linear.learning_rate.is_nan() || self.linear.learning_rate <= 0.0 {
            return Err(anyhow!("linear.learning_rate must be positive"));
        }
        if self.tree.min_samples_split == 0 {
            return Err(anyhow!("tree.min_samples_split must be at least 1"));
        }
        if self.tree.split_variance_threshold.is_nan() || self.tree.split_variance_threshold < 0.0 {
            return Err(anyhow!("tree.split_variance_threshold must be non-negative"));
        }
        if self.tree.leaf_policy == PolicyKind::Tree {
            return Err(anyhow!("tree.leaf_policy cannot be tree"));
        }
        if self.thompson.exploration_factor.is_nan() || self.thompson.exploration_factor < 0.1 {
            return Err(anyhow!("thompson.exploration_factor must be at least 0.1"));
        }
        if self.router.max_pending_decisions == 0 {
            return Err(anyhow!("router.max_pending_decisions must be at least 1"));
        }
        if !valid_snapshot_name(&self.router.snapshot_name) {
            return Err(anyhow!(
                "router.snapshot_name must be a plain file name: {}",
                self.router.snapshot_name
            ));
        }
        Ok(())
    }

    /// Directory snapshots are written to
    pub fn snapshot_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.router.snapshot_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("snapshots")),
        }
    }

    /// Build the policy selected by `router.policy`
    pub fn build_policy(&self) -> Box<dyn BanditPolicy> {
        self.build(self.router.policy, None)
    }

    /// Build a policy of `kind` whose randomness is derived from `seed`
    pub fn build_seeded(&self, kind: PolicyKind, seed: u64) -> Box<dyn BanditPolicy> {
        self.build(kind, Some(seed))
    }

    /// Factory for the leaves of a tree policy
    pub fn leaf_factory(&self) -> PolicyFactory {
        self.leaf_factory_with(None)
    }

    fn build(&self, kind: PolicyKind, seed: Option<u64>) -> Box<dyn BanditPolicy> {
        match (kind, seed) {
            (PolicyKind::Linear, _) => Box::new(LinearPolicy::new(self.linear)),
            (PolicyKind::Thompson, None) => Box::new(ThompsonPolicy::new(self.thompson)),
            (PolicyKind::Thompson, Some(seed)) => {
                Box::new(ThompsonPolicy::with_seed(self.thompson, seed))
            }
            (PolicyKind::Tree, None) => Box::new(TreePolicy::new(
                self.tree.tree_config(),
                self.leaf_factory(),
            )),
            (PolicyKind::Tree, Some(seed)) => Box::new(TreePolicy::with_seed(
                self.tree.tree_config(),
                self.leaf_factory_with(Some(seed.wrapping_add(1))),
                seed,
            )),
        }
    }

    fn leaf_factory_with(&self, seed: Option<u64>) -> PolicyFactory {
        match self.tree.leaf_policy {
            PolicyKind::Linear => {
                let linear = self.linear;
                Arc::new(move || Box::new(LinearPolicy::new(linear)) as Box<dyn BanditPolicy>)
            }
            // Trees never nest; validate rejects it and Thompson is the fallback
            PolicyKind::Thompson | PolicyKind::Tree => {
                let thompson = self.thompson;
                match seed {
                    None => Arc::new(move || {
                        Box::new(ThompsonPolicy::new(thompson)) as Box<dyn BanditPolicy>
                    }),
                    Some(seed) => {
                        let next = Arc::new(AtomicU64::new(seed));
                        Arc::new(move || {
                            let seed = next.fetch_add(1, Ordering::Relaxed);
                            Box::new(ThompsonPolicy::with_seed(thompson, seed))
                                as Box<dyn BanditPolicy>
                        })
                    }
                }
            }
        }
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "linear.alpha" => Ok(self.linear.alpha.to_string()),
            "linear.dim" => Ok(self.linear.dim.to_string()),
            "linear.learning_rate" => Ok(self.linear.learning_rate.to_string()),
            "linear.step_cap" => Ok(self.linear.step_cap.to_string()),

            "tree.max_depth" => Ok(self.tree.max_depth.to_string()),
            "tree.min_samples_split" => Ok(self.tree.min_samples_split.to_string()),
            "tree.split_variance_threshold" => Ok(self.tree.split_variance_threshold.to_string()),
            "tree.leaf_policy" => Ok(self.tree.leaf_policy.to_string()),

            "thompson.exploration_factor" => Ok(self.thompson.exploration_factor.to_string()),

            "router.policy" => Ok(self.router.policy.to_string()),
            "router.snapshot_name" => Ok(self.router.snapshot_name.clone()),
            "router.snapshot_dir" => Ok(match &self.router.snapshot_dir {
                Some(dir) => dir.display().to_string(),
                None => "(default - <config dir>/snapshots)".to_string(),
            }),
            "router.max_pending_decisions" => Ok(self.router.max_pending_decisions.to_string()),
            "router.persist_on_outcome" => Ok(self.router.persist_on_outcome.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `switchyard config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "linear.alpha" => {
                let alpha: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid alpha value: {}", value))?;
                if alpha.is_nan() || alpha < 0.0 {
                    return Err(anyhow!("Alpha must be non-negative"));
                }
                self.linear.alpha = alpha;
            }
            "linear.dim" => {
                let dim: usize = value
                    .parse()
                    .with_context(|| format!("Invalid dim value: {}", value))?;
                if dim == 0 {
                    return Err(anyhow!("Dimension must be at least 1"));
                }
                self.linear.dim = dim;
            }
            "linear.learning_rate" => {
                let rate: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid learning_rate value: {}", value))?;
                if !(0.0..=1.0).contains(&rate) || rate == 0.0 {
                    return Err(anyhow!("Learning rate must be in (0.0, 1.0]"));
                }
                self.linear.learning_rate = rate;
            }
            "linear.step_cap" => {
                self.linear.step_cap = value
                    .parse()
                    .with_context(|| format!("Invalid step_cap value: {}", value))?;
            }

            "tree.max_depth" => {
                self.tree.max_depth = value
                    .parse()
                    .with_context(|| format!("Invalid max_depth value: {}", value))?;
            }
            "tree.min_samples_split" => {
                let samples: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid min_samples_split value: {}", value))?;
                if samples == 0 {
                    return Err(anyhow!("min_samples_split must be at least 1"));
                }
                self.tree.min_samples_split = samples;
            }
            "tree.split_variance_threshold" => {
                let threshold: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid split_variance_threshold value: {}", value))?;
                if threshold.is_nan() || threshold < 0.0 {
                    return Err(anyhow!("Split variance threshold must be non-negative"));
                }
                self.tree.split_variance_threshold = threshold;
            }
            "tree.leaf_policy" => {
                let kind: PolicyKind = value.parse().map_err(|e: String| anyhow!(e))?;
                if kind == PolicyKind::Tree {
                    return Err(anyhow!(
                        "Invalid leaf policy: tree. Valid options: linear, thompson"
                    ));
                }
                self.tree.leaf_policy = kind;
            }

            "thompson.exploration_factor" => {
                let factor: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid exploration_factor value: {}", value))?;
                if factor.is_nan() || factor < 0.1 {
                    return Err(anyhow!("Exploration factor must be at least 0.1"));
                }
                self.thompson.exploration_factor = factor;
            }

            "router.policy" => {
                self.router.policy = value.parse().map_err(|e: String| {
                    anyhow!("{}. Valid options: linear, thompson, tree", e)
                })?;
            }
            "router.snapshot_name" => {
                if !valid_snapshot_name(value) {
                    return Err(anyhow!("Snapshot name must be a plain file name: {}", value));
                }
                self.router.snapshot_name = value.to_string();
            }
            "router.snapshot_dir" => {
                self.router.snapshot_dir = if value.trim().is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "router.max_pending_decisions" => {
                let max: usize = value
                    .parse()
                    .with_context(|| format!("Invalid max_pending_decisions value: {}", value))?;
                if max == 0 {
                    return Err(anyhow!("max_pending_decisions must be at least 1"));
                }
                self.router.max_pending_decisions = max;
            }
            "router.persist_on_outcome" => {
                self.router.persist_on_outcome = value
                    .parse()
                    .with_context(|| format!("Invalid persist_on_outcome value: {}", value))?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `switchyard config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

/// Whether `name` can be used as a snapshot file stem
pub(crate) fn valid_snapshot_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
