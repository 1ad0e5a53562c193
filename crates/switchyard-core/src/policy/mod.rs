//! Bandit policies and the contract they share
//!
//! Every policy implements [`BanditPolicy`]: pick an action for a context
//! from a non-empty candidate list, learn from the observed reward, and
//! round-trip its complete state through [`PolicyState`].
//!
//! - [`LinearPolicy`]: per-action linear reward model with a variance-based
//!   confidence bonus and an importance-weighted update path.
//! - [`TreePolicy`]: partitions the context space and gives every region its
//!   own sub-policy, built by an injected [`PolicyFactory`].
//! - [`ThompsonPolicy`]: Beta-Bernoulli Thompson Sampling, the default leaf.

mod linear;
mod thompson;
mod tree;

pub use linear::{LinearConfig, LinearPolicy, LinearState, RewardModel};
pub use thompson::{ArmState, ThompsonConfig, ThompsonPolicy, ThompsonState};
pub use tree::{HistoryEntry, NodeState, Split, TreeConfig, TreePolicy, TreeState};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::features::Context;

/// Identifier of a routing candidate
pub type Action = String;

/// Highest state version this build understands
pub const STATE_VERSION: u32 = 1;

/// Builds a fresh policy for a new tree leaf
pub type PolicyFactory = Arc<dyn Fn() -> Box<dyn BanditPolicy> + Send + Sync>;

/// Contract shared by all bandit policies
pub trait BanditPolicy: fmt::Debug + Send + Sync {
    /// Choose one of `candidates` for `context`
    ///
    /// Fails with [`Error::InvalidArgument`] when `candidates` is empty.
    fn recommend(&mut self, context: &Context, candidates: &[Action]) -> Result<Action>;

    /// Learn from the reward observed after taking `action` in `context`
    fn update(&mut self, action: &str, reward: f64, context: &Context);

    /// Learn from an observation collected under a different policy
    ///
    /// Policies without an off-policy correction treat it as a plain update.
    fn update_with_importance_weight(
        &mut self,
        action: &str,
        reward: f64,
        context: &Context,
        weight: f64,
    ) {
        let _ = weight;
        self.update(action, reward, context);
    }

    /// Export the complete learned state
    fn export_state(&self) -> PolicyState;

    /// Replace the complete learned state
    ///
    /// A state newer than [`STATE_VERSION`] is ignored without error.
    fn import_state(&mut self, state: PolicyState) -> Result<()>;

    /// Per-action visit counts and average rewards
    fn counters(&self) -> &ActionCounters;

    /// Which concrete policy this is
    fn kind(&self) -> PolicyKind;
}

/// Concrete policy types that can be persisted and rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Linear confidence-bound policy
    Linear,
    /// Thompson Sampling policy
    Thompson,
    /// Partitioning tree policy
    Tree,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Thompson => write!(f, "thompson"),
            Self::Tree => write!(f, "tree"),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "thompson" => Ok(Self::Thompson),
            "tree" => Ok(Self::Tree),
            _ => Err(format!("Unknown policy kind: {}", s)),
        }
    }
}

/// Persisted state of any policy, tagged with its concrete type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyState {
    Linear(LinearState),
    Thompson(ThompsonState),
    Tree(TreeState),
}

impl PolicyState {
    /// Which policy type this state belongs to
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Linear(_) => PolicyKind::Linear,
            Self::Thompson(_) => PolicyKind::Thompson,
            Self::Tree(_) => PolicyKind::Tree,
        }
    }

    /// Format version recorded in the state
    pub fn version(&self) -> u32 {
        match self {
            Self::Linear(s) => s.version,
            Self::Thompson(s) => s.version,
            Self::Tree(s) => s.version,
        }
    }

    /// Whether this build can read the state
    pub fn is_supported(&self) -> bool {
        self.version() <= STATE_VERSION
    }

    /// Compatibility counters carried by the state
    pub fn counters(&self) -> &ActionCounters {
        match self {
            Self::Linear(s) => &s.counters,
            Self::Thompson(s) => &s.counters,
            Self::Tree(s) => &s.counters,
        }
    }
}

/// Rebuild a policy from persisted state
///
/// The factory is tried first so injected configuration survives a restore;
/// when it builds a different kind the tag decides what gets constructed.
pub fn restore_policy(state: PolicyState, factory: &PolicyFactory) -> Result<Box<dyn BanditPolicy>> {
    let mut policy = factory();
    if policy.kind() != state.kind() {
        policy = match state.kind() {
            PolicyKind::Linear => Box::new(LinearPolicy::default()),
            PolicyKind::Thompson => Box::new(ThompsonPolicy::default()),
            PolicyKind::Tree => Box::new(TreePolicy::new(TreeConfig::default(), factory.clone())),
        };
    }
    policy.import_state(state)?;
    Ok(policy)
}

/// Reject an empty candidate list
pub(crate) fn require_candidates(candidates: &[Action]) -> Result<()> {
    if candidates.is_empty() {
        return Err(Error::InvalidArgument(
            "candidates must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Per-action visit counts and running-average rewards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCounters {
    /// Number of updates seen per action
    pub counts: HashMap<Action, u64>,
    /// Running-average reward per action
    pub values: HashMap<Action, f64>,
}

impl ActionCounters {
    /// Fold one observation into the running average
    pub fn record(&mut self, action: &str, reward: f64) {
        let count = self.counts.entry(action.to_string()).or_insert(0);
        *count += 1;
        let n = *count as f64;
        let value = self.values.entry(action.to_string()).or_insert(0.0);
        *value += (reward - *value) / n;
    }

    /// Visit count for an action (zero if never seen)
    pub fn count(&self, action: &str) -> u64 {
        self.counts.get(action).copied().unwrap_or(0)
    }

    /// Average reward for an action (zero if never seen)
    pub fn value(&self, action: &str) -> f64 {
        self.values.get(action).copied().unwrap_or(0.0)
    }

    /// Total number of updates across all actions
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.counts.clear();
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_incremental_mean() {
        let mut counters = ActionCounters::default();
        counters.record("a", 1.0);
        counters.record("a", 0.0);
        counters.record("a", 0.5);
        assert_eq!(counters.count("a"), 3);
        assert!((counters.value("a") - 0.5).abs() < 1e-12);
        assert_eq!(counters.count("b"), 0);
        assert_eq!(counters.value("b"), 0.0);
        assert_eq!(counters.total(), 3);
    }

    #[test]
    fn test_policy_kind_parse() {
        assert_eq!("linear".parse::<PolicyKind>().unwrap(), PolicyKind::Linear);
        assert_eq!("TREE".parse::<PolicyKind>().unwrap(), PolicyKind::Tree);
        assert!("epsilon".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::Thompson.to_string(), "thompson");
    }

    #[test]
    fn test_state_tag_in_json() {
        let state = LinearPolicy::default().export_state();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["policy"], "linear");
        assert_eq!(json["version"], STATE_VERSION);
    }

    #[test]
    fn test_restore_policy_uses_tag_when_factory_differs() {
        let factory: PolicyFactory = Arc::new(|| Box::new(ThompsonPolicy::default()));
        let mut linear = LinearPolicy::default();
        linear.update("a", 1.0, &Context::new());

        let restored = restore_policy(linear.export_state(), &factory).unwrap();
        assert_eq!(restored.kind(), PolicyKind::Linear);
        assert_eq!(restored.counters().count("a"), 1);
    }

    #[test]
    fn test_require_candidates() {
        assert!(matches!(
            require_candidates(&[]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(require_candidates(&["a".to_string()]).is_ok());
    }
}
