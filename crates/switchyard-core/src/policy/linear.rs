//! Linear confidence-bound policy
//!
//! Each action owns a [`RewardModel`]: a linear predictor over the context
//! feature vector plus an exponentially-weighted estimate of its squared
//! prediction error. Selection adds an exploration bonus to the prediction:
//!
//! ```text
//! score = bias + w · x + alpha * sqrt(variance / max(visits, 1))
//! ```
//!
//! The bonus shrinks as an action accumulates visits and as its model
//! stops making mistakes, so under-tried actions keep getting a chance.
//!
//! Learning is one stochastic-gradient step per observation. Observations
//! logged under another policy can be folded in with an importance weight
//! (clamped to `[0.01, 10.0]`), which scales the error term.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::{
    Action, ActionCounters, BanditPolicy, PolicyKind, PolicyState, STATE_VERSION,
    require_candidates,
};
use crate::error::{Error, Result};
use crate::features::{Context, feature_vector};

/// Variance assigned to a model that has not seen any data
pub const INITIAL_VARIANCE: f64 = 1.0;

/// Smoothing factor of the variance estimate
const VARIANCE_DECAY: f64 = 0.9;

/// Bounds applied to importance weights
pub const MIN_IMPORTANCE_WEIGHT: f64 = 0.01;
pub const MAX_IMPORTANCE_WEIGHT: f64 = 10.0;

/// Importance weights kept in memory per action
const IMPORTANCE_HISTORY_LIMIT: usize = 1000;

/// Importance weights written into exported state per action
const IMPORTANCE_EXPORT_LIMIT: usize = 100;

/// Hyperparameters of the linear policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    /// Confidence coefficient (higher = more exploration)
    pub alpha: f64,
    /// Feature vector length, bias slot included
    pub dim: usize,
    /// Gradient step size
    pub learning_rate: f64,
    /// Cap each step so the prediction cannot overshoot the observation
    ///
    /// With the cap off every update uses the raw learning rate, which
    /// diverges once feature magnitudes grow past a few units.
    pub step_cap: bool,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            dim: 8,
            learning_rate: 0.1,
            step_cap: true,
        }
    }
}

impl LinearConfig {
    /// Create a config with the given feature dimension
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    /// Set the confidence coefficient
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.max(0.0);
        self
    }

    /// Set the learning rate
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate.max(0.0);
        self
    }

    /// Enable or disable the step cap
    pub fn with_step_cap(mut self, step_cap: bool) -> Self {
        self.step_cap = step_cap;
        self
    }

    /// Step size actually applied for one observation
    ///
    /// The configured learning rate, capped (when enabled) so a single step
    /// moves the prediction no further than the observed error.
    fn step_size(&self, scale: f64, features: &[f64]) -> f64 {
        if !self.step_cap {
            return self.learning_rate;
        }
        let norm_sq = 1.0 + features.iter().map(|x| x * x).sum::<f64>();
        self.learning_rate.min(1.0 / (scale * norm_sq))
    }
}

/// Linear reward model of a single action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Moving estimate of the squared prediction error
    pub variance: f64,
}

impl RewardModel {
    /// Create an untrained model
    pub fn new(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            bias: 0.0,
            variance: INITIAL_VARIANCE,
        }
    }

    /// Predicted reward for a feature vector
    pub fn predict(&self, features: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }

    /// Apply one gradient step for an (already weighted) error
    fn apply(&mut self, features: &[f64], error: f64, step: f64) {
        self.bias += step * error;
        for (w, x) in self.weights.iter_mut().zip(features) {
            *w += step * error * x;
        }
        self.variance = VARIANCE_DECAY * self.variance + (1.0 - VARIANCE_DECAY) * error * error;
    }
}

/// Exported state of a [`LinearPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearState {
    pub version: u32,
    pub alpha: f64,
    pub dim: usize,
    pub learning_rate: f64,
    pub models: HashMap<Action, RewardModel>,
    /// Most recent importance weights per action
    pub importance_weights: HashMap<Action, Vec<f64>>,
    #[serde(flatten)]
    pub counters: ActionCounters,
}

/// Linear confidence-bound policy with optional importance weighting
#[derive(Debug, Clone)]
pub struct LinearPolicy {
    config: LinearConfig,
    models: HashMap<Action, RewardModel>,
    importance_weights: HashMap<Action, VecDeque<f64>>,
    counters: ActionCounters,
}

impl Default for LinearPolicy {
    fn default() -> Self {
        Self::new(LinearConfig::default())
    }
}

impl LinearPolicy {
    /// Create a policy with no learned state
    pub fn new(config: LinearConfig) -> Self {
        Self {
            config,
            models: HashMap::new(),
            importance_weights: HashMap::new(),
            counters: ActionCounters::default(),
        }
    }

    /// Current hyperparameters
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Reward model of an action, if it has been updated
    pub fn model(&self, action: &str) -> Option<&RewardModel> {
        self.models.get(action)
    }

    /// Predicted reward of an action for a context
    pub fn predict(&self, action: &str, context: &Context) -> f64 {
        let features = feature_vector(context, self.config.dim);
        self.models
            .get(action)
            .map(|m| m.predict(&features))
            .unwrap_or(0.0)
    }

    /// Exploration bonus currently added to an action's prediction
    pub fn confidence(&self, action: &str) -> f64 {
        let variance = self
            .models
            .get(action)
            .map(|m| m.variance)
            .unwrap_or(INITIAL_VARIANCE);
        let visits = self.counters.count(action).max(1) as f64;
        self.config.alpha * (variance / visits).sqrt()
    }

    /// Importance weights applied to an action, oldest first
    pub fn importance_weights(&self, action: &str) -> Vec<f64> {
        self.importance_weights
            .get(action)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop all learned state, keeping the configuration
    pub fn reset(&mut self) {
        self.models.clear();
        self.importance_weights.clear();
        self.counters.clear();
    }

    fn score(&self, action: &str, features: &[f64]) -> f64 {
        let predicted = self
            .models
            .get(action)
            .map(|m| m.predict(features))
            .unwrap_or(0.0);
        predicted + self.confidence(action)
    }

    fn model_mut(&mut self, action: &str) -> &mut RewardModel {
        let dim = self.config.dim;
        self.models
            .entry(action.to_string())
            .or_insert_with(|| RewardModel::new(dim))
    }
}

impl BanditPolicy for LinearPolicy {
    fn recommend(&mut self, context: &Context, candidates: &[Action]) -> Result<Action> {
        require_candidates(candidates)?;

        let features = feature_vector(context, self.config.dim);
        let mut best: Option<(&Action, f64)> = None;

        for candidate in candidates {
            let score = self.score(candidate, &features);
            match best {
                // Strictly greater: the first candidate wins ties
                Some((_, best_score)) if score <= best_score || score.is_nan() => {}
                _ => best = Some((candidate, score)),
            }
        }

        let (action, score) = best.ok_or_else(|| {
            Error::RoutingFailed("no candidate could be scored".to_string())
        })?;

        debug!(action = %action, score, "Linear policy recommendation");
        Ok(action.clone())
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        let features = feature_vector(context, self.config.dim);
        let step = self.config.step_size(1.0, &features);

        let model = self.model_mut(action);
        let error = reward - model.predict(&features);
        model.apply(&features, error, step);

        self.counters.record(action, reward);

        debug!(action = %action, reward, error, "Updated linear reward model");
    }

    fn update_with_importance_weight(
        &mut self,
        action: &str,
        reward: f64,
        context: &Context,
        weight: f64,
    ) {
        let weight = if weight.is_nan() {
            1.0
        } else {
            weight.clamp(MIN_IMPORTANCE_WEIGHT, MAX_IMPORTANCE_WEIGHT)
        };

        let features = feature_vector(context, self.config.dim);
        let step = self.config.step_size(weight, &features);

        let model = self.model_mut(action);
        let error = weight * (reward - model.predict(&features));
        model.apply(&features, error, step);

        // Weighted and unweighted rewards share one running average
        self.counters.record(action, weight * reward);

        let history = self
            .importance_weights
            .entry(action.to_string())
            .or_default();
        history.push_back(weight);
        if history.len() > IMPORTANCE_HISTORY_LIMIT {
            history.pop_front();
        }

        debug!(action = %action, reward, weight, "Applied importance-weighted update");
    }

    fn export_state(&self) -> PolicyState {
        let importance_weights = self
            .importance_weights
            .iter()
            .map(|(action, history)| {
                let skip = history.len().saturating_sub(IMPORTANCE_EXPORT_LIMIT);
                (action.clone(), history.iter().skip(skip).copied().collect())
            })
            .collect();

        PolicyState::Linear(LinearState {
            version: STATE_VERSION,
            alpha: self.config.alpha,
            dim: self.config.dim,
            learning_rate: self.config.learning_rate,
            models: self.models.clone(),
            importance_weights,
            counters: self.counters.clone(),
        })
    }

    fn import_state(&mut self, state: PolicyState) -> Result<()> {
        if !state.is_supported() {
            warn!(
                version = state.version(),
                supported = STATE_VERSION,
                "Ignoring linear policy state from a newer version"
            );
            return Ok(());
        }

        let found = state.kind();
        let PolicyState::Linear(state) = state else {
            return Err(Error::InvalidState(format!(
                "expected linear state, found {}",
                found
            )));
        };

        if let Some((action, model)) = state
            .models
            .iter()
            .find(|(_, m)| m.weights.len() != state.dim)
        {
            return Err(Error::InvalidState(format!(
                "model for '{}' has {} weights but dim is {}",
                action,
                model.weights.len(),
                state.dim
            )));
        }

        // The step cap is a local setting and is not part of the exported state
        self.config = LinearConfig {
            alpha: state.alpha,
            dim: state.dim,
            learning_rate: state.learning_rate,
            step_cap: self.config.step_cap,
        };
        self.models = state.models;
        self.importance_weights = state
            .importance_weights
            .into_iter()
            .map(|(action, weights)| {
                let skip = weights.len().saturating_sub(IMPORTANCE_HISTORY_LIMIT);
                (action, weights.into_iter().skip(skip).collect())
            })
            .collect();
        self.counters = state.counters;

        info!(
            models = self.models.len(),
            dim = self.config.dim,
            "Imported linear policy state"
        );
        Ok(())
    }

    fn counters(&self) -> &ActionCounters {
        &self.counters
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Linear
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(names: &[&str]) -> Vec<Action> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_recommend_empty_candidates() {
        let mut policy = LinearPolicy::default();
        let result = policy.recommend(&Context::new(), &[]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_ties_go_to_first_candidate() {
        let mut policy = LinearPolicy::default();
        let context = Context::new().with_number("x", 1.0);
        assert_eq!(
            policy.recommend(&context, &actions(&["b", "a", "c"])).unwrap(),
            "b"
        );
        assert_eq!(
            policy.recommend(&context, &actions(&["c", "b"])).unwrap(),
            "c"
        );
    }

    #[test]
    fn test_recommend_does_not_materialize_models() {
        let mut policy = LinearPolicy::default();
        policy
            .recommend(&Context::new(), &actions(&["a", "b"]))
            .unwrap();
        assert!(policy.model("a").is_none());
        assert_eq!(policy.counters().total(), 0);
    }

    #[test]
    fn test_update_gradient_step() {
        let mut policy = LinearPolicy::new(LinearConfig::new(3).with_learning_rate(0.1));
        let context = Context::new().with_number("x", 0.5);

        policy.update("a", 1.0, &context);

        // x = [1, 0.5, 0]; error = 1.0
        let model = policy.model("a").unwrap();
        assert!((model.bias - 0.1).abs() < 1e-12);
        assert!((model.weights[0] - 0.1).abs() < 1e-12);
        assert!((model.weights[1] - 0.05).abs() < 1e-12);
        assert_eq!(model.weights[2], 0.0);
        assert!((model.variance - (0.9 + 0.1)).abs() < 1e-12);
        assert_eq!(policy.counters().count("a"), 1);
        assert!((policy.counters().value("a") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_step_is_capped_for_large_features() {
        let mut policy = LinearPolicy::new(LinearConfig::new(4));
        let context = Context::new().with_number("latency_ms", 50.0);

        policy.update("a", 0.9, &context);
        let after_one = policy.predict("a", &context);
        assert!((after_one - 0.9).abs() < 1e-9, "prediction {after_one}");

        for _ in 0..100 {
            policy.update("a", 0.9, &context);
        }
        let model = policy.model("a").unwrap();
        assert!(model.weights.iter().all(|w| w.is_finite()));
        assert!((policy.predict("a", &context) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_uncapped_step_uses_raw_learning_rate() {
        let config = LinearConfig::new(4).with_step_cap(false);
        let mut policy = LinearPolicy::new(config);
        let context = Context::new().with_number("latency_ms", 50.0);

        policy.update("a", 1.0, &context);

        // x = [1, 50, 0, 0]; error = 1.0; bias += 0.1 * 1.0
        let model = policy.model("a").unwrap();
        assert!((model.bias - 0.1).abs() < 1e-12);
        assert!((model.weights[1] - 5.0).abs() < 1e-12);

        let capped = LinearConfig::new(4);
        assert!(capped.step_size(1.0, &[1.0, 50.0, 0.0, 0.0]) < capped.learning_rate);
        assert_eq!(config.step_size(1.0, &[1.0, 50.0, 0.0, 0.0]), 0.1);
    }

    #[test]
    fn test_import_keeps_local_step_cap() {
        let mut source = LinearPolicy::new(LinearConfig::new(3));
        source.update("a", 1.0, &Context::new());

        let mut target = LinearPolicy::new(LinearConfig::new(3).with_step_cap(false));
        target.import_state(source.export_state()).unwrap();
        assert!(!target.config().step_cap);
    }

    #[test]
    fn test_monotonic_learning() {
        let mut policy = LinearPolicy::default();
        let context = Context::new().with_number("load", 0.3).with_text("region", "eu");
        let candidates = actions(&["A", "B"]);

        for _ in 0..200 {
            policy.update("A", 1.0, &context);
            policy.update("B", 0.0, &context);
        }

        for _ in 0..10 {
            assert_eq!(policy.recommend(&context, &candidates).unwrap(), "A");
        }
    }

    #[test]
    fn test_fast_model_scenario() {
        let context = Context::new().with_number("latency_ms", 50.0);
        let candidates = actions(&["fast_model", "slow_model"]);
        let trials = 20;

        let wins = (0..trials)
            .filter(|_| {
                let mut policy = LinearPolicy::new(
                    LinearConfig::new(4).with_alpha(1.0).with_learning_rate(0.1),
                );
                for _ in 0..50 {
                    policy.update("fast_model", 0.9, &context);
                }
                for _ in 0..50 {
                    policy.update("slow_model", 0.1, &context);
                }
                policy.recommend(&context, &candidates).unwrap() == "fast_model"
            })
            .count();

        assert!(wins * 100 >= trials * 95, "fast_model won {wins}/{trials}");
    }

    #[test]
    fn test_confidence_decays_with_visits() {
        let mut policy = LinearPolicy::default();
        let context = Context::new();

        let mut previous = policy.confidence("a");
        let initial = previous;
        for n in 1..=50 {
            policy.update("a", 0.5, &context);
            let current = policy.confidence("a");
            assert!(current <= previous, "confidence grew at visit {n}");
            previous = current;
        }
        assert!(previous < initial / 5.0);
    }

    #[test]
    fn test_importance_weight_clamped_and_recorded() {
        let mut policy = LinearPolicy::default();
        let context = Context::new();

        policy.update_with_importance_weight("a", 1.0, &context, 100.0);
        policy.update_with_importance_weight("a", 1.0, &context, 0.0);
        policy.update_with_importance_weight("a", 1.0, &context, 2.0);

        assert_eq!(policy.importance_weights("a"), vec![10.0, 0.01, 2.0]);
        assert_eq!(policy.counters().count("a"), 3);
    }

    #[test]
    fn test_importance_weight_folds_into_running_average() {
        let mut policy = LinearPolicy::default();
        policy.update_with_importance_weight("a", 0.5, &Context::new(), 2.0);
        assert!((policy.counters().value("a") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_importance_history_is_bounded() {
        let mut policy = LinearPolicy::default();
        let context = Context::new();
        for i in 0..1005 {
            let weight = 1.0 + (i % 7) as f64;
            policy.update_with_importance_weight("a", 0.5, &context, weight);
        }

        let history = policy.importance_weights("a");
        assert_eq!(history.len(), 1000);
        // the first five pushes were dropped
        assert_eq!(history[0], 1.0 + (5 % 7) as f64);

        let PolicyState::Linear(state) = policy.export_state() else {
            panic!("expected linear state");
        };
        assert_eq!(state.importance_weights["a"].len(), 100);
        assert_eq!(state.importance_weights["a"][..], history[900..]);
    }

    #[test]
    fn test_round_trip_preserves_decisions() {
        let mut policy = LinearPolicy::new(LinearConfig::new(4));
        let candidates = actions(&["a", "b", "c"]);
        for i in 0..60 {
            let context = Context::new().with_number("x", (i % 10) as f64 / 10.0);
            let action = &candidates[i % 3];
            let reward = if action == "b" { 0.8 } else { 0.3 };
            policy.update(action, reward, &context);
        }

        let mut restored = LinearPolicy::default();
        restored.import_state(policy.export_state()).unwrap();

        assert_eq!(restored.config(), policy.config());
        for i in 0..10 {
            let probe = Context::new().with_number("x", i as f64 / 10.0);
            assert_eq!(
                restored.recommend(&probe, &candidates).unwrap(),
                policy.recommend(&probe, &candidates).unwrap()
            );
        }
    }

    #[test]
    fn test_newer_version_is_ignored() {
        let mut policy = LinearPolicy::default();
        policy.update("a", 1.0, &Context::new());
        let before = policy.export_state();

        let mut other = LinearPolicy::new(LinearConfig::new(2));
        other.update("z", 0.0, &Context::new());
        let PolicyState::Linear(mut future) = other.export_state() else {
            panic!("expected linear state");
        };
        future.version = STATE_VERSION + 1;

        policy.import_state(PolicyState::Linear(future)).unwrap();
        assert_eq!(policy.export_state(), before);
    }

    #[test]
    fn test_import_rejects_dimension_mismatch() {
        let mut policy = LinearPolicy::default();
        policy.update("a", 1.0, &Context::new());
        let before = policy.export_state();

        let PolicyState::Linear(mut bad) = before.clone() else {
            panic!("expected linear state");
        };
        bad.dim = 3;

        let result = policy.import_state(PolicyState::Linear(bad));
        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(policy.export_state(), before);
    }

    #[test]
    fn test_import_rejects_other_kind() {
        let mut policy = LinearPolicy::default();
        let thompson = crate::policy::ThompsonPolicy::default().export_state();
        assert!(matches!(
            policy.import_state(thompson),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_import_replaces_rather_than_merges() {
        let mut policy = LinearPolicy::default();
        policy.update("old", 1.0, &Context::new());

        let mut source = LinearPolicy::default();
        source.update("new", 0.5, &Context::new());
        policy.import_state(source.export_state()).unwrap();

        assert!(policy.model("old").is_none());
        assert!(policy.model("new").is_some());
        assert_eq!(policy.counters().count("old"), 0);
    }

    #[test]
    fn test_reset() {
        let mut policy = LinearPolicy::default();
        policy.update_with_importance_weight("a", 1.0, &Context::new(), 3.0);
        policy.reset();
        assert!(policy.model("a").is_none());
        assert!(policy.importance_weights("a").is_empty());
        assert_eq!(policy.counters().total(), 0);
    }
}
