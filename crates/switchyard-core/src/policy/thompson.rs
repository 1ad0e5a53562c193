//! Thompson Sampling policy
//!
//! A Bayesian approach to the explore/exploit dilemma. Each action (arm)
//! keeps a Beta distribution over its expected reward; selection samples
//! every candidate's distribution and takes the highest draw.
//!
//! ## Algorithm Overview
//!
//! 1. For each action, maintain Beta(α, β), starting from Beta(1, 1)
//! 2. Sample θ ~ Beta(α, β) for every candidate
//! 3. Select the candidate with the highest sample
//! 4. Observe reward r in [0, 1] and update: α += r, β += (1 - r)
//!
//! Uncertain arms produce widely spread samples and get explored; arms with
//! a high mean tend to produce high samples and get exploited. The policy
//! ignores context, which makes it a good default leaf for [`TreePolicy`]:
//! the tree supplies the context sensitivity.
//!
//! [`TreePolicy`]: super::TreePolicy

use rand::prelude::*;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{
    Action, ActionCounters, BanditPolicy, PolicyKind, PolicyState, STATE_VERSION,
    require_candidates,
};
use crate::error::{Error, Result};
use crate::features::Context;

/// Hyperparameters of the Thompson Sampling policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThompsonConfig {
    /// Scales both Beta parameters before sampling; values below 1.0 widen
    /// the posterior and explore more
    pub exploration_factor: f64,
}

impl Default for ThompsonConfig {
    fn default() -> Self {
        Self {
            exploration_factor: 1.0,
        }
    }
}

impl ThompsonConfig {
    /// Set the exploration factor (floored at 0.1)
    pub fn with_exploration_factor(mut self, factor: f64) -> Self {
        self.exploration_factor = factor.max(0.1);
        self
    }
}

/// Beta posterior of one action
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for ArmState {
    fn default() -> Self {
        // Uninformed prior (Beta(1,1) = uniform distribution)
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

impl ArmState {
    /// Mean of the Beta distribution
    pub fn expected_value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Standard deviation of the Beta distribution
    pub fn uncertainty(&self) -> f64 {
        let ab = self.alpha + self.beta;
        ((self.alpha * self.beta) / (ab * ab * (ab + 1.0))).sqrt()
    }
}

/// Exported state of a [`ThompsonPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThompsonState {
    pub version: u32,
    pub exploration_factor: f64,
    pub arms: HashMap<Action, ArmState>,
    #[serde(flatten)]
    pub counters: ActionCounters,
}

/// Thompson Sampling bandit over a dynamic set of actions
#[derive(Debug)]
pub struct ThompsonPolicy {
    config: ThompsonConfig,
    arms: HashMap<Action, ArmState>,
    counters: ActionCounters,
    rng: StdRng,
}

impl Default for ThompsonPolicy {
    fn default() -> Self {
        Self::new(ThompsonConfig::default())
    }
}

impl ThompsonPolicy {
    /// Create a policy seeded from system entropy
    pub fn new(config: ThompsonConfig) -> Self {
        Self {
            config,
            arms: HashMap::new(),
            counters: ActionCounters::default(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a policy with a fixed seed (for reproducibility in tests)
    pub fn with_seed(config: ThompsonConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(config)
        }
    }

    /// Current hyperparameters
    pub fn config(&self) -> &ThompsonConfig {
        &self.config
    }

    /// Posterior of an action, if it has been updated
    pub fn arm(&self, action: &str) -> Option<&ArmState> {
        self.arms.get(action)
    }

    /// Posterior mean of every known action
    pub fn expected_values(&self) -> HashMap<Action, f64> {
        self.arms
            .iter()
            .map(|(action, arm)| (action.clone(), arm.expected_value()))
            .collect()
    }

    /// Sample from the Beta distribution for an arm
    fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        if alpha <= 0.0 || beta <= 0.0 {
            return 0.5;
        }

        match Beta::new(alpha, beta) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0.5, // Fallback to mean of uniform
        }
    }
}

impl BanditPolicy for ThompsonPolicy {
    fn recommend(&mut self, _context: &Context, candidates: &[Action]) -> Result<Action> {
        require_candidates(candidates)?;

        if let [only] = candidates {
            return Ok(only.clone());
        }

        let mut best: Option<(&Action, f64)> = None;
        for candidate in candidates {
            let arm = self.arms.get(candidate).copied().unwrap_or_default();
            let factor = self.config.exploration_factor;
            let sample = self.sample_beta(arm.alpha * factor, arm.beta * factor);

            match best {
                Some((_, best_sample)) if sample <= best_sample => {}
                _ => best = Some((candidate, sample)),
            }
        }

        let (action, sample) = best.ok_or_else(|| {
            Error::RoutingFailed("no candidate could be sampled".to_string())
        })?;

        debug!(action = %action, sample, "Thompson policy recommendation");
        Ok(action.clone())
    }

    fn update(&mut self, action: &str, reward: f64, _context: &Context) {
        let clamped = if reward.is_nan() {
            0.0
        } else {
            reward.clamp(0.0, 1.0)
        };

        let arm = self.arms.entry(action.to_string()).or_default();
        arm.alpha += clamped;
        arm.beta += 1.0 - clamped;

        self.counters.record(action, reward);
    }

    fn export_state(&self) -> PolicyState {
        PolicyState::Thompson(ThompsonState {
            version: STATE_VERSION,
            exploration_factor: self.config.exploration_factor,
            arms: self.arms.clone(),
            counters: self.counters.clone(),
        })
    }

    fn import_state(&mut self, state: PolicyState) -> Result<()> {
        if !state.is_supported() {
            warn!(
                version = state.version(),
                supported = STATE_VERSION,
                "Ignoring Thompson policy state from a newer version"
            );
            return Ok(());
        }

        let found = state.kind();
        let PolicyState::Thompson(state) = state else {
            return Err(Error::InvalidState(format!(
                "expected thompson state, found {}",
                found
            )));
        };

        self.config = ThompsonConfig {
            exploration_factor: state.exploration_factor,
        };
        self.arms = state.arms;
        self.counters = state.counters;

        info!(arms = self.arms.len(), "Imported Thompson policy state");
        Ok(())
    }

    fn counters(&self) -> &ActionCounters {
        &self.counters
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Thompson
    }
}
