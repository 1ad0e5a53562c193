//! Types exchanged with the policy router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::features::Context;
use crate::policy::{Action, PolicyKind};

/// Result of a routing decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Identifier used to attribute the outcome later
    pub decision_id: String,
    /// Selected action
    pub action: Action,
    /// Policy that made the choice
    pub policy: PolicyKind,
    /// Other candidates that were considered
    pub alternatives: Vec<Action>,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Create a new routing decision
    pub fn new(decision_id: impl Into<String>, action: impl Into<Action>, policy: PolicyKind) -> Self {
        Self {
            decision_id: decision_id.into(),
            action: action.into(),
            policy,
            alternatives: Vec::new(),
            decided_at: Utc::now(),
        }
    }

    /// Add alternative actions
    pub fn with_alternatives(mut self, alternatives: Vec<Action>) -> Self {
        self.alternatives = alternatives;
        self
    }
}

/// Outcome signal reported after a routed call completes
///
/// Either an explicit scalar reward, or a composite computed from success,
/// quality, cost and latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingReward {
    /// Whether the call succeeded
    pub success: bool,
    /// Explicit reward; overrides the composite when set
    pub reward: Option<f64>,
    /// Quality score (0.0 to 1.0, optional - from reviews/tests)
    pub quality_score: Option<f64>,
    /// Actual cost in USD
    pub actual_cost_usd: Option<f64>,
    /// Expected cost in USD
    pub expected_cost_usd: Option<f64>,
    /// Latency in milliseconds
    pub latency_ms: Option<u64>,
    /// Expected latency in milliseconds
    pub expected_latency_ms: Option<u64>,
    /// Probability with which the logging policy chose this action
    pub propensity: Option<f64>,
}

impl RoutingReward {
    /// Create a composite reward signal
    pub fn new(success: bool) -> Self {
        Self {
            success,
            reward: None,
            quality_score: None,
            actual_cost_usd: None,
            expected_cost_usd: None,
            latency_ms: None,
            expected_latency_ms: None,
            propensity: None,
        }
    }

    /// Create a reward signal carrying an explicit scalar
    pub fn scalar(reward: f64) -> Self {
        Self {
            reward: Some(reward),
            ..Self::new(reward > 0.5)
        }
    }

    /// Set quality score
    pub fn with_quality(mut self, score: f64) -> Self {
        self.quality_score = Some(score.clamp(0.0, 1.0));
        self
    }

    /// Set actual and expected cost
    pub fn with_cost(mut self, actual_usd: f64, expected_usd: f64) -> Self {
        self.actual_cost_usd = Some(actual_usd);
        self.expected_cost_usd = Some(expected_usd);
        self
    }

    /// Set actual and expected latency
    pub fn with_latency(mut self, actual_ms: u64, expected_ms: u64) -> Self {
        self.latency_ms = Some(actual_ms);
        self.expected_latency_ms = Some(expected_ms);
        self
    }

    /// Set the logging propensity for off-policy correction
    pub fn with_propensity(mut self, propensity: f64) -> Self {
        self.propensity = Some(propensity);
        self
    }

    /// Compute overall reward value
    ///
    /// The composite (clamped to 0.0..=1.0) combines:
    /// - Success (40% weight)
    /// - Quality (30% weight, 0.5 when unknown)
    /// - Cost efficiency (20% weight)
    /// - Speed (10% weight)
    ///
    /// Efficiencies are expected/actual capped at 2x and halved, so meeting
    /// the expectation scores 0.5; they are 0.5 when either side is unknown.
    pub fn compute_reward(&self) -> f64 {
        if let Some(reward) = self.reward {
            return reward;
        }

        let success_reward = if self.success { 1.0 } else { 0.0 };
        let quality_reward = self.quality_score.unwrap_or(0.5);
        let cost_efficiency = efficiency(self.expected_cost_usd, self.actual_cost_usd);
        let speed_efficiency = efficiency(
            self.expected_latency_ms.map(|ms| ms as f64),
            self.latency_ms.map(|ms| ms as f64),
        );

        let reward = (success_reward * 0.4)
            + (quality_reward * 0.3)
            + (cost_efficiency * 0.2)
            + (speed_efficiency * 0.1);

        reward.clamp(0.0, 1.0)
    }

    /// Importance weight derived from the logging propensity
    pub fn importance_weight(&self) -> Option<f64> {
        self.propensity
            .filter(|p| *p > 0.0 && p.is_finite())
            .map(|p| 1.0 / p)
    }
}

fn efficiency(expected: Option<f64>, actual: Option<f64>) -> f64 {
    match (expected, actual) {
        (Some(expected), Some(actual)) if actual > 0.0 => (expected / actual).min(2.0) / 2.0,
        (Some(_), Some(_)) => 1.0,
        _ => 0.5,
    }
}

/// A routing decision awaiting reward feedback
#[derive(Debug, Clone)]
pub(crate) struct PendingDecision {
    /// Order in which decisions were made
    pub sequence: u64,
    pub action: Action,
    pub context: Context,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_reward_composite() {
        let reward = RoutingReward::new(true)
            .with_quality(0.9)
            .with_cost(0.01, 0.02)
            .with_latency(1000, 2000);

        // 0.4 + 0.27 + 0.2 + 0.1
        assert!((reward.compute_reward() - 0.97).abs() < 1e-12);
    }

    #[test]
    fn test_compute_reward_defaults_are_neutral() {
        let failed = RoutingReward::new(false);
        // 0.0 + 0.15 + 0.1 + 0.05
        assert!((failed.compute_reward() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_scalar_reward_overrides_composite() {
        let reward = RoutingReward::scalar(0.25).with_quality(1.0);
        assert_eq!(reward.compute_reward(), 0.25);
        assert!(!reward.success);
    }

    #[test]
    fn test_importance_weight_from_propensity() {
        assert_eq!(
            RoutingReward::scalar(1.0).with_propensity(0.25).importance_weight(),
            Some(4.0)
        );
        assert_eq!(
            RoutingReward::scalar(1.0).with_propensity(0.0).importance_weight(),
            None
        );
        assert_eq!(RoutingReward::scalar(1.0).importance_weight(), None);
    }

    #[test]
    fn test_decision_serializes_policy_kind() {
        let decision = RoutingDecision::new("id-1", "fast_model", PolicyKind::Tree)
            .with_alternatives(vec!["slow_model".to_string()]);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["policy"], "tree");
        assert_eq!(json["alternatives"][0], "slow_model");
    }
}
