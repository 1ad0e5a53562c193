//! Policy Router - decision tracking and reward attribution
//!
//! The router wraps a single [`BanditPolicy`] behind an async lock and adds
//! what callers need around it:
//! - Decision ids, so outcomes can be reported after the call completes
//! - Composite reward computation from success, quality, cost and latency
//! - Importance-weighted updates when the caller knows the logging propensity
//! - Snapshot persistence across sessions

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::store::SnapshotStore;
use super::types::{PendingDecision, RoutingDecision, RoutingReward};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::features::Context;
use crate::policy::{
    Action, ActionCounters, BanditPolicy, LinearPolicy, PolicyKind, PolicyState,
};

/// Configuration for the policy router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Policy built by [`Config::build_policy`]
    pub policy: PolicyKind,
    /// Name the router's snapshot is stored under
    pub snapshot_name: String,
    /// Directory of the snapshot store (defaults to the config directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    /// Decisions awaiting an outcome before the oldest are dropped
    pub max_pending_decisions: usize,
    /// Whether to save a snapshot after every recorded outcome
    pub persist_on_outcome: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Linear,
            snapshot_name: "default".to_string(),
            snapshot_dir: None,
            max_pending_decisions: 10_000,
            persist_on_outcome: false,
        }
    }
}

/// Routes requests through a bandit policy and feeds outcomes back into it
///
/// Cloning is cheap and clones share the policy and the pending decisions.
#[derive(Debug, Clone)]
pub struct PolicyRouter {
    /// Configuration
    config: RouterConfig,
    /// The learning policy
    policy: Arc<RwLock<Box<dyn BanditPolicy>>>,
    /// Optional snapshot store
    store: Option<Arc<SnapshotStore>>,
    /// Decisions awaiting an outcome
    pending_decisions: Arc<RwLock<PendingDecisions>>,
    /// Sequence number of the next decision
    next_sequence: Arc<AtomicU64>,
}

impl PolicyRouter {
    /// Create a router around `policy` with default configuration
    pub fn new(policy: Box<dyn BanditPolicy>) -> Self {
        Self::with_config(policy, RouterConfig::default())
    }

    /// Create a router with custom configuration
    pub fn with_config(policy: Box<dyn BanditPolicy>, config: RouterConfig) -> Self {
        Self {
            config,
            policy: Arc::new(RwLock::new(policy)),
            store: None,
            pending_decisions: Arc::new(RwLock::new(PendingDecisions::default())),
            next_sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a router from application configuration
    ///
    /// The snapshot store lives in `router.snapshot_dir`, or in the
    /// `snapshots` directory next to the config file when unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config
            .snapshot_dir()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        let router = Self::with_config(config.build_policy(), config.router.clone());
        Ok(router.with_store(Arc::new(SnapshotStore::new(dir))))
    }

    /// Set the snapshot store for persistence
    pub fn with_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Select an action for a request
    ///
    /// The returned decision id is used to report the outcome through
    /// [`record_outcome`](Self::record_outcome).
    pub async fn select(&self, context: &Context, candidates: &[Action]) -> Result<RoutingDecision> {
        let (action, kind) = {
            let mut policy = self.policy.write().await;
            let action = policy.recommend(context, candidates)?;
            (action, policy.kind())
        };

        let decision_id = uuid::Uuid::new_v4().to_string();
        let pending = PendingDecision {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            action: action.clone(),
            context: context.clone(),
            decided_at: Utc::now(),
        };
        {
            let mut decisions = self.pending_decisions.write().await;
            decisions.insert(decision_id.clone(), pending);
            for dropped in decisions.evict_over(self.config.max_pending_decisions) {
                warn!(decision_id = %dropped, "Dropped pending decision without an outcome");
            }
        }

        let alternatives: Vec<Action> = candidates
            .iter()
            .filter(|c| **c != action)
            .cloned()
            .collect();

        debug!(
            decision_id = %decision_id,
            action = %action,
            policy = %kind,
            candidates = candidates.len(),
            "Selected action for request"
        );

        Ok(RoutingDecision::new(decision_id, action, kind).with_alternatives(alternatives))
    }

    /// Record the outcome of a routing decision
    ///
    /// Returns the scalar reward the policy learned from.
    pub async fn record_outcome(&self, decision_id: &str, reward: RoutingReward) -> Result<f64> {
        let pending = {
            let mut decisions = self.pending_decisions.write().await;
            decisions.remove(decision_id)
        }
        .ok_or_else(|| Error::UnknownDecision(decision_id.to_string()))?;

        let value = self.apply(&pending.action, &pending.context, &reward).await;

        debug!(
            decision_id = %decision_id,
            action = %pending.action,
            success = reward.success,
            reward = value,
            waited_ms = (Utc::now() - pending.decided_at).num_milliseconds(),
            "Recorded routing outcome"
        );

        self.persist_if_configured().await?;
        Ok(value)
    }

    /// Record an outcome for a decision made outside the router
    pub async fn record_with_context(
        &self,
        action: &str,
        context: &Context,
        reward: &RoutingReward,
    ) -> Result<f64> {
        let value = self.apply(action, context, reward).await;
        debug!(action = %action, reward = value, "Recorded external outcome");

        self.persist_if_configured().await?;
        Ok(value)
    }

    async fn apply(&self, action: &str, context: &Context, reward: &RoutingReward) -> f64 {
        let value = reward.compute_reward();
        let mut policy = self.policy.write().await;
        match reward.importance_weight() {
            Some(weight) => policy.update_with_importance_weight(action, value, context, weight),
            None => policy.update(action, value, context),
        }
        value
    }

    async fn persist_if_configured(&self) -> Result<()> {
        if self.config.persist_on_outcome && self.store.is_some() {
            self.save().await?;
        }
        Ok(())
    }

    /// Export the policy's complete state
    pub async fn snapshot(&self) -> PolicyState {
        self.policy.read().await.export_state()
    }

    /// Replace the policy's state
    pub async fn restore(&self, state: PolicyState) -> Result<()> {
        self.policy.write().await.import_state(state)
    }

    /// Per-action counts and average rewards
    pub async fn counters(&self) -> ActionCounters {
        self.policy.read().await.counters().clone()
    }

    /// Kind of the wrapped policy
    pub async fn policy_kind(&self) -> PolicyKind {
        self.policy.read().await.kind()
    }

    /// Number of decisions awaiting an outcome
    pub async fn pending_count(&self) -> usize {
        self.pending_decisions.read().await.len()
    }

    /// Save the policy state to the configured store
    pub async fn save(&self) -> Result<()> {
        if let Some(store) = &self.store {
            self.save_to(store).await?;
        }
        Ok(())
    }

    /// Load the policy state from the configured store
    ///
    /// Returns whether a snapshot was found.
    pub async fn load(&self) -> Result<bool> {
        match &self.store {
            Some(store) => self.load_from(store).await,
            None => Ok(false),
        }
    }

    /// Save the policy state to `store` under the configured name
    pub async fn save_to(&self, store: &SnapshotStore) -> Result<PathBuf> {
        let state = self.snapshot().await;
        store.save(&self.config.snapshot_name, &state).await
    }

    /// Load the policy state from `store` under the configured name
    pub async fn load_from(&self, store: &SnapshotStore) -> Result<bool> {
        match store.load(&self.config.snapshot_name).await? {
            Some(snapshot) => {
                self.restore(snapshot.state).await?;
                info!(
                    name = %self.config.snapshot_name,
                    saved_at = %snapshot.saved_at,
                    "Loaded policy snapshot into router"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Pending decisions indexed by id and by sequence number
#[derive(Debug, Default)]
struct PendingDecisions {
    by_id: HashMap<String, PendingDecision>,
    by_sequence: BTreeMap<u64, String>,
}

impl PendingDecisions {
    fn insert(&mut self, decision_id: String, pending: PendingDecision) {
        self.by_sequence.insert(pending.sequence, decision_id.clone());
        if let Some(replaced) = self.by_id.insert(decision_id, pending) {
            self.by_sequence.remove(&replaced.sequence);
        }
    }

    fn remove(&mut self, decision_id: &str) -> Option<PendingDecision> {
        let pending = self.by_id.remove(decision_id)?;
        self.by_sequence.remove(&pending.sequence);
        Some(pending)
    }

    /// Drop the oldest decisions until at most `limit` remain
    fn evict_over(&mut self, limit: usize) -> Vec<String> {
        let mut dropped = Vec::new();
        while self.by_id.len() > limit {
            let Some((_, oldest)) = self.by_sequence.pop_first() else {
                break;
            };
            self.by_id.remove(&oldest);
            dropped.push(oldest);
        }
        dropped
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl Default for PolicyRouter {
    fn default() -> Self {
        Self::new(Box::new(LinearPolicy::default()))
    }
}

/// Builder for PolicyRouter
#[derive(Default)]
pub struct PolicyRouterBuilder {
    config: RouterConfig,
    policy: Option<Box<dyn BanditPolicy>>,
    store: Option<Arc<SnapshotStore>>,
}

impl PolicyRouterBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the policy
    pub fn policy(mut self, policy: Box<dyn BanditPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the snapshot store
    pub fn store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the name the snapshot is stored under
    pub fn snapshot_name(mut self, name: impl Into<String>) -> Self {
        self.config.snapshot_name = name.into();
        self
    }

    /// Build the router (a default linear policy when none was set)
    pub fn build(self) -> PolicyRouter {
        let policy = self
            .policy
            .unwrap_or_else(|| Box::new(LinearPolicy::default()));
        let mut router = PolicyRouter::with_config(policy, self.config);
        router.store = self.store;
        router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{LinearConfig, ThompsonConfig, ThompsonPolicy};
    use tempfile::TempDir;

    fn candidates() -> Vec<Action> {
        vec!["fast_model".to_string(), "slow_model".to_string()]
    }

    fn linear_router() -> PolicyRouter {
        PolicyRouterBuilder::new()
            .policy(Box::new(LinearPolicy::new(LinearConfig::new(4))))
            .build()
    }

    #[tokio::test]
    async fn test_select_returns_decision() {
        let router = linear_router();
        let decision = router.select(&Context::new(), &candidates()).await.unwrap();

        assert!(candidates().contains(&decision.action));
        assert_eq!(decision.policy, PolicyKind::Linear);
        assert_eq!(decision.alternatives.len(), 1);
        assert!(!decision.alternatives.contains(&decision.action));
        assert_eq!(router.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_select_empty_candidates() {
        let router = linear_router();
        let result = router.select(&Context::new(), &[]).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_record_outcome_updates_policy() {
        let router = linear_router();
        let context = Context::new().with_number("latency", 50.0);
        let decision = router.select(&context, &candidates()).await.unwrap();

        let value = router
            .record_outcome(&decision.decision_id, RoutingReward::scalar(1.0))
            .await
            .unwrap();

        assert_eq!(value, 1.0);
        assert_eq!(router.pending_count().await, 0);
        let counters = router.counters().await;
        assert_eq!(counters.count(&decision.action), 1);
        assert_eq!(counters.value(&decision.action), 1.0);
    }

    #[tokio::test]
    async fn test_record_outcome_unknown_decision() {
        let router = linear_router();
        let result = router
            .record_outcome("missing", RoutingReward::new(true))
            .await;
        assert!(matches!(result, Err(Error::UnknownDecision(_))));
    }

    #[tokio::test]
    async fn test_outcome_is_consumed_once() {
        let router = linear_router();
        let decision = router.select(&Context::new(), &candidates()).await.unwrap();

        router
            .record_outcome(&decision.decision_id, RoutingReward::new(true))
            .await
            .unwrap();
        let again = router
            .record_outcome(&decision.decision_id, RoutingReward::new(true))
            .await;
        assert!(matches!(again, Err(Error::UnknownDecision(_))));
    }

    #[tokio::test]
    async fn test_propensity_uses_importance_weight() {
        let router = linear_router();
        let context = Context::new().with_number("latency", 0.5);

        router
            .record_with_context(
                "fast_model",
                &context,
                &RoutingReward::scalar(1.0).with_propensity(0.5),
            )
            .await
            .unwrap();

        let PolicyState::Linear(state) = router.snapshot().await else {
            panic!("expected linear state");
        };
        assert_eq!(state.importance_weights["fast_model"], vec![2.0]);
        // the running average folds in the weighted reward
        assert_eq!(state.counters.value("fast_model"), 2.0);
    }

    #[tokio::test]
    async fn test_pending_decisions_are_bounded() {
        let config = RouterConfig {
            max_pending_decisions: 3,
            ..Default::default()
        };
        let router = PolicyRouterBuilder::new().config(config).build();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let decision = router.select(&Context::new(), &candidates()).await.unwrap();
            ids.push(decision.decision_id);
        }

        assert_eq!(router.pending_count().await, 3);

        // The two oldest decisions were dropped, in order
        for dropped in &ids[..2] {
            let result = router.record_outcome(dropped, RoutingReward::new(true)).await;
            assert!(matches!(result, Err(Error::UnknownDecision(_))));
        }
        for kept in &ids[2..] {
            assert!(router.record_outcome(kept, RoutingReward::new(true)).await.is_ok());
        }
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_eviction_skips_resolved_decisions() {
        let config = RouterConfig {
            max_pending_decisions: 2,
            ..Default::default()
        };
        let router = PolicyRouterBuilder::new().config(config).build();

        let first = router.select(&Context::new(), &candidates()).await.unwrap();
        let second = router.select(&Context::new(), &candidates()).await.unwrap();
        router
            .record_outcome(&first.decision_id, RoutingReward::new(true))
            .await
            .unwrap();

        // Room for the third without evicting anything
        let third = router.select(&Context::new(), &candidates()).await.unwrap();
        assert_eq!(router.pending_count().await, 2);

        // The fourth evicts the second, the oldest still pending
        let fourth = router.select(&Context::new(), &candidates()).await.unwrap();
        let result = router
            .record_outcome(&second.decision_id, RoutingReward::new(true))
            .await;
        assert!(matches!(result, Err(Error::UnknownDecision(_))));
        for kept in [&third, &fourth] {
            router
                .record_outcome(&kept.decision_id, RoutingReward::new(false))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_pending_decisions_index_stays_consistent() {
        let mut decisions = PendingDecisions::default();
        for sequence in 0..4 {
            decisions.insert(
                format!("d{sequence}"),
                PendingDecision {
                    sequence,
                    action: "a".to_string(),
                    context: Context::new(),
                    decided_at: Utc::now(),
                },
            );
        }

        assert!(decisions.remove("d1").is_some());
        assert!(decisions.remove("d1").is_none());
        assert_eq!(decisions.evict_over(1), vec!["d0", "d2"]);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions.by_sequence.len(), 1);
        assert!(decisions.by_id.contains_key("d3"));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let router = linear_router();
        let clone = router.clone();
        let decision = router.select(&Context::new(), &candidates()).await.unwrap();

        clone
            .record_outcome(&decision.decision_id, RoutingReward::scalar(0.5))
            .await
            .unwrap();
        assert_eq!(router.counters().await.total(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_through_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path()));

        let router = PolicyRouterBuilder::new()
            .policy(Box::new(ThompsonPolicy::with_seed(ThompsonConfig::default(), 3)))
            .store(store.clone())
            .snapshot_name("thompson-test")
            .build();
        router
            .record_with_context("fast_model", &Context::new(), &RoutingReward::scalar(1.0))
            .await
            .unwrap();
        router.save().await.unwrap();

        let fresh = PolicyRouterBuilder::new()
            .policy(Box::new(ThompsonPolicy::default()))
            .store(store)
            .snapshot_name("thompson-test")
            .build();
        assert!(fresh.load().await.unwrap());
        assert_eq!(fresh.snapshot().await, router.snapshot().await);
    }

    #[tokio::test]
    async fn test_load_without_snapshot() {
        let dir = TempDir::new().unwrap();
        let router = linear_router().with_store(Arc::new(SnapshotStore::new(dir.path())));
        assert!(!router.load().await.unwrap());
    }

    #[tokio::test]
    async fn test_persist_on_outcome() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SnapshotStore::new(dir.path()));
        let config = RouterConfig {
            persist_on_outcome: true,
            ..Default::default()
        };
        let router = PolicyRouterBuilder::new()
            .config(config)
            .store(store.clone())
            .build();

        let decision = router.select(&Context::new(), &candidates()).await.unwrap();
        router
            .record_outcome(&decision.decision_id, RoutingReward::new(true))
            .await
            .unwrap();

        let saved = store.load("default").await.unwrap().unwrap();
        assert_eq!(saved.state.counters().total(), 1);
    }

    #[tokio::test]
    async fn test_restore_rejects_wrong_kind() {
        let router = linear_router();
        let thompson = ThompsonPolicy::default().export_state();
        assert!(matches!(
            router.restore(thompson).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.router.policy = PolicyKind::Tree;
        config.router.snapshot_dir = Some(dir.path().to_path_buf());

        let router = PolicyRouter::from_config(&config).unwrap();
        assert_eq!(router.policy_kind().await, PolicyKind::Tree);
        router.save().await.unwrap();
        assert!(dir.path().join("default.json").exists());
    }
}
