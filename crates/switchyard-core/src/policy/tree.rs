//! Partitioning tree policy
//!
//! Recursively partitions the context space so each region can learn its
//! own routing behavior. The tree starts as a single leaf; every leaf owns
//! an independent [`BanditPolicy`] built by the injected [`PolicyFactory`].
//!
//! ## Routing
//!
//! Internal nodes test one numeric feature against a threshold:
//! `value <= threshold` goes left, anything else goes right. A missing or
//! non-numeric feature goes left.
//!
//! ## Growth
//!
//! After each update the receiving leaf is checked for a split. A leaf
//! splits when all of these hold:
//!
//! 1. its depth is below `max_depth`
//! 2. it has seen at least `min_samples_split` updates
//! 3. at least `min_samples_split` of the last 100 history entries route to it
//! 4. the reward variance of those entries exceeds `split_variance_threshold`
//!
//! Candidate thresholds are the numeric feature values of the first 10 of
//! those entries. The candidate with the largest variance reduction wins.
//! New children start cold: no samples, no history, fresh sub-policies.
//! A node never re-splits, merges or disappears; the tree only grows.
//!
//! Nodes live in an arena indexed by `usize`. The root is node 0 and the
//! two children of a split are appended in (left, right) order.

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use super::{
    Action, ActionCounters, BanditPolicy, PolicyFactory, PolicyKind, PolicyState, STATE_VERSION,
    require_candidates, restore_policy,
};
use crate::error::{Error, Result};
use crate::features::Context;

/// Arena index of the root node
pub const ROOT: usize = 0;

/// History length that triggers trimming
const HISTORY_LIMIT: usize = 10_000;

/// History length kept after trimming
const HISTORY_RETAIN: usize = 5_000;

/// Recent history entries examined for a split
const SPLIT_WINDOW: usize = 100;

/// Routed entries whose features become candidate thresholds
const SPLIT_CANDIDATE_SAMPLES: usize = 10;

/// History entries written into exported state
const HISTORY_EXPORT_LIMIT: usize = 100;

/// Growth limits of the tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Leaves at this depth never split
    pub max_depth: usize,
    /// Updates a leaf needs before it may split
    pub min_samples_split: u64,
    /// Reward variance a leaf must exceed before it may split
    pub split_variance_threshold: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            min_samples_split: 20,
            split_variance_threshold: 0.01,
        }
    }
}

/// Threshold test of an internal node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub feature: String,
    pub threshold: f64,
}

impl Split {
    /// Whether a context descends into the left child
    pub fn routes_left(&self, context: &Context) -> bool {
        match context.numeric(&self.feature) {
            Some(value) => value <= self.threshold,
            None => true,
        }
    }
}

/// One observed decision, kept for split evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub context: Context,
    pub action: Action,
    pub reward: f64,
}

#[derive(Debug)]
enum Node {
    Leaf {
        depth: usize,
        samples: u64,
        policy: Box<dyn BanditPolicy>,
    },
    Internal {
        depth: usize,
        split: Split,
        left: usize,
        right: usize,
    },
}

impl Node {
    fn depth(&self) -> usize {
        match self {
            Self::Leaf { depth, .. } | Self::Internal { depth, .. } => *depth,
        }
    }
}

/// Persisted form of one tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeState {
    Leaf {
        depth: usize,
        samples: u64,
        policy: PolicyState,
    },
    Internal {
        depth: usize,
        feature: String,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Exported state of a [`TreePolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeState {
    pub version: u32,
    pub config: TreeConfig,
    /// Nodes in arena order; index 0 is the root
    pub nodes: Vec<NodeState>,
    /// Most recent history entries, oldest first
    pub history: Vec<HistoryEntry>,
    #[serde(flatten)]
    pub counters: ActionCounters,
}

/// Context-partitioning policy delegating to one sub-policy per leaf
pub struct TreePolicy {
    config: TreeConfig,
    nodes: Vec<Node>,
    history: VecDeque<HistoryEntry>,
    counters: ActionCounters,
    factory: PolicyFactory,
    rng: StdRng,
}

impl fmt::Debug for TreePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreePolicy")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .field("history_len", &self.history.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl TreePolicy {
    /// Create a single-leaf tree whose leaves are built by `factory`
    pub fn new(config: TreeConfig, factory: PolicyFactory) -> Self {
        let root = Node::Leaf {
            depth: 0,
            samples: 0,
            policy: factory(),
        };
        Self {
            config,
            nodes: vec![root],
            history: VecDeque::new(),
            counters: ActionCounters::default(),
            factory,
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a tree with a fixed seed for the fallback choice
    pub fn with_seed(config: TreeConfig, factory: PolicyFactory, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new(config, factory)
        }
    }

    /// Current growth limits
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Total number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    /// Number of retained history entries
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Retained history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Split at the root, if the root has split
    pub fn root_split(&self) -> Option<&Split> {
        self.split_at(ROOT)
    }

    /// Split of an internal node
    pub fn split_at(&self, node: usize) -> Option<&Split> {
        match self.nodes.get(node) {
            Some(Node::Internal { split, .. }) => Some(split),
            _ => None,
        }
    }

    /// Depth of a node
    pub fn depth_of(&self, node: usize) -> Option<usize> {
        self.nodes.get(node).map(Node::depth)
    }

    /// Sample count of a leaf
    pub fn leaf_samples(&self, node: usize) -> Option<u64> {
        match self.nodes.get(node) {
            Some(Node::Leaf { samples, .. }) => Some(*samples),
            _ => None,
        }
    }

    /// Policy owned by a leaf
    pub fn leaf_policy(&self, node: usize) -> Option<&dyn BanditPolicy> {
        match self.nodes.get(node) {
            Some(Node::Leaf { policy, .. }) => Some(policy.as_ref()),
            _ => None,
        }
    }

    /// Arena index of the leaf a context routes to
    pub fn leaf_for(&self, context: &Context) -> usize {
        let mut id = ROOT;
        loop {
            match &self.nodes[id] {
                Node::Leaf { .. } => return id,
                Node::Internal {
                    split, left, right, ..
                } => {
                    id = if split.routes_left(context) {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Collapse back to a single fresh leaf and forget all history
    pub fn reset(&mut self) {
        self.nodes = vec![Node::Leaf {
            depth: 0,
            samples: 0,
            policy: (self.factory)(),
        }];
        self.history.clear();
        self.counters.clear();
    }

    fn observe(&mut self, action: &str, reward: f64, context: &Context, weight: Option<f64>) {
        self.push_history(HistoryEntry {
            context: context.clone(),
            action: action.to_string(),
            reward,
        });
        self.counters.record(action, reward);

        let leaf = self.leaf_for(context);
        if let Node::Leaf {
            samples, policy, ..
        } = &mut self.nodes[leaf]
        {
            *samples += 1;
            match weight {
                Some(w) => policy.update_with_importance_weight(action, reward, context, w),
                None => policy.update(action, reward, context),
            }
        }

        debug!(action = %action, reward, node = leaf, "Updated tree leaf");
        self.maybe_split(leaf);
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_RETAIN;
            self.history.drain(..excess);
            debug!(retained = self.history.len(), "Trimmed tree decision history");
        }
    }

    /// Entries among the recent window that currently route to `leaf`
    fn recent_entries_for(&self, leaf: usize) -> Vec<&HistoryEntry> {
        let skip = self.history.len().saturating_sub(SPLIT_WINDOW);
        self.history
            .iter()
            .skip(skip)
            .filter(|entry| self.leaf_for(&entry.context) == leaf)
            .collect()
    }

    fn maybe_split(&mut self, leaf: usize) {
        let (depth, samples) = match &self.nodes[leaf] {
            Node::Leaf { depth, samples, .. } => (*depth, *samples),
            Node::Internal { .. } => return,
        };
        if depth >= self.config.max_depth || samples < self.config.min_samples_split {
            return;
        }

        let routed = self.recent_entries_for(leaf);
        if (routed.len() as u64) < self.config.min_samples_split {
            return;
        }

        let rewards: Vec<f64> = routed.iter().map(|e| e.reward).collect();
        let spread = variance(&rewards);
        if spread <= self.config.split_variance_threshold {
            return;
        }

        match best_split(&routed) {
            Some((split, gain)) => self.split_leaf(leaf, split, gain),
            None => debug!(node = leaf, variance = spread, "No valid split candidate yet"),
        }
    }

    fn split_leaf(&mut self, leaf: usize, split: Split, gain: f64) {
        let depth = self.nodes[leaf].depth();
        let left = self.nodes.len();
        let right = left + 1;

        // Children must exist before the parent points at them
        for _ in 0..2 {
            self.nodes.push(Node::Leaf {
                depth: depth + 1,
                samples: 0,
                policy: (self.factory)(),
            });
        }

        info!(
            node = leaf,
            feature = %split.feature,
            threshold = split.threshold,
            gain,
            left,
            right,
            "Split tree leaf"
        );

        self.nodes[leaf] = Node::Internal {
            depth,
            split,
            left,
            right,
        };
    }

    fn node_state(node: &Node) -> NodeState {
        match node {
            Node::Leaf {
                depth,
                samples,
                policy,
            } => NodeState::Leaf {
                depth: *depth,
                samples: *samples,
                policy: policy.export_state(),
            },
            Node::Internal {
                depth,
                split,
                left,
                right,
            } => NodeState::Internal {
                depth: *depth,
                feature: split.feature.clone(),
                threshold: split.threshold,
                left: *left,
                right: *right,
            },
        }
    }
}

/// Check that persisted nodes form a tree rooted at index 0
fn validate_nodes(nodes: &[NodeState]) -> Result<()> {
    if nodes.is_empty() {
        return Err(Error::InvalidState("tree has no root node".to_string()));
    }

    let mut parents = vec![0usize; nodes.len()];
    for (id, node) in nodes.iter().enumerate() {
        if let NodeState::Internal { left, right, .. } = node {
            for &child in [left, right] {
                if child <= id || child >= nodes.len() {
                    return Err(Error::InvalidState(format!(
                        "node {} has invalid child {}",
                        id, child
                    )));
                }
                parents[child] += 1;
            }
        }
    }

    if let Some(orphan) = (1..nodes.len()).find(|&id| parents[id] != 1) {
        return Err(Error::InvalidState(format!(
            "node {} has {} parents",
            orphan, parents[orphan]
        )));
    }
    Ok(())
}

/// Population variance (zero for fewer than two values)
fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Best variance-reducing split over the given entries
fn best_split(entries: &[&HistoryEntry]) -> Option<(Split, f64)> {
    let rewards: Vec<f64> = entries.iter().map(|e| e.reward).collect();
    let total = variance(&rewards);

    let mut best: Option<(Split, f64)> = None;
    for entry in entries.iter().take(SPLIT_CANDIDATE_SAMPLES) {
        for (feature, threshold) in entry.context.numeric_features() {
            let split = Split {
                feature: feature.to_string(),
                threshold,
            };

            let mut left = Vec::new();
            let mut right = Vec::new();
            for e in entries {
                if split.routes_left(&e.context) {
                    left.push(e.reward);
                } else {
                    right.push(e.reward);
                }
            }
            if left.is_empty() || right.is_empty() {
                continue;
            }

            let gain = total - variance(&left) - variance(&right);
            if gain > best.as_ref().map_or(0.0, |(_, g)| *g) {
                best = Some((split, gain));
            }
        }
    }
    best
}

impl BanditPolicy for TreePolicy {
    fn recommend(&mut self, context: &Context, candidates: &[Action]) -> Result<Action> {
        require_candidates(candidates)?;

        let leaf = self.leaf_for(context);
        let result = match &mut self.nodes[leaf] {
            Node::Leaf { policy, .. } => policy.recommend(context, candidates),
            Node::Internal { .. } => Err(Error::RoutingFailed(format!(
                "node {} is not a leaf",
                leaf
            ))),
        };

        match result {
            Ok(action) => {
                debug!(action = %action, node = leaf, "Tree policy recommendation");
                Ok(action)
            }
            Err(err) => {
                // Defensive fallback: only reachable if a leaf policy fails on
                // a non-empty candidate list
                warn!(node = leaf, error = %err, "Leaf policy failed, choosing at random");
                candidates.choose(&mut self.rng).cloned().ok_or(err)
            }
        }
    }

    fn update(&mut self, action: &str, reward: f64, context: &Context) {
        self.observe(action, reward, context, None);
    }

    fn update_with_importance_weight(
        &mut self,
        action: &str,
        reward: f64,
        context: &Context,
        weight: f64,
    ) {
        self.observe(action, reward, context, Some(weight));
    }

    fn export_state(&self) -> PolicyState {
        let skip = self.history.len().saturating_sub(HISTORY_EXPORT_LIMIT);
        PolicyState::Tree(TreeState {
            version: STATE_VERSION,
            config: self.config,
            nodes: self.nodes.iter().map(Self::node_state).collect(),
            history: self.history.iter().skip(skip).cloned().collect(),
            counters: self.counters.clone(),
        })
    }

    fn import_state(&mut self, state: PolicyState) -> Result<()> {
        if !state.is_supported() {
            warn!(
                version = state.version(),
                supported = STATE_VERSION,
                "Ignoring tree policy state from a newer version"
            );
            return Ok(());
        }

        let found = state.kind();
        let PolicyState::Tree(state) = state else {
            return Err(Error::InvalidState(format!(
                "expected tree state, found {}",
                found
            )));
        };

        validate_nodes(&state.nodes)?;

        let nodes = state
            .nodes
            .into_iter()
            .map(|node| match node {
                NodeState::Leaf {
                    depth,
                    samples,
                    policy,
                } => Ok(Node::Leaf {
                    depth,
                    samples,
                    policy: restore_policy(policy, &self.factory)?,
                }),
                NodeState::Internal {
                    depth,
                    feature,
                    threshold,
                    left,
                    right,
                } => Ok(Node::Internal {
                    depth,
                    split: Split { feature, threshold },
                    left,
                    right,
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        self.config = state.config;
        self.nodes = nodes;
        self.history = state.history.into();
        self.counters = state.counters;

        info!(
            nodes = self.nodes.len(),
            leaves = self.leaf_count(),
            history = self.history.len(),
            "Imported tree policy state"
        );
        Ok(())
    }

    fn counters(&self) -> &ActionCounters {
        &self.counters
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Tree
    }
}
