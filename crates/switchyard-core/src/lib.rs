//! Switchyard Core Library
//!
//! Online-learning decision engine for routing requests to backends:
//! - Context feature extraction
//! - Bandit policies (linear confidence-bound, Thompson Sampling,
//!   partitioning tree)
//! - Policy router with reward attribution
//! - Snapshot persistence
//! - Configuration

pub mod config;
pub mod error;
pub mod features;
pub mod policy;
pub mod routing;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::features::Context;
    pub use crate::policy::{Action, BanditPolicy, PolicyKind, PolicyState};
    pub use crate::routing::{PolicyRouter, RoutingDecision, RoutingReward, SnapshotStore};
}
