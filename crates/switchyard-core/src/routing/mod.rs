//! Request routing on top of a bandit policy
//!
//! The key components are:
//!
//! - **Policy Router**: wraps one [`BanditPolicy`](crate::policy::BanditPolicy)
//!   behind an async lock, hands out decision ids and attributes outcomes.
//!
//! - **Routing Reward**: turns success, quality, cost and latency of a call
//!   into the scalar reward the policy learns from.
//!
//! - **Snapshot Store**: JSON snapshots of the policy state for learning
//!   across sessions.
//!
//! ## How It Works
//!
//! 1. The caller describes the request as a [`Context`](crate::features::Context)
//!    and lists the backends that could serve it
//! 2. The policy picks one; the router remembers the context under a decision id
//! 3. After the call completes the outcome is recorded against that id
//! 4. The policy state is saved periodically and restored on startup
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::prelude::*;
//!
//! let router = PolicyRouter::from_config(&Config::load()?)?;
//! router.load().await?;
//!
//! let context = Context::new()
//!     .with_number("latency", 50.0)
//!     .with_text("region", "eu-west");
//! let candidates = vec!["fast_model".to_string(), "slow_model".to_string()];
//! let decision = router.select(&context, &candidates).await?;
//!
//! // Call the selected backend...
//!
//! let reward = RoutingReward::new(true)
//!     .with_quality(0.9)
//!     .with_latency(latency_ms, 2000);
//! router.record_outcome(&decision.decision_id, reward).await?;
//! router.save().await?;
//! ```

mod router;
mod store;
mod types;

pub use router::{PolicyRouter, PolicyRouterBuilder, RouterConfig};
pub use store::{Snapshot, SnapshotStore};
pub use types::{RoutingDecision, RoutingReward};
