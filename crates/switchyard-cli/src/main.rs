//! Switchyard CLI - simulate, inspect and query routing policies

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use clap::{Parser, Subcommand};
use rand::prelude::*;
use serde_json::json;
use switchyard_core::config::Config;
use switchyard_core::features::{Context, FeatureValue};
use switchyard_core::policy::{Action, NodeState, PolicyKind, PolicyState, restore_policy};
use switchyard_core::routing::{PolicyRouter, RoutingReward, Snapshot, SnapshotStore};
use tracing::info;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(author, version, about = "Online-learning backend routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a policy against a synthetic traffic stream
    Simulate {
        /// Policy to run (defaults to router.policy from the configuration)
        #[arg(short, long)]
        policy: Option<PolicyKind>,
        /// Number of routed requests
        #[arg(short, long, default_value_t = 1000)]
        steps: usize,
        /// Seed for traffic and policy randomness
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Save the learned state under this snapshot name
        #[arg(long)]
        save: Option<String>,
    },

    /// Summarize a snapshot
    Inspect {
        /// Snapshot file, or a name in the snapshot store
        snapshot: String,
    },

    /// Ask a snapshot which candidate it would route to
    Recommend {
        /// Snapshot file, or a name in the snapshot store
        snapshot: String,
        /// Candidate actions (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        candidates: Vec<String>,
        /// Context feature as key=value (numbers are parsed, anything else is text)
        #[arg(short, long = "feature", value_parser = parse_feature)]
        features: Vec<(String, FeatureValue)>,
    },

    /// Manage stored snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List stored snapshots
    List,
    /// Delete a stored snapshot
    Delete { name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            policy,
            steps,
            seed,
            save,
        } => cmd_simulate(policy, steps, seed, save.as_deref(), cli.format, cli.quiet).await,

        Commands::Inspect { snapshot } => cmd_inspect(&snapshot, cli.format).await,

        Commands::Recommend {
            snapshot,
            candidates,
            features,
        } => cmd_recommend(&snapshot, candidates, features, cli.format).await,

        Commands::Snapshots { action } => cmd_snapshots(action, cli.quiet).await,

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

/// Parse a `key=value` context feature
fn parse_feature(raw: &str) -> Result<(String, FeatureValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("feature name is empty in '{}'", raw));
    }

    let value = match value.trim().parse::<f64>() {
        Ok(number) => FeatureValue::Number(number),
        Err(_) => FeatureValue::Text(value.to_string()),
    };
    Ok((key.to_string(), value))
}

/// Find a snapshot by path, falling back to the configured store
fn resolve_snapshot(config: &Config, snapshot: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(snapshot);
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    let store = SnapshotStore::new(config.snapshot_dir()?);
    let stored = store.path_for(snapshot)?;
    if stored.exists() {
        Ok(stored)
    } else {
        Err(anyhow!(
            "Snapshot not found: {} (looked for a file and in {})",
            snapshot,
            store.dir().display()
        ))
    }
}

async fn read_snapshot(config: &Config, snapshot: &str) -> anyhow::Result<Snapshot> {
    let path = resolve_snapshot(config, snapshot)?;
    Snapshot::read(&path)
        .await
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))
}

const SIMULATED_BACKENDS: [&str; 3] = ["fast_model", "balanced_model", "slow_model"];
const SIMULATED_REGIONS: [&str; 3] = ["eu-west", "us-east", "ap-south"];

/// Success probability of a simulated backend for a request
///
/// Tight latency budgets favour the fast backend, loose ones the slow
/// (higher quality) backend; the balanced backend is never best but never bad.
fn simulated_success(action: &str, latency_budget: f64) -> f64 {
    match action {
        "fast_model" if latency_budget < 0.3 => 0.9,
        "fast_model" => 0.5,
        "slow_model" if latency_budget >= 0.6 => 0.9,
        "slow_model" => 0.2,
        _ => 0.6,
    }
}

#[derive(Default)]
struct ActionTally {
    selections: u64,
    reward: f64,
}

async fn cmd_simulate(
    policy: Option<PolicyKind>,
    steps: usize,
    seed: u64,
    save: Option<&str>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let kind = policy.unwrap_or(config.router.policy);
    let router = PolicyRouter::with_config(config.build_seeded(kind, seed), config.router.clone());

    let candidates: Vec<Action> = SIMULATED_BACKENDS.iter().map(|b| b.to_string()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tally: BTreeMap<Action, ActionTally> = BTreeMap::new();
    let mut total_reward = 0.0;
    let mut oracle_reward = 0.0;

    info!(policy = %kind, steps, seed, "Starting simulation");

    for _ in 0..steps {
        let latency_budget: f64 = rng.gen_range(0.0..1.0);
        let region = SIMULATED_REGIONS
            .choose(&mut rng)
            .copied()
            .unwrap_or("eu-west");
        let context = Context::new()
            .with_number("latency_budget", latency_budget)
            .with_text("region", region);

        let decision = router.select(&context, &candidates).await?;
        let success = rng.gen_bool(simulated_success(&decision.action, latency_budget));
        let reward = if success { 1.0 } else { 0.0 };
        router
            .record_outcome(&decision.decision_id, RoutingReward::scalar(reward))
            .await?;

        let entry = tally.entry(decision.action).or_default();
        entry.selections += 1;
        entry.reward += reward;
        total_reward += reward;
        oracle_reward += SIMULATED_BACKENDS
            .iter()
            .map(|b| simulated_success(b, latency_budget))
            .fold(0.0, f64::max);
    }

    let saved_to = match save {
        Some(name) => {
            let store = SnapshotStore::new(config.snapshot_dir()?);
            let state = router.snapshot().await;
            Some(store.save(name, &state).await?)
        }
        None => None,
    };

    let mean = |sum: f64, n: u64| if n == 0 { 0.0 } else { sum / n as f64 };
    let steps_u64 = steps as u64;

    match format {
        OutputFormat::Json => {
            let actions: serde_json::Map<String, serde_json::Value> = tally
                .iter()
                .map(|(action, t)| {
                    (
                        action.clone(),
                        json!({
                            "selections": t.selections,
                            "mean_reward": mean(t.reward, t.selections),
                        }),
                    )
                })
                .collect();
            let output = json!({
                "policy": kind,
                "steps": steps,
                "seed": seed,
                "mean_reward": mean(total_reward, steps_u64),
                "expected_regret": (oracle_reward - total_reward) / steps.max(1) as f64,
                "actions": actions,
                "saved_to": saved_to.as_ref().map(|p| p.display().to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            if !quiet {
                println!("Simulation ({} policy, {} steps, seed {}):", kind, steps, seed);
                for (action, t) in &tally {
                    println!(
                        "  {:<16} {:>6} selections  mean reward {:.3}",
                        action,
                        t.selections,
                        mean(t.reward, t.selections)
                    );
                }
                println!("  Mean reward: {:.3}", mean(total_reward, steps_u64));
            }
            if let Some(path) = &saved_to {
                println!("Saved snapshot to {}", path.display());
            }
        }
    }
    Ok(())
}

async fn cmd_inspect(snapshot: &str, format: OutputFormat) -> anyhow::Result<()> {
    let config = Config::load()?;
    let snapshot = read_snapshot(&config, snapshot).await?;
    let state = &snapshot.state;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Snapshot:");
    println!("  Policy: {}", state.kind());
    println!("  Version: {}", state.version());
    println!("  Saved at: {}", snapshot.saved_at.to_rfc3339());
    if !state.is_supported() {
        println!("  (newer than this build understands; it would be ignored on import)");
    }

    match state {
        PolicyState::Linear(linear) => {
            println!("  Dimension: {}", linear.dim);
            println!("  Alpha: {}", linear.alpha);
            println!("  Learning rate: {}", linear.learning_rate);
            println!("  Reward models: {}", linear.models.len());
        }
        PolicyState::Thompson(thompson) => {
            println!("  Exploration factor: {}", thompson.exploration_factor);
            println!("  Arms: {}", thompson.arms.len());
        }
        PolicyState::Tree(tree) => {
            let leaves = tree
                .nodes
                .iter()
                .filter(|n| matches!(n, NodeState::Leaf { .. }))
                .count();
            println!("  Nodes: {} ({} leaves)", tree.nodes.len(), leaves);
            println!("  Max depth: {}", tree.config.max_depth);
            println!("  History entries: {}", tree.history.len());
            for (id, node) in tree.nodes.iter().enumerate() {
                if let NodeState::Internal {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } = node
                {
                    println!(
                        "  Split {}: {} <= {} -> {}, else {}",
                        id, feature, threshold, left, right
                    );
                }
            }
        }
    }

    let counters = state.counters();
    let mut actions: Vec<_> = counters.counts.keys().collect();
    actions.sort();
    println!("  Actions:");
    if actions.is_empty() {
        println!("    (no updates yet)");
    }
    for action in actions {
        println!(
            "    {:<16} {:>6} updates  mean reward {:.3}",
            action,
            counters.count(action),
            counters.value(action)
        );
    }
    Ok(())
}

async fn cmd_recommend(
    snapshot: &str,
    candidates: Vec<String>,
    features: Vec<(String, FeatureValue)>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let snapshot = read_snapshot(&config, snapshot).await?;
    let kind = snapshot.state.kind();

    let mut policy = restore_policy(snapshot.state, &config.leaf_factory())?;
    let context: Context = features.into_iter().collect();
    let action = policy.recommend(&context, &candidates)?;

    match format {
        OutputFormat::Json => {
            let output = json!({
                "action": action,
                "policy": kind,
                "context": context,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => println!("{}", action),
    }
    Ok(())
}

async fn cmd_snapshots(action: SnapshotAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let store = SnapshotStore::new(config.snapshot_dir()?);

    match action {
        SnapshotAction::List => {
            let names = store.list().await?;
            if names.is_empty() && !quiet {
                println!("(no snapshots in {})", store.dir().display());
            }
            for name in names {
                println!("{}", name);
            }
        }
        SnapshotAction::Delete { name } => {
            if !store.delete(&name).await? {
                return Err(anyhow!("Snapshot not found: {}", name));
            }
            if !quiet {
                println!("Deleted snapshot {}", name);
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
