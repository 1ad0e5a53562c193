//! Snapshot location when the router configuration leaves it unset
//!
//! Kept in its own test binary because it points `SWITCHYARD_CONFIG_DIR`
//! at a temporary directory for the whole process.

use switchyard_core::{
    config::Config,
    features::Context,
    routing::{PolicyRouter, RoutingReward},
};
use tempfile::TempDir;

#[tokio::test]
async fn test_default_config_persists_under_config_dir() {
    let dir = TempDir::new().unwrap();
    // SAFETY: the only test in this binary, no other thread reads the environment
    unsafe { std::env::set_var("SWITCHYARD_CONFIG_DIR", dir.path()) };

    let mut config = Config::default();
    config.router.persist_on_outcome = true;
    assert_eq!(config.snapshot_dir().unwrap(), dir.path().join("snapshots"));

    let router = PolicyRouter::from_config(&config).unwrap();
    let snapshot = dir.path().join("snapshots").join("default.json");

    router
        .record_with_context(
            "fast_model",
            &Context::new().with_number("latency_ms", 50.0),
            &RoutingReward::scalar(0.9),
        )
        .await
        .unwrap();
    assert!(snapshot.exists(), "outcome was not persisted");

    std::fs::remove_file(&snapshot).unwrap();
    router.save().await.unwrap();
    assert!(snapshot.exists(), "save wrote nothing");

    let restarted = PolicyRouter::from_config(&config).unwrap();
    assert!(restarted.load().await.unwrap());
    assert_eq!(restarted.counters().await.count("fast_model"), 1);
}
