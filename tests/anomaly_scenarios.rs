//! End-to-end anomaly scenarios exercised through the reporter's `report`
//! entry point rather than the engine directly, so the persisted
//! `errplane.anomalies` point and its dimensions are checked the way an
//! external reader of the store would see them.

use agent::anomaly::AnomalyEngine;
use agent::model::{Comparator, Condition, MonitorConfig, MonitorRule, ReadSeriesParams};
use agent::reporter::Reporter;
use agent::store::snapshot::SnapshotStore;
use agent::store::Store;
use std::sync::Arc;
use std::time::Duration;

const DATABASE: &str = "acme+prod";
const HOSTNAME: &str = "host-1";

async fn build_reporter(monitors: Vec<MonitorRule>) -> (Arc<Reporter>, Arc<Store>) {
    let store_dir = tempfile::tempdir().unwrap();
    let snap_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(store_dir.path()));
    let snapshots = Arc::new(SnapshotStore::open(snap_dir.path(), 100).unwrap());
    let engine = Arc::new(AnomalyEngine::new(store.clone(), snapshots, DATABASE.to_string(), HOSTNAME.to_string()));
    engine
        .set_config(MonitorConfig {
            monitors,
            silence_policies: Vec::new(),
        })
        .await;
    let reporter = Arc::new(Reporter::new(store.clone(), engine, DATABASE.to_string(), "http://127.0.0.1:1".to_string(), "test-key".to_string()));
    (reporter, store)
}

async fn anomalies_count(store: &Store) -> usize {
    let params = ReadSeriesParams::new(DATABASE, "errplane.anomalies", 0);
    let mut points = Vec::new();
    store
        .read_series(&params, |p| {
            points.push(p);
            true
        })
        .await
        .unwrap();
    points.len()
}

#[tokio::test]
async fn cpu_metric_anomaly_fires_once_then_clears() {
    let monitor = MonitorRule {
        id: "cpu-high".to_string(),
        log_name: None,
        stat_name: Some("foo.bar".to_string()),
        stat_regex: None,
        plugin_name: None,
        disabled: false,
        snooze_until: None,
        conditions: vec![Condition {
            comparator: Comparator::Gt,
            threshold: 90.0,
            match_regex: None,
            only_after: Duration::from_secs(2),
        }],
    };
    let (reporter, store) = build_reporter(vec![monitor]).await;
    let t0 = 1_700_000_000;

    reporter.report("foo.bar", 95.0, t0, None, Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 0, "dwell has not elapsed yet");

    reporter.report("foo.bar", 95.0, t0 + 2, None, Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 1, "dwell elapsed, exactly one fire");

    let params = ReadSeriesParams::new(DATABASE, "errplane.anomalies", 0);
    let mut points = Vec::new();
    store.read_series(&params, |p| { points.push(p); true }).await.unwrap();
    let dims: std::collections::HashMap<_, _> = points[0].dimensions.iter().cloned().collect();
    assert_eq!(dims.get("statName").map(String::as_str), Some("foo.bar"));
    assert_eq!(dims.get("alertWhen").map(String::as_str), Some(">"));
    assert_eq!(dims.get("alertThreshold").map(String::as_str), Some("90"));
    assert_eq!(dims.get("onlyAfter").map(String::as_str), Some("2s"));

    reporter.report("foo.bar", 85.0, t0 + 3, None, Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 1, "a healthy reading clears the bucket without firing again");
}

#[tokio::test]
async fn plugin_status_change_fires_on_matching_context_only() {
    let monitor = MonitorRule {
        id: "redis-critical".to_string(),
        log_name: None,
        stat_name: None,
        stat_regex: None,
        plugin_name: Some("redis".to_string()),
        disabled: false,
        snooze_until: None,
        conditions: vec![Condition {
            comparator: Comparator::Eq,
            threshold: 0.0,
            match_regex: Some("critical".to_string()),
            only_after: Duration::from_secs(2),
        }],
    };
    let (reporter, store) = build_reporter(vec![monitor]).await;
    let t0 = 1_700_000_000;

    reporter.report(format!("{HOSTNAME}.plugins.redis.status"), 1.0, t0, Some("critical".to_string()), Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 0);

    reporter.report(format!("{HOSTNAME}.plugins.redis.status"), 1.0, t0 + 2, Some("critical".to_string()), Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 1, "dwell elapsed with matching status, exactly one fire");

    reporter.report(format!("{HOSTNAME}.plugins.redis.status"), 1.0, t0 + 4, Some("warning".to_string()), Vec::new()).await;
    assert_eq!(anomalies_count(&store).await, 1, "status no longer matches, bucket cleared, no further fire");
}
