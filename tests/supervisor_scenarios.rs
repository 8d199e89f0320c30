//! Process supervisor scenarios: down-transition firing and snooze-gated
//! auto-start, driven through the real tick loop against a mocked
//! config-service backend.

use agent::anomaly::AnomalyEngine;
use agent::config_service::ConfigServiceClient;
use agent::model::{MonitorConfig, ReadSeriesParams};
use agent::reporter::Reporter;
use agent::store::snapshot::SnapshotStore;
use agent::store::Store;
use agent::supervisor::{parse_snooze_duration, ProcessSupervisor};
use std::sync::Arc;
use std::time::Duration;

const DATABASE: &str = "acme+prod";
const HOSTNAME: &str = "host-1";

async fn anomalies_count(store: &Store) -> usize {
    let params = ReadSeriesParams::new(DATABASE, "errplane.anomalies", 0);
    let mut points = Vec::new();
    store.read_series(&params, |p| { points.push(p); true }).await.unwrap();
    points.len()
}

#[tokio::test]
async fn down_process_fires_once_and_attempts_start_each_tick() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"{
        "plugins": {},
        "disabled_plugins": [],
        "processes": [{
            "id": "web-mon",
            "name": "this-process-does-not-exist-xyz",
            "nickname": "web",
            "status_method": "name",
            "start_cmd": "true",
            "stop_cmd": "",
            "user": "root"
        }]
    }"#;
    let _mock = server
        .mock("GET", "/v2/databases/acme+prod/agents/host-1/configuration")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let store_dir = tempfile::tempdir().unwrap();
    let snap_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(store_dir.path()));
    let snapshots = Arc::new(SnapshotStore::open(snap_dir.path(), 100).unwrap());
    let engine = Arc::new(AnomalyEngine::new(store.clone(), snapshots, DATABASE.to_string(), HOSTNAME.to_string()));
    engine.set_config(MonitorConfig { monitors: Vec::new(), silence_policies: Vec::new() }).await;
    let reporter = Arc::new(Reporter::new(store.clone(), engine.clone(), DATABASE.to_string(), server.url(), "key".to_string()));
    let config_client = Arc::new(ConfigServiceClient::new(server.url(), "key".to_string(), DATABASE.to_string(), HOSTNAME.to_string()));

    let supervisor = Arc::new(ProcessSupervisor::new(config_client, engine, reporter, HOSTNAME.to_string()));
    let handle = supervisor.clone().spawn(Duration::from_millis(30));

    tokio::time::sleep(Duration::from_millis(140)).await;
    handle.abort();

    assert_eq!(anomalies_count(&store).await, 1, "a process that stays down only transitions once");
}

#[tokio::test]
async fn snoozed_nickname_is_not_restarted() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"{
        "plugins": {},
        "disabled_plugins": [],
        "processes": [{
            "id": "web-mon",
            "name": "this-process-does-not-exist-xyz",
            "nickname": "web",
            "status_method": "name",
            "start_cmd": "/nonexistent/marker-binary-should-never-run",
            "stop_cmd": "",
            "user": "root"
        }]
    }"#;
    let _mock = server
        .mock("GET", "/v2/databases/acme+prod/agents/host-1/configuration")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let store_dir = tempfile::tempdir().unwrap();
    let snap_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(store_dir.path()));
    let snapshots = Arc::new(SnapshotStore::open(snap_dir.path(), 100).unwrap());
    let engine = Arc::new(AnomalyEngine::new(store.clone(), snapshots, DATABASE.to_string(), HOSTNAME.to_string()));
    engine.set_config(MonitorConfig { monitors: Vec::new(), silence_policies: Vec::new() }).await;
    let reporter = Arc::new(Reporter::new(store.clone(), engine.clone(), DATABASE.to_string(), server.url(), "key".to_string()));
    let config_client = Arc::new(ConfigServiceClient::new(server.url(), "key".to_string(), DATABASE.to_string(), HOSTNAME.to_string()));

    let supervisor = Arc::new(ProcessSupervisor::new(config_client, engine, reporter, HOSTNAME.to_string()));
    supervisor.snooze.snooze("web", parse_snooze_duration(None)).await;
    assert!(supervisor.snooze.is_snoozed("web").await);

    let handle = supervisor.clone().spawn(Duration::from_millis(30));
    tokio::time::sleep(Duration::from_millis(140)).await;
    handle.abort();

    assert!(supervisor.snooze.is_snoozed("web").await, "indefinite snooze is never cleared by the tick loop itself");
}
