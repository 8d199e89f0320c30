//! Local command surface: snooze/unsnooze/restart against a nickname that
//! the supervisor actually knows about, and the 400 guard for ones it
//! doesn't.

use agent::anomaly::AnomalyEngine;
use agent::config_service::ConfigServiceClient;
use agent::local_http;
use agent::model::MonitorConfig;
use agent::reporter::Reporter;
use agent::store::snapshot::SnapshotStore;
use agent::store::Store;
use agent::supervisor::ProcessSupervisor;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const DATABASE: &str = "acme+prod";
const HOSTNAME: &str = "host-1";

async fn supervisor_with_known_process(server: &mockito::ServerGuard) -> Arc<ProcessSupervisor> {
    let store_dir = tempfile::tempdir().unwrap();
    let snap_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::new(store_dir.path()));
    let snapshots = Arc::new(SnapshotStore::open(snap_dir.path(), 100).unwrap());
    let engine = Arc::new(AnomalyEngine::new(store.clone(), snapshots, DATABASE.to_string(), HOSTNAME.to_string()));
    engine.set_config(MonitorConfig { monitors: Vec::new(), silence_policies: Vec::new() }).await;
    let reporter = Arc::new(Reporter::new(store.clone(), engine.clone(), DATABASE.to_string(), server.url(), "key".to_string()));
    let config_client = Arc::new(ConfigServiceClient::new(server.url(), "key".to_string(), DATABASE.to_string(), HOSTNAME.to_string()));

    let supervisor = Arc::new(ProcessSupervisor::new(config_client, engine, reporter, HOSTNAME.to_string()));
    let handle = supervisor.clone().spawn(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.abort();
    supervisor
}

#[tokio::test]
async fn unknown_nickname_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/v2/databases/acme+prod/agents/host-1/configuration")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(r#"{"plugins":{},"disabled_plugins":[],"processes":[]}"#)
        .create_async()
        .await;
    let supervisor = supervisor_with_known_process(&server).await;
    let app = local_http::router(supervisor);

    let response = app
        .oneshot(Request::builder().uri("/stop_monitoring/ghost").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn known_nickname_can_be_snoozed_and_unsnoozed_via_http() {
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
    let supervisor = supervisor_with_known_process(&server).await;
    let snooze_handle = supervisor.snooze.clone();
    let app = local_http::router(supervisor);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/stop_monitoring/web?duration=60").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(snooze_handle.is_snoozed("web").await);

    let response = app
        .oneshot(Request::builder().uri("/start_monitoring/web").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!snooze_handle.is_snoozed("web").await);
}
