//! Sliding-window anomaly evaluation over stat values, log lines, plugin
//! status, and process transitions.
//!
//! Grounded on `original_source/src/apps/agent/anomalies.go`'s event-bucket
//! dwell algorithm, generalized to hash-keyed buckets stored in a
//! `dashmap::DashMap` (grounded via `N3mes1s-sentra`'s concurrent rule-state
//! table) instead of the Go source's `fmt.Sprintf("%#v/%#v", ...)` string
//! keys.

mod engine;
mod silence;

use crate::config_service::ConfigServiceClient;
use crate::model::{MonitorConfig, ProcessStatus};
use crate::store::snapshot::SnapshotStore;
use crate::store::Store;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub ts: i64,
    pub before: Vec<String>,
    pub line: String,
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricEvent {
    pub ts: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessEventState {
    pub ts: i64,
    pub status: ProcessStatus,
}

/// A synthesized `errplane.anomalies` emission waiting to be persisted and
/// forwarded by the reporter. The engine never calls the reporter directly —
/// that would cycle the reporter's own handle back into the engine — so
/// fires are handed back as plain data instead.
#[derive(Debug, Clone)]
pub struct AnomalyFire {
    pub value: f64,
    pub context: Option<String>,
    pub dims: Vec<(String, String)>,
}

pub struct AnomalyEngine {
    config: RwLock<MonitorConfig>,
    log_events: DashMap<u64, Vec<LogEvent>>,
    metric_events: DashMap<u64, Vec<MetricEvent>>,
    process_events: DashMap<String, ProcessEventState>,
    store: Arc<Store>,
    snapshots: Arc<SnapshotStore>,
    database: String,
    hostname: String,
}

impl AnomalyEngine {
    pub fn new(store: Arc<Store>, snapshots: Arc<SnapshotStore>, database: String, hostname: String) -> Self {
        Self {
            config: RwLock::new(MonitorConfig {
                monitors: Vec::new(),
                silence_policies: Vec::new(),
            }),
            log_events: DashMap::new(),
            metric_events: DashMap::new(),
            process_events: DashMap::new(),
            store,
            snapshots,
            database,
            hostname,
        }
    }

    pub async fn set_config(&self, config: MonitorConfig) {
        *self.config.write().await = config;
    }

    /// Log paths currently named by a monitor's `log_name`, for the watcher's
    /// reconciliation tick.
    pub async fn files_to_monitor(&self) -> Vec<String> {
        self.config
            .read()
            .await
            .monitors
            .iter()
            .filter_map(|m| m.log_name.clone())
            .collect()
    }
}

fn condition_hash(monitor: &crate::model::MonitorRule, condition: &crate::model::Condition) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Ok(bytes) = bincode::serialize(monitor) {
        bytes.hash(&mut hasher);
    }
    if let Ok(bytes) = bincode::serialize(condition) {
        bytes.hash(&mut hasher);
    }
    hasher.finish()
}

fn process_hash(monitor_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    monitor_id.hash(&mut hasher);
    hasher.finish()
}

/// Refetches monitor configuration from the config-service on `sleep`,
/// also waking immediately when the control channel signals a reload.
pub fn spawn_config_reload_loop(
    engine: Arc<AnomalyEngine>,
    config_client: Arc<ConfigServiceClient>,
    sleep: Duration,
    mut reload_signal: mpsc::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match config_client.fetch_monitor_config().await {
                Ok(cfg) => engine.set_config(cfg).await,
                Err(err) => tracing::warn!(error = %err, "failed to refresh monitor configuration"),
            }
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = reload_signal.recv() => {}
            }
        }
    })
}
