//! Entry point: loads configuration, constructs every component behind an
//! `Arc`, spawns one task per loop, and waits for `ctrl_c`.
//!
//! Grounded on `manager/src/main.rs`'s construction-then-spawn sequence.

use agent::clock::now_unix;
use agent::cli::Cli;
use agent::collectors::{cpu, disk_io, disk_space, memory, network, processes, MetricSink, SharedSink};
use agent::config::Config;
use agent::config_service::ConfigServiceClient;
use agent::control::ControlChannel;
use agent::error::CollectorError;
use agent::model::MonitorConfig;
use agent::plugins::PluginRunner;
use agent::reporter::Reporter;
use agent::store::snapshot::SnapshotStore;
use agent::store::{retention, Store};
use agent::supervisor::ProcessSupervisor;
use agent::{anomaly, local_http, log_watcher};

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const SNAPSHOT_RETENTION_CAP: usize = 100;
const LOG_WATCHER_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let env_filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    info!("starting anomalous-agent");

    write_pidfile(&cli.pidfile)?;

    let hostname = config.resolve_hostname()?;
    let database = config.database();
    info!(%hostname, %database, "resolved agent identity");

    let store = Arc::new(Store::new(&config.datastore_dir));
    let snapshot_dir = std::path::Path::new(&config.datastore_dir).join("snapshots");
    let snapshots = Arc::new(SnapshotStore::open(&snapshot_dir, SNAPSHOT_RETENTION_CAP).context("failed to open snapshot store")?);
    retention::spawn(store.clone());

    let engine = Arc::new(anomaly::AnomalyEngine::new(store.clone(), snapshots.clone(), database.clone(), hostname.clone()));

    let config_client = Arc::new(ConfigServiceClient::new(config.config_service.clone(), config.api_key.clone(), database.clone(), hostname.clone()));

    if let Ok(initial) = config_client.fetch_monitor_config().await {
        engine.set_config(initial).await;
    } else {
        warn!("could not fetch initial monitor configuration, starting with an empty rule set");
        engine.set_config(MonitorConfig { monitors: Vec::new(), silence_policies: Vec::new() }).await;
    }

    let reporter = Arc::new(Reporter::new(store.clone(), engine.clone(), database.clone(), config.config_service.clone(), config.api_key.clone()));

    let (reload_tx, reload_rx) = mpsc::channel::<()>(4);
    anomaly::spawn_config_reload_loop(engine.clone(), config_client.clone(), config.sleep, reload_rx);

    log_watcher::spawn(engine.clone(), reporter.clone(), LOG_WATCHER_RECONCILE_INTERVAL);

    let supervisor = Arc::new(ProcessSupervisor::new(config_client.clone(), engine.clone(), reporter.clone(), hostname.clone()));
    supervisor.clone().spawn(config.monitored_sleep);

    spawn_collectors(reporter.clone(), &hostname, &config);

    let plugin_runner = Arc::new(PluginRunner::new(config_client.clone(), reporter.clone(), hostname.clone(), config.plugins_dir.clone(), config.custom_plugins_dir.clone()));
    plugin_runner.spawn(config.sleep);

    let control_channel = Arc::new(ControlChannel::new(
        config.config_websocket.clone(),
        hostname.clone(),
        database.clone(),
        store.clone(),
        snapshots.clone(),
        reload_tx,
        config.websocket_ping,
    ));
    control_channel.spawn();

    let http_router = local_http::router(supervisor);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.local_command_port)).await?;
    info!(port = config.local_command_port, "local command surface listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, http_router).await {
            error!(error = %err, "local http server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = std::fs::remove_file(&cli.pidfile);
    Ok(())
}

fn spawn_collectors(reporter: Arc<Reporter>, hostname: &str, config: &Config) {
    let sink: SharedSink = reporter as Arc<dyn MetricSink>;
    let (err_tx, mut err_rx) = mpsc::channel::<CollectorError>(64);
    tokio::spawn(async move {
        while let Some(err) = err_rx.recv().await {
            warn!(error = %err, "collector sampling error");
        }
    });

    memory::spawn(sink.clone(), hostname.to_string(), config.sleep, err_tx.clone());
    cpu::spawn(sink.clone(), hostname.to_string(), config.sleep, err_tx.clone());
    network::spawn(sink.clone(), hostname.to_string(), config.sleep, err_tx.clone());
    disk_space::spawn(sink.clone(), hostname.to_string(), config.sleep, err_tx.clone());
    disk_io::spawn(sink.clone(), hostname.to_string(), config.sleep, err_tx.clone());
    processes::spawn(sink, hostname.to_string(), config.top_n_processes, config.top_n_sleep, err_tx);
}

fn write_pidfile(path: &std::path::Path) -> Result<()> {
    std::fs::write(path, std::process::id().to_string()).with_context(|| format!("failed to write pidfile {}", path.display()))?;
    let _ = now_unix();
    Ok(())
}
