//! Tail-follows a reconciled set of log files, feeding each newly-appended
//! chunk to the anomaly engine.
//!
//! Grounded on `original_source/src/apps/agent/log-monitoring.go`'s
//! per-file `{size, lastHundredLines}` state and truncation handling,
//! translated from `fsnotify` to the `notify` crate (grounded via
//! `other_examples/manifests/vectordotdev-vector`,
//! `other_examples/manifests/penserai-acteon`); `manager/src/health/
//! log_monitor.rs`'s per-file async task fan-out informed the reconcile
//! loop's add/remove-watch shape.

use crate::anomaly::AnomalyEngine;
use crate::clock::now_unix;
use crate::reporter::Reporter;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const TAIL_LINES: usize = 100;

struct FileState {
    size: u64,
    tail: Vec<String>,
}

pub fn spawn(engine: Arc<AnomalyEngine>, reporter: Arc<Reporter>, reconcile_interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (modify_tx, mut modify_rx) = mpsc::channel::<PathBuf>(256);
        let mut watcher = match make_watcher(modify_tx) {
            Ok(w) => w,
            Err(err) => {
                error!(error = %err, "failed to initialize log file watcher, log monitoring disabled");
                return;
            }
        };

        let mut files: HashMap<String, FileState> = HashMap::new();
        let mut tick = tokio::time::interval(reconcile_interval);

        loop {
            tokio::select! {
                Some(path) = modify_rx.recv() => {
                    let path_str = path.to_string_lossy().to_string();
                    if files.contains_key(&path_str) {
                        if let Err(err) = handle_modify(&engine, &reporter, &mut files, &path_str).await {
                            warn!(path = %path_str, error = %err, "failed to process log modification");
                        }
                    }
                }
                _ = tick.tick() => {
                    reconcile(&engine, &mut watcher, &mut files).await;
                }
            }
        }
    })
}

fn make_watcher(modify_tx: mpsc::Sender<PathBuf>) -> notify::Result<RecommendedWatcher> {
    notify::recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            let _ = modify_tx.blocking_send(path);
        }
    })
}

async fn reconcile(engine: &Arc<AnomalyEngine>, watcher: &mut RecommendedWatcher, files: &mut HashMap<String, FileState>) {
    let wanted = engine.files_to_monitor().await;
    let wanted_set: std::collections::HashSet<&String> = wanted.iter().collect();

    for path in &wanted {
        if files.contains_key(path) {
            continue;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if let Err(err) = watcher.watch(Path::new(path), RecursiveMode::NonRecursive) {
                    warn!(%path, error = %err, "cannot watch log file");
                    continue;
                }
                info!(%path, "watching log file");
                files.insert(path.clone(), FileState { size: meta.len(), tail: Vec::new() });
            }
            Err(err) => warn!(%path, error = %err, "cannot stat log file"),
        }
    }

    let vanished: Vec<String> = files.keys().filter(|p| !wanted_set.contains(p)).cloned().collect();
    for path in vanished {
        let _ = watcher.unwatch(Path::new(&path));
        files.remove(&path);
        info!(%path, "removed log watcher");
    }
}

async fn handle_modify(
    engine: &Arc<AnomalyEngine>,
    reporter: &Arc<Reporter>,
    files: &mut HashMap<String, FileState>,
    path: &str,
) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(path).await?;
    let stat_size = meta.len();
    let state = files.get_mut(path).expect("reconcile populates entries before watching");

    let mut seek_from = state.size;
    if stat_size < seek_from {
        warn!(%path, "file was truncated");
        seek_from = 0;
        state.tail.clear();
    }
    if stat_size == seek_from {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(seek_from)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    state.size = stat_size;

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    let mut old_lines = state.tail.clone();
    if let Some(last) = old_lines.pop() {
        text = format!("{last}{text}");
    }
    let new_lines: Vec<String> = text.split('\n').map(|s| s.to_string()).collect();

    let fires = engine.evaluate_log(path, &old_lines, &new_lines, now_unix()).await;
    for fire in fires {
        reporter.emit_fire(fire).await;
    }

    old_lines.extend(new_lines);
    let start = old_lines.len().saturating_sub(TAIL_LINES);
    state.tail = old_lines[start..].to_vec();
    Ok(())
}
