use super::{condition_hash, process_hash, silence, AnomalyEngine, AnomalyFire, LogEvent, MetricEvent, ProcessEventState};
use crate::model::{ProcessMonitorConfig, ProcessStatus};
use regex::RegexBuilder;

const STAT_SNAPSHOT_WINDOW_SECS: i64 = 30 * 60;
const LOG_SNAPSHOT_LIMIT: usize = 500;
const LOG_CONTEXT_RADIUS: usize = 10;

impl AnomalyEngine {
    /// Appends an event to the metric bucket for `key` if `holds`, or clears
    /// it otherwise; returns whether the bucket's oldest event is now older
    /// than `only_after_secs` (a fire), pruning stale events either way.
    fn touch_metric_bucket(&self, key: u64, holds: bool, only_after_secs: i64, now: i64) -> bool {
        if !holds {
            self.metric_events.remove(&key);
            return false;
        }
        let cutoff = now - only_after_secs;
        let mut bucket = self.metric_events.entry(key).or_insert_with(Vec::new);
        bucket.push(MetricEvent { ts: now });
        let fire = bucket.first().map(|e| e.ts <= cutoff).unwrap_or(false);
        bucket.retain(|e| e.ts > cutoff);
        fire
    }

    async fn capture_snapshot(
        &self,
        regex: String,
        start: i64,
        limit: Option<usize>,
    ) -> Option<String> {
        let requests = vec![crate::model::SnapshotRequest {
            regex,
            start,
            end: None,
            limit,
        }];
        match self.snapshots.take_snapshot(&self.store, &self.database, &requests).await {
            Ok(snap) => Some(snap.id),
            Err(err) => {
                tracing::error!(error = %err, "failed to capture evidence snapshot");
                None
            }
        }
    }

    async fn silence_allows(&self, key: u64, now: i64) -> bool {
        let policies = self.config.read().await.silence_policies.clone();
        match silence::check_and_mark(&self.store, &self.database, &policies, key, now).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::error!(error = %err, "silence ledger write failed, allowing fire");
                true
            }
        }
    }

    /// Evaluates an incoming `(metric, value)` sample against every monitor
    /// whose `stat_name`/`stat_regex` selects it.
    pub async fn evaluate_stat(
        &self,
        metric: &str,
        value: f64,
        dims: &[(String, String)],
        now: i64,
    ) -> Vec<AnomalyFire> {
        let config = self.config.read().await;
        let mut fires = Vec::new();
        for monitor in &config.monitors {
            if monitor.disabled || monitor.is_snoozed(now) {
                continue;
            }
            let selects = monitor.stat_name.as_deref() == Some(metric)
                || monitor
                    .stat_regex
                    .as_deref()
                    .and_then(|p| regex::Regex::new(p).ok())
                    .map(|re| re.is_match(metric))
                    .unwrap_or(false);
            if !selects {
                continue;
            }
            for condition in &monitor.conditions {
                let key = condition_hash(monitor, condition);
                let holds = condition.comparator.holds(value, condition.threshold);
                let only_after = condition.only_after.as_secs() as i64;
                if self.touch_metric_bucket(key, holds, only_after, now) {
                    if self.silence_allows(key, now).await {
                        let snapshot_id = self
                            .capture_snapshot(
                                format!("^{}\\.stats\\.", regex::escape(&self.hostname)),
                                now - STAT_SNAPSHOT_WINDOW_SECS,
                                None,
                            )
                            .await;
                        fires.push(AnomalyFire {
                            value: 1.0,
                            context: None,
                            dims: vec![
                                ("monitor".into(), monitor.id.clone()),
                                ("type".into(), "stat".into()),
                                ("statName".into(), metric.to_string()),
                                ("alertWhen".into(), condition.comparator.to_string()),
                                ("alertThreshold".into(), condition.threshold.to_string()),
                                ("onlyAfter".into(), humantime::format_duration(condition.only_after).to_string()),
                                ("snapshot_id".into(), snapshot_id.unwrap_or_default()),
                            ],
                        });
                    }
                }
            }
        }
        let _ = dims;
        fires
    }

    /// Evaluates plugin status text matched by `plugins.<name>.status`
    /// against monitors whose `plugin_name` selects it, using the same dwell
    /// bucket and fire logic as stat conditions.
    pub async fn evaluate_plugin(&self, metric: &str, status_context: Option<&str>, now: i64) -> Vec<AnomalyFire> {
        let Some(caps) = plugin_status_regex().captures(metric) else {
            return Vec::new();
        };
        let plugin_name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        let config = self.config.read().await;
        let mut fires = Vec::new();
        for monitor in &config.monitors {
            if monitor.disabled || monitor.is_snoozed(now) {
                continue;
            }
            let Some(plugin_pattern) = &monitor.plugin_name else {
                continue;
            };
            let Ok(plugin_re) = regex::Regex::new(plugin_pattern) else {
                continue;
            };
            if !plugin_re.is_match(&plugin_name) {
                continue;
            }
            for condition in &monitor.conditions {
                let Some(status_pattern) = &condition.match_regex else {
                    continue;
                };
                let Ok(status_re) = regex::Regex::new(status_pattern) else {
                    continue;
                };
                let holds = status_context.map(|c| status_re.is_match(c)).unwrap_or(false);
                let key = condition_hash(monitor, condition);
                let only_after = condition.only_after.as_secs() as i64;
                if self.touch_metric_bucket(key, holds, only_after, now) && self.silence_allows(key, now).await {
                    let snapshot_id = self
                        .capture_snapshot(
                            format!("^{}\\.stats\\.", regex::escape(&self.hostname)),
                            now - STAT_SNAPSHOT_WINDOW_SECS,
                            None,
                        )
                        .await;
                    fires.push(AnomalyFire {
                        value: 1.0,
                        context: status_context.map(|s| s.to_string()),
                        dims: vec![
                            ("monitor".into(), monitor.id.clone()),
                            ("type".into(), "plugin".into()),
                            ("pluginName".into(), plugin_name.clone()),
                            ("snapshot_id".into(), snapshot_id.unwrap_or_default()),
                        ],
                    });
                }
            }
        }
        fires
    }

    /// Evaluates newly-appended log lines against monitors whose `log_name`
    /// selects `path`.
    pub async fn evaluate_log(&self, path: &str, old_lines: &[String], new_lines: &[String], now: i64) -> Vec<AnomalyFire> {
        let config = self.config.read().await;
        let mut fires = Vec::new();
        for monitor in &config.monitors {
            if monitor.disabled || monitor.is_snoozed(now) {
                continue;
            }
            if monitor.log_name.as_deref() != Some(path) {
                continue;
            }
            for condition in &monitor.conditions {
                let Some(pattern) = &condition.match_regex else {
                    continue;
                };
                let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
                    continue;
                };
                let matched: Vec<usize> = new_lines
                    .iter()
                    .enumerate()
                    .filter(|(_, line)| re.is_match(line))
                    .map(|(idx, _)| idx)
                    .collect();
                if matched.is_empty() {
                    continue;
                }
                let key = condition_hash(monitor, condition);
                let stateless = condition.only_after.as_secs() == 0 || condition.threshold <= 1.0;
                if stateless {
                    self.log_events.remove(&key);
                }
                let only_after = condition.only_after.as_secs() as i64;
                let cutoff = now - only_after;
                let count = {
                    let mut bucket = self.log_events.entry(key).or_insert_with(Vec::new);
                    for &idx in &matched {
                        bucket.push(LogEvent {
                            ts: now,
                            before: context_before(old_lines, new_lines, idx),
                            line: new_lines[idx].clone(),
                            after: context_after(new_lines, idx),
                        });
                    }
                    bucket.retain(|e| e.ts > cutoff);
                    bucket.len()
                };
                if (count as f64) < condition.threshold {
                    continue;
                }
                if !self.silence_allows(key, now).await {
                    continue;
                }
                let evidence = if condition.threshold <= 1.0 {
                    matched
                        .first()
                        .map(|&idx| log_window(old_lines, new_lines, idx))
                        .unwrap_or_default()
                } else {
                    matched.iter().map(|&idx| new_lines[idx].as_str()).collect::<Vec<_>>().join("\n")
                };
                let snapshot_id = self
                    .capture_snapshot(
                        format!("^{}\\.logs\\.", regex::escape(&self.hostname)),
                        0,
                        Some(LOG_SNAPSHOT_LIMIT),
                    )
                    .await;
                fires.push(AnomalyFire {
                    value: count as f64,
                    context: Some(evidence),
                    dims: vec![
                        ("monitor".into(), monitor.id.clone()),
                        ("type".into(), "log".into()),
                        ("log_name".into(), path.to_string()),
                        ("snapshot_id".into(), snapshot_id.unwrap_or_default()),
                    ],
                });
            }
        }
        fires
    }

    /// Evaluates a process up/down report against its prior recorded
    /// status, firing on transition only.
    pub async fn evaluate_process(&self, monitor: &ProcessMonitorConfig, status: ProcessStatus, now: i64) -> Option<AnomalyFire> {
        let prior = self.process_events.get(&monitor.id).map(|e| e.status);
        self.process_events.insert(monitor.id.clone(), ProcessEventState { ts: now, status });
        if prior == Some(status) {
            return None;
        }
        let key = process_hash(&monitor.id);
        if !self.silence_allows(key, now).await {
            return None;
        }
        match status {
            ProcessStatus::Down => {
                let stats_snapshot = self
                    .capture_snapshot(format!("^{}\\.stats\\.", regex::escape(&self.hostname)), now - STAT_SNAPSHOT_WINDOW_SECS, None)
                    .await;
                let process_snapshot = self
                    .capture_snapshot(
                        format!("^{}\\.process\\.{}\\.", regex::escape(&self.hostname), regex::escape(&monitor.nickname)),
                        now - STAT_SNAPSHOT_WINDOW_SECS,
                        None,
                    )
                    .await;
                let log_snapshot = self
                    .capture_snapshot(format!("^{}\\.logs\\.", regex::escape(&self.hostname)), 0, Some(LOG_SNAPSHOT_LIMIT))
                    .await;
                Some(AnomalyFire {
                    value: 1.0,
                    context: None,
                    dims: vec![
                        ("monitor".into(), monitor.id.clone()),
                        ("type".into(), "process".into()),
                        ("status".into(), "down".into()),
                        ("snapshot_id_stats".into(), stats_snapshot.unwrap_or_default()),
                        ("snapshot_id_process".into(), process_snapshot.unwrap_or_default()),
                        ("snapshot_id_logs".into(), log_snapshot.unwrap_or_default()),
                    ],
                })
            }
            ProcessStatus::Up => Some(AnomalyFire {
                value: 1.0,
                context: None,
                dims: vec![
                    ("monitor".into(), monitor.id.clone()),
                    ("type".into(), "process".into()),
                    ("status".into(), "up".into()),
                ],
            }),
        }
    }
}

fn context_before(old_lines: &[String], new_lines: &[String], idx: usize) -> Vec<String> {
    let combined = combine(old_lines, new_lines);
    let offset = old_lines.len() + idx;
    let start = offset.saturating_sub(LOG_CONTEXT_RADIUS);
    combined[start..offset].to_vec()
}

fn context_after(new_lines: &[String], idx: usize) -> Vec<String> {
    let end = (idx + 1 + LOG_CONTEXT_RADIUS).min(new_lines.len());
    new_lines[idx + 1..end].to_vec()
}

fn combine(old_lines: &[String], new_lines: &[String]) -> Vec<String> {
    let mut combined = Vec::with_capacity(old_lines.len() + new_lines.len());
    combined.extend_from_slice(old_lines);
    combined.extend_from_slice(new_lines);
    combined
}

fn log_window(old_lines: &[String], new_lines: &[String], idx: usize) -> String {
    let combined = combine(old_lines, new_lines);
    let offset = old_lines.len() + idx;
    let start = offset.saturating_sub(LOG_CONTEXT_RADIUS);
    let end = (offset + LOG_CONTEXT_RADIUS).min(combined.len().saturating_sub(1));
    combined[start..=end].join("\n")
}

static PLUGIN_STATUS_RE_CELL: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

/// Matches both the host-prefixed form plugins actually report
/// (`<hostname>.plugins.<name>.status`) and the bare form, since the
/// hostname itself may contain dots.
fn plugin_status_regex() -> &'static regex::Regex {
    PLUGIN_STATUS_RE_CELL.get_or_init(|| regex::Regex::new(r"(?:^|\.)plugins\.([^.]+)\.status$").expect("static regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Comparator, Condition, MonitorConfig, MonitorRule};
    use crate::store::snapshot::SnapshotStore;
    use crate::store::Store;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine_with(monitors: Vec<MonitorRule>) -> AnomalyEngine {
        let store_dir = tempfile::tempdir().unwrap();
        let snap_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(store_dir.path()));
        let snapshots = Arc::new(SnapshotStore::open(snap_dir.path(), 100).unwrap());
        let engine = AnomalyEngine::new(store, snapshots, "acme+prod".to_string(), "host-1".to_string());
        engine
            .set_config(MonitorConfig {
                monitors,
                silence_policies: Vec::new(),
            })
            .await;
        engine
    }

    fn threshold_monitor(only_after_secs: u64) -> MonitorRule {
        MonitorRule {
            id: "cpu-high".to_string(),
            log_name: None,
            stat_name: Some("cpu.idle".to_string()),
            stat_regex: None,
            plugin_name: None,
            disabled: false,
            snooze_until: None,
            conditions: vec![Condition {
                comparator: Comparator::Lt,
                threshold: 5.0,
                match_regex: None,
                only_after: Duration::from_secs(only_after_secs),
            }],
        }
    }

    #[tokio::test]
    async fn stat_condition_does_not_fire_before_dwell_elapses() {
        let engine = engine_with(vec![threshold_monitor(300)]).await;
        let fires = engine.evaluate_stat("cpu.idle", 1.0, &[], 1_700_000_000).await;
        assert!(fires.is_empty(), "dwell window has not elapsed yet");
    }

    #[tokio::test]
    async fn stat_condition_resets_bucket_when_comparator_fails() {
        let engine = engine_with(vec![threshold_monitor(0)]).await;
        let fires = engine.evaluate_stat("cpu.idle", 50.0, &[], 1_700_000_000).await;
        assert!(fires.is_empty(), "comparator does not hold for a healthy value");
    }

    #[tokio::test]
    async fn stat_condition_fires_once_dwell_has_elapsed() {
        let engine = engine_with(vec![threshold_monitor(0)]).await;
        let fires = engine.evaluate_stat("cpu.idle", 1.0, &[], 1_700_000_000).await;
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].dims[1], ("type".to_string(), "stat".to_string()));
    }

    #[tokio::test]
    async fn stat_condition_fires_exactly_when_dwell_elapses_mid_burst() {
        let engine = engine_with(vec![threshold_monitor(2)]).await;
        let t0 = 1_700_000_000;
        assert!(engine.evaluate_stat("cpu.idle", 1.0, &[], t0).await.is_empty());
        assert!(engine.evaluate_stat("cpu.idle", 1.0, &[], t0 + 1).await.is_empty());
        let fires = engine.evaluate_stat("cpu.idle", 1.0, &[], t0 + 3).await;
        assert_eq!(fires.len(), 1, "oldest bucket entry is now older than the dwell window");
        let healthy = engine.evaluate_stat("cpu.idle", 50.0, &[], t0 + 4).await;
        assert!(healthy.is_empty(), "a healthy reading clears the bucket");
        let no_repeat = engine.evaluate_stat("cpu.idle", 1.0, &[], t0 + 5).await;
        assert!(no_repeat.is_empty(), "bucket was cleared, dwell has not re-elapsed");
    }

    #[tokio::test]
    async fn process_transition_fires_only_once() {
        let monitor = ProcessMonitorConfig {
            id: "web".to_string(),
            name: "nginx".to_string(),
            nickname: "web".to_string(),
            status_method: crate::model::StatusMethod::Name,
            regex: None,
            start_cmd: "nginx".to_string(),
            stop_cmd: String::new(),
            user: "root".to_string(),
            snooze_until: None,
        };
        let engine = engine_with(vec![]).await;
        let now = 1_700_000_000;
        let first = engine.evaluate_process(&monitor, ProcessStatus::Down, now).await;
        assert!(first.is_some());
        let second = engine.evaluate_process(&monitor, ProcessStatus::Down, now + 1).await;
        assert!(second.is_none(), "repeated identical status is not a transition");
    }

    fn log_threshold_monitor(threshold: f64, only_after_secs: u64) -> MonitorRule {
        MonitorRule {
            id: "error-burst".to_string(),
            log_name: Some("/tmp/x.log".to_string()),
            stat_name: None,
            stat_regex: None,
            plugin_name: None,
            disabled: false,
            snooze_until: None,
            conditions: vec![Condition {
                comparator: Comparator::Eq,
                threshold,
                match_regex: Some("ERROR".to_string()),
                only_after: Duration::from_secs(only_after_secs),
            }],
        }
    }

    #[tokio::test]
    async fn log_bucket_drops_matches_older_than_only_after() {
        let engine = engine_with(vec![log_threshold_monitor(3.0, 5)]).await;
        let t0 = 1_700_000_000;
        let lines = vec!["ERROR: boom".to_string()];

        assert!(engine.evaluate_log("/tmp/x.log", &[], &lines, t0).await.is_empty());
        assert!(engine.evaluate_log("/tmp/x.log", &[], &lines, t0 + 1).await.is_empty());
        // These two matches are outside the 5s window of the next ones, so
        // they must not count toward the threshold once pruned.
        let fires = engine.evaluate_log("/tmp/x.log", &[], &lines, t0 + 10).await;
        assert!(fires.is_empty(), "stale matches were pruned, only one left in the window");
        assert!(engine.evaluate_log("/tmp/x.log", &[], &lines, t0 + 11).await.is_empty());
        let fires = engine.evaluate_log("/tmp/x.log", &[], &lines, t0 + 12).await;
        assert_eq!(fires.len(), 1, "three matches now fall within the 5s window");
    }
}
