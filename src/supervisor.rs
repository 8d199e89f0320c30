//! Process table reconciliation: name/regex matching against configured
//! process monitors, up/down transition reporting, auto-start on down,
//! CPU/memory delta metrics, and the snooze cache the local HTTP surface
//! writes to.
//!
//! Grounded on `original_source/src/apps/agent/monit.go`'s reconciliation
//! loop and pid-reuse-safe `mergeStats`; `agent/src/services/systemctl.rs`
//! for the `tokio::process::Command` subprocess-control idiom (generalized
//! from `systemctl start/stop` to the monitor's declared `start_cmd`/
//! `stop_cmd` run under `sudo -u <user>`); `agent/src/services/
//! job_manager.rs`'s `Arc<RwLock<HashMap<...>>>` shape reused for the
//! snooze cache.

use crate::anomaly::AnomalyEngine;
use crate::clock::now_unix;
use crate::config_service::ConfigServiceClient;
use crate::model::{ProcessMonitorConfig, ProcessStatus, StatusMethod};
use crate::reporter::Reporter;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// TTL map `nickname -> expiry`; `None` means snoozed indefinitely until a
/// matching `/start_monitoring/:process` call clears the entry.
#[derive(Default)]
pub struct SnoozeCache {
    entries: RwLock<HashMap<String, Option<i64>>>,
}

impl SnoozeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snooze(&self, nickname: &str, duration: Option<Duration>) {
        let expiry = duration.map(|d| now_unix() + d.as_secs() as i64);
        self.entries.write().await.insert(nickname.to_string(), expiry);
    }

    pub async fn unsnooze(&self, nickname: &str) {
        self.entries.write().await.remove(nickname);
    }

    pub async fn is_snoozed(&self, nickname: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(nickname) {
            None => false,
            Some(None) => true,
            Some(Some(expiry)) => {
                if *expiry > now_unix() {
                    true
                } else {
                    entries.remove(nickname);
                    false
                }
            }
        }
    }
}

/// Parses the local HTTP surface's `duration` query parameter: absent or
/// `-1` means snooze indefinitely.
pub fn parse_snooze_duration(raw: Option<&str>) -> Option<Duration> {
    match raw.and_then(|s| s.parse::<i64>().ok()) {
        None | Some(-1) => None,
        Some(secs) if secs >= 0 => Some(Duration::from_secs(secs as u64)),
        Some(_) => None,
    }
}

#[derive(Debug, Clone)]
struct LiveProcess {
    pid: i32,
    name: String,
    cmdline: String,
    cpu_ticks: u64,
    rss_bytes: u64,
}

#[derive(Debug, Clone)]
struct PrevSample {
    cpu_ticks: u64,
    sampled_at: Instant,
}

async fn enumerate_processes() -> std::io::Result<Vec<LiveProcess>> {
    let mut entries = tokio::fs::read_dir("/proc").await?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(pid_str) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(pid) = pid_str.parse::<i32>() else { continue };
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{pid_str}/stat")).await else {
            continue;
        };
        let Some((name, utime, stime)) = parse_stat(&stat) else { continue };
        let cmdline = tokio::fs::read(format!("/proc/{pid_str}/cmdline"))
            .await
            .map(|bytes| {
                bytes
                    .split(|&b| b == 0)
                    .filter(|s| !s.is_empty())
                    .map(|s| String::from_utf8_lossy(s).to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let rss_bytes = tokio::fs::read_to_string(format!("/proc/{pid_str}/status"))
            .await
            .map(|s| parse_vmrss(&s))
            .unwrap_or(0);
        out.push(LiveProcess {
            pid,
            name,
            cmdline,
            cpu_ticks: utime + stime,
            rss_bytes,
        });
    }
    Ok(out)
}

fn parse_stat(data: &str) -> Option<(String, u64, u64)> {
    let open = data.find('(')?;
    let close = data.rfind(')')?;
    let name = data[open + 1..close].to_string();
    let rest: Vec<&str> = data[close + 1..].split_whitespace().collect();
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    Some((name, utime, stime))
}

fn parse_vmrss(status: &str) -> u64 {
    status
        .lines()
        .find_map(|l| l.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

fn find_match<'a>(monitor: &ProcessMonitorConfig, processes: &'a [LiveProcess]) -> Option<&'a LiveProcess> {
    match monitor.status_method {
        StatusMethod::Name => processes.iter().find(|p| p.name == monitor.name),
        StatusMethod::Regex => {
            let pattern = monitor.regex.as_deref().unwrap_or(&monitor.name);
            let re = Regex::new(pattern).ok()?;
            processes.iter().find(|p| re.is_match(&p.cmdline))
        }
    }
}

pub struct ProcessSupervisor {
    config_client: Arc<ConfigServiceClient>,
    engine: Arc<AnomalyEngine>,
    reporter: Arc<Reporter>,
    pub snooze: Arc<SnoozeCache>,
    hostname: String,
    monitors: RwLock<Vec<ProcessMonitorConfig>>,
    matched_pids: RwLock<HashMap<String, i32>>,
}

impl ProcessSupervisor {
    pub fn new(config_client: Arc<ConfigServiceClient>, engine: Arc<AnomalyEngine>, reporter: Arc<Reporter>, hostname: String) -> Self {
        Self {
            config_client,
            engine,
            reporter,
            snooze: Arc::new(SnoozeCache::new()),
            hostname,
            monitors: RwLock::new(Vec::new()),
            matched_pids: RwLock::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, monitored_sleep: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitored_sleep);
            let mut prev: HashMap<i32, PrevSample> = HashMap::new();
            loop {
                interval.tick().await;
                if let Err(err) = self.tick(&mut prev).await {
                    error!(error = %err, "process supervisor tick failed");
                }
            }
        })
    }

    async fn tick(&self, prev: &mut HashMap<i32, PrevSample>) -> anyhow::Result<()> {
        let monitors = self.config_client.fetch_process_monitors().await?;
        *self.monitors.write().await = monitors.clone();

        let processes = enumerate_processes().await?;
        let now = now_unix();
        let mut matched = HashMap::new();

        for monitor in &monitors {
            let live = find_match(monitor, &processes);
            let status = if live.is_some() { ProcessStatus::Up } else { ProcessStatus::Down };

            if let Some(fire) = self.engine.evaluate_process(monitor, status, now).await {
                self.reporter.emit_fire(fire).await;
            }

            if let Some(live) = live {
                matched.insert(monitor.nickname.clone(), live.pid);
                if let Some(prev_sample) = prev.get(&live.pid) {
                    let wall_secs = Instant::now().duration_since(prev_sample.sampled_at).as_secs_f64().max(0.001);
                    if live.cpu_ticks >= prev_sample.cpu_ticks {
                        let clk_tck = crate::collectors::processes::clock_ticks_per_sec() as f64;
                        let cpu_pct = (live.cpu_ticks - prev_sample.cpu_ticks) as f64 / clk_tck / wall_secs * 100.0;
                        self.reporter
                            .report(format!("{}.process.{}.cpu", self.hostname, monitor.nickname), cpu_pct, now, None, Vec::new())
                            .await;
                    }
                }
                self.reporter
                    .report(format!("{}.process.{}.memory", self.hostname, monitor.nickname), live.rss_bytes as f64, now, None, Vec::new())
                    .await;
            } else if !self.snooze.is_snoozed(&monitor.nickname).await {
                if let Err(err) = self.start_process(monitor).await {
                    warn!(monitor = %monitor.nickname, error = %err, "failed to auto-start down process");
                }
            }
        }

        let mut next_prev = HashMap::new();
        for p in &processes {
            next_prev.insert(p.pid, PrevSample { cpu_ticks: p.cpu_ticks, sampled_at: Instant::now() });
        }
        *prev = next_prev;
        *self.matched_pids.write().await = matched;
        Ok(())
    }

    pub async fn snoozed_monitor(&self, nickname: &str) -> Option<ProcessMonitorConfig> {
        self.monitors.read().await.iter().find(|m| m.nickname == nickname).cloned()
    }

    pub async fn start_process(&self, monitor: &ProcessMonitorConfig) -> anyhow::Result<()> {
        info!(monitor = %monitor.nickname, "starting process");
        let args: Vec<&str> = monitor.start_cmd.split_whitespace().collect();
        let (cmd, rest) = args.split_first().ok_or_else(|| anyhow::anyhow!("empty start_cmd"))?;
        let status = Command::new("sudo").arg("-u").arg(&monitor.user).arg("-n").arg(cmd).args(rest).status().await?;
        if !status.success() {
            anyhow::bail!("start_cmd exited with {status}");
        }
        Ok(())
    }

    /// `kill <pid>`, escalating to `kill -9 <pid>` on failure, unless the
    /// monitor declares its own stop command.
    pub async fn stop_process(&self, monitor: &ProcessMonitorConfig) -> anyhow::Result<()> {
        let pid = self.matched_pids.read().await.get(&monitor.nickname).copied();
        if monitor.stop_is_kill() {
            let Some(pid) = pid else {
                anyhow::bail!("no known pid for {}", monitor.nickname);
            };
            info!(monitor = %monitor.nickname, pid, "stopping process via kill");
            let status = Command::new("kill").arg(pid.to_string()).status().await?;
            if !status.success() {
                warn!(monitor = %monitor.nickname, pid, "kill failed, escalating to kill -9");
                Command::new("kill").arg("-9").arg(pid.to_string()).status().await?;
            }
            return Ok(());
        }
        let args: Vec<&str> = monitor.stop_cmd.split_whitespace().collect();
        let (cmd, rest) = args.split_first().ok_or_else(|| anyhow::anyhow!("empty stop_cmd"))?;
        let status = Command::new("sudo").arg("-u").arg(&monitor.user).arg("-n").arg(cmd).args(rest).status().await?;
        if !status.success() {
            anyhow::bail!("stop_cmd exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snooze_duration() {
        assert_eq!(parse_snooze_duration(None), None);
        assert_eq!(parse_snooze_duration(Some("-1")), None);
        assert_eq!(parse_snooze_duration(Some("30")), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn snooze_cache_expires_timed_entries() {
        let cache = SnoozeCache::new();
        cache.snooze("db", Some(Duration::from_secs(0))).await;
        assert!(!cache.is_snoozed("db").await, "an already-expired entry is pruned on read");
    }

    #[tokio::test]
    async fn snooze_cache_indefinite_entry_persists() {
        let cache = SnoozeCache::new();
        cache.snooze("db", None).await;
        assert!(cache.is_snoozed("db").await);
        cache.unsnooze("db").await;
        assert!(!cache.is_snoozed("db").await);
    }
}
