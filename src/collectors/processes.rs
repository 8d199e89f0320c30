//! `process.top.*` sampler: top-N processes by CPU and by memory, tagged
//! with pid/name/cmdline dimensions.
//!
//! Grounded on `original_source/src/apps/agent/proc-stats.go`'s
//! `mergeStats`: a process is rejected as pid-reuse when its cpu-time
//! counter goes backwards or its reported name changes between samples.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProcessesError {
    #[error("failed to read /proc: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct ProcSample {
    name: String,
    cmdline: String,
    cpu_ticks: u64,
    rss_bytes: u64,
    sampled_at: Instant,
}

pub(crate) fn clock_ticks_per_sec() -> u64 {
    // SAFETY: `sysconf` with `_SC_CLK_TCK` has no preconditions and never
    // panics; a negative return (unsupported) falls back to the common 100Hz.
    let value = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if value > 0 {
        value as u64
    } else {
        100
    }
}

fn parse_stat(data: &str) -> Option<(String, u64, u64)> {
    let open = data.find('(')?;
    let close = data.rfind(')')?;
    let name = data[open + 1..close].to_string();
    let rest: Vec<&str> = data[close + 1..].split_whitespace().collect();
    // fields after `)` are 1-indexed from `state` (field 3); utime is field
    // 14, stime is field 15, i.e. indices 11 and 12 here.
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    Some((name, utime, stime))
}

fn parse_rss_bytes(status_data: &str, page_size: u64) -> u64 {
    for line in status_data.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                return kb * 1024;
            }
        }
    }
    let _ = page_size;
    0
}

async fn read_cmdline(pid: &str) -> String {
    tokio::fs::read(format!("/proc/{pid}/cmdline"))
        .await
        .map(|bytes| {
            bytes
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

async fn read_sample(pid: &str) -> Option<ProcSample> {
    let stat_data = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    let (name, utime, stime) = parse_stat(&stat_data)?;
    let status_data = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await.unwrap_or_default();
    let rss_bytes = parse_rss_bytes(&status_data, 4096);
    let cmdline = read_cmdline(pid).await;
    Some(ProcSample {
        name,
        cmdline,
        cpu_ticks: utime + stime,
        rss_bytes,
        sampled_at: Instant::now(),
    })
}

async fn list_pids() -> Result<Vec<String>, ProcessesError> {
    let mut entries = tokio::fs::read_dir("/proc").await?;
    let mut pids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.chars().all(|c| c.is_ascii_digit()) {
                pids.push(name.to_string());
            }
        }
    }
    Ok(pids)
}

pub fn spawn(sink: SharedSink, hostname: String, top_n: usize, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let clk_tck = clock_ticks_per_sec();
        let mut interval = tokio::time::interval(sleep);
        let mut prev: HashMap<String, ProcSample> = HashMap::new();
        loop {
            interval.tick().await;
            let pids = match list_pids().await {
                Ok(pids) => pids,
                Err(err) => {
                    let _ = errors.send(CollectorError::Processes(err)).await;
                    continue;
                }
            };
            let mut curr = HashMap::new();
            let mut merged = Vec::new();
            for pid in pids {
                let Some(sample) = read_sample(&pid).await else { continue };
                if let Some(old) = prev.get(&pid) {
                    if sample.name == old.name && sample.cpu_ticks >= old.cpu_ticks {
                        let wall_secs = sample.sampled_at.duration_since(old.sampled_at).as_secs_f64().max(0.001);
                        let cpu_usage = (sample.cpu_ticks - old.cpu_ticks) as f64 / clk_tck as f64 / wall_secs * 100.0;
                        merged.push((pid.clone(), sample.name.clone(), sample.cmdline.clone(), cpu_usage, sample.rss_bytes));
                    }
                }
                curr.insert(pid, sample);
            }
            prev = curr;
            emit(sink.as_ref(), &hostname, &merged, top_n).await;
        }
    })
}

async fn emit(sink: &dyn MetricSink, hostname: &str, merged: &[(String, String, String, f64, u64)], top_n: usize) {
    let now = now_unix();
    let mut by_cpu = merged.to_vec();
    by_cpu.sort_by(|a, b| b.3.total_cmp(&a.3));
    for (pid, name, cmdline, cpu_usage, _) in by_cpu.into_iter().take(top_n) {
        let dims = vec![("pid".to_string(), pid), ("name".to_string(), name), ("cmdline".to_string(), cmdline)];
        sink.report(format!("{hostname}.process.cpu.top"), cpu_usage, now, None, dims).await;
    }

    let mut by_mem = merged.to_vec();
    by_mem.sort_by(|a, b| b.4.cmp(&a.4));
    for (pid, name, cmdline, _, rss_bytes) in by_mem.into_iter().take(top_n) {
        let dims = vec![("pid".to_string(), pid), ("name".to_string(), name), ("cmdline".to_string(), cmdline)];
        sink.report(format!("{hostname}.process.memory.top"), rss_bytes as f64, now, None, dims).await;
    }
}
