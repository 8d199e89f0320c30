//! `cpu.*` sampler: percent of the delta in each `/proc/stat` jiffy counter
//! since the prior tick. The first tick has no prior sample and is
//! discarded, matching `original_source/src/apps/agent/proc-stats.go`'s
//! "first sample establishes the baseline" shape.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("failed to read /proc/stat: {0}")]
    Io(#[from] std::io::Error),
    #[error("/proc/stat has no cpu summary line")]
    MissingCpuLine,
    #[error("cpu summary line has fewer than 8 fields")]
    ShortLine,
}

#[derive(Debug, Clone, Copy, Default)]
struct CpuTimes {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }
}

fn parse_cpu_line(data: &str) -> Result<CpuTimes, CpuError> {
    let line = data.lines().find(|l| l.starts_with("cpu ")).ok_or(CpuError::MissingCpuLine)?;
    let fields: Vec<u64> = line.split_whitespace().skip(1).filter_map(|f| f.parse().ok()).collect();
    if fields.len() < 7 {
        return Err(CpuError::ShortLine);
    }
    Ok(CpuTimes {
        user: fields[0],
        nice: fields[1],
        system: fields[2],
        idle: fields[3],
        iowait: fields[4],
        irq: fields[5],
        softirq: fields[6],
        steal: fields.get(7).copied().unwrap_or(0),
    })
}

pub fn spawn(sink: SharedSink, hostname: String, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sleep);
        let mut prev: Option<CpuTimes> = None;
        loop {
            interval.tick().await;
            match read_cpu_times().await {
                Ok(curr) => {
                    if let Some(prev_times) = prev {
                        emit(sink.as_ref(), &hostname, &prev_times, &curr).await;
                    }
                    prev = Some(curr);
                }
                Err(err) => {
                    let _ = errors.send(CollectorError::Cpu(err)).await;
                }
            }
        }
    })
}

async fn read_cpu_times() -> Result<CpuTimes, CpuError> {
    let data = tokio::fs::read_to_string("/proc/stat").await?;
    parse_cpu_line(&data)
}

async fn emit(sink: &dyn MetricSink, hostname: &str, prev: &CpuTimes, curr: &CpuTimes) {
    let delta_total = curr.total().saturating_sub(prev.total());
    if delta_total == 0 {
        return;
    }
    let pct = |field: u64| field as f64 / delta_total as f64 * 100.0;
    let now = now_unix();
    let samples = [
        ("user", pct((curr.user + curr.nice).saturating_sub(prev.user + prev.nice))),
        ("sys", pct(curr.system.saturating_sub(prev.system))),
        ("idle", pct(curr.idle.saturating_sub(prev.idle))),
        ("wait", pct(curr.iowait.saturating_sub(prev.iowait))),
        ("irq", pct(curr.irq.saturating_sub(prev.irq))),
        ("softirq", pct(curr.softirq.saturating_sub(prev.softirq))),
        ("stolen", pct(curr.steal.saturating_sub(prev.steal))),
    ];
    for (name, value) in samples {
        sink.report(format!("{hostname}.cpu.{name}"), value, now, None, Vec::new()).await;
    }
}
