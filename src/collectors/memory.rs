//! `memory.*` sampler: reads `/proc/meminfo` once per tick, no prior-sample
//! state needed since every field there is already an absolute gauge.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to read /proc/meminfo: {0}")]
    Io(#[from] std::io::Error),
    #[error("/proc/meminfo missing key {0}")]
    MissingKey(&'static str),
}

fn parse_meminfo(data: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for line in data.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
            out.insert(key.to_string(), value);
        }
    }
    out
}

fn required(map: &HashMap<String, u64>, key: &'static str) -> Result<u64, MemoryError> {
    map.get(key).copied().ok_or(MemoryError::MissingKey(key))
}

pub fn spawn(sink: SharedSink, hostname: String, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sleep);
        loop {
            interval.tick().await;
            if let Err(err) = sample(sink.as_ref(), &hostname).await {
                let _ = errors.send(CollectorError::Memory(err)).await;
            }
        }
    })
}

async fn sample(sink: &dyn MetricSink, hostname: &str) -> Result<(), MemoryError> {
    let data = tokio::fs::read_to_string("/proc/meminfo").await?;
    let map = parse_meminfo(&data);
    let total = required(&map, "MemTotal")? * 1024;
    let free = required(&map, "MemFree")? * 1024;
    let buffers = map.get("Buffers").copied().unwrap_or(0) * 1024;
    let cached = map.get("Cached").copied().unwrap_or(0) * 1024;
    let used = total.saturating_sub(free);
    let actual_used = total.saturating_sub(free + buffers + cached);
    let used_percentage = if total > 0 { actual_used as f64 / total as f64 * 100.0 } else { 0.0 };

    let now = now_unix();
    sink.report(format!("{hostname}.memory.free"), free as f64, now, None, Vec::new()).await;
    sink.report(format!("{hostname}.memory.used"), used as f64, now, None, Vec::new()).await;
    sink.report(format!("{hostname}.memory.actual_used"), actual_used as f64, now, None, Vec::new()).await;
    sink.report(format!("{hostname}.memory.used_percentage"), used_percentage, now, None, Vec::new()).await;

    let swap_total = map.get("SwapTotal").copied().unwrap_or(0) * 1024;
    if swap_total > 0 {
        let swap_free = map.get("SwapFree").copied().unwrap_or(0) * 1024;
        let swap_used = swap_total.saturating_sub(swap_free);
        sink.report(format!("{hostname}.memory.swap_free"), swap_free as f64, now, None, Vec::new()).await;
        sink.report(format!("{hostname}.memory.swap_used"), swap_used as f64, now, None, Vec::new()).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meminfo_lines() {
        let data = "MemTotal:       16384000 kB\nMemFree:         2048000 kB\nBuffers:          512000 kB\nCached:          1024000 kB\nSwapTotal:       4096000 kB\nSwapFree:        4096000 kB\n";
        let map = parse_meminfo(data);
        assert_eq!(map["MemTotal"], 16_384_000);
        assert_eq!(map["SwapFree"], 4_096_000);
    }
}
