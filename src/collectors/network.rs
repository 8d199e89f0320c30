//! `network.<iface>.*` sampler: per-interface rx/tx byte/packet/error/drop
//! counters as differences since the prior tick.
//!
//! Parsing and field ordinals are lifted directly from
//! `original_source/src/apps/agent/network-utilization.go`: skip the two
//! `/proc/net/dev` header lines, split each remaining line on `:`, then
//! pull rx-bytes/rx-packets/rx-errors/rx-dropped and tx-bytes/tx-packets/
//! tx-errors/tx-dropped off fixed array positions in the whitespace-split
//! remainder.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to read /proc/net/dev: {0}")]
    Io(#[from] std::io::Error),
    #[error("/proc/net/dev doesn't have the expected format")]
    Malformed,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceCounters {
    rx_bytes: i64,
    rx_packets: i64,
    rx_errors: i64,
    rx_dropped: i64,
    tx_bytes: i64,
    tx_packets: i64,
    tx_errors: i64,
    tx_dropped: i64,
}

fn parse_net_dev(data: &str) -> Result<HashMap<String, DeviceCounters>, NetworkError> {
    let lines: Vec<&str> = data.lines().collect();
    if lines.len() <= 2 {
        return Err(NetworkError::Malformed);
    }
    let mut devices = HashMap::new();
    for line in &lines[2..] {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ':');
        let (Some(name_part), Some(rest)) = (parts.next(), parts.next()) else {
            return Err(NetworkError::Malformed);
        };
        let name = name_part.trim().to_string();
        let fields: Vec<i64> = rest.split_whitespace().filter_map(|f| f.parse().ok()).collect();
        if fields.len() < 16 {
            return Err(NetworkError::Malformed);
        }
        devices.insert(
            name,
            DeviceCounters {
                rx_bytes: fields[1],
                rx_packets: fields[2],
                rx_errors: fields[3],
                rx_dropped: fields[4],
                tx_bytes: fields[9],
                tx_packets: fields[10],
                tx_errors: fields[11],
                tx_dropped: fields[12],
            },
        );
    }
    Ok(devices)
}

pub fn spawn(sink: SharedSink, hostname: String, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sleep);
        let mut prev: Option<HashMap<String, DeviceCounters>> = None;
        loop {
            interval.tick().await;
            match read_net_dev().await {
                Ok(curr) => {
                    if let Some(prev_devices) = &prev {
                        emit(sink.as_ref(), &hostname, prev_devices, &curr).await;
                    }
                    prev = Some(curr);
                }
                Err(err) => {
                    let _ = errors.send(CollectorError::Network(err)).await;
                }
            }
        }
    })
}

async fn read_net_dev() -> Result<HashMap<String, DeviceCounters>, NetworkError> {
    let data = tokio::fs::read_to_string("/proc/net/dev").await?;
    parse_net_dev(&data)
}

async fn emit(sink: &dyn MetricSink, hostname: &str, prev: &HashMap<String, DeviceCounters>, curr: &HashMap<String, DeviceCounters>) {
    let now = now_unix();
    for (iface, c) in curr {
        let Some(p) = prev.get(iface) else { continue };
        let deltas = [
            ("rx_bytes", c.rx_bytes - p.rx_bytes),
            ("rx_packets", c.rx_packets - p.rx_packets),
            ("rx_errors", c.rx_errors - p.rx_errors),
            ("rx_dropped", c.rx_dropped - p.rx_dropped),
            ("tx_bytes", c.tx_bytes - p.tx_bytes),
            ("tx_packets", c.tx_packets - p.tx_packets),
            ("tx_errors", c.tx_errors - p.tx_errors),
            ("tx_dropped", c.tx_dropped - p.tx_dropped),
        ];
        for (name, value) in deltas {
            sink.report(format!("{hostname}.network.{iface}.{name}"), value as f64, now, None, Vec::new()).await;
        }
    }
}
