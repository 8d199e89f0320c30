//! `disk_io.<device>.utilization` sampler: `Δ(total_io_time_ms) /
//! Δ(wall_ms) × 100`, skipping partitions, `ram*` and `loop*` devices.
//!
//! Field layout follows `original_source/src/apps/agent/disk_usage.go`'s
//! `DiskUsage` struct, which maps onto `/proc/diskstats` fields 4-13
//! (1-indexed, after major/minor/device name) in declaration order.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DiskIoError {
    #[error("failed to read /proc/diskstats: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed /proc/diskstats line: {0:?}")]
    MalformedLine(String),
}

#[derive(Debug, Clone, Copy, Default)]
struct DiskUsage {
    reads_completed: u64,
    reads_merged: u64,
    sectors_read: u64,
    total_read_time: u64,
    writes_completed: u64,
    writes_merged: u64,
    sectors_written: u64,
    total_write_time: u64,
    io_in_progress: u64,
    total_io_time: u64,
}

fn is_monitored(device: &str) -> bool {
    if device.starts_with("ram") || device.starts_with("loop") {
        return false;
    }
    // Partitions carry a trailing digit on the parent device name (sda1,
    // nvme0n1p1); skip them, keep whole-disk entries.
    !device.chars().last().is_some_and(|c| c.is_ascii_digit())
}

fn parse_diskstats(data: &str) -> Result<HashMap<String, DiskUsage>, DiskIoError> {
    let mut out = HashMap::new();
    for line in data.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 13 {
            return Err(DiskIoError::MalformedLine(line.to_string()));
        }
        let name = fields[2].to_string();
        if !is_monitored(&name) {
            continue;
        }
        let parse = |idx: usize| -> Result<u64, DiskIoError> {
            fields[idx].parse().map_err(|_| DiskIoError::MalformedLine(line.to_string()))
        };
        out.insert(
            name,
            DiskUsage {
                reads_completed: parse(3)?,
                reads_merged: parse(4)?,
                sectors_read: parse(5)?,
                total_read_time: parse(6)?,
                writes_completed: parse(7)?,
                writes_merged: parse(8)?,
                sectors_written: parse(9)?,
                total_write_time: parse(10)?,
                io_in_progress: parse(11)?,
                total_io_time: parse(12)?,
            },
        );
    }
    Ok(out)
}

pub fn spawn(sink: SharedSink, hostname: String, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sleep);
        let mut prev: Option<(HashMap<String, DiskUsage>, Instant)> = None;
        loop {
            interval.tick().await;
            match read_diskstats().await {
                Ok(curr) => {
                    let now_instant = Instant::now();
                    if let Some((prev_devices, prev_instant)) = &prev {
                        let wall_ms = now_instant.duration_since(*prev_instant).as_millis().max(1) as u64;
                        emit(sink.as_ref(), &hostname, prev_devices, &curr, wall_ms).await;
                    }
                    prev = Some((curr, now_instant));
                }
                Err(err) => {
                    let _ = errors.send(CollectorError::DiskIo(err)).await;
                }
            }
        }
    })
}

async fn read_diskstats() -> Result<HashMap<String, DiskUsage>, DiskIoError> {
    let data = tokio::fs::read_to_string("/proc/diskstats").await?;
    parse_diskstats(&data)
}

async fn emit(sink: &dyn MetricSink, hostname: &str, prev: &HashMap<String, DiskUsage>, curr: &HashMap<String, DiskUsage>, wall_ms: u64) {
    let now = now_unix();
    for (device, c) in curr {
        let Some(p) = prev.get(device) else { continue };
        let delta_io_ms = c.total_io_time.saturating_sub(p.total_io_time);
        let utilization = delta_io_ms as f64 / wall_ms as f64 * 100.0;
        sink.report(format!("{hostname}.disk_io.{device}.utilization"), utilization, now, None, Vec::new()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_ram_loop_and_partition_devices() {
        assert!(!is_monitored("ram0"));
        assert!(!is_monitored("loop0"));
        assert!(!is_monitored("sda1"));
        assert!(is_monitored("sda"));
    }

    #[test]
    fn parses_whole_disk_fields_at_documented_ordinals() {
        let data = "   8       0 sda 100 5 2000 300 50 2 1000 150 0 400 400\n   8       1 sda1 10 0 200 30 5 0 100 15 0 40 40\n";
        let devices = parse_diskstats(data).unwrap();
        assert!(!devices.contains_key("sda1"));
        let sda = devices["sda"];
        assert_eq!(sda.reads_completed, 100);
        assert_eq!(sda.total_io_time, 400);
    }
}
