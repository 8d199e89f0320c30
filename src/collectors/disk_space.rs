//! `disk.<mount>.*` sampler: per-mount usage via `statvfs(2)`, skipping
//! pseudo filesystems mounted under `/sys`, `/run`, `/dev`.
//!
//! `statvfs` has no safe stdlib wrapper; the raw FFI call follows the
//! `unsafe`-block-around-a-single-libc-call idiom used throughout
//! `lemonxah-zestbay`'s `libc`-based host bindings.

use super::{MetricSink, SharedSink};
use crate::clock::now_unix;
use crate::error::CollectorError;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DiskSpaceError {
    #[error("failed to read /proc/mounts: {0}")]
    Io(#[from] std::io::Error),
}

fn is_special(mount_point: &str) -> bool {
    mount_point.starts_with("/sys") || mount_point.starts_with("/run") || mount_point.starts_with("/dev")
}

fn mount_points(data: &str) -> Vec<String> {
    data.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|p| p.to_string())
        .filter(|p| !is_special(p))
        .collect()
}

struct Usage {
    used: u64,
    used_percentage: f64,
}

fn statvfs_usage(mount_point: &str) -> Option<Usage> {
    let path = CString::new(mount_point).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `path` is a valid NUL-terminated C string and `stat` is
    // written in full by a successful call before being read.
    let rc = unsafe { libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bfree as u64 * block_size;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(free);
    Some(Usage {
        used,
        used_percentage: used as f64 / total as f64 * 100.0,
    })
}

pub fn spawn(sink: SharedSink, hostname: String, sleep: Duration, errors: mpsc::Sender<CollectorError>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sleep);
        loop {
            interval.tick().await;
            if let Err(err) = sample(sink.as_ref(), &hostname).await {
                let _ = errors.send(CollectorError::DiskSpace(err)).await;
            }
        }
    })
}

async fn sample(sink: &dyn MetricSink, hostname: &str) -> Result<(), DiskSpaceError> {
    let data = tokio::fs::read_to_string("/proc/mounts").await?;
    let now = now_unix();
    for mount in mount_points(&data) {
        let Some(usage) = statvfs_usage(&mount) else { continue };
        let label = if mount == "/" { "root".to_string() } else { mount.trim_start_matches('/').replace('/', ".") };
        sink.report(format!("{hostname}.disk.{label}.used"), usage.used as f64, now, None, Vec::new()).await;
        sink.report(format!("{hostname}.disk.{label}.used_percentage"), usage.used_percentage, now, None, Vec::new()).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_special_mounts() {
        let data = "/dev/sda1 / ext4 rw 0 0\nsysfs /sys sysfs rw 0 0\ntmpfs /run tmpfs rw 0 0\nudev /dev devtmpfs rw 0 0\n/dev/sda2 /home ext4 rw 0 0\n";
        let mounts = mount_points(data);
        assert_eq!(mounts, vec!["/".to_string(), "/home".to_string()]);
    }
}
