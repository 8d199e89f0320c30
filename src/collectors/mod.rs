//! Independent sampling loops, one per metric family, each running at its
//! own cadence with no shared mutable state beyond the reporter sink — the
//! scheduling model is parallel-goroutine-equivalent.
//!
//! Grounded on `original_source/src/apps/agent/proc-stats.go`,
//! `network-utilization.go`, `disk_usage.go`, `process_io.go` for exact
//! `/proc` field ordinals, and on the teacher's `tokio::spawn`-per-concern
//! style in `agent/src/main.rs`.

pub mod cpu;
pub mod disk_io;
pub mod disk_space;
pub mod memory;
pub mod network;
pub mod processes;

use async_trait::async_trait;
use std::sync::Arc;

/// Sink all collectors report samples through; implemented by the reporter
/// fan-in so collectors never depend on the anomaly engine or store
/// directly.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn report(&self, metric: String, value: f64, t: i64, context: Option<String>, dims: Vec<(String, String)>);
}

pub type SharedSink = Arc<dyn MetricSink>;
