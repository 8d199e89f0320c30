//! Hourly background sweep that drops whole day-partitions older than the
//! retention window.

use super::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SWEEP_PERIOD: Duration = Duration::from_secs(3600);
const MAX_AGE_DAYS: i64 = 3;

pub fn spawn(store: Arc<Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.run_retention_sweep(MAX_AGE_DAYS).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(?removed, "retention sweep removed stale partitions");
                }
                Ok(_) => {}
                Err(err) => error!(%err, "retention sweep failed"),
            }
        }
    })
}
