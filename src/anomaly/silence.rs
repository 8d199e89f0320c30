//! Silence-policy rate-limit ledger. Each `(monitor, condition)` pair writes
//! a marker point into a synthetic series on every non-suppressed fire;
//! later fires count prior markers within each policy's window and suppress
//! once any policy's cap is reached.

use crate::error::StoreError;
use crate::model::{Point, ReadSeriesParams, SilencePolicy};
use crate::store::Store;

fn silence_series(key: u64) -> String {
    format!("__silence__.{:016x}", key)
}

pub async fn check_and_mark(
    store: &Store,
    db: &str,
    policies: &[SilencePolicy],
    key: u64,
    now: i64,
) -> Result<bool, StoreError> {
    let series = silence_series(key);
    for policy in policies {
        let start = now - policy.window.as_secs() as i64;
        let mut count = 0u32;
        let params = ReadSeriesParams::new(db, series.clone(), start);
        store
            .read_series(&params, |_| {
                count += 1;
                true
            })
            .await?;
        if count >= policy.max_fires {
            return Ok(false);
        }
    }
    let mut marker = vec![Point::new(now, 1.0)];
    store.write_points(db, &series, &mut marker).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn suppresses_once_max_fires_reached_within_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let policies = vec![SilencePolicy {
            max_fires: 2,
            window: Duration::from_secs(3600),
        }];
        let now = crate::clock::now_unix();
        let key = 42u64;

        assert!(check_and_mark(&store, "acme+prod", &policies, key, now).await.unwrap());
        assert!(check_and_mark(&store, "acme+prod", &policies, key, now + 1).await.unwrap());
        assert!(!check_and_mark(&store, "acme+prod", &policies, key, now + 2).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_ledgers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let policies = vec![SilencePolicy {
            max_fires: 1,
            window: Duration::from_secs(3600),
        }];
        let now = crate::clock::now_unix();

        assert!(check_and_mark(&store, "acme+prod", &policies, 1, now).await.unwrap());
        assert!(!check_and_mark(&store, "acme+prod", &policies, 1, now).await.unwrap());
        assert!(check_and_mark(&store, "acme+prod", &policies, 2, now).await.unwrap());
    }
}
