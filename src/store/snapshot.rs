//! Snapshot subsystem: point-in-time captures of a regex-matched set of
//! series, persisted in a dedicated (non-day-partitioned) `sled::Db`.
//!
//! Grounded on `original_source/src/datastore/snapshot.go` for the
//! take/prune procedure; the count-capped prune mirrors the teacher's
//! `cleanup_old_jobs` TTL-sweep shape generalized to "oldest by
//! `created_at`, capped by count" rather than age.

use super::Store;
use crate::clock::now_unix;
use crate::error::StoreError;
use crate::model::{ReadSeriesParams, Snapshot, SnapshotRequest};
use rand::RngCore;
use std::path::Path;

const DEFAULT_SNAPSHOT_LIMIT: usize = 1000;

/// 16 random bytes, hex-encoded.
fn new_snapshot_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct SnapshotStore {
    db: sled::Db,
    retention_cap: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>, retention_cap: usize) -> Result<Self, StoreError> {
        let db = sled::open(dir)?;
        Ok(Self { db, retention_cap })
    }

    pub fn set_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let encoded = bincode::serialize(snapshot)?;
        self.db.insert(snapshot.id.as_bytes(), encoded)?;
        Ok(())
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, StoreError> {
        match self.db.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Enumerates series seen since `requests[0].start` via the store's
    /// index, keeps the ones matching `requests[0].regex`, and reads each
    /// one over the first request's window. Only the first request's regex
    /// and window govern the result, matching the source procedure.
    pub async fn take_snapshot(
        &self,
        store: &Store,
        db_tag: &str,
        requests: &[SnapshotRequest],
    ) -> Result<Snapshot, StoreError> {
        let id = new_snapshot_id();
        let created_at = now_unix();
        let mut series_out = Vec::new();

        if let Some(first) = requests.first() {
            let regex = regex::Regex::new(&first.regex)
                .unwrap_or_else(|_| regex::Regex::new("$^").expect("never matches"));
            let mut candidates = Vec::new();
            store
                .read_series_index(db_tag, first.start, |name| candidates.push(name))
                .await?;

            for name in candidates {
                if !regex.is_match(&name) {
                    continue;
                }
                let mut params = ReadSeriesParams::new(db_tag, name.clone(), first.start);
                params.end = first.end;
                params.limit = Some(first.limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT));
                let mut points = Vec::new();
                store
                    .read_series(&params, |p| {
                        points.push(p);
                        true
                    })
                    .await?;
                series_out.push((name, points));
            }
        }

        let requested_window = requests
            .first()
            .map(|r| (r.start, r.end.unwrap_or(created_at)))
            .unwrap_or((created_at, created_at));

        let snapshot = Snapshot {
            id,
            created_at,
            requested_window,
            series: series_out,
        };
        self.set_snapshot(&snapshot)?;
        self.prune()?;
        Ok(snapshot)
    }

    fn prune(&self) -> Result<(), StoreError> {
        if self.db.len() <= self.retention_cap {
            return Ok(());
        }
        let mut oldest: Option<(Vec<u8>, i64)> = None;
        for kv in self.db.iter() {
            let (k, v) = kv?;
            let snap: Snapshot = bincode::deserialize(&v)?;
            let is_older = oldest.as_ref().map(|(_, ts)| snap.created_at < *ts).unwrap_or(true);
            if is_older {
                oldest = Some((k.to_vec(), snap.created_at));
            }
        }
        if let Some((key, _)) = oldest {
            self.db.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;

    #[tokio::test]
    async fn take_snapshot_matches_regex_and_window() {
        let store_dir = tempfile::tempdir().unwrap();
        let snap_dir = tempfile::tempdir().unwrap();
        let store = Store::new(store_dir.path());
        let snapshots = SnapshotStore::open(snap_dir.path(), 100).unwrap();

        let base = now_unix() - 100;
        let mut cpu_points = vec![Point::new(base, 10.0)];
        let mut mem_points = vec![Point::new(base, 20.0)];
        store.write_points("acme+prod", "cpu.idle", &mut cpu_points).await.unwrap();
        store.write_points("acme+prod", "mem.used", &mut mem_points).await.unwrap();

        let requests = vec![SnapshotRequest {
            regex: "^cpu\\.".to_string(),
            start: base - 10,
            end: None,
            limit: None,
        }];
        let snap = snapshots.take_snapshot(&store, "acme+prod", &requests).await.unwrap();
        assert_eq!(snap.series.len(), 1);
        assert_eq!(snap.series[0].0, "cpu.idle");

        let reloaded = snapshots.get_snapshot(&snap.id).unwrap().unwrap();
        assert_eq!(reloaded.id, snap.id);
    }

    #[tokio::test]
    async fn prune_drops_oldest_when_over_cap() {
        let snap_dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::open(snap_dir.path(), 2).unwrap();

        let mut ids = Vec::new();
        for i in 0..3i64 {
            let snap = Snapshot {
                id: new_snapshot_id(),
                created_at: now_unix() - (100 - i * 10),
                requested_window: (0, 0),
                series: Vec::new(),
            };
            ids.push(snap.id.clone());
            snapshots.set_snapshot(&snap).unwrap();
            snapshots.prune().unwrap();
        }
        assert_eq!(snapshots.db.len(), 2);
        assert!(snapshots.get_snapshot(&ids[0]).unwrap().is_none());
        assert!(snapshots.get_snapshot(&ids[1]).unwrap().is_some());
        assert!(snapshots.get_snapshot(&ids[2]).unwrap().is_some());
    }
}
