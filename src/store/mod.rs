//! Day-partitioned ordered key-value time-series store.
//!
//! Ground truth for the key layout and seek algorithm is
//! `original_source/src/datastore/timeseries.go`, translated from LevelDB to
//! `sled`. One `sled::Db` lives per UTC-day partition under
//! `<datastore-dir>/timeseries/<YYYYMMDD>/`, opened lazily and cached.

pub mod retention;
pub mod snapshot;

use crate::clock::now_unix;
use crate::error::StoreError;
use crate::model::{Point, ReadSeriesParams};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

const SECONDS_PER_DAY: i64 = 86_400;
const DEFAULT_READ_LIMIT: usize = 50_000;

const SENTINEL_KEYS: &[&str] = &["9999", "0000", "aaaa", "zzzz", "AAAA", "ZZZZ"];

pub fn epoch_to_day(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap())
        .format("%Y%m%d")
        .to_string()
}

fn point_prefix(db: &str, series: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(db.len() + series.len() + 4);
    k.extend_from_slice(db.as_bytes());
    k.extend_from_slice(b"~t~");
    k.extend_from_slice(series.as_bytes());
    k.push(b'~');
    k
}

fn point_key(db: &str, series: &str, time: i64, seq: u32) -> Vec<u8> {
    let mut k = point_prefix(db, series);
    k.write_i64::<BigEndian>(time).expect("write to Vec never fails");
    k.write_u32::<BigEndian>(seq).expect("write to Vec never fails");
    k
}

fn index_prefix(db: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(db.len() + 4);
    k.extend_from_slice(db.as_bytes());
    k.extend_from_slice(b"~i~");
    k
}

fn index_key(db: &str, series: &str) -> Vec<u8> {
    let mut k = index_prefix(db);
    k.extend_from_slice(series.as_bytes());
    k
}

fn write_sentinels(db: &sled::Db) -> Result<(), StoreError> {
    for key in SENTINEL_KEYS {
        db.insert(key.as_bytes(), &[] as &[u8])?;
    }
    db.insert("!".repeat(96).as_bytes(), &[] as &[u8])?;
    db.insert("~".repeat(96).as_bytes(), &[] as &[u8])?;
    Ok(())
}

fn matches_filters(params: &ReadSeriesParams, point: &Point) -> bool {
    if params.filter.is_empty() && params.not_filter.is_empty() {
        return true;
    }
    for (name, expected) in &params.filter {
        match point.dimension(name) {
            Some(v) if v == expected => {}
            _ => return false,
        }
    }
    for (name, excluded) in &params.not_filter {
        if point.dimension(name) == Some(excluded.as_str()) {
            return false;
        }
    }
    true
}

/// Partitioned time-series store. One instance is constructed in `main.rs`
/// and shared behind an `Arc` with every component that reports or reads
/// metrics.
pub struct Store {
    root: PathBuf,
    partitions: RwLock<HashMap<String, sled::Db>>,
    next_seq: AtomicU32,
}

impl Store {
    pub fn new(datastore_dir: impl AsRef<Path>) -> Self {
        Self {
            root: datastore_dir.as_ref().join("timeseries"),
            partitions: RwLock::new(HashMap::new()),
            next_seq: AtomicU32::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn open_partition(&self, day: &str, create: bool) -> Result<Option<sled::Db>, StoreError> {
        {
            let partitions = self.partitions.read().await;
            if let Some(db) = partitions.get(day) {
                return Ok(Some(db.clone()));
            }
        }
        let dir = self.root.join(day);
        if !create && !dir.exists() {
            return Ok(None);
        }
        let mut partitions = self.partitions.write().await;
        if let Some(db) = partitions.get(day) {
            return Ok(Some(db.clone()));
        }
        let existed = dir.exists();
        tokio::fs::create_dir_all(&self.root).await?;
        let db = sled::open(&dir)?;
        if !existed {
            write_sentinels(&db)?;
        }
        partitions.insert(day.to_string(), db.clone());
        Ok(Some(db))
    }

    /// Assigns sequence numbers to any point whose `sequence` is still the
    /// zero-value placeholder, updates the series index to `now()`, and
    /// writes each point into the partition for its own `time`.
    pub async fn write_points(
        &self,
        db: &str,
        series: &str,
        points: &mut [Point],
    ) -> Result<(), StoreError> {
        for point in points.iter_mut() {
            if point.sequence == 0 {
                point.sequence = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            }
        }
        self.update_index(db, series).await?;
        for point in points.iter() {
            let day = epoch_to_day(point.time);
            let tree = self
                .open_partition(&day, true)
                .await?
                .expect("create=true always yields a partition");
            let key = point_key(db, series, point.time, point.sequence);
            let encoded = bincode::serialize(point)?;
            tree.insert(key, encoded)?;
        }
        Ok(())
    }

    async fn update_index(&self, db: &str, series: &str) -> Result<(), StoreError> {
        let now = now_unix();
        let day = epoch_to_day(now);
        let tree = self
            .open_partition(&day, true)
            .await?
            .expect("create=true always yields a partition");
        let mut buf = Vec::with_capacity(8);
        buf.write_i64::<LittleEndian>(now)?;
        tree.insert(index_key(db, series), buf)?;
        Ok(())
    }

    /// Streams matching points for `series` newest-first into `yield_fn`.
    /// Stops early if `yield_fn` returns `false`.
    pub async fn read_series(
        &self,
        params: &ReadSeriesParams,
        mut yield_fn: impl FnMut(Point) -> bool,
    ) -> Result<(), StoreError> {
        let end = params.end.unwrap_or_else(now_unix);
        let mut limit = params.limit.unwrap_or(DEFAULT_READ_LIMIT);
        let prefix = point_prefix(&params.db, &params.series);
        let upper = point_key(&params.db, &params.series, end + 1, 0);
        let mut cursor = end;

        'days: loop {
            if limit == 0 || cursor < params.start {
                break;
            }
            let day = epoch_to_day(cursor);
            if let Some(tree) = self.open_partition(&day, false).await? {
                for kv in tree.range(..upper.clone()).rev() {
                    let (k, v) = kv?;
                    if !k.starts_with(&prefix[..]) {
                        break;
                    }
                    let mut point: Point = bincode::deserialize(&v)?;
                    if point.time < params.start {
                        break 'days;
                    }
                    if matches_filters(params, &point) {
                        if !params.include_context {
                            point.context = None;
                        }
                        if !params.include_dimensions {
                            point.dimensions.clear();
                        }
                        if !yield_fn(point) {
                            break 'days;
                        }
                        limit -= 1;
                        if limit == 0 {
                            break 'days;
                        }
                    }
                }
            }
            cursor -= SECONDS_PER_DAY;
        }
        Ok(())
    }

    /// Yields each series name whose index entry timestamp is `>= since`,
    /// scanning partitions from today backward to the day of `since`. Each
    /// name is yielded at most once even if several partitions saw writes.
    pub async fn read_series_index(
        &self,
        db: &str,
        since: i64,
        mut yield_fn: impl FnMut(String),
    ) -> Result<(), StoreError> {
        let prefix = index_prefix(db);
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = now_unix();
        loop {
            if cursor < since {
                break;
            }
            let day = epoch_to_day(cursor);
            if let Some(tree) = self.open_partition(&day, false).await? {
                for kv in tree.scan_prefix(&prefix) {
                    let (k, v) = kv?;
                    if v.len() < 8 {
                        continue;
                    }
                    let ts = (&v[..]).read_i64::<LittleEndian>()?;
                    if ts < since {
                        continue;
                    }
                    let name = String::from_utf8_lossy(&k[prefix.len()..]).into_owned();
                    if seen.insert(name.clone()) {
                        yield_fn(name);
                    }
                }
            }
            cursor -= SECONDS_PER_DAY;
        }
        Ok(())
    }

    /// Lists partition directory names currently on disk (for retention and
    /// tests); does not require any partition to be open.
    pub async fn list_partition_days(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Removes whole partitions older than `max_age_days`. Returns the list
    /// of removed day strings.
    pub async fn run_retention_sweep(&self, max_age_days: i64) -> Result<Vec<String>, StoreError> {
        let cutoff = epoch_to_day(now_unix() - max_age_days * SECONDS_PER_DAY);
        let all_days = self.list_partition_days().await?;
        let stale: Vec<String> = all_days
            .into_iter()
            .filter(|day| day.len() == 8 && day.chars().all(|c| c.is_ascii_digit()) && day.as_str() < cutoff.as_str())
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let mut partitions = self.partitions.write().await;
        let mut removed = Vec::with_capacity(stale.len());
        for day in stale {
            partitions.remove(&day);
            let dir = self.root.join(&day);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            removed.push(day);
        }
        Ok(removed)
    }
}
