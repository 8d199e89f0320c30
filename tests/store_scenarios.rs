//! Store and snapshot scenarios that exercise partitioning and snapshot
//! round-tripping across the public `Store`/`SnapshotStore` surface.

use agent::clock::now_unix;
use agent::model::{Point, ReadSeriesParams, SnapshotRequest};
use agent::store::snapshot::SnapshotStore;
use agent::store::Store;

const DATABASE: &str = "acme+prod";
const DAY_SECS: i64 = 86_400;

#[tokio::test]
async fn partition_boundary_read_returns_points_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let now = 1_700_000_000;
    let t0 = now - 2 * DAY_SECS;
    let t1 = now - DAY_SECS;
    let t2 = now;

    store.write_points(DATABASE, "series1", &mut [Point::new(t0, 1.0)]).await.unwrap();
    store.write_points(DATABASE, "series1", &mut [Point::new(t1, 2.0)]).await.unwrap();
    store.write_points(DATABASE, "series1", &mut [Point::new(t2, 3.0)]).await.unwrap();

    let mut params = ReadSeriesParams::new(DATABASE, "series1", t0);
    params.end = Some(t2);
    let mut points = Vec::new();
    store.read_series(&params, |p| { points.push(p); true }).await.unwrap();

    assert_eq!(points.len(), 3);
    assert_eq!(points.iter().map(|p| p.time).collect::<Vec<_>>(), vec![t2, t1, t0]);
}

#[tokio::test]
async fn duplicate_time_and_sequence_collapse_to_one_point() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let t = 1_700_000_000;

    let mut first = Point::new(t, 1.0);
    first.sequence = 7;
    store.write_points(DATABASE, "series1", std::slice::from_mut(&mut first)).await.unwrap();

    let mut second = Point::new(t, 2.0);
    second.sequence = 7;
    store.write_points(DATABASE, "series1", std::slice::from_mut(&mut second)).await.unwrap();

    let params = ReadSeriesParams::new(DATABASE, "series1", 0);
    let mut points = Vec::new();
    store.read_series(&params, |p| { points.push(p); true }).await.unwrap();

    assert_eq!(points.len(), 1, "identical (time, sequence) overwrites rather than duplicates");
    assert_eq!(points[0].value, 2.0);
}

#[tokio::test]
async fn read_series_index_yields_only_recently_active_series() {
    // The index stamps activity with the real wall clock (`update_index`
    // uses `now_unix()`, independent of the point's own `time`), so the
    // `since` boundary here must be relative to the real clock too.
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path());
    let write_time = 1_700_000_000;
    let activity_floor = now_unix();

    store.write_points(DATABASE, "active", &mut [Point::new(write_time, 1.0)]).await.unwrap();

    let mut names = Vec::new();
    store.read_series_index(DATABASE, activity_floor - 60, |n| names.push(n)).await.unwrap();
    assert_eq!(names, vec!["active".to_string()]);

    let mut none_since_future = Vec::new();
    store.read_series_index(DATABASE, activity_floor + 60, |n| none_since_future.push(n)).await.unwrap();
    assert!(none_since_future.is_empty(), "nothing has been active since a future instant");
}

#[tokio::test]
async fn snapshot_round_trip_produces_distinct_ids_with_matching_series() {
    let store_dir = tempfile::tempdir().unwrap();
    let snap_dir = tempfile::tempdir().unwrap();
    let store = Store::new(store_dir.path());
    let snapshots = SnapshotStore::open(snap_dir.path(), 100).unwrap();
    let t = 1_700_000_000;

    store.write_points(DATABASE, "timeseries1", &mut [Point::new(t, 1.0)]).await.unwrap();
    store.write_points(DATABASE, "timeseries2", &mut [Point::new(t, 2.0)]).await.unwrap();

    let requests = vec![SnapshotRequest {
        regex: ".*".to_string(),
        start: t - 300,
        end: None,
        limit: None,
    }];

    let first = snapshots.take_snapshot(&store, DATABASE, &requests).await.unwrap();
    assert_eq!(first.series.len(), 2);
    for (_, points) in &first.series {
        assert_eq!(points.len(), 1);
    }

    let fetched = snapshots.get_snapshot(&first.id).unwrap().expect("take_snapshot persists it");
    assert_eq!(fetched.id, first.id);
    assert_eq!(fetched.series.len(), first.series.len());

    let second = snapshots.take_snapshot(&store, DATABASE, &requests).await.unwrap();
    assert_ne!(first.id, second.id, "each snapshot gets a fresh random id");
}
