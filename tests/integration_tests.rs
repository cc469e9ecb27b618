use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use prost::Message;
use subway_delays::feed::nyct::snapshot_from_feed;
use subway_delays::feed::{FeedSnapshot, FeedSource};
use subway_delays::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate as RtStopTimeUpdate};
use subway_delays::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, TripDescriptor, TripUpdate};
use subway_delays::ingest::Ingestor;
use subway_delays::parser::parse_feed;
use subway_delays::partition::PartitionWindow;
use subway_delays::schema::{TableSchema, Value};
use subway_delays::static_gtfs::StopDirectory;
use subway_delays::store::{MemoryStore, SqliteStore};
use subway_delays::{Extractor, IngestError, Loader, StopTimeUpdate, Trip};

const TRIPS: &str = "raw_trips";
const UPDATES: &str = "raw_stop_time_updates";

/// Serves canned snapshots per source; unknown sources are unavailable.
#[derive(Default)]
struct CannedFeed {
    snapshots: Mutex<HashMap<String, FeedSnapshot>>,
}

impl CannedFeed {
    fn with(self, source_id: &str, trips: Vec<Trip>, generated_at: DateTime<Utc>) -> Self {
        self.snapshots.lock().unwrap().insert(
            source_id.to_string(),
            FeedSnapshot {
                source_id: source_id.to_string(),
                trips,
                generated_at,
            },
        );
        self
    }
}

#[async_trait]
impl FeedSource for CannedFeed {
    async fn pull(&self, source_id: &str) -> Result<FeedSnapshot, IngestError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .ok_or_else(|| IngestError::feed_unavailable(source_id, "connection refused"))
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, h, m, s).unwrap()
}

fn trip(trip_id: &str, stops: &[&str]) -> Trip {
    Trip {
        trip_id: trip_id.to_string(),
        route_id: Some("A".to_string()),
        direction: Some("N".to_string()),
        start_date: NaiveDate::from_ymd_opt(2026, 1, 5),
        underway: true,
        train_assigned: true,
        stop_time_updates: stops
            .iter()
            .enumerate()
            .map(|(i, stop)| StopTimeUpdate::new(*stop).arriving(at(18, 10 + i as u32, 0)))
            .collect(),
        ..Default::default()
    }
}

fn extractor() -> Extractor {
    Extractor::new(
        TableSchema::trip_snapshots(TRIPS, true),
        TableSchema::boundary_updates(UPDATES),
    )
    .unwrap()
}

async fn ingestor<F: FeedSource>(feed: F, store: MemoryStore) -> Ingestor<F, MemoryStore> {
    let ingestor = Ingestor::new(
        feed,
        extractor(),
        Loader::new(store, Duration::from_secs(5)),
        PartitionWindow::default(),
    );
    ingestor.prepare().await.unwrap();
    ingestor
}

#[tokio::test]
async fn test_tick_lands_both_tables_in_one_partition() {
    let feed = CannedFeed::default().with(
        "A",
        vec![trip("t1", &["A1", "A2", "A3"]), trip("t2", &["A9"])],
        at(18, 2, 30),
    );
    let ingestor = ingestor(feed, MemoryStore::new()).await;

    let report = ingestor.run_tick("A").await.unwrap();
    assert_eq!(report.trips, 2);
    assert_eq!(report.loaded.snapshot_rows, 2);
    assert_eq!(report.loaded.boundary_rows, 3);
    assert_eq!(report.partition.to_string(), "2026-01-05-18:00");

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS), 2);
    assert_eq!(store.row_count(UPDATES), 3);
    assert_eq!(store.partitions(TRIPS), ["2026-01-05-18:00"]);
    assert_eq!(store.partitions(UPDATES), ["2026-01-05-18:00"]);

    let stops: Vec<_> = store
        .rows(UPDATES)
        .into_iter()
        .map(|row| row.values[2].clone())
        .collect();
    assert_eq!(
        stops,
        [
            Value::String("A1".to_string()),
            Value::String("A3".to_string()),
            Value::String("A9".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_repeated_ticks_are_additive() {
    let trips = vec![trip("t1", &["A1", "A2"])];
    let feed = CannedFeed::default().with("A", trips, at(18, 2, 30));
    let ingestor = ingestor(feed, MemoryStore::new()).await;

    ingestor.run_tick("A").await.unwrap();
    ingestor.run_tick("A").await.unwrap();

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS), 2);
    assert_eq!(store.row_count(UPDATES), 4);
}

#[tokio::test]
async fn test_unavailable_feed_leaves_tables_unchanged() {
    let feed = CannedFeed::default().with("A", vec![trip("t1", &["A1"])], at(18, 2, 30));
    let ingestor = ingestor(feed, MemoryStore::new()).await;
    ingestor.run_tick("A").await.unwrap();

    let err = ingestor.run_tick("L").await.unwrap_err();
    assert!(matches!(err, IngestError::FeedUnavailable { .. }));
    assert!(err.is_retryable());

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS), 1);
    assert_eq!(store.row_count(UPDATES), 1);
}

#[tokio::test]
async fn test_malformed_trip_aborts_whole_tick() {
    let mut broken = trip("t2", &["A5", "A6"]);
    broken.route_id = None;
    let feed = CannedFeed::default().with(
        "A",
        vec![trip("t1", &["A1"]), broken],
        at(18, 2, 30),
    );
    let ingestor = ingestor(feed, MemoryStore::new()).await;

    let err = ingestor.run_tick("A").await.unwrap_err();
    match err {
        IngestError::MalformedRecord { trip_id, field } => {
            assert_eq!(trip_id, "t2");
            assert_eq!(field, "route_id");
        }
        other => panic!("unexpected error: {other}"),
    }

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS), 0);
    assert_eq!(store.row_count(UPDATES), 0);
}

#[tokio::test]
async fn test_empty_feed_is_a_successful_tick() {
    let feed = CannedFeed::default().with("G", Vec::new(), at(18, 2, 30));
    let ingestor = ingestor(feed, MemoryStore::new()).await;

    let report = ingestor.run_tick("G").await.unwrap();
    assert_eq!(report.trips, 0);
    assert_eq!(report.loaded.snapshot_rows, 0);
    assert_eq!(ingestor.loader().store().row_count(TRIPS), 0);
}

#[tokio::test]
async fn test_run_sources_isolates_failures() {
    let feed = CannedFeed::default()
        .with("A", vec![trip("a1", &["A1", "A2"])], at(18, 2, 30))
        .with("L", vec![trip("l1", &["L1"]), trip("l2", &["L2"])], at(18, 6, 0));
    let ingestor = Arc::new(ingestor(feed, MemoryStore::new()).await);

    let sources: Vec<String> = ["A", "B", "L"].iter().map(|s| s.to_string()).collect();
    let results = ingestor.run_sources(&sources, 2).await;

    let order: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(order, ["A", "B", "L"]);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(IngestError::FeedUnavailable { .. })));
    assert!(results[2].1.is_ok());

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS), 3);
    assert_eq!(store.row_count(UPDATES), 3);

    let mut partitions = store.partitions(TRIPS);
    partitions.sort();
    assert_eq!(partitions, ["2026-01-05-18:00", "2026-01-05-18:05"]);
}

#[tokio::test]
async fn test_tick_into_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("subway.db"));
    let feed = CannedFeed::default().with("N", vec![trip("n1", &["R01", "R05", "R09"])], at(18, 2, 30));

    let ingestor = Ingestor::new(
        feed,
        extractor(),
        Loader::new(store, Duration::from_secs(5)),
        PartitionWindow::default(),
    );
    ingestor.prepare().await.unwrap();
    ingestor.run_tick("N").await.unwrap();
    ingestor.run_tick("N").await.unwrap();

    let store = ingestor.loader().store();
    assert_eq!(store.row_count(TRIPS).unwrap(), 2);
    assert_eq!(store.row_count(UPDATES).unwrap(), 4);
}

#[tokio::test]
async fn test_conflicting_layout_is_rejected_before_any_write() {
    let store = MemoryStore::new();
    let loader = Loader::new(store, Duration::from_secs(5));
    loader
        .ensure_schema(&TableSchema::trip_snapshots(TRIPS, false))
        .await
        .unwrap();

    let feed = CannedFeed::default().with("A", vec![trip("t1", &["A1"])], at(18, 2, 30));
    let ingestor = Ingestor::new(feed, extractor(), loader, PartitionWindow::default());

    let err = ingestor.prepare().await.unwrap_err();
    assert!(matches!(err, IngestError::SchemaConflict { .. }));
    assert_eq!(ingestor.loader().store().row_count(TRIPS), 0);
}

#[test]
fn test_encoded_feed_decodes_to_trips() {
    let generated = at(18, 2, 30).timestamp();
    let stu = |stop_id: &str, offset: i64| RtStopTimeUpdate {
        stop_id: Some(stop_id.to_string()),
        arrival: Some(StopTimeEvent {
            time: Some(generated + offset),
            ..Default::default()
        }),
        ..Default::default()
    };
    let message = FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "1.0".to_string(),
            timestamp: Some(generated as u64),
            ..Default::default()
        },
        entity: vec![FeedEntity {
            id: "000001".to_string(),
            trip_update: Some(TripUpdate {
                trip: TripDescriptor {
                    trip_id: Some("108250_L..N".to_string()),
                    start_date: Some("20260105".to_string()),
                    ..Default::default()
                },
                stop_time_update: vec![stu("L10N", 60), stu("L08N", 180), stu("L01N", 900)],
                ..Default::default()
            }),
            ..Default::default()
        }],
    };

    let bytes = message.encode_to_vec();
    let feed = parse_feed(&bytes).unwrap();
    let stops = StopDirectory::from_pairs([("L10", "Bedford Av"), ("L01", "8 Av")]);
    let snapshot = snapshot_from_feed("L", &feed, &stops).unwrap();

    assert_eq!(snapshot.generated_at, at(18, 2, 30));
    assert_eq!(snapshot.trips.len(), 1);

    let trip = &snapshot.trips[0];
    assert_eq!(trip.trip_id, "108250_L..N");
    assert_eq!(trip.route_id.as_deref(), Some("L"));
    assert_eq!(trip.direction.as_deref(), Some("N"));
    assert_eq!(trip.stop_time_updates.len(), 3);

    let extraction = extractor().extract(&snapshot.trips, snapshot.generated_at).unwrap();
    assert_eq!(extraction.snapshot_batch.len(), 1);
    assert_eq!(extraction.boundary_batch.len(), 2);
    assert_eq!(extraction.snapshots[0].num_stops_left, 3);
}
