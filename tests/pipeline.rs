//! End-to-end pipeline scenarios against the in-memory store.

use std::sync::Arc;

use chrono::Utc;
use fleet_ingest::completion::CompletionCalculator;
use fleet_ingest::config::Settings;
use fleet_ingest::detector::TransitionDetector;
use fleet_ingest::models::{Position, VehiclePosition, VehicleState};
use fleet_ingest::publisher::Publisher;
use fleet_ingest::schedule::{GtfsDirSource, ScheduleCache};
use fleet_ingest::store::{MemoryStore, StateStore, StoreStats, WriteBatch, WriteOp, status_key};
use std::collections::HashMap;

fn pipeline<S: StateStore + 'static>(store: Arc<S>) -> Publisher {
    let settings = Arc::new(Settings::default());
    let schedule = Arc::new(ScheduleCache::new(
        Arc::new(GtfsDirSource::new("unused")),
        settings.schedule_refresh_hour,
        settings.timezone,
    ));
    let completion = Arc::new(CompletionCalculator::new(
        store.clone(),
        schedule.clone(),
        settings.timezone,
    ));
    let detector = Arc::new(TransitionDetector::new(
        store.clone(),
        completion,
        settings.timezone,
        settings.trip_status_ttl_seconds,
    ));
    Publisher::new(store, schedule, detector, settings)
}

fn sample(
    vehicle_id: &str,
    trip_id: Option<&str>,
    ts: i64,
    stop_sequence: Option<u32>,
) -> VehiclePosition {
    VehiclePosition {
        vehicle_id: vehicle_id.to_string(),
        license_plate: Some("AB-12-CD".to_string()),
        trip_id: trip_id.map(String::from),
        route_id: Some("route_9".to_string()),
        position: Position {
            latitude: 38.7 + (ts % 1_000) as f64 * 1e-5,
            longitude: -9.1,
            bearing: Some(45.0),
            speed: Some(8.0),
        },
        timestamp: ts,
        current_status: Some("IN_TRANSIT_TO".to_string()),
        stop_id: None,
        stop_sequence,
        congestion_level: None,
        occupancy_status: None,
        service_date: trip_id.map(|_| "20251207".to_string()),
    }
}

#[tokio::test]
async fn test_unchanged_positions_skip_second_cycle() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    let positions = vec![
        sample("v1", Some("t1"), 1_000, None),
        sample("v2", Some("t2"), 1_000, None),
    ];

    let first = publisher.publish_positions(positions.clone()).await.unwrap();
    assert_eq!(first.published, 2);
    assert_eq!(first.unchanged, 0);
    let broadcasts_after_first = store.published().len();

    let second = publisher.publish_positions(positions).await.unwrap();
    assert_eq!(second.published, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(store.published().len(), broadcasts_after_first);
}

#[tokio::test]
async fn test_changed_position_republishes() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    publisher
        .publish_positions(vec![sample("v1", Some("t1"), 1_000, None)])
        .await
        .unwrap();
    let outcome = publisher
        .publish_positions(vec![sample("v1", Some("t1"), 1_030, None)])
        .await
        .unwrap();

    assert_eq!(outcome.published, 1);
    let state = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(state.get("timestamp").map(String::as_str), Some("1030"));
}

#[tokio::test]
async fn test_cycle_writes_state_track_status_and_broadcast() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    publisher
        .publish_positions(vec![sample("v1", Some("t1"), 1_000, Some(1))])
        .await
        .unwrap();

    let state = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(state.get("trip_id").map(String::as_str), Some("t1"));
    assert_eq!(state.get("status").map(String::as_str), Some("active"));
    // First report at stop_sequence 1 pins the actual start
    assert_eq!(state.get("actual_start_time").map(String::as_str), Some("1000"));

    assert_eq!(store.get_active_vehicles().await.unwrap(), vec!["v1"]);

    let track = store.get_trip_track("t1", "20251207", None).await.unwrap();
    assert_eq!(track.len(), 1);
    assert_eq!(track[0].get("vehicle_id").map(String::as_str), Some("v1"));

    assert_eq!(
        store.get_trip_status("t1", "20251207").await.unwrap().as_deref(),
        Some("active")
    );
    assert_eq!(store.string_ttl(&status_key("t1", "20251207")), Some(86_400));

    let published = store.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "vehicle:updates");
    let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(payload["vehicle_id"], "v1");
    assert_eq!(payload["status"], "active");
}

#[tokio::test]
async fn test_trip_transition_finalizes_previous_trip() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    // Ten samples on t1 over ~10 minutes, serving four distinct stops
    for i in 0..10 {
        let outcome = publisher
            .publish_positions(vec![sample(
                "v1",
                Some("t1"),
                1_000 + i * 66,
                Some(1 + (i % 4) as u32),
            )])
            .await
            .unwrap();
        assert_eq!(outcome.published, 1);
    }

    // Then the vehicle shows up on t2
    let outcome = publisher
        .publish_positions(vec![sample("v1", Some("t2"), 1_700, Some(1))])
        .await
        .unwrap();
    assert_eq!(outcome.transitions, 1);

    // Previous trip is completed with metrics replayed from its track
    let completion = store
        .get_trip_completion("t1", "20251207")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completion.get("start_time").map(String::as_str), Some("1000"));
    assert_eq!(completion.get("end_time").map(String::as_str), Some("1594"));
    assert_eq!(completion.get("duration_seconds").map(String::as_str), Some("594"));
    assert_eq!(completion.get("total_positions").map(String::as_str), Some("10"));
    assert_eq!(completion.get("stops_served").map(String::as_str), Some("4"));
    assert_eq!(
        completion.get("completion_method").map(String::as_str),
        Some("TRANSITION")
    );
    assert_eq!(
        completion.get("license_plate").map(String::as_str),
        Some("AB-12-CD")
    );

    assert_eq!(
        store.get_trip_status("t1", "20251207").await.unwrap().as_deref(),
        Some("completed")
    );

    // The pre-transition snapshot is consumed and removed
    assert!(store
        .get_hash("vehicle:v1:transition:t1")
        .await
        .unwrap()
        .is_none());

    // Current state reflects the new trip
    let state = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(state.get("trip_id").map(String::as_str), Some("t2"));
}

#[tokio::test]
async fn test_transition_is_one_completion_not_two() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    publisher
        .publish_positions(vec![sample("v1", Some("t1"), 1_000, None)])
        .await
        .unwrap();
    publisher
        .publish_positions(vec![sample("v1", Some("t2"), 1_030, None)])
        .await
        .unwrap();

    // Re-reporting on t2 must not re-finalize t1
    let outcome = publisher
        .publish_positions(vec![sample("v1", Some("t2"), 1_060, None)])
        .await
        .unwrap();
    assert_eq!(outcome.transitions, 0);
}

async fn seed_stale_vehicle(
    store: &MemoryStore,
    vehicle_id: &str,
    trip_id: Option<&str>,
    last_timestamp: i64,
) {
    let state = VehicleState {
        vehicle_id: vehicle_id.to_string(),
        license_plate: Some("AB-12-CD".to_string()),
        trip_id: trip_id.map(String::from),
        latitude: 38.7,
        longitude: -9.1,
        timestamp: last_timestamp,
        last_updated: last_timestamp,
        status: "active".to_string(),
        service_date: trip_id.map(|_| "20251207".to_string()),
        ..Default::default()
    };
    let mut batch = WriteBatch::new();
    batch.put_vehicle_state(&state);
    batch.add_active(vehicle_id);
    store.commit(batch).await.unwrap();
}

#[tokio::test]
async fn test_cleanup_marks_stale_vehicle_inactive() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());
    let now = Utc::now().timestamp();

    seed_stale_vehicle(&store, "v1", None, now - 300).await;
    seed_stale_vehicle(&store, "v2", None, now - 10).await;

    publisher.cleanup_inactive_vehicles().await.unwrap();

    let stale = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(stale.get("status").map(String::as_str), Some("inactive"));
    let fresh = store.get_vehicle_state("v2").await.unwrap().unwrap();
    assert_eq!(fresh.get("status").map(String::as_str), Some("active"));

    let published = store.published();
    assert_eq!(published.len(), 1);
    let payload: serde_json::Value = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(payload["vehicle_id"], "v1");
    assert_eq!(payload["status"], "inactive");
}

#[tokio::test]
async fn test_cleanup_force_completes_long_abandoned_trip() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());
    let now = Utc::now().timestamp();

    // Build up a track first, two hours in the past
    publisher
        .publish_positions(vec![
            sample("v1", Some("t1"), now - 7_400, Some(1)),
        ])
        .await
        .unwrap();
    publisher
        .publish_positions(vec![
            sample("v1", Some("t1"), now - 7_200, Some(2)),
        ])
        .await
        .unwrap();

    publisher.cleanup_inactive_vehicles().await.unwrap();

    // Trip force-finalized, vehicle state deleted, active index cleared
    let completion = store
        .get_trip_completion("t1", "20251207")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        completion.get("completion_method").map(String::as_str),
        Some("INACTIVITY")
    );
    assert_eq!(completion.get("total_positions").map(String::as_str), Some("2"));
    assert_eq!(
        store.get_trip_status("t1", "20251207").await.unwrap().as_deref(),
        Some("completed")
    );
    assert!(store.get_vehicle_state("v1").await.unwrap().is_none());
    assert!(store.get_active_vehicles().await.unwrap().is_empty());
}

/// Delegates to a [`MemoryStore`] but rejects any batch that writes a
/// trip completion hash.
struct CompletionWriteFailure {
    inner: Arc<MemoryStore>,
}

#[async_trait::async_trait]
impl StateStore for CompletionWriteFailure {
    async fn ping(&self) -> anyhow::Result<bool> {
        self.inner.ping().await
    }

    async fn get_vehicle_state(
        &self,
        vehicle_id: &str,
    ) -> anyhow::Result<Option<HashMap<String, String>>> {
        self.inner.get_vehicle_state(vehicle_id).await
    }

    async fn get_active_vehicles(&self) -> anyhow::Result<Vec<String>> {
        self.inner.get_active_vehicles().await
    }

    async fn get_trip_track(
        &self,
        trip_id: &str,
        service_date: &str,
        count: Option<usize>,
    ) -> anyhow::Result<Vec<HashMap<String, String>>> {
        self.inner.get_trip_track(trip_id, service_date, count).await
    }

    async fn get_trip_status(
        &self,
        trip_id: &str,
        service_date: &str,
    ) -> anyhow::Result<Option<String>> {
        self.inner.get_trip_status(trip_id, service_date).await
    }

    async fn get_trip_completion(
        &self,
        trip_id: &str,
        service_date: &str,
    ) -> anyhow::Result<Option<HashMap<String, String>>> {
        self.inner.get_trip_completion(trip_id, service_date).await
    }

    async fn get_hash(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        self.inner.get_hash(key).await
    }

    async fn put_hash(&self, key: &str, fields: Vec<(String, String)>) -> anyhow::Result<()> {
        self.inner.put_hash(key, fields).await
    }

    async fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let writes_completion = batch
            .ops
            .iter()
            .any(|op| matches!(op, WriteOp::PutHash { key, .. } if key.ends_with(":completion")));
        if writes_completion {
            anyhow::bail!("completion write rejected");
        }
        self.inner.commit(batch).await
    }

    async fn stats(&self) -> anyhow::Result<StoreStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn test_cleanup_continues_past_failed_forced_completion() {
    let inner = Arc::new(MemoryStore::new());
    let store = Arc::new(CompletionWriteFailure {
        inner: inner.clone(),
    });
    let publisher = pipeline(store);
    let now = Utc::now().timestamp();

    // One vehicle abandoned its trip two hours ago, with a track behind it
    publisher
        .publish_positions(vec![sample("a1", Some("t1"), now - 7_400, Some(1))])
        .await
        .unwrap();
    publisher
        .publish_positions(vec![sample("a1", Some("t1"), now - 7_200, Some(2))])
        .await
        .unwrap();
    // Another merely went quiet for five minutes
    seed_stale_vehicle(&inner, "b1", None, now - 300).await;

    publisher.cleanup_inactive_vehicles().await.unwrap();

    // The rejected completion leaves the first vehicle for the next sweep
    assert!(inner
        .get_trip_completion("t1", "20251207")
        .await
        .unwrap()
        .is_none());
    let untouched = inner.get_vehicle_state("a1").await.unwrap().unwrap();
    assert_eq!(untouched.get("status").map(String::as_str), Some("active"));

    // The sweep still marks the quiet vehicle inactive
    let marked = inner.get_vehicle_state("b1").await.unwrap().unwrap();
    assert_eq!(marked.get("status").map(String::as_str), Some("inactive"));
}

#[tokio::test]
async fn test_cleanup_without_track_falls_back_to_inactive() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());
    let now = Utc::now().timestamp();

    // Abandoned trip but no track entries were ever written
    seed_stale_vehicle(&store, "v1", Some("t1"), now - 7_200).await;

    publisher.cleanup_inactive_vehicles().await.unwrap();

    let state = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(state.get("status").map(String::as_str), Some("inactive"));
    assert!(store
        .get_trip_completion("t1", "20251207")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_vehicle_without_trip_keeps_state_only() {
    let store = Arc::new(MemoryStore::new());
    let publisher = pipeline(store.clone());

    publisher
        .publish_positions(vec![sample("v1", None, 1_000, None)])
        .await
        .unwrap();

    let state = store.get_vehicle_state("v1").await.unwrap().unwrap();
    assert_eq!(state.get("trip_id").map(String::as_str), Some(""));
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.active_vehicles, 1);
    assert_eq!(stats.total_trip_tracks, 0);
}
