//! Trip transition detection.
//!
//! Compares each incoming sample's trip against the stored vehicle state.
//! A change emits a [`TripTransition`]; completion of the previous trip is
//! handled later, after the cycle's bulk write has landed.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::completion::CompletionCalculator;
use crate::models::{CompletionMethod, TripTransition, VehiclePosition, VehicleState};
use crate::store::{StateStore, WriteBatch, snapshot_key};
use crate::timeutil::service_date;

pub struct TransitionDetector {
    store: Arc<dyn StateStore>,
    completion: Arc<CompletionCalculator>,
    tz: chrono_tz::Tz,
    status_ttl_seconds: u64,
}

impl TransitionDetector {
    pub fn new(
        store: Arc<dyn StateStore>,
        completion: Arc<CompletionCalculator>,
        tz: chrono_tz::Tz,
        status_ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            completion,
            tz,
            status_ttl_seconds,
        }
    }

    /// The calculator shared with the inactivity sweeper.
    pub fn completion(&self) -> &CompletionCalculator {
        &self.completion
    }

    /// Checks one sample against the stored state.
    ///
    /// Returns `None` when the sample carries no trip, when the vehicle has
    /// never been seen, or when the trip is unchanged. A vehicle seen before
    /// but previously without a trip yields a transition with no previous
    /// trip (a trip start).
    pub async fn detect(&self, position: &VehiclePosition) -> Result<Option<TripTransition>> {
        let Some(new_trip_id) = position.trip_id.as_deref() else {
            return Ok(None);
        };
        let new_service_date = match &position.service_date {
            Some(sd) => sd.clone(),
            None => match service_date(position.timestamp, self.tz) {
                Some(sd) => sd,
                None => return Ok(None),
            },
        };

        let Some(previous_map) = self.store.get_vehicle_state(&position.vehicle_id).await? else {
            debug!(
                vehicle_id = %position.vehicle_id,
                trip_id = %new_trip_id,
                "New vehicle"
            );
            return Ok(None);
        };
        let Some(previous) = VehicleState::from_field_map(&previous_map) else {
            return Ok(None);
        };

        let Some(previous_trip_id) = previous.trip_id.clone() else {
            info!(
                vehicle_id = %position.vehicle_id,
                trip_id = %new_trip_id,
                service_date = %new_service_date,
                "Vehicle starting trip"
            );
            return Ok(Some(TripTransition {
                vehicle_id: position.vehicle_id.clone(),
                previous_trip_id: None,
                new_trip_id: new_trip_id.to_string(),
                timestamp: position.timestamp,
                previous_service_date: None,
                new_service_date,
                previous_state_key: None,
            }));
        };

        if previous_trip_id == new_trip_id {
            return Ok(None);
        }

        // Snapshot the pre-transition state so completion still has it
        // after the bulk write overwrites the vehicle hash. Snapshot
        // failure degrades to a keyless transition rather than losing it.
        let key = snapshot_key(&position.vehicle_id, &previous_trip_id);
        let previous_state_key = match self
            .store
            .put_hash(&key, previous.to_field_map())
            .await
        {
            Ok(()) => Some(key),
            Err(e) => {
                error!(
                    vehicle_id = %position.vehicle_id,
                    error = %e,
                    "Failed to save pre-transition snapshot"
                );
                None
            }
        };

        info!(
            vehicle_id = %position.vehicle_id,
            previous_trip_id = %previous_trip_id,
            new_trip_id = %new_trip_id,
            "Trip transition detected"
        );
        Ok(Some(TripTransition {
            vehicle_id: position.vehicle_id.clone(),
            previous_trip_id: Some(previous_trip_id),
            new_trip_id: new_trip_id.to_string(),
            timestamp: position.timestamp,
            previous_service_date: previous.service_date,
            new_service_date,
            previous_state_key,
        }))
    }

    /// Finalizes the previous trip of a transition: completion metrics,
    /// status flip to "completed", and snapshot cleanup, in one batch.
    /// A trip start (no previous trip) is a no-op.
    pub async fn handle_transition(&self, transition: &TripTransition) -> Result<()> {
        let Some(previous_trip_id) = transition.previous_trip_id.as_deref() else {
            return Ok(());
        };
        let Some(previous_service_date) = transition.previous_service_date.as_deref() else {
            debug!(
                trip_id = %previous_trip_id,
                "No service date on previous trip, skipping completion"
            );
            return Ok(());
        };

        let completion = self
            .completion
            .calculate(
                previous_trip_id,
                previous_service_date,
                &transition.vehicle_id,
                transition.previous_state_key.as_deref(),
                CompletionMethod::Transition,
            )
            .await?;

        let mut batch = WriteBatch::new();
        if let Some(completion) = &completion {
            batch.put_completion(completion);
            info!(
                trip_id = %previous_trip_id,
                service_date = %previous_service_date,
                duration_seconds = completion.duration_seconds,
                stops_served = completion.stops_served,
                "Trip completed"
            );
        }
        batch.set_trip_status(
            previous_trip_id,
            previous_service_date,
            "completed",
            Some(self.status_ttl_seconds),
        );
        if let Some(key) = &transition.previous_state_key {
            batch.delete_key(key);
        }
        self.store.commit(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Position;
    use crate::schedule::ScheduleCache;
    use crate::store::MemoryStore;
    use chrono_tz::Europe::Lisbon;

    fn detector(store: Arc<MemoryStore>) -> TransitionDetector {
        let schedule = Arc::new(ScheduleCache::new(
            Arc::new(crate::schedule::GtfsDirSource::new("unused")),
            4,
            Lisbon,
        ));
        let completion = Arc::new(CompletionCalculator::new(
            store.clone(),
            schedule,
            Lisbon,
        ));
        TransitionDetector::new(store, completion, Lisbon, 86_400)
    }

    fn sample(vehicle_id: &str, trip_id: Option<&str>, ts: i64) -> VehiclePosition {
        VehiclePosition {
            vehicle_id: vehicle_id.to_string(),
            license_plate: None,
            trip_id: trip_id.map(String::from),
            route_id: None,
            position: Position {
                latitude: 38.7,
                longitude: -9.1,
                bearing: None,
                speed: None,
            },
            timestamp: ts,
            current_status: None,
            stop_id: None,
            stop_sequence: None,
            congestion_level: None,
            occupancy_status: None,
            service_date: Some("20251207".to_string()),
        }
    }

    fn stored_state(vehicle_id: &str, trip_id: Option<&str>) -> VehicleState {
        VehicleState {
            vehicle_id: vehicle_id.to_string(),
            trip_id: trip_id.map(String::from),
            latitude: 38.7,
            longitude: -9.1,
            timestamp: 1_765_100_000,
            status: "active".to_string(),
            service_date: Some("20251207".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_trip_no_transition() {
        let store = Arc::new(MemoryStore::new());
        let detector = detector(store);
        let result = detector.detect(&sample("v1", None, 1_765_100_000)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_new_vehicle_no_transition() {
        let store = Arc::new(MemoryStore::new());
        let detector = detector(store);
        let result = detector
            .detect(&sample("v1", Some("t1"), 1_765_100_000))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_trip_start_emits_transition_without_previous() {
        let store = Arc::new(MemoryStore::new());
        let state = stored_state("v1", None);
        store
            .put_hash("vehicle:v1", state.to_field_map())
            .await
            .unwrap();

        let detector = detector(store);
        let transition = detector
            .detect(&sample("v1", Some("t1"), 1_765_100_030))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(transition.previous_trip_id, None);
        assert_eq!(transition.new_trip_id, "t1");
        assert_eq!(transition.previous_state_key, None);
    }

    #[tokio::test]
    async fn test_unchanged_trip_no_transition() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_hash("vehicle:v1", stored_state("v1", Some("t1")).to_field_map())
            .await
            .unwrap();

        let detector = detector(store);
        let result = detector
            .detect(&sample("v1", Some("t1"), 1_765_100_030))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_trip_change_snapshots_previous_state() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_hash("vehicle:v1", stored_state("v1", Some("t1")).to_field_map())
            .await
            .unwrap();

        let detector = detector(store.clone());
        let transition = detector
            .detect(&sample("v1", Some("t2"), 1_765_100_030))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(transition.previous_trip_id.as_deref(), Some("t1"));
        assert_eq!(transition.new_trip_id, "t2");
        assert_eq!(
            transition.previous_state_key.as_deref(),
            Some("vehicle:v1:transition:t1")
        );

        let snapshot = store
            .get_hash("vehicle:v1:transition:t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.get("trip_id").map(String::as_str), Some("t1"));
    }

    #[tokio::test]
    async fn test_handle_transition_marks_completed_even_without_track() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_hash("vehicle:v1", stored_state("v1", Some("t1")).to_field_map())
            .await
            .unwrap();

        let detector = detector(store.clone());
        let transition = detector
            .detect(&sample("v1", Some("t2"), 1_765_100_030))
            .await
            .unwrap()
            .unwrap();
        detector.handle_transition(&transition).await.unwrap();

        // No track entries, so no completion hash, but status flips and
        // the snapshot is gone.
        assert_eq!(
            store.get_trip_status("t1", "20251207").await.unwrap().as_deref(),
            Some("completed")
        );
        assert!(store.get_trip_completion("t1", "20251207").await.unwrap().is_none());
        assert!(store.get_hash("vehicle:v1:transition:t1").await.unwrap().is_none());
    }
}
