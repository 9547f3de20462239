//! Trip completion metrics, derived by replaying the stored track.

use anyhow::Result;
use chrono::Utc;
use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::models::{CompletionMethod, TripCompletion};
use crate::schedule::ScheduleCache;
use crate::store::StateStore;
use crate::timeutil::gtfs_time_to_timestamp;

pub struct CompletionCalculator {
    store: Arc<dyn StateStore>,
    schedule: Arc<ScheduleCache>,
    tz: Tz,
}

impl CompletionCalculator {
    pub fn new(store: Arc<dyn StateStore>, schedule: Arc<ScheduleCache>, tz: Tz) -> Self {
        Self { store, schedule, tz }
    }

    /// Replays the full track of `(trip_id, service_date)` into summary
    /// metrics. Returns `Ok(None)` when no track data exists; a trip with
    /// no observations has nothing to finalize.
    ///
    /// The license plate is taken from the pre-transition snapshot when one
    /// exists, falling back to the current vehicle state (which by now may
    /// already describe the next trip, but the plate does not change).
    pub async fn calculate(
        &self,
        trip_id: &str,
        service_date: &str,
        vehicle_id: &str,
        snapshot_key: Option<&str>,
        method: CompletionMethod,
    ) -> Result<Option<TripCompletion>> {
        let track = self.store.get_trip_track(trip_id, service_date, None).await?;
        if track.is_empty() {
            warn!(trip_id, service_date, "No track data, skipping completion");
            return Ok(None);
        }

        let mut timestamps: Vec<i64> = Vec::with_capacity(track.len());
        let mut stop_sequences: HashSet<u32> = HashSet::new();
        for entry in &track {
            if let Some(ts) = entry.get("ts").and_then(|v| v.parse().ok()) {
                timestamps.push(ts);
            }
            if let Some(seq) = entry
                .get("stop_sequence")
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse().ok())
            {
                stop_sequences.insert(seq);
            }
        }

        let (Some(&start_time), Some(&end_time)) =
            (timestamps.iter().min(), timestamps.iter().max())
        else {
            warn!(trip_id, "No valid timestamps on track, skipping completion");
            return Ok(None);
        };

        let license_plate = self.resolve_license_plate(vehicle_id, snapshot_key).await;

        let mut route_short_name = None;
        let mut route_long_name = None;
        let mut scheduled_start_time = None;
        let mut scheduled_end_time = None;
        if let Some(tables) = self.schedule.current() {
            if let Some(route) = tables
                .trip(trip_id)
                .and_then(|trip| tables.route(&trip.route_id))
            {
                route_short_name = route.short_name.clone();
                route_long_name = route.long_name.clone();
            }
            let (first_departure, last_arrival) = tables.scheduled_span(trip_id);
            scheduled_start_time = first_departure
                .and_then(|t| gtfs_time_to_timestamp(&t, service_date, self.tz));
            scheduled_end_time =
                last_arrival.and_then(|t| gtfs_time_to_timestamp(&t, service_date, self.tz));
        }

        Ok(Some(TripCompletion {
            trip_id: trip_id.to_string(),
            service_date: service_date.to_string(),
            vehicle_id: vehicle_id.to_string(),
            license_plate,
            start_time,
            end_time,
            duration_seconds: end_time - start_time,
            stops_served: stop_sequences.len(),
            total_positions: track.len(),
            route_short_name,
            route_long_name,
            scheduled_start_time,
            scheduled_end_time,
            completion_method: method,
            completed_at: Utc::now(),
        }))
    }

    async fn resolve_license_plate(
        &self,
        vehicle_id: &str,
        snapshot_key: Option<&str>,
    ) -> Option<String> {
        if let Some(key) = snapshot_key {
            match self.store.get_hash(key).await {
                Ok(Some(snapshot)) => {
                    if let Some(plate) = crate::models::opt_str(&snapshot, "license_plate") {
                        return Some(plate);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "Failed to read snapshot"),
            }
        }

        match self.store.get_vehicle_state(vehicle_id).await {
            Ok(Some(state)) => crate::models::opt_str(&state, "license_plate"),
            Ok(None) => None,
            Err(e) => {
                warn!(vehicle_id, error = %e, "Failed to read vehicle state");
                None
            }
        }
    }
}
