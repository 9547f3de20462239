//! Pipeline orchestrator: dedupe, bounded-parallel processing, atomic
//! commit, and the inactivity sweeper.
//!
//! A poll cycle runs in phases. Unchanged positions are dropped against a
//! process-local fingerprint cache, transitions are detected with bounded
//! parallelism, every surviving vehicle's state is rebuilt, and one atomic
//! batch writes the whole cycle. Completions of transitioned trips run
//! sequentially afterwards so they read the already-committed tracks.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::detector::TransitionDetector;
use crate::models::{TripPosition, TripTransition, VehiclePosition, VehicleState, VehicleUpdate};
use crate::models::{CompletionMethod, opt_num, opt_str};
use crate::schedule::geometry::bearing_deg;
use crate::schedule::{ScheduleCache, ScheduleTables};
use crate::store::{StateStore, WriteBatch};
use crate::timeutil::{gtfs_time_to_timestamp, service_date};

/// Inactivity after which a still-assigned trip is force-finalized.
const FORCED_COMPLETION_AFTER_SECONDS: i64 = 3_600;

/// Movement below this many degrees in both coordinates is jitter, not
/// travel, and produces no GPS bearing.
const MIN_MOVEMENT_DEG: f64 = 1e-5;

/// Shape-speed samples with more than this much time between reports are
/// discarded as stale.
const MAX_SPEED_WINDOW_SECONDS: i64 = 300;

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleOutcome {
    pub received: usize,
    pub published: usize,
    pub unchanged: usize,
    pub transitions: usize,
}

pub struct Publisher {
    store: Arc<dyn StateStore>,
    schedule: Arc<ScheduleCache>,
    detector: Arc<TransitionDetector>,
    settings: Arc<Settings>,
    semaphore: Arc<Semaphore>,
    fingerprints: Mutex<HashMap<String, String>>,
    first_run: AtomicBool,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn StateStore>,
        schedule: Arc<ScheduleCache>,
        detector: Arc<TransitionDetector>,
        settings: Arc<Settings>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_store_operations));
        Self {
            store,
            schedule,
            detector,
            settings,
            semaphore,
            fingerprints: Mutex::new(HashMap::new()),
            first_run: AtomicBool::new(true),
        }
    }

    /// Publishes one cycle's worth of normalized positions.
    pub async fn publish_positions(&self, positions: Vec<VehiclePosition>) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome {
            received: positions.len(),
            ..Default::default()
        };
        if positions.is_empty() {
            warn!("No positions to publish");
            return Ok(outcome);
        }

        let to_publish = self.filter_changed(positions);
        outcome.unchanged = outcome.received - to_publish.len();
        if to_publish.is_empty() {
            debug!("No changed positions this cycle");
            return Ok(outcome);
        }

        let transitions = self.detect_transitions(&to_publish).await;
        outcome.transitions = transitions.len();

        let records = self.build_records(&to_publish).await;
        let batch = self.assemble_batch(&records)?;
        outcome.published = records.len();

        self.store
            .commit(batch)
            .await
            .context("committing cycle batch")?;

        info!(
            received = outcome.received,
            published = outcome.published,
            unchanged = outcome.unchanged,
            transitions = outcome.transitions,
            "Cycle published"
        );

        // Completions read the tracks the commit above just extended, so
        // they must run after it, and sequentially.
        for transition in &transitions {
            if let Err(e) = self.detector.handle_transition(transition).await {
                error!(
                    vehicle_id = %transition.vehicle_id,
                    error = %e,
                    "Failed to handle transition"
                );
            }
        }

        Ok(outcome)
    }

    /// Drops positions whose fingerprint matches the previous cycle. The
    /// first cycle after startup publishes everything.
    fn filter_changed(&self, positions: Vec<VehiclePosition>) -> Vec<VehiclePosition> {
        let first_run = self.first_run.swap(false, Ordering::Relaxed);
        let mut cache = self.fingerprints.lock().expect("fingerprint lock poisoned");

        let mut new_cache = HashMap::with_capacity(positions.len());
        let mut changed = Vec::new();
        for position in positions {
            let print = fingerprint(&position);
            let unchanged = cache.get(&position.vehicle_id) == Some(&print);
            new_cache.insert(position.vehicle_id.clone(), print);
            if first_run || !unchanged {
                changed.push(position);
            }
        }
        *cache = new_cache;
        changed
    }

    fn forget_fingerprint(&self, vehicle_id: &str) {
        self.fingerprints
            .lock()
            .expect("fingerprint lock poisoned")
            .remove(vehicle_id);
    }

    async fn detect_transitions(&self, positions: &[VehiclePosition]) -> Vec<TripTransition> {
        let mut tasks = Vec::with_capacity(positions.len());
        for position in positions {
            let detector = self.detector.clone();
            let semaphore = self.semaphore.clone();
            let position = position.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                detector.detect(&position).await
            }));
        }

        let mut transitions = Vec::new();
        for (task, position) in tasks.into_iter().zip(positions) {
            match task.await {
                Ok(Ok(Some(transition))) => transitions.push(transition),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => error!(
                    vehicle_id = %position.vehicle_id,
                    error = %e,
                    "Transition detection failed"
                ),
                Err(e) => error!(
                    vehicle_id = %position.vehicle_id,
                    error = %e,
                    "Transition task panicked"
                ),
            }
        }
        transitions
    }

    /// Rebuilds the full state record for each position, in parallel. A
    /// failed vehicle is logged and excluded; it never sinks the cycle.
    async fn build_records(
        &self,
        positions: &[VehiclePosition],
    ) -> Vec<(VehicleState, Option<TripPosition>)> {
        let now = Utc::now().timestamp();
        let tables = self.schedule.current();
        let tz = self.settings.timezone;

        let mut tasks = Vec::with_capacity(positions.len());
        for position in positions {
            let store = self.store.clone();
            let semaphore = self.semaphore.clone();
            let tables = tables.clone();
            let position = position.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let old_state = store
                    .get_vehicle_state(&position.vehicle_id)
                    .await?
                    .and_then(|map| VehicleState::from_field_map(&map));
                anyhow::Ok(build_state(
                    &position,
                    old_state.as_ref(),
                    tables.as_deref(),
                    tz,
                    now,
                ))
            }));
        }

        let mut records = Vec::new();
        for (task, position) in tasks.into_iter().zip(positions) {
            match task.await {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => error!(
                    vehicle_id = %position.vehicle_id,
                    error = %e,
                    "Failed to process position"
                ),
                Err(e) => error!(
                    vehicle_id = %position.vehicle_id,
                    error = %e,
                    "Processing task panicked"
                ),
            }
        }
        records
    }

    fn assemble_batch(
        &self,
        records: &[(VehicleState, Option<TripPosition>)],
    ) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        for (state, trip_position) in records {
            batch.put_vehicle_state(state);
            batch.add_active(&state.vehicle_id);
            batch.publish_update(&VehicleUpdate {
                vehicle_id: state.vehicle_id.clone(),
                trip_id: state.trip_id.clone(),
                route_id: state.route_id.clone(),
                latitude: state.latitude,
                longitude: state.longitude,
                bearing: state.bearing,
                speed: state.speed,
                timestamp: state.timestamp,
                service_date: state.service_date.clone(),
                status: "active".to_string(),
            })?;

            if let (Some(trip_position), Some(trip_id)) = (trip_position, &state.trip_id) {
                batch.append_track(
                    trip_id,
                    &trip_position.service_date,
                    trip_position,
                    self.settings.track_max_len,
                );
                batch.set_trip_status(
                    trip_id,
                    &trip_position.service_date,
                    "active",
                    Some(self.settings.trip_status_ttl_seconds),
                );
            }
        }
        Ok(batch)
    }

    /// Sweeps the active index for vehicles that stopped reporting.
    ///
    /// Past the inactivity timeout a vehicle's status flips to "inactive"
    /// (state stays queryable). Past one hour, a vehicle still assigned to
    /// a trip has that trip force-finalized and its state deleted.
    pub async fn cleanup_inactive_vehicles(&self) -> Result<()> {
        self.cleanup_at(Utc::now().timestamp()).await
    }

    pub(crate) async fn cleanup_at(&self, now: i64) -> Result<()> {
        let active = self.store.get_active_vehicles().await?;
        if active.is_empty() {
            return Ok(());
        }

        let mut to_mark_inactive: Vec<HashMap<String, String>> = Vec::new();
        let mut completed = 0usize;

        for vehicle_id in active {
            let Some(state) = self.store.get_vehicle_state(&vehicle_id).await? else {
                continue;
            };
            if state.get("status").map(String::as_str) == Some("inactive") {
                continue;
            }
            let Some(last_timestamp) = opt_num::<i64>(&state, "timestamp") else {
                warn!(vehicle_id = %vehicle_id, "Invalid timestamp on vehicle state");
                continue;
            };
            let idle = now - last_timestamp;
            if idle <= self.settings.vehicle_inactivity_timeout_seconds {
                continue;
            }

            let trip_id = opt_str(&state, "trip_id");
            let state_service_date = opt_str(&state, "service_date");
            if idle > FORCED_COMPLETION_AFTER_SECONDS {
                if let (Some(trip_id), Some(sd)) = (&trip_id, &state_service_date) {
                    match self.force_complete(&vehicle_id, trip_id, sd, idle).await {
                        Ok(true) => {
                            completed += 1;
                            continue;
                        }
                        Ok(false) => {}
                        // One vehicle's failure must not stop the sweep;
                        // this one is retried on the next pass.
                        Err(e) => {
                            error!(
                                vehicle_id = %vehicle_id,
                                trip_id = %trip_id,
                                error = %e,
                                "Forced completion failed"
                            );
                            continue;
                        }
                    }
                }
            }
            to_mark_inactive.push(state);
        }

        if !to_mark_inactive.is_empty() {
            let mut batch = WriteBatch::new();
            for state in &to_mark_inactive {
                let Some(vehicle_id) = state.get("vehicle_id") else {
                    continue;
                };
                batch.set_vehicle_status(vehicle_id, "inactive");
                batch.publish_update(&VehicleUpdate {
                    vehicle_id: vehicle_id.clone(),
                    trip_id: opt_str(state, "trip_id"),
                    route_id: opt_str(state, "route_id"),
                    latitude: opt_num(state, "latitude").unwrap_or(0.0),
                    longitude: opt_num(state, "longitude").unwrap_or(0.0),
                    bearing: opt_num(state, "bearing"),
                    speed: opt_num(state, "speed"),
                    timestamp: opt_num(state, "timestamp").unwrap_or(0),
                    service_date: opt_str(state, "service_date"),
                    status: "inactive".to_string(),
                })?;
                self.forget_fingerprint(vehicle_id);
            }
            self.store.commit(batch).await?;
            info!(
                count = to_mark_inactive.len(),
                "Marked vehicles inactive"
            );
        }
        if completed > 0 {
            info!(count = completed, "Force-completed trips of inactive vehicles");
        }

        Ok(())
    }

    /// Finalizes an abandoned trip. Returns false when no track data
    /// exists; the caller then falls back to plain inactive marking.
    async fn force_complete(
        &self,
        vehicle_id: &str,
        trip_id: &str,
        service_date: &str,
        idle_seconds: i64,
    ) -> Result<bool> {
        let Some(completion) = self
            .detector
            .completion()
            .calculate(trip_id, service_date, vehicle_id, None, CompletionMethod::Inactivity)
            .await?
        else {
            return Ok(false);
        };

        let mut batch = WriteBatch::new();
        batch.put_completion(&completion);
        batch.set_trip_status(
            trip_id,
            service_date,
            "completed",
            Some(self.settings.trip_status_ttl_seconds),
        );
        batch.delete_vehicle_state(vehicle_id);
        batch.remove_active(vehicle_id);
        self.store.commit(batch).await?;
        self.forget_fingerprint(vehicle_id);

        info!(
            trip_id,
            vehicle_id,
            idle_seconds,
            duration_seconds = completion.duration_seconds,
            "Force-completed trip for inactive vehicle"
        );
        Ok(true)
    }
}

/// Change-detection fingerprint over the fields that matter for publishing.
fn fingerprint(p: &VehiclePosition) -> String {
    format!(
        "{}|{}|{:.6}|{:.6}|{}|{}|{}|{}|{}|{}|{}",
        p.trip_id.as_deref().unwrap_or(""),
        p.route_id.as_deref().unwrap_or(""),
        p.position.latitude,
        p.position.longitude,
        p.position.bearing.map(|v| v.to_string()).unwrap_or_default(),
        p.position.speed.map(|v| v.to_string()).unwrap_or_default(),
        p.timestamp,
        p.current_status.as_deref().unwrap_or(""),
        p.stop_id.as_deref().unwrap_or(""),
        p.stop_sequence.map(|v| v.to_string()).unwrap_or_default(),
        p.service_date.as_deref().unwrap_or(""),
    )
}

/// Builds the new state record for one vehicle, deriving kinematics against
/// the previous state and resolving schedule enrichment. Pure apart from
/// its inputs.
pub(crate) fn build_state(
    position: &VehiclePosition,
    old_state: Option<&VehicleState>,
    tables: Option<&ScheduleTables>,
    tz: chrono_tz::Tz,
    now: i64,
) -> (VehicleState, Option<TripPosition>) {
    let enrichment = tables
        .map(|t| {
            t.enrich(
                position.trip_id.as_deref(),
                position.stop_id.as_deref(),
                position.stop_sequence,
            )
        })
        .unwrap_or_default();

    let mut shape_dist_traveled = None;
    let mut two_shape_bearing = None;
    if let (Some(tables), Some(trip_id)) = (tables, position.trip_id.as_deref()) {
        shape_dist_traveled = tables
            .match_to_shape(trip_id, position.position.latitude, position.position.longitude)
            .and_then(|m| m.dist_traveled);
        two_shape_bearing = tables.two_point_bearing(
            trip_id,
            position.position.latitude,
            position.position.longitude,
        );
    }

    // Speed over the shape: distance-along-route delta divided by report
    // interval, accepted only for a forward move within the window.
    let mut shape_speed = None;
    if let (Some(old), Some(new_dist)) = (old_state, shape_dist_traveled) {
        if let Some(old_dist) = old.shape_dist_traveled {
            let dt = position.timestamp - old.timestamp;
            let dd = new_dist - old_dist;
            if old.timestamp > 0 && dt > 0 && dt < MAX_SPEED_WINDOW_SECONDS && dd >= 0.0 {
                shape_speed = Some(dd / dt as f64);
            }
        }
    }

    // Bearing from actual GPS movement, independent of the shape.
    let mut shape_bearing = None;
    if let Some(old) = old_state {
        if old.latitude != 0.0 && old.longitude != 0.0 {
            let moved = (old.latitude - position.position.latitude).abs() > MIN_MOVEMENT_DEG
                || (old.longitude - position.position.longitude).abs() > MIN_MOVEMENT_DEG;
            if moved {
                shape_bearing = Some(bearing_deg(
                    old.latitude,
                    old.longitude,
                    position.position.latitude,
                    position.position.longitude,
                ));
            }
        }
    }

    let old_trip_id = old_state.and_then(|s| s.trip_id.as_deref());
    let is_new_trip = position.trip_id.is_some() && old_trip_id != position.trip_id.as_deref();

    let mut scheduled_start_time = None;
    let mut scheduled_end_time = None;
    let mut actual_start_time = None;
    if is_new_trip {
        if let (Some(tables), Some(trip_id), Some(sd)) =
            (tables, position.trip_id.as_deref(), position.service_date.as_deref())
        {
            let (first_departure, last_arrival) = tables.scheduled_span(trip_id);
            scheduled_start_time =
                first_departure.and_then(|t| gtfs_time_to_timestamp(&t, sd, tz));
            scheduled_end_time = last_arrival.and_then(|t| gtfs_time_to_timestamp(&t, sd, tz));
        }
    } else if let Some(old) = old_state {
        scheduled_start_time = old.scheduled_start_time;
        scheduled_end_time = old.scheduled_end_time;
        actual_start_time = old.actual_start_time;
    }

    // The real departure is pinned the first time the vehicle reports at
    // the first stop of its trip.
    if position.trip_id.is_some() && position.stop_sequence == Some(1) {
        let already_set = old_state.map(|s| s.actual_start_time.is_some()).unwrap_or(false);
        if !already_set {
            actual_start_time = Some(position.timestamp);
        }
    }

    let resolved_service_date = position
        .service_date
        .clone()
        .or_else(|| old_state.and_then(|s| s.service_date.clone()))
        .or_else(|| {
            position
                .trip_id
                .as_ref()
                .and_then(|_| service_date(position.timestamp, tz))
        });

    let state = VehicleState {
        vehicle_id: position.vehicle_id.clone(),
        license_plate: position.license_plate.clone(),
        trip_id: position.trip_id.clone(),
        route_id: position.route_id.clone(),
        latitude: position.position.latitude,
        longitude: position.position.longitude,
        bearing: position.position.bearing,
        speed: position.position.speed,
        timestamp: position.timestamp,
        current_status: position.current_status.clone(),
        stop_id: position.stop_id.clone(),
        current_stop_sequence: position.stop_sequence,
        last_updated: now,
        status: "active".to_string(),
        route_short_name: enrichment.route_short_name,
        route_long_name: enrichment.route_long_name,
        trip_headsign: enrichment.trip_headsign,
        stop_name: enrichment.stop_name,
        direction_id: enrichment.direction_id,
        shape_dist_traveled,
        shape_bearing,
        two_shape_bearing,
        shape_speed,
        service_date: resolved_service_date,
        scheduled_start_time,
        scheduled_end_time,
        actual_start_time,
    };

    let trip_position = match (&position.trip_id, &position.service_date) {
        (Some(_), Some(sd)) => Some(TripPosition {
            vehicle_id: position.vehicle_id.clone(),
            latitude: position.position.latitude,
            longitude: position.position.longitude,
            bearing: position.position.bearing,
            speed: position.position.speed,
            timestamp: position.timestamp,
            current_status: position.current_status.clone(),
            stop_id: position.stop_id.clone(),
            stop_sequence: position.stop_sequence,
            service_date: sd.clone(),
        }),
        _ => None,
    };

    (state, trip_position)
}
