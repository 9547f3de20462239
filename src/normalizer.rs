//! Normalization of raw GTFS-RT feed entities into application models.

use chrono_tz::Tz;
use gtfs_realtime::FeedMessage;
use tracing::{debug, info, warn};

use crate::models::{Position, VehiclePosition};
use crate::timeutil::service_date;

/// Samples older than this at normalization time are discarded.
const STALE_AFTER_SECONDS: i64 = 180;

/// Converts a decoded feed into normalized vehicle positions.
///
/// A malformed or incomplete entity is skipped with a warning; it never
/// aborts the rest of the feed. `now` is the wall-clock Unix timestamp
/// used for the staleness gate.
pub fn normalize_feed(feed: &FeedMessage, now: i64, tz: Tz) -> Vec<VehiclePosition> {
    let mut positions = Vec::new();

    for entity in &feed.entity {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        if let Some(position) = normalize_vehicle(vehicle, &entity.id, now, tz) {
            positions.push(position);
        }
    }

    info!(count = positions.len(), "Normalized vehicle positions");
    positions
}

fn normalize_vehicle(
    vehicle: &gtfs_realtime::VehiclePosition,
    entity_id: &str,
    now: i64,
    tz: Tz,
) -> Option<VehiclePosition> {
    let descriptor = vehicle.vehicle.as_ref();
    let vehicle_id = match descriptor.and_then(|d| d.id.clone()).filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            warn!(entity_id, "Vehicle entity missing vehicle id, skipping");
            return None;
        }
    };

    let Some(raw_position) = &vehicle.position else {
        warn!(vehicle_id, "Vehicle entity missing position, skipping");
        return None;
    };

    let position = Position {
        latitude: raw_position.latitude as f64,
        longitude: raw_position.longitude as f64,
        bearing: raw_position.bearing.map(|b| b as f64),
        speed: raw_position.speed.map(|s| s as f64),
    };

    let timestamp = vehicle.timestamp.map(|t| t as i64).unwrap_or(now);
    let age = now - timestamp;
    if age > STALE_AFTER_SECONDS {
        debug!(vehicle_id, age, "Skipping stale vehicle sample");
        return None;
    }

    let (trip_id, route_id) = match &vehicle.trip {
        Some(trip) => (
            trip.trip_id.clone().filter(|t| !t.is_empty()),
            trip.route_id.clone().filter(|r| !r.is_empty()),
        ),
        None => (None, None),
    };

    let current_status = vehicle.current_status.and_then(status_name);
    let congestion_level = vehicle.congestion_level.and_then(congestion_name);
    let occupancy_status = vehicle.occupancy_status.and_then(occupancy_name);

    // Service date only makes sense while the vehicle is on a trip.
    let sd = match &trip_id {
        Some(_) => service_date(timestamp, tz),
        None => None,
    };

    Some(VehiclePosition {
        vehicle_id,
        license_plate: descriptor.and_then(|d| d.license_plate.clone()),
        trip_id,
        route_id,
        position,
        timestamp,
        current_status: current_status.map(str::to_string),
        stop_id: vehicle.stop_id.clone().filter(|s| !s.is_empty()),
        stop_sequence: vehicle.current_stop_sequence,
        congestion_level: congestion_level.map(str::to_string),
        occupancy_status: occupancy_status.map(str::to_string),
        service_date: sd,
    })
}

fn status_name(value: i32) -> Option<&'static str> {
    match value {
        0 => Some("INCOMING_AT"),
        1 => Some("STOPPED_AT"),
        2 => Some("IN_TRANSIT_TO"),
        _ => None,
    }
}

fn congestion_name(value: i32) -> Option<&'static str> {
    match value {
        0 => Some("UNKNOWN_CONGESTION_LEVEL"),
        1 => Some("RUNNING_SMOOTHLY"),
        2 => Some("STOP_AND_GO"),
        3 => Some("CONGESTION"),
        4 => Some("SEVERE_CONGESTION"),
        _ => None,
    }
}

fn occupancy_name(value: i32) -> Option<&'static str> {
    match value {
        0 => Some("EMPTY"),
        1 => Some("MANY_SEATS_AVAILABLE"),
        2 => Some("FEW_SEATS_AVAILABLE"),
        3 => Some("STANDING_ROOM_ONLY"),
        4 => Some("CRUSHED_STANDING_ROOM_ONLY"),
        5 => Some("FULL"),
        6 => Some("NOT_ACCEPTING_PASSENGERS"),
        _ => None,
    }
}
