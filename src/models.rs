//! Data models for vehicle location data and their flat field-map codecs.
//!
//! The store keeps hashes and stream entries as flat string maps; every
//! optional field is encoded as an empty string when absent so the key set
//! of a hash is stable across writes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;

/// Geographic position reported by a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    /// Meters per second.
    pub speed: Option<f64>,
}

/// One normalized feed sample.
#[derive(Debug, Clone)]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub license_plate: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub position: Position,
    /// Unix timestamp of the report.
    pub timestamp: i64,
    pub current_status: Option<String>,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub congestion_level: Option<String>,
    pub occupancy_status: Option<String>,
    /// YYYYMMDD, present only when the sample carries a trip.
    pub service_date: Option<String>,
}

/// Latest-known snapshot per vehicle, stored as a hash under
/// `vehicle:{id}` and overwritten wholesale on every accepted sample.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    pub vehicle_id: String,
    pub license_plate: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: i64,
    pub current_status: Option<String>,
    pub stop_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub last_updated: i64,
    /// "active" or "inactive".
    pub status: String,

    // Schedule enrichment
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub trip_headsign: Option<String>,
    pub stop_name: Option<String>,
    pub direction_id: Option<u8>,

    // Derived kinematics
    pub shape_dist_traveled: Option<f64>,
    /// Bearing from GPS movement between consecutive samples (0-360).
    pub shape_bearing: Option<u16>,
    /// Bearing between the two closest shape points (0-360).
    pub two_shape_bearing: Option<u16>,
    /// Speed derived from shape distance deltas (m/s).
    pub shape_speed: Option<f64>,

    pub service_date: Option<String>,
    pub scheduled_start_time: Option<i64>,
    pub scheduled_end_time: Option<i64>,
    pub actual_start_time: Option<i64>,
}

impl VehicleState {
    pub fn to_field_map(&self) -> Vec<(String, String)> {
        let mut m = Vec::with_capacity(26);
        put(&mut m, "vehicle_id", &self.vehicle_id);
        put_opt(&mut m, "license_plate", self.license_plate.as_deref());
        put_opt(&mut m, "trip_id", self.trip_id.as_deref());
        put_opt(&mut m, "route_id", self.route_id.as_deref());
        put(&mut m, "latitude", self.latitude.to_string());
        put(&mut m, "longitude", self.longitude.to_string());
        put_num(&mut m, "bearing", self.bearing);
        put_num(&mut m, "speed", self.speed);
        put(&mut m, "timestamp", self.timestamp.to_string());
        put_opt(&mut m, "current_status", self.current_status.as_deref());
        put_opt(&mut m, "stop_id", self.stop_id.as_deref());
        put_num(&mut m, "current_stop_sequence", self.current_stop_sequence);
        put(&mut m, "last_updated", self.last_updated.to_string());
        put(&mut m, "status", &self.status);
        put_opt(&mut m, "route_short_name", self.route_short_name.as_deref());
        put_opt(&mut m, "route_long_name", self.route_long_name.as_deref());
        put_opt(&mut m, "trip_headsign", self.trip_headsign.as_deref());
        put_opt(&mut m, "stop_name", self.stop_name.as_deref());
        put_num(&mut m, "direction_id", self.direction_id);
        put_num(&mut m, "shape_dist_traveled", self.shape_dist_traveled);
        put_num(&mut m, "shape_bearing", self.shape_bearing);
        put_num(&mut m, "two_shape_bearing", self.two_shape_bearing);
        put_num(&mut m, "shape_speed", self.shape_speed);
        put_opt(&mut m, "service_date", self.service_date.as_deref());
        put_num(&mut m, "scheduled_start_time", self.scheduled_start_time);
        put_num(&mut m, "scheduled_end_time", self.scheduled_end_time);
        put_num(&mut m, "actual_start_time", self.actual_start_time);
        m
    }

    /// Rebuilds a state from a stored hash. Returns `None` when the hash
    /// is missing any of the required fields.
    pub fn from_field_map(map: &HashMap<String, String>) -> Option<Self> {
        Some(VehicleState {
            vehicle_id: get_str(map, "vehicle_id")?,
            license_plate: opt_str(map, "license_plate"),
            trip_id: opt_str(map, "trip_id"),
            route_id: opt_str(map, "route_id"),
            latitude: opt_num(map, "latitude")?,
            longitude: opt_num(map, "longitude")?,
            bearing: opt_num(map, "bearing"),
            speed: opt_num(map, "speed"),
            timestamp: opt_num(map, "timestamp")?,
            current_status: opt_str(map, "current_status"),
            stop_id: opt_str(map, "stop_id"),
            current_stop_sequence: opt_num(map, "current_stop_sequence"),
            last_updated: opt_num(map, "last_updated").unwrap_or(0),
            status: get_str(map, "status").unwrap_or_else(|| "active".to_string()),
            route_short_name: opt_str(map, "route_short_name"),
            route_long_name: opt_str(map, "route_long_name"),
            trip_headsign: opt_str(map, "trip_headsign"),
            stop_name: opt_str(map, "stop_name"),
            direction_id: opt_num(map, "direction_id"),
            shape_dist_traveled: opt_num(map, "shape_dist_traveled"),
            shape_bearing: opt_num(map, "shape_bearing"),
            two_shape_bearing: opt_num(map, "two_shape_bearing"),
            shape_speed: opt_num(map, "shape_speed"),
            service_date: opt_str(map, "service_date"),
            scheduled_start_time: opt_num(map, "scheduled_start_time"),
            scheduled_end_time: opt_num(map, "scheduled_end_time"),
            actual_start_time: opt_num(map, "actual_start_time"),
        })
    }
}

/// One entry of a trip's position track stream. Field names are kept short
/// on the wire (`lat`, `lon`, `ts`) to match the stored schema.
#[derive(Debug, Clone)]
pub struct TripPosition {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: i64,
    pub current_status: Option<String>,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub service_date: String,
}

impl TripPosition {
    pub fn to_stream_map(&self) -> Vec<(String, String)> {
        let mut m = Vec::with_capacity(10);
        put(&mut m, "vehicle_id", &self.vehicle_id);
        put(&mut m, "lat", self.latitude.to_string());
        put(&mut m, "lon", self.longitude.to_string());
        put_num(&mut m, "bearing", self.bearing);
        put_num(&mut m, "speed", self.speed);
        put(&mut m, "ts", self.timestamp.to_string());
        put_opt(&mut m, "status", self.current_status.as_deref());
        put_opt(&mut m, "stop_id", self.stop_id.as_deref());
        put_num(&mut m, "stop_sequence", self.stop_sequence);
        put(&mut m, "service_date", &self.service_date);
        m
    }
}

/// A detected change of a vehicle's trip between consecutive samples.
#[derive(Debug, Clone)]
pub struct TripTransition {
    pub vehicle_id: String,
    pub previous_trip_id: Option<String>,
    pub new_trip_id: String,
    pub timestamp: i64,
    pub previous_service_date: Option<String>,
    pub new_service_date: String,
    /// Store key of the durable snapshot of the pre-transition state.
    pub previous_state_key: Option<String>,
}

/// How a trip came to be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMethod {
    Transition,
    Inactivity,
}

impl CompletionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionMethod::Transition => "TRANSITION",
            CompletionMethod::Inactivity => "INACTIVITY",
        }
    }
}

/// Finalized summary metrics for one (trip, service date), written once.
#[derive(Debug, Clone)]
pub struct TripCompletion {
    pub trip_id: String,
    pub service_date: String,
    pub vehicle_id: String,
    pub license_plate: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_seconds: i64,
    /// Count of distinct stop_sequence values seen on the track.
    pub stops_served: usize,
    pub total_positions: usize,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub scheduled_start_time: Option<i64>,
    pub scheduled_end_time: Option<i64>,
    pub completion_method: CompletionMethod,
    pub completed_at: DateTime<Utc>,
}

impl TripCompletion {
    pub fn to_field_map(&self) -> Vec<(String, String)> {
        let mut m = Vec::with_capacity(15);
        put(&mut m, "trip_id", &self.trip_id);
        put(&mut m, "service_date", &self.service_date);
        put(&mut m, "vehicle_id", &self.vehicle_id);
        put_opt(&mut m, "license_plate", self.license_plate.as_deref());
        put(&mut m, "start_time", self.start_time.to_string());
        put(&mut m, "end_time", self.end_time.to_string());
        put(&mut m, "duration_seconds", self.duration_seconds.to_string());
        put(&mut m, "stops_served", self.stops_served.to_string());
        put(&mut m, "total_positions", self.total_positions.to_string());
        put_opt(&mut m, "route_short_name", self.route_short_name.as_deref());
        put_opt(&mut m, "route_long_name", self.route_long_name.as_deref());
        put_num(&mut m, "scheduled_start_time", self.scheduled_start_time);
        put_num(&mut m, "scheduled_end_time", self.scheduled_end_time);
        put(&mut m, "completion_method", self.completion_method.as_str());
        put(&mut m, "completed_at", self.completed_at.to_rfc3339());
        m
    }
}

/// Compact live-update record broadcast on the `vehicle:updates` channel.
#[derive(Debug, Clone, Serialize)]
pub struct VehicleUpdate {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub bearing: Option<f64>,
    pub speed: Option<f64>,
    pub timestamp: i64,
    pub service_date: Option<String>,
    pub status: String,
}

// Field-map helpers. Writers emit empty strings for absent values; readers
// treat empty strings as absent.

fn put(m: &mut Vec<(String, String)>, key: &str, value: impl Into<String>) {
    m.push((key.to_string(), value.into()));
}

fn put_opt(m: &mut Vec<(String, String)>, key: &str, value: Option<&str>) {
    m.push((key.to_string(), value.unwrap_or_default().to_string()));
}

fn put_num<T: ToString>(m: &mut Vec<(String, String)>, key: &str, value: Option<T>) {
    m.push((
        key.to_string(),
        value.map(|v| v.to_string()).unwrap_or_default(),
    ));
}

fn get_str(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key).map(|v| v.to_string())
}

pub(crate) fn opt_str(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub(crate) fn opt_num<T: FromStr>(map: &HashMap<String, String>, key: &str) -> Option<T> {
    map.get(key).and_then(|v| v.parse().ok())
}
