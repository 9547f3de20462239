//! In-memory static schedule tables and point-in-route queries.

use std::collections::HashMap;

use super::geometry::{bearing_deg, haversine_m};

#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub route_type: Option<i32>,
    pub color: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub headsign: Option<String>,
    pub direction_id: Option<u8>,
    pub shape_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Stop {
    pub stop_id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// One scheduled stop of a trip. Times are GTFS `HH:MM:SS` strings and may
/// exceed 24 hours for trips running past midnight.
#[derive(Debug, Clone)]
pub struct StopTime {
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival: Option<String>,
    pub departure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ShapePoint {
    pub lat: f64,
    pub lon: f64,
    pub sequence: usize,
    /// Cumulative distance along the shape in meters.
    pub dist_traveled: Option<f64>,
}

/// Result of matching a position onto a trip's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeMatch {
    pub dist_traveled: Option<f64>,
    /// Great-circle distance from the position to the matched point.
    pub distance_to_shape: f64,
    pub matched_lat: f64,
    pub matched_lon: f64,
}

/// Typed enrichment fields resolved from the static tables for one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<u8>,
    pub stop_name: Option<String>,
    pub scheduled_arrival: Option<String>,
    pub scheduled_departure: Option<String>,
}

/// The four lookup tables, fully replaced on every refresh. All queries
/// are pure in-memory lookups; no I/O happens here.
#[derive(Debug, Default)]
pub struct ScheduleTables {
    pub routes: HashMap<String, Route>,
    pub trips: HashMap<String, Trip>,
    pub stops: HashMap<String, Stop>,
    /// Ordered by stop_sequence per trip.
    pub stop_times: HashMap<String, Vec<StopTime>>,
    /// Ordered by point sequence per shape.
    pub shapes: HashMap<String, Vec<ShapePoint>>,
}

impl ScheduleTables {
    pub fn route(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.get(trip_id)
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    /// Scheduled stops of a trip, ordered by stop_sequence.
    pub fn trip_stop_times(&self, trip_id: &str) -> Option<&[StopTime]> {
        self.stop_times.get(trip_id).map(Vec::as_slice)
    }

    fn shape_for_trip(&self, trip_id: &str) -> Option<&[ShapePoint]> {
        let shape_id = self.trips.get(trip_id)?.shape_id.as_deref()?;
        self.shapes.get(shape_id).map(Vec::as_slice)
    }

    /// Resolves the names and schedule fields for one sample. Each field
    /// falls back to absent when its table has no match.
    pub fn enrich(
        &self,
        trip_id: Option<&str>,
        stop_id: Option<&str>,
        stop_sequence: Option<u32>,
    ) -> Enrichment {
        let mut enrichment = Enrichment::default();

        if let Some(trip) = trip_id.and_then(|t| self.trips.get(t)) {
            enrichment.trip_headsign = trip.headsign.clone();
            enrichment.direction_id = trip.direction_id;

            if let Some(route) = self.routes.get(&trip.route_id) {
                enrichment.route_short_name = route.short_name.clone();
                enrichment.route_long_name = route.long_name.clone();
            }
        }

        if let Some(stop) = stop_id.and_then(|s| self.stops.get(s)) {
            enrichment.stop_name = stop.name.clone();
        }

        if let (Some(trip_id), Some(seq)) = (trip_id, stop_sequence) {
            if let Some(stop_times) = self.stop_times.get(trip_id) {
                if let Some(st) = stop_times.iter().find(|st| st.stop_sequence == seq) {
                    enrichment.scheduled_arrival = st.arrival.clone();
                    enrichment.scheduled_departure = st.departure.clone();
                }
            }
        }

        enrichment
    }

    /// Finds the shape point nearest to (lat, lon) for the trip's shape.
    /// Every point is scanned; ties go to the lowest sequence.
    pub fn match_to_shape(&self, trip_id: &str, lat: f64, lon: f64) -> Option<ShapeMatch> {
        let points = self.shape_for_trip(trip_id)?;
        let (index, distance) = nearest_point(points, lat, lon)?;
        let point = &points[index];

        Some(ShapeMatch {
            dist_traveled: point.dist_traveled,
            distance_to_shape: distance,
            matched_lat: point.lat,
            matched_lon: point.lon,
        })
    }

    /// Bearing between the nearest shape point and its successor, giving
    /// the direction of travel along the route rather than the bearing
    /// toward the vehicle. At the shape's last point the bearing from its
    /// predecessor is used, still pointing forward.
    pub fn two_point_bearing(&self, trip_id: &str, lat: f64, lon: f64) -> Option<u16> {
        let points = self.shape_for_trip(trip_id)?;
        if points.len() < 2 {
            return None;
        }

        let (index, _) = nearest_point(points, lat, lon)?;
        let (from, to) = if index < points.len() - 1 {
            (&points[index], &points[index + 1])
        } else {
            (&points[index - 1], &points[index])
        };

        Some(bearing_deg(from.lat, from.lon, to.lat, to.lon))
    }

    /// Scheduled departure of the first stop and arrival of the last stop
    /// (by stop_sequence), as GTFS time strings.
    pub fn scheduled_span(&self, trip_id: &str) -> (Option<String>, Option<String>) {
        let Some(stop_times) = self.stop_times.get(trip_id) else {
            return (None, None);
        };
        let first = stop_times
            .iter()
            .min_by_key(|st| st.stop_sequence)
            .and_then(|st| st.departure.clone());
        let last = stop_times
            .iter()
            .max_by_key(|st| st.stop_sequence)
            .and_then(|st| st.arrival.clone());
        (first, last)
    }
}

fn nearest_point(points: &[ShapePoint], lat: f64, lon: f64) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, p) in points.iter().enumerate() {
        let d = haversine_m(lat, lon, p.lat, p.lon);
        // Strict < keeps the first-encountered point on ties
        if best.map(|(_, min)| d < min).unwrap_or(true) {
            best = Some((i, d));
        }
    }
    best
}
