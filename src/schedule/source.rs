//! Loading the static schedule tables from a GTFS feed directory.
//!
//! The relational side of schedule data is someone else's problem; the
//! cache only consumes the four tables this source produces.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gtfs_structures::{DirectionType, Gtfs, RouteType};
use std::collections::HashMap;
use tracing::info;

use super::geometry::haversine_m;
use super::types::{Route, ScheduleTables, ShapePoint, Stop, StopTime, Trip};
use crate::timeutil::seconds_to_gtfs_time;

/// Producer of a fully-built table set. Implementations own all the I/O;
/// a refresh builds a complete new value before the cache swaps it in.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn load(&self) -> Result<ScheduleTables>;
}

/// Reads a GTFS static feed from a local directory (or zip).
pub struct GtfsDirSource {
    path: String,
}

impl GtfsDirSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScheduleSource for GtfsDirSource {
    async fn load(&self) -> Result<ScheduleTables> {
        let path = self.path.clone();
        // The GTFS parse is CPU+disk bound, keep it off the runtime threads
        let tables = tokio::task::spawn_blocking(move || -> Result<ScheduleTables> {
            let gtfs = Gtfs::new(&path).with_context(|| format!("loading GTFS from {path}"))?;
            Ok(build_tables(gtfs))
        })
        .await??;

        info!(
            routes = tables.routes.len(),
            trips = tables.trips.len(),
            stops = tables.stops.len(),
            shapes = tables.shapes.len(),
            "Schedule tables built"
        );
        Ok(tables)
    }
}

fn build_tables(gtfs: Gtfs) -> ScheduleTables {
    let mut tables = ScheduleTables::default();

    for (route_id, route) in &gtfs.routes {
        tables.routes.insert(
            route_id.clone(),
            Route {
                route_id: route_id.clone(),
                short_name: route.short_name.clone(),
                long_name: route.long_name.clone(),
                route_type: Some(route_type_code(&route.route_type)),
                color: Some(format!(
                    "{:02X}{:02X}{:02X}",
                    route.color.r, route.color.g, route.color.b
                )),
            },
        );
    }

    for (stop_id, stop) in &gtfs.stops {
        tables.stops.insert(
            stop_id.clone(),
            Stop {
                stop_id: stop_id.clone(),
                code: stop.code.clone(),
                name: stop.name.clone(),
                lat: stop.latitude,
                lon: stop.longitude,
            },
        );
    }

    for (trip_id, trip) in &gtfs.trips {
        tables.trips.insert(
            trip_id.clone(),
            Trip {
                trip_id: trip_id.clone(),
                route_id: trip.route_id.clone(),
                service_id: trip.service_id.clone(),
                headsign: trip.trip_headsign.clone(),
                direction_id: trip.direction_id.map(|d| match d {
                    DirectionType::Outbound => 0,
                    DirectionType::Inbound => 1,
                }),
                shape_id: trip.shape_id.clone(),
            },
        );

        let mut stop_times: Vec<StopTime> = trip
            .stop_times
            .iter()
            .map(|st| StopTime {
                stop_id: st.stop.id.clone(),
                stop_sequence: st.stop_sequence as u32,
                arrival: st.arrival_time.map(seconds_to_gtfs_time),
                departure: st.departure_time.map(seconds_to_gtfs_time),
            })
            .collect();
        stop_times.sort_by_key(|st| st.stop_sequence);
        tables.stop_times.insert(trip_id.clone(), stop_times);
    }

    let mut shapes: HashMap<String, Vec<ShapePoint>> = HashMap::new();
    for (shape_id, points) in &gtfs.shapes {
        let mut out: Vec<ShapePoint> = points
            .iter()
            .map(|p| ShapePoint {
                lat: p.latitude,
                lon: p.longitude,
                sequence: p.sequence,
                dist_traveled: p.dist_traveled.map(|d| d as f64),
            })
            .collect();
        out.sort_by_key(|p| p.sequence);
        fill_cumulative_distances(&mut out);
        shapes.insert(shape_id.clone(), out);
    }
    tables.shapes = shapes;

    tables
}

/// Feeds that omit `shape_dist_traveled` still need distance-along-shape;
/// accumulate great-circle distances between consecutive points.
fn fill_cumulative_distances(points: &mut [ShapePoint]) {
    if points.iter().all(|p| p.dist_traveled.is_some()) {
        return;
    }

    let mut total = 0.0;
    for i in 0..points.len() {
        if i > 0 {
            let prev = (points[i - 1].lat, points[i - 1].lon);
            total += haversine_m(prev.0, prev.1, points[i].lat, points[i].lon);
        }
        points[i].dist_traveled = Some(total);
    }
}

fn route_type_code(rt: &RouteType) -> i32 {
    match *rt {
        RouteType::Tramway => 0,
        RouteType::Subway => 1,
        RouteType::Rail => 2,
        RouteType::Bus => 3,
        RouteType::Ferry => 4,
        RouteType::CableCar => 5,
        RouteType::Gondola => 6,
        RouteType::Funicular => 7,
        RouteType::Coach => 200,
        RouteType::Air => 1100,
        RouteType::Taxi => 1500,
        RouteType::Other(code) => code as i32,
    }
}
