mod cache;
pub mod geometry;
mod source;
mod types;

pub use cache::ScheduleCache;
pub use source::{GtfsDirSource, ScheduleSource};
pub use types::{
    Enrichment, Route, ScheduleTables, ShapeMatch, ShapePoint, Stop, StopTime, Trip,
};
