//! State store abstraction over the key-value/stream backing store.
//!
//! Key layout (colon-delimited, bit-exact):
//!
//! | key | structure | purpose |
//! |---|---|---|
//! | `vehicle:{id}` | hash | latest vehicle state |
//! | `active_vehicles` | set | index of non-deleted vehicles |
//! | `trip:{trip_id}:{service_date}:track` | stream | ordered position log |
//! | `trip:{trip_id}:{service_date}:status` | string + TTL | "active"/"completed" |
//! | `trip:{trip_id}:{service_date}:completion` | hash, no expiry | completion summary |
//! | `vehicle:{id}:transition:{prev_trip_id}` | hash | pre-transition snapshot |
//! | channel `vehicle:updates` | pub/sub | best-effort live updates |

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use crate::models::{TripCompletion, TripPosition, VehicleState, VehicleUpdate};

pub const ACTIVE_VEHICLES_KEY: &str = "active_vehicles";
pub const UPDATES_CHANNEL: &str = "vehicle:updates";

pub fn vehicle_key(vehicle_id: &str) -> String {
    format!("vehicle:{vehicle_id}")
}

pub fn track_key(trip_id: &str, service_date: &str) -> String {
    format!("trip:{trip_id}:{service_date}:track")
}

pub fn status_key(trip_id: &str, service_date: &str) -> String {
    format!("trip:{trip_id}:{service_date}:status")
}

pub fn completion_key(trip_id: &str, service_date: &str) -> String {
    format!("trip:{trip_id}:{service_date}:completion")
}

pub fn snapshot_key(vehicle_id: &str, previous_trip_id: &str) -> String {
    format!("vehicle:{vehicle_id}:transition:{previous_trip_id}")
}

/// One operation of an atomic write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutHash {
        key: String,
        fields: Vec<(String, String)>,
    },
    SetHashField {
        key: String,
        field: String,
        value: String,
    },
    AddActive {
        vehicle_id: String,
    },
    RemoveActive {
        vehicle_id: String,
    },
    AppendStream {
        key: String,
        fields: Vec<(String, String)>,
        max_len: usize,
    },
    SetString {
        key: String,
        value: String,
        ttl_seconds: Option<u64>,
    },
    DeleteKey {
        key: String,
    },
    Publish {
        channel: String,
        payload: String,
    },
}

/// Ordered list of operations committed as one indivisible unit. Either
/// every operation lands or none do.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn put_vehicle_state(&mut self, state: &VehicleState) {
        self.ops.push(WriteOp::PutHash {
            key: vehicle_key(&state.vehicle_id),
            fields: state.to_field_map(),
        });
    }

    pub fn set_vehicle_status(&mut self, vehicle_id: &str, status: &str) {
        self.ops.push(WriteOp::SetHashField {
            key: vehicle_key(vehicle_id),
            field: "status".to_string(),
            value: status.to_string(),
        });
    }

    pub fn add_active(&mut self, vehicle_id: &str) {
        self.ops.push(WriteOp::AddActive {
            vehicle_id: vehicle_id.to_string(),
        });
    }

    pub fn remove_active(&mut self, vehicle_id: &str) {
        self.ops.push(WriteOp::RemoveActive {
            vehicle_id: vehicle_id.to_string(),
        });
    }

    pub fn append_track(
        &mut self,
        trip_id: &str,
        service_date: &str,
        position: &TripPosition,
        max_len: usize,
    ) {
        self.ops.push(WriteOp::AppendStream {
            key: track_key(trip_id, service_date),
            fields: position.to_stream_map(),
            max_len,
        });
    }

    pub fn set_trip_status(
        &mut self,
        trip_id: &str,
        service_date: &str,
        status: &str,
        ttl_seconds: Option<u64>,
    ) {
        self.ops.push(WriteOp::SetString {
            key: status_key(trip_id, service_date),
            value: status.to_string(),
            ttl_seconds,
        });
    }

    pub fn put_completion(&mut self, completion: &TripCompletion) {
        self.ops.push(WriteOp::PutHash {
            key: completion_key(&completion.trip_id, &completion.service_date),
            fields: completion.to_field_map(),
        });
    }

    pub fn delete_key(&mut self, key: &str) {
        self.ops.push(WriteOp::DeleteKey {
            key: key.to_string(),
        });
    }

    pub fn delete_vehicle_state(&mut self, vehicle_id: &str) {
        self.delete_key(&vehicle_key(vehicle_id));
    }

    /// Best-effort live update broadcast; subscribers may or may not see it.
    pub fn publish_update(&mut self, update: &VehicleUpdate) -> Result<()> {
        self.ops.push(WriteOp::Publish {
            channel: UPDATES_CHANNEL.to_string(),
            payload: serde_json::to_string(update)?,
        });
        Ok(())
    }
}

/// Aggregate counts exposed on the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub active_vehicles: usize,
    pub total_vehicle_states: usize,
    pub total_trip_tracks: usize,
}

/// Store seam: reads mirror the schema above, all mutations funnel
/// through [`StateStore::commit`], except the pre-transition snapshot
/// which the detector must persist before its batch exists.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn ping(&self) -> Result<bool>;

    async fn get_vehicle_state(&self, vehicle_id: &str)
    -> Result<Option<HashMap<String, String>>>;

    async fn get_active_vehicles(&self) -> Result<Vec<String>>;

    /// Track entries in insertion order; `count` limits from the front.
    async fn get_trip_track(
        &self,
        trip_id: &str,
        service_date: &str,
        count: Option<usize>,
    ) -> Result<Vec<HashMap<String, String>>>;

    async fn get_trip_status(&self, trip_id: &str, service_date: &str) -> Result<Option<String>>;

    async fn get_trip_completion(
        &self,
        trip_id: &str,
        service_date: &str,
    ) -> Result<Option<HashMap<String, String>>>;

    /// Raw hash read, used for transition snapshots.
    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Raw hash write outside any batch, used for transition snapshots.
    async fn put_hash(&self, key: &str, fields: Vec<(String, String)>) -> Result<()>;

    /// Executes the batch atomically; on error nothing has landed.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}
