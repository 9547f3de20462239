//! In-memory [`StateStore`] used by the test suites. Batches apply under a
//! single lock, so commit atomicity matches the real backend's MULTI/EXEC.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::{StateStore, StoreStats, WriteBatch, WriteOp};
use super::{completion_key, status_key, track_key, vehicle_key};

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    active: BTreeSet<String>,
    streams: HashMap<String, Vec<HashMap<String, String>>>,
    strings: HashMap<String, (String, Option<u64>)>,
    published: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far, as (channel, payload) pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    /// Recorded TTL of a string key, if the key exists and one was set.
    pub fn string_ttl(&self, key: &str) -> Option<u64> {
        self.lock().strings.get(key).and_then(|(_, ttl)| *ttl)
    }

    pub fn stream_len(&self, key: &str) -> usize {
        self.lock().streams.get(key).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_vehicle_state(
        &self,
        vehicle_id: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        self.get_hash(&vehicle_key(vehicle_id)).await
    }

    async fn get_active_vehicles(&self) -> Result<Vec<String>> {
        Ok(self.lock().active.iter().cloned().collect())
    }

    async fn get_trip_track(
        &self,
        trip_id: &str,
        service_date: &str,
        count: Option<usize>,
    ) -> Result<Vec<HashMap<String, String>>> {
        let inner = self.lock();
        let entries = inner
            .streams
            .get(&track_key(trip_id, service_date))
            .cloned()
            .unwrap_or_default();
        Ok(match count {
            Some(n) => entries.into_iter().take(n).collect(),
            None => entries,
        })
    }

    async fn get_trip_status(&self, trip_id: &str, service_date: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .strings
            .get(&status_key(trip_id, service_date))
            .map(|(value, _)| value.clone()))
    }

    async fn get_trip_completion(
        &self,
        trip_id: &str,
        service_date: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        self.get_hash(&completion_key(trip_id, service_date)).await
    }

    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(self.lock().hashes.get(key).cloned())
    }

    async fn put_hash(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.lock();
        for op in batch.ops {
            match op {
                WriteOp::PutHash { key, fields } => {
                    inner.hashes.entry(key).or_default().extend(fields);
                }
                WriteOp::SetHashField { key, field, value } => {
                    inner.hashes.entry(key).or_default().insert(field, value);
                }
                WriteOp::AddActive { vehicle_id } => {
                    inner.active.insert(vehicle_id);
                }
                WriteOp::RemoveActive { vehicle_id } => {
                    inner.active.remove(&vehicle_id);
                }
                WriteOp::AppendStream {
                    key,
                    fields,
                    max_len,
                } => {
                    let stream = inner.streams.entry(key).or_default();
                    stream.push(fields.into_iter().collect());
                    if stream.len() > max_len {
                        let excess = stream.len() - max_len;
                        stream.drain(..excess);
                    }
                }
                WriteOp::SetString {
                    key,
                    value,
                    ttl_seconds,
                } => {
                    inner.strings.insert(key, (value, ttl_seconds));
                }
                WriteOp::DeleteKey { key } => {
                    inner.hashes.remove(&key);
                    inner.streams.remove(&key);
                    inner.strings.remove(&key);
                }
                WriteOp::Publish { channel, payload } => {
                    inner.published.push((channel, payload));
                }
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.lock();
        Ok(StoreStats {
            active_vehicles: inner.active.len(),
            total_vehicle_states: inner
                .hashes
                .keys()
                .filter(|k| k.starts_with("vehicle:") && !k.contains(":transition:"))
                .count(),
            total_trip_tracks: inner.streams.keys().filter(|k| k.ends_with(":track")).count(),
        })
    }
}
