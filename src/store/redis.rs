//! Redis-backed [`StateStore`].
//!
//! All reads use single commands; [`RedisStore::commit`] turns a
//! [`WriteBatch`] into one MULTI/EXEC pipeline so a poll cycle's writes for
//! a vehicle land together or not at all.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::debug;

use super::{ACTIVE_VEHICLES_KEY, StateStore, StoreStats, WriteBatch, WriteOp};
use super::{completion_key, status_key, track_key, vehicle_key};

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects and verifies the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to redis")?;
        let store = RedisStore { conn };
        store.ping().await?;
        debug!("Connected to redis");
        Ok(store)
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn ping(&self) -> Result<bool> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }

    async fn get_vehicle_state(
        &self,
        vehicle_id: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        self.get_hash(&vehicle_key(vehicle_id)).await
    }

    async fn get_active_vehicles(&self) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(ACTIVE_VEHICLES_KEY).await?;
        Ok(members)
    }

    async fn get_trip_track(
        &self,
        trip_id: &str,
        service_date: &str,
        count: Option<usize>,
    ) -> Result<Vec<HashMap<String, String>>> {
        let mut conn = self.connection();
        let key = track_key(trip_id, service_date);

        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&key).arg("-").arg("+");
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let entries: Vec<(String, HashMap<String, String>)> =
            cmd.query_async(&mut conn).await?;

        Ok(entries.into_iter().map(|(_, fields)| fields).collect())
    }

    async fn get_trip_status(&self, trip_id: &str, service_date: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let status: Option<String> = conn.get(status_key(trip_id, service_date)).await?;
        Ok(status)
    }

    async fn get_trip_completion(
        &self,
        trip_id: &str,
        service_date: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        self.get_hash(&completion_key(trip_id, service_date)).await
    }

    async fn get_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.connection();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn put_hash(&self, key: &str, fields: Vec<(String, String)>) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.hset_multiple(key, &fields).await?;
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &batch.ops {
            match op {
                WriteOp::PutHash { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                WriteOp::SetHashField { key, field, value } => {
                    pipe.hset(key, field, value).ignore();
                }
                WriteOp::AddActive { vehicle_id } => {
                    pipe.sadd(ACTIVE_VEHICLES_KEY, vehicle_id).ignore();
                }
                WriteOp::RemoveActive { vehicle_id } => {
                    pipe.srem(ACTIVE_VEHICLES_KEY, vehicle_id).ignore();
                }
                WriteOp::AppendStream {
                    key,
                    fields,
                    max_len,
                } => {
                    // Approximate MAXLEN trimming keeps the XADD cheap
                    let cmd = pipe
                        .cmd("XADD")
                        .arg(key)
                        .arg("MAXLEN")
                        .arg("~")
                        .arg(*max_len)
                        .arg("*");
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                WriteOp::SetString {
                    key,
                    value,
                    ttl_seconds,
                } => {
                    match ttl_seconds {
                        Some(ttl) => pipe.set_ex(key, value, *ttl).ignore(),
                        None => pipe.set(key, value).ignore(),
                    };
                }
                WriteOp::DeleteKey { key } => {
                    pipe.del(key).ignore();
                }
                WriteOp::Publish { channel, payload } => {
                    pipe.publish(channel, payload).ignore();
                }
            }
        }

        let mut conn = self.connection();
        pipe.query_async::<()>(&mut conn)
            .await
            .context("committing write batch")?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut conn = self.connection();

        let active_vehicles: usize = conn.scard(ACTIVE_VEHICLES_KEY).await?;
        let vehicle_keys: Vec<String> = conn.keys("vehicle:*").await?;
        let track_keys: Vec<String> = conn.keys("trip:*:track").await?;

        Ok(StoreStats {
            active_vehicles,
            total_vehicle_states: vehicle_keys
                .iter()
                .filter(|k| !k.contains(":transition:"))
                .count(),
            total_trip_tracks: track_keys.len(),
        })
    }
}
