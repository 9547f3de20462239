//! Application settings loaded from environment variables.
//!
//! A `Settings` value is built once at startup and passed (behind an `Arc`)
//! into every component's constructor. There is no global settings object.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Settings {
    /// GTFS-RT vehicle positions endpoint.
    pub feed_url: String,
    pub poll_interval_seconds: u64,

    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub redis_db: u8,
    /// Max simultaneously in-flight store operations per pipeline phase.
    pub max_concurrent_store_operations: usize,

    /// Seconds without a report before a vehicle is considered inactive.
    pub vehicle_inactivity_timeout_seconds: i64,

    /// Directory holding the static GTFS feed (routes.txt, trips.txt, ...).
    pub gtfs_static_dir: String,
    /// Local hour of day (0-23) after which the schedule cache reloads.
    pub schedule_refresh_hour: u32,

    /// Fleet-local timezone used for service dates and schedule anchoring.
    pub timezone: Tz,

    /// Cap on entries kept per trip track stream.
    pub track_max_len: usize,
    /// TTL applied to trip status keys.
    pub trip_status_ttl_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            feed_url:
                "https://gateway.carris.pt/gateway/gtfs/api/v2.11/GTFS/realtime/vehiclepositions"
                    .to_string(),
            poll_interval_seconds: 30,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: String::new(),
            redis_db: 0,
            max_concurrent_store_operations: 100,
            vehicle_inactivity_timeout_seconds: 180,
            gtfs_static_dir: "gtfs".to_string(),
            schedule_refresh_hour: 4,
            timezone: chrono_tz::Europe::Lisbon,
            track_max_len: 1000,
            trip_status_ttl_seconds: 86_400,
        }
    }
}

impl Settings {
    /// Builds settings from the process environment, falling back to
    /// defaults for anything unset. `.env` loading happens in `main`.
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let timezone = match std::env::var("FLEET_TIMEZONE") {
            Ok(name) => Tz::from_str(&name)
                .map_err(|e| anyhow::anyhow!("invalid FLEET_TIMEZONE {name:?}: {e}"))?,
            Err(_) => defaults.timezone,
        };

        Ok(Settings {
            feed_url: env_or("FEED_URL", defaults.feed_url),
            poll_interval_seconds: env_parse("POLL_INTERVAL_SECONDS", defaults.poll_interval_seconds)?,
            redis_host: env_or("REDIS_HOST", defaults.redis_host),
            redis_port: env_parse("REDIS_PORT", defaults.redis_port)?,
            redis_password: env_or("REDIS_PASSWORD", defaults.redis_password),
            redis_db: env_parse("REDIS_DB", defaults.redis_db)?,
            max_concurrent_store_operations: env_parse(
                "MAX_CONCURRENT_STORE_OPERATIONS",
                defaults.max_concurrent_store_operations,
            )?,
            vehicle_inactivity_timeout_seconds: env_parse(
                "VEHICLE_INACTIVITY_TIMEOUT_SECONDS",
                defaults.vehicle_inactivity_timeout_seconds,
            )?,
            gtfs_static_dir: env_or("GTFS_STATIC_DIR", defaults.gtfs_static_dir),
            schedule_refresh_hour: env_parse("SCHEDULE_REFRESH_HOUR", defaults.schedule_refresh_hour)?,
            timezone,
            track_max_len: env_parse("TRACK_MAX_LEN", defaults.track_max_len)?,
            trip_status_ttl_seconds: env_parse(
                "TRIP_STATUS_TTL_SECONDS",
                defaults.trip_status_ttl_seconds,
            )?,
        })
    }

    /// Redis connection URL with the password percent-encoded.
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(&self.redis_password),
                self.redis_host,
                self.redis_port,
                self.redis_db
            )
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_without_password() {
        let settings = Settings::default();
        assert_eq!(settings.redis_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_encodes_password() {
        let settings = Settings {
            redis_password: "p@ss/word".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.redis_url(), "redis://:p%40ss%2Fword@localhost:6379/0");
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval_seconds, 30);
        assert_eq!(settings.vehicle_inactivity_timeout_seconds, 180);
        assert_eq!(settings.schedule_refresh_hour, 4);
        assert_eq!(settings.timezone, chrono_tz::Europe::Lisbon);
    }
}
