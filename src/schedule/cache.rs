//! Daily-refreshed holder of the static schedule tables.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

use super::source::ScheduleSource;
use super::types::ScheduleTables;

/// Shared, atomically-replaceable view of the schedule tables.
///
/// Readers grab an `Arc` to the current table set and keep using it even
/// while a refresh builds the replacement; nobody ever observes a
/// half-replaced set.
pub struct ScheduleCache {
    source: Arc<dyn ScheduleSource>,
    tables: RwLock<Option<Arc<ScheduleTables>>>,
    last_loaded: Mutex<Option<NaiveDate>>,
    refresh_hour: u32,
    tz: Tz,
}

impl ScheduleCache {
    pub fn new(source: Arc<dyn ScheduleSource>, refresh_hour: u32, tz: Tz) -> Self {
        Self {
            source,
            tables: RwLock::new(None),
            last_loaded: Mutex::new(None),
            refresh_hour,
            tz,
        }
    }

    /// Current table set, if one has been loaded.
    pub fn current(&self) -> Option<Arc<ScheduleTables>> {
        self.tables.read().expect("schedule tables lock poisoned").clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// True when a load has never succeeded, or local time has passed the
    /// refresh hour and the last successful load was on a prior day.
    pub fn should_refresh(&self) -> bool {
        self.should_refresh_at(Utc::now())
    }

    pub(crate) fn should_refresh_at(&self, now: DateTime<Utc>) -> bool {
        let Some(loaded_on) = *self.last_loaded.lock().expect("last_loaded lock poisoned") else {
            return true;
        };
        if !self.is_loaded() {
            return true;
        }

        let local = now.with_timezone(&self.tz);
        local.hour() >= self.refresh_hour && loaded_on < local.date_naive()
    }

    /// Builds a new table set from the source and swaps it in. On failure
    /// the previous tables stay in place and keep serving reads.
    pub async fn refresh(&self) -> Result<()> {
        let tables = self.source.load().await?;
        self.install(tables);
        info!("Schedule cache refreshed");
        Ok(())
    }

    /// Atomically replaces the table set and records the load day.
    pub fn install(&self, tables: ScheduleTables) {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        *self.tables.write().expect("schedule tables lock poisoned") = Some(Arc::new(tables));
        *self.last_loaded.lock().expect("last_loaded lock poisoned") = Some(today);
    }
}
