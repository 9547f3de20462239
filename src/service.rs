//! Service wiring and the three background loops.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::completion::CompletionCalculator;
use crate::config::Settings;
use crate::detector::TransitionDetector;
use crate::fetch::{FeedClient, HttpClient};
use crate::normalizer::normalize_feed;
use crate::publisher::{CycleOutcome, Publisher};
use crate::schedule::{GtfsDirSource, ScheduleCache};
use crate::store::{StateStore, StoreStats};

const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Owns the pipeline components and drives them on a schedule.
///
/// Three loops run independently once started: ingestion and cleanup on
/// the poll interval, plus a five-minute check for the daily schedule
/// reload. Ingestion and cleanup share no locks; concurrent writes to the
/// same vehicle resolve last-write-wins per key.
pub struct IngestionService<C: HttpClient + 'static> {
    feed: FeedClient<C>,
    publisher: Arc<Publisher>,
    schedule: Arc<ScheduleCache>,
    store: Arc<dyn StateStore>,
    settings: Arc<Settings>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<C: HttpClient + 'static> IngestionService<C> {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn StateStore>, client: C) -> Self {
        let feed = FeedClient::new(client, settings.feed_url.clone());
        let schedule = Arc::new(ScheduleCache::new(
            Arc::new(GtfsDirSource::new(settings.gtfs_static_dir.clone())),
            settings.schedule_refresh_hour,
            settings.timezone,
        ));
        let completion = Arc::new(CompletionCalculator::new(
            store.clone(),
            schedule.clone(),
            settings.timezone,
        ));
        let detector = Arc::new(TransitionDetector::new(
            store.clone(),
            completion,
            settings.timezone,
            settings.trip_status_ttl_seconds,
        ));
        let publisher = Arc::new(Publisher::new(
            store.clone(),
            schedule.clone(),
            detector,
            settings.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            feed,
            publisher,
            schedule,
            store,
            settings,
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Loads the schedule and spawns the background loops. A failed initial
    /// schedule load is logged and retried by the refresh loop; ingestion
    /// runs without enrichment until it succeeds.
    pub async fn start(self: Arc<Self>) {
        info!("Starting ingestion service");

        if let Err(e) = self.schedule.refresh().await {
            error!(error = %e, "Initial schedule load failed, continuing without enrichment");
        }

        let poll_interval = Duration::from_secs(self.settings.poll_interval_seconds);
        let mut tasks = self.tasks.lock().await;

        let svc = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            info!(interval_seconds = svc.settings.poll_interval_seconds, "Ingestion loop started");
            loop {
                if let Err(e) = svc.run_cycle().await {
                    error!(error = %e, "Ingestion cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let svc = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            info!(
                interval_seconds = svc.settings.poll_interval_seconds,
                timeout_seconds = svc.settings.vehicle_inactivity_timeout_seconds,
                "Cleanup loop started"
            );
            loop {
                if let Err(e) = svc.publisher.cleanup_inactive_vehicles().await {
                    error!(error = %e, "Cleanup cycle failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let svc = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            info!(
                refresh_hour = svc.settings.schedule_refresh_hour,
                "Schedule refresh loop started"
            );
            loop {
                if svc.schedule.should_refresh() {
                    if let Err(e) = svc.schedule.refresh().await {
                        error!(error = %e, "Schedule refresh failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(REFRESH_CHECK_INTERVAL) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!("Ingestion service started");
    }

    /// Signals the loops to stop and waits for them to finish their
    /// current iteration.
    pub async fn stop(&self) {
        info!("Stopping ingestion service");
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed to join");
            }
        }
        info!("Ingestion service stopped");
    }

    /// Forces a schedule load outside the refresh loop, used by the
    /// one-shot CLI path.
    pub async fn refresh_schedule(&self) -> Result<()> {
        self.schedule.refresh().await
    }

    /// One full fetch -> normalize -> publish pass. Also the manual
    /// trigger used by the CLI.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let feed = self.feed.fetch_feed().await?;
        let positions = normalize_feed(&feed, Utc::now().timestamp(), self.settings.timezone);
        if positions.is_empty() {
            warn!("No positions in feed, skipping cycle");
            return Ok(CycleOutcome::default());
        }
        self.publisher.publish_positions(positions).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }
}
