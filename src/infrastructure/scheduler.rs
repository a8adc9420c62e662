use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::infrastructure::fetcher::Fetcher;
use crate::infrastructure::stores::SqliteFeedStore;
use crate::metrics::Metrics;

/// How many due feeds one tick pulls off the queue at most. Generous relative
/// to `max_concurrency` so a slow batch of feeds doesn't starve the next
/// tick's worth of work once the semaphore frees up.
const CLAIM_BATCH_SIZE: i64 = 200;

pub struct Scheduler {
    fetcher: Fetcher,
    feed_store: SqliteFeedStore,
    metrics: Arc<Metrics>,
    max_concurrency: usize,
    cycle_interval_minutes: u32,
    running: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        fetcher: Fetcher,
        feed_store: SqliteFeedStore,
        metrics: Arc<Metrics>,
        max_concurrency: usize,
        cycle_interval_minutes: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            feed_store,
            metrics,
            max_concurrency,
            cycle_interval_minutes,
            running: Mutex::new(()),
        })
    }

    /// Runs one cycle immediately, then starts the cron tick and blocks until
    /// `shutdown` fires, then tears the scheduler down cleanly. The tick
    /// cadence is `cycle_interval_minutes`; the bound on in-flight feed
    /// fetches per tick is `max_concurrency`, enforced by a semaphore rather
    /// than by the tick cadence itself.
    pub async fn run_until_shutdown(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), JobSchedulerError> {
        self.run_cycle().await;

        let mut sched = JobScheduler::new().await?;

        let cron = format!("0 */{} * * * *", self.cycle_interval_minutes.clamp(1, 59));
        let this = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                this.run_cycle().await;
            })
        })?;
        sched.add(job).await?;
        sched.start().await?;

        let _ = shutdown.changed().await;
        sched.shutdown().await?;
        Ok(())
    }

    /// One cron tick: claim due feeds, fan them out bounded by
    /// `max_concurrency`, wait for all of them. If the previous tick's cycle
    /// is still draining, this tick is skipped entirely rather than queued.
    async fn run_cycle(&self) {
        let guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!("previous fetch cycle still running; skipping this tick");
                return;
            }
        };

        let now = Utc::now();
        let due = match self.feed_store.list_due_for_fetch(now, CLAIM_BATCH_SIZE).await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::error!(error = %e, "failed to list due feeds");
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        tracing::debug!(count = due.len(), "claimed feeds due for fetch");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for feed in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed while this cycle runs");
            let fetcher = self.fetcher.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let feed_id = feed.id;
                match fetcher.fetch_one(&feed, now).await {
                    Ok(report) => metrics.record(&report),
                    Err(e) => tracing::error!(feed_id, error = %e, "failed to persist fetch outcome"),
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        drop(guard);
    }
}
