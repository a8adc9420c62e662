use std::sync::Arc;

use tokio::sync::watch;

use feedfetchd::config::Config;
use feedfetchd::infrastructure::database::setup_database;
use feedfetchd::infrastructure::fetcher::Fetcher;
use feedfetchd::infrastructure::scheduler::Scheduler;
use feedfetchd::infrastructure::ssrf::new_safe_client;
use feedfetchd::infrastructure::stores::{SqliteFeedStore, SqliteItemStore, SqliteSubscriptionStore};
use feedfetchd::metrics::{self, Metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedfetchd=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    tracing::info!(database_url = %config.database_url, "connecting to database");
    let db_pool = setup_database(&config.database_url).await?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations").run(&db_pool).await?;

    let feed_store = SqliteFeedStore::new(db_pool.clone());
    let item_store = SqliteItemStore::new(db_pool.clone());
    let subscription_store = SqliteSubscriptionStore::new(db_pool);

    let client = new_safe_client(config.fetch_timeout)?;
    let fetcher = Fetcher::new(
        client,
        feed_store.clone(),
        item_store,
        subscription_store,
        config.fetch_max_body_bytes,
    );

    let metrics = Arc::new(Metrics::new());
    metrics::serve(metrics.clone(), config.metrics_addr);

    let scheduler = Scheduler::new(
        fetcher,
        feed_store,
        metrics,
        config.max_concurrent_fetches,
        config.cycle_interval_minutes,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler
        .run_until_shutdown(shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("scheduler failed: {e}"))?;

    Ok(())
}
