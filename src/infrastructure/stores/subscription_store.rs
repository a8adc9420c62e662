use sqlx::SqlitePool;

use super::StoreError;

/// Used when a feed currently has no subscribers, or the lookup itself
/// fails. Per spec: "treat 0/error as 'use 60 minutes'".
pub const DEFAULT_FETCH_INTERVAL_MINUTES: i64 = 60;
pub const MIN_FETCH_INTERVAL_MINUTES: i64 = 30;
pub const MAX_FETCH_INTERVAL_MINUTES: i64 = 720;
pub const FETCH_INTERVAL_STEP_MINUTES: i64 = 30;

#[derive(Clone)]
pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The cadence the fetcher should use for this feed: the minimum
    /// requested interval across all current subscribers, quantized to the
    /// 30..=720-minute grid in steps of 30.
    pub async fn min_fetch_interval_minutes(&self, feed_id: i64) -> Result<i64, StoreError> {
        let min: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(fetch_interval_minutes) FROM subscriptions WHERE feed_id = ?1",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(quantize(min.unwrap_or(DEFAULT_FETCH_INTERVAL_MINUTES)))
    }

    pub async fn subscribe(&self, feed_id: i64, user_id: i64, interval_minutes: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (feed_id, user_id, fetch_interval_minutes)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(feed_id, user_id) DO UPDATE SET fetch_interval_minutes = excluded.fetch_interval_minutes
            "#,
        )
        .bind(feed_id)
        .bind(user_id)
        .bind(quantize(interval_minutes))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn quantize(minutes: i64) -> i64 {
    let clamped = minutes.clamp(MIN_FETCH_INTERVAL_MINUTES, MAX_FETCH_INTERVAL_MINUTES);
    let steps = (clamped as f64 / FETCH_INTERVAL_STEP_MINUTES as f64).round() as i64;
    (steps * FETCH_INTERVAL_STEP_MINUTES).clamp(MIN_FETCH_INTERVAL_MINUTES, MAX_FETCH_INTERVAL_MINUTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::setup_database;
    use crate::infrastructure::stores::SqliteFeedStore;
    use chrono::Utc;

    #[test]
    fn quantize_clamps_to_grid() {
        assert_eq!(quantize(10), MIN_FETCH_INTERVAL_MINUTES);
        assert_eq!(quantize(45), 30);
        assert_eq!(quantize(46), 60);
        assert_eq!(quantize(1000), MAX_FETCH_INTERVAL_MINUTES);
        assert_eq!(quantize(360), 360);
    }

    async fn test_stores() -> (SqliteFeedStore, SqliteSubscriptionStore, i64) {
        let pool = setup_database("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let feeds = SqliteFeedStore::new(pool.clone());
        let feed_id = feeds
            .insert("https://example.com/feed.xml", "Example", Utc::now())
            .await
            .unwrap();
        (feeds, SqliteSubscriptionStore::new(pool), feed_id)
    }

    #[tokio::test]
    async fn no_subscribers_falls_back_to_slowest_cadence() {
        let (_feeds, subs, feed_id) = test_stores().await;
        assert_eq!(
            subs.min_fetch_interval_minutes(feed_id).await.unwrap(),
            DEFAULT_FETCH_INTERVAL_MINUTES
        );
    }

    #[tokio::test]
    async fn cadence_is_minimum_across_subscribers() {
        let (_feeds, subs, feed_id) = test_stores().await;
        subs.subscribe(feed_id, 1, 360).await.unwrap();
        subs.subscribe(feed_id, 2, 60).await.unwrap();
        subs.subscribe(feed_id, 3, 720).await.unwrap();

        assert_eq!(subs.min_fetch_interval_minutes(feed_id).await.unwrap(), 60);
    }
}
