use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::StoreError;
use crate::domain::models::Feed;

const FEED_COLUMNS: &str = "id, feed_url, site_url, title, etag, last_modified, \
     fetch_status, consecutive_errors, error_message, next_fetch_at, created_at, updated_at";

/// A row is considered abandoned, and reclaimable, once its claim has stood
/// unreleased for this long. Guards against a crashed fetch task leaving a
/// feed permanently unselectable.
const CLAIM_STALE_AFTER_MINUTES: i64 = 30;

#[derive(Clone)]
pub struct SqliteFeedStore {
    pool: SqlitePool,
}

impl SqliteFeedStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Exposes the underlying pool for callers (the fetcher's best-effort
    /// fetch-log write) that need a raw connection without a dedicated store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomically claims up to `limit` active feeds whose `next_fetch_at`
    /// has passed, stamping `claimed_at` in the same statement so a second
    /// scheduler tick racing this one cannot select the same row. SQLite has
    /// no `SELECT ... FOR UPDATE SKIP LOCKED`; a single atomic
    /// `UPDATE ... RETURNING` is the equivalent under WAL's single-writer
    /// semantics.
    pub async fn list_due_for_fetch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Feed>, StoreError> {
        let stale_before = now - chrono::Duration::minutes(CLAIM_STALE_AFTER_MINUTES);

        let query = format!(
            r#"
            UPDATE feeds
            SET claimed_at = ?1
            WHERE id IN (
                SELECT id FROM feeds
                WHERE fetch_status = 'active'
                  AND next_fetch_at <= ?1
                  AND (claimed_at IS NULL OR claimed_at <= ?2)
                ORDER BY next_fetch_at ASC
                LIMIT ?3
            )
            RETURNING {FEED_COLUMNS}
            "#
        );

        let rows = sqlx::query_as::<_, Feed>(&query)
            .bind(now)
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    /// Persists the feed row produced by `retry_policy::apply` and clears the
    /// claim stamp, making the row selectable again once `next_fetch_at`
    /// arrives.
    pub async fn update_fetch_state(&self, feed: &Feed) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET title = ?2, site_url = ?3, etag = ?4, last_modified = ?5,
                fetch_status = ?6, consecutive_errors = ?7, error_message = ?8,
                next_fetch_at = ?9, updated_at = ?10, claimed_at = NULL
            WHERE id = ?1
            "#,
        )
        .bind(feed.id)
        .bind(&feed.title)
        .bind(&feed.site_url)
        .bind(&feed.etag)
        .bind(&feed.last_modified)
        .bind(&feed.fetch_status)
        .bind(feed.consecutive_errors)
        .bind(&feed.error_message)
        .bind(feed.next_fetch_at)
        .bind(feed.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Feed>, StoreError> {
        let query = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1");
        let feed = sqlx::query_as::<_, Feed>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Inserts a new feed in the `active` state, due immediately. Used by
    /// tests and by whatever external process onboards a new subscription;
    /// the fetch subsystem itself never creates feeds.
    pub async fn insert(&self, feed_url: &str, title: &str, now: DateTime<Utc>) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO feeds (feed_url, title, fetch_status, consecutive_errors, next_fetch_at, created_at, updated_at)
            VALUES (?1, ?2, 'active', 0, ?3, ?3, ?3)
            RETURNING id
            "#,
        )
        .bind(feed_url)
        .bind(title)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::setup_database;
    use chrono::Duration;

    async fn test_store() -> SqliteFeedStore {
        let pool = setup_database("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteFeedStore::new(pool)
    }

    #[tokio::test]
    async fn due_feed_is_claimed_and_excluded_from_next_call() {
        let store = test_store().await;
        let now = Utc::now();
        store.insert("https://example.com/a.xml", "A", now - Duration::minutes(1)).await.unwrap();

        let due = store.list_due_for_fetch(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        let due_again = store.list_due_for_fetch(now, 10).await.unwrap();
        assert!(due_again.is_empty(), "claimed row must not be selected twice");
    }

    #[tokio::test]
    async fn future_feed_is_not_due() {
        let store = test_store().await;
        let now = Utc::now();
        store.insert("https://example.com/b.xml", "B", now + Duration::hours(1)).await.unwrap();

        let due = store.list_due_for_fetch(now, 10).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn update_fetch_state_releases_claim() {
        let store = test_store().await;
        let now = Utc::now();
        store.insert("https://example.com/c.xml", "C", now - Duration::minutes(1)).await.unwrap();

        let due = store.list_due_for_fetch(now, 10).await.unwrap();
        let mut feed = due.into_iter().next().unwrap();
        feed.next_fetch_at = now + Duration::minutes(30);
        store.update_fetch_state(&feed).await.unwrap();

        let due_again = store.list_due_for_fetch(now, 10).await.unwrap();
        assert!(due_again.is_empty(), "feed scheduled in the future must not be due");
    }

    #[tokio::test]
    async fn stale_claim_is_reclaimed() {
        let store = test_store().await;
        let now = Utc::now();
        store.insert("https://example.com/d.xml", "D", now - Duration::minutes(1)).await.unwrap();
        let _ = store.list_due_for_fetch(now, 10).await.unwrap();

        let much_later = now + Duration::minutes(CLAIM_STALE_AFTER_MINUTES + 5);
        let due = store.list_due_for_fetch(much_later, 10).await.unwrap();
        assert_eq!(due.len(), 1, "abandoned claim must be reclaimable");
    }
}
