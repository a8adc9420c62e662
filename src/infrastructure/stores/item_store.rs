use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::StoreError;
use crate::domain::models::{Item, ParsedItem, UpsertCounts};

#[derive(Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts items new to this feed and updates existing ones whose
    /// content hash has changed, keyed on `(feed_id, guid_or_id)`. Items
    /// whose hash is unchanged are left untouched — re-fetching an
    /// unmodified article must not bump its `updated_at`.
    pub async fn upsert_items(
        &self,
        feed_id: i64,
        items: &[(ParsedItem, String)],
        fetched_at: DateTime<Utc>,
    ) -> Result<UpsertCounts, StoreError> {
        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;

        for (item, content_hash) in items {
            let existing: Option<(i64, String)> = sqlx::query_as(
                "SELECT id, content_hash FROM items WHERE feed_id = ?1 AND guid_or_id = ?2",
            )
            .bind(feed_id)
            .bind(&item.guid_or_id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO items (
                            feed_id, guid_or_id, title, link, content, summary,
                            author, published_at, is_date_estimated, content_hash,
                            fetched_at, created_at, updated_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11)
                        "#,
                    )
                    .bind(feed_id)
                    .bind(&item.guid_or_id)
                    .bind(&item.title)
                    .bind(&item.link)
                    .bind(&item.content)
                    .bind(&item.summary)
                    .bind(&item.author)
                    .bind(item.published_at)
                    .bind(item.is_date_estimated)
                    .bind(content_hash)
                    .bind(fetched_at)
                    .execute(&mut *tx)
                    .await?;
                    counts.inserted += 1;
                }
                Some((id, existing_hash)) if &existing_hash != content_hash => {
                    sqlx::query(
                        r#"
                        UPDATE items
                        SET title = ?2, link = ?3, content = ?4, summary = ?5,
                            author = ?6, published_at = ?7, is_date_estimated = ?8,
                            content_hash = ?9, fetched_at = ?10, updated_at = ?10
                        WHERE id = ?1
                        "#,
                    )
                    .bind(id)
                    .bind(&item.title)
                    .bind(&item.link)
                    .bind(&item.content)
                    .bind(&item.summary)
                    .bind(&item.author)
                    .bind(item.published_at)
                    .bind(item.is_date_estimated)
                    .bind(content_hash)
                    .bind(fetched_at)
                    .execute(&mut *tx)
                    .await?;
                    counts.updated += 1;
                }
                Some((id, _)) => {
                    // Hash unchanged: advance only `fetched_at`, a no-op from
                    // the user's perspective but evidence the poll happened.
                    sqlx::query("UPDATE items SET fetched_at = ?2 WHERE id = ?1")
                        .bind(id)
                        .bind(fetched_at)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    pub async fn list_by_feed(&self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        let items = sqlx::query_as::<_, Item>(
            r#"
            SELECT id, feed_id, guid_or_id, title, link, content, summary, author,
                   published_at, is_date_estimated, content_hash, fetched_at,
                   created_at, updated_at
            FROM items WHERE feed_id = ?1 ORDER BY id ASC
            "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}
