use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `Feed::fetch_status` value meaning the scheduler may select this row.
pub const FETCH_STATUS_ACTIVE: &str = "active";
/// `Feed::fetch_status` value meaning the scheduler must never select this row
/// again until an out-of-band resume action clears it.
pub const FETCH_STATUS_STOPPED: &str = "stopped";

/// The persistent unit of scheduling work. Only the fetch subsystem mutates
/// the fetch-state fields; title/site_url are mutated only on successful parse.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Feed {
    pub id: i64,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub title: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetch_status: String,
    pub consecutive_errors: i64,
    pub error_message: Option<String>,
    pub next_fetch_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feed {
    pub fn is_active(&self) -> bool {
        self.fetch_status == FETCH_STATUS_ACTIVE
    }
}

/// One article, converted from a parsed feed entry and sanitized, ready for
/// the upsert contract.
#[derive(Debug, Clone)]
pub struct ParsedItem {
    pub guid_or_id: String,
    pub title: String,
    pub link: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub is_date_estimated: bool,
}

/// A persisted article, as returned by the item store.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub guid_or_id: String,
    pub title: String,
    pub link: Option<String>,
    pub content: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub is_date_estimated: bool,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an `upsert_items` call: how many rows were freshly inserted
/// versus updated in place because their content hash changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Read-only view the fetcher consults to derive polling cadence. Owned by
/// the (external) API server; the fetch subsystem never writes these rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub feed_id: i64,
    pub user_id: i64,
    pub fetch_interval_minutes: i64,
}

/// One row per fetch attempt, for operational debugging. Best-effort: a
/// failure to write this log never fails the fetch itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub outcome: String,
    pub http_status: Option<i32>,
    pub message: Option<String>,
    pub fetched_at: DateTime<Utc>,
}
