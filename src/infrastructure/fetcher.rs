use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::models::{Feed, ParsedItem};
use crate::domain::retry_policy::{self, FetchOutcome};
use crate::infrastructure::sanitize;
use crate::infrastructure::ssrf::{self, SsrfError};
use crate::infrastructure::stores::{SqliteFeedStore, SqliteItemStore, SqliteSubscriptionStore, StoreError};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("SSRF guard rejected URL: {0}")]
    Ssrf(#[from] SsrfError),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("response exceeds {0} byte cap")]
    ResponseTooLarge(u64),

    #[error("feed did not parse: {0}")]
    Parse(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one feed's fetch cycle, returned for logging and metrics. The
/// feed row and any new/changed items have already been persisted by the
/// time this is returned.
#[derive(Debug)]
pub struct FetchCycleReport {
    pub feed_id: i64,
    pub outcome: &'static str,
    pub http_status: Option<u16>,
    pub inserted: usize,
    pub updated: usize,
    pub duration_ms: u128,
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    feed_store: SqliteFeedStore,
    item_store: SqliteItemStore,
    subscription_store: SqliteSubscriptionStore,
    max_body_bytes: u64,
    enforce_ssrf_guard: bool,
}

impl Fetcher {
    pub fn new(
        client: Client,
        feed_store: SqliteFeedStore,
        item_store: SqliteItemStore,
        subscription_store: SqliteSubscriptionStore,
        max_body_bytes: u64,
    ) -> Self {
        Self {
            client,
            feed_store,
            item_store,
            subscription_store,
            max_body_bytes,
            enforce_ssrf_guard: true,
        }
    }

    /// Builds a `Fetcher` that skips the private-IP check on `feed_url`
    /// itself (the connecting `client` is still whatever was passed in).
    /// Exists so integration tests can point feeds at a local mock server;
    /// never used from `main`.
    #[doc(hidden)]
    pub fn new_with_ssrf_guard_disabled(
        client: Client,
        feed_store: SqliteFeedStore,
        item_store: SqliteItemStore,
        subscription_store: SqliteSubscriptionStore,
        max_body_bytes: u64,
    ) -> Self {
        Self {
            client,
            feed_store,
            item_store,
            subscription_store,
            max_body_bytes,
            enforce_ssrf_guard: false,
        }
    }

    /// Runs the full cycle for one feed: SSRF-validate, conditional GET,
    /// classify the response, parse and upsert items on success, compute the
    /// next retry-policy state, and persist it. Never panics and never
    /// returns an `Err` for a feed-side failure — those are folded into the
    /// report via `outcome`; `Err` is reserved for failures persisting the
    /// outcome itself.
    pub async fn fetch_one(&self, feed: &Feed, now: DateTime<Utc>) -> Result<FetchCycleReport, FetchError> {
        let started = Instant::now();

        let (outcome, http_status, inserted, updated, metadata) = self.attempt(feed, now).await;

        // Display metadata (title, site_url) is refreshed only on a
        // successful parse, independently of the retry-policy transition, so
        // build the snapshot `apply` transitions from off a copy carrying it.
        let mut snapshot = feed.clone();
        if let Some((title, site_url)) = metadata {
            snapshot.title = title;
            if site_url.is_some() {
                snapshot.site_url = site_url;
            }
        }

        let next = retry_policy::apply(&snapshot, outcome.clone(), now);
        self.feed_store.update_fetch_state(&next).await?;
        self.write_fetch_log(feed.id, &outcome, http_status, now).await;

        let report = FetchCycleReport {
            feed_id: feed.id,
            outcome: outcome.label(),
            http_status,
            inserted,
            updated,
            duration_ms: started.elapsed().as_millis(),
        };

        tracing::info!(
            feed_id = report.feed_id,
            outcome = report.outcome,
            status = ?report.http_status,
            inserted = report.inserted,
            updated = report.updated,
            duration_ms = report.duration_ms,
            "fetch cycle complete"
        );

        Ok(report)
    }

    /// The part of the cycle that can fail in feed-specific ways: URL
    /// validation, the HTTP round trip, parsing, and the item upsert. Always
    /// resolves to one of the five `FetchOutcome` variants rather than
    /// propagating an error, since a feed that 404s is not a fetcher bug. The
    /// last element is `Some((title, site_url))` when a parse succeeded and
    /// the parsed channel carried a non-empty title, per spec step 7.
    #[allow(clippy::type_complexity)]
    async fn attempt(
        &self,
        feed: &Feed,
        now: DateTime<Utc>,
    ) -> (FetchOutcome, Option<u16>, usize, usize, Option<(String, Option<String>)>) {
        let url = if self.enforce_ssrf_guard {
            match ssrf::validate_url(&feed.feed_url).await {
                Ok(url) => url,
                Err(e) => {
                    return (
                        FetchOutcome::Stop {
                            reason: format!("SSRF guard: {e}"),
                        },
                        None,
                        0,
                        0,
                        None,
                    );
                }
            }
        } else {
            match reqwest::Url::parse(&feed.feed_url) {
                Ok(url) => url,
                Err(e) => {
                    return (
                        FetchOutcome::Stop {
                            reason: format!("invalid URL: {e}"),
                        },
                        None,
                        0,
                        0,
                        None,
                    );
                }
            }
        };

        let mut request = self.client.get(url).header(
            header::ACCEPT,
            "application/rss+xml, application/atom+xml, application/xml, text/xml, */*",
        );
        if let Some(etag) = &feed.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &feed.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                return (
                    FetchOutcome::Backoff {
                        reason: format!("network error: {e}"),
                    },
                    None,
                    0,
                    0,
                    None,
                );
            }
        };

        let status = response.status();
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match retry_policy::classify_status(status) {
            retry_policy::StatusClass::NotModified => {
                let interval = self.interval_minutes(feed.id).await;
                (
                    FetchOutcome::NotModified {
                        interval_minutes: interval,
                    },
                    Some(status.as_u16()),
                    0,
                    0,
                    None,
                )
            }
            retry_policy::StatusClass::Stop => (
                FetchOutcome::Stop {
                    reason: format!("HTTP {status}"),
                },
                Some(status.as_u16()),
                0,
                0,
                None,
            ),
            retry_policy::StatusClass::Backoff | retry_policy::StatusClass::Unknown => (
                FetchOutcome::Backoff {
                    reason: format!("HTTP {status}"),
                },
                Some(status.as_u16()),
                0,
                0,
                None,
            ),
            retry_policy::StatusClass::Ok => {
                self.handle_ok_response(feed, response, status, etag, last_modified, now)
                    .await
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn handle_ok_response(
        &self,
        feed: &Feed,
        response: reqwest::Response,
        status: StatusCode,
        etag: Option<String>,
        last_modified: Option<String>,
        now: DateTime<Utc>,
    ) -> (FetchOutcome, Option<u16>, usize, usize, Option<(String, Option<String>)>) {
        let body = match read_capped_bytes(response, self.max_body_bytes).await {
            Ok(body) => body,
            Err(FetchError::ResponseTooLarge(cap)) => {
                return (
                    FetchOutcome::ParseFailure {
                        reason: format!("response exceeds {cap} byte cap"),
                    },
                    Some(status.as_u16()),
                    0,
                    0,
                    None,
                );
            }
            Err(e) => {
                return (
                    FetchOutcome::Backoff {
                        reason: format!("error reading response body: {e}"),
                    },
                    Some(status.as_u16()),
                    0,
                    0,
                    None,
                );
            }
        };

        let parsed = match feed_rs::parser::parse(body.as_slice()) {
            Ok(parsed) => parsed,
            Err(e) => {
                return (
                    FetchOutcome::ParseFailure {
                        reason: format!("feed did not parse: {e}"),
                    },
                    Some(status.as_u16()),
                    0,
                    0,
                    None,
                );
            }
        };

        // Refresh display metadata from the parsed channel. Only a non-empty
        // title counts; an absent or blank one leaves `feed.title` as is.
        let metadata = {
            let title = parsed
                .title
                .as_ref()
                .map(|t| sanitize::strip_all_html(&t.content))
                .filter(|t| !t.is_empty());
            let site_url = parsed.links.first().map(|l| l.href.clone());
            title.map(|title| (title, site_url))
        };

        let items = convert_entries(&parsed, now);
        let hashed: Vec<(ParsedItem, String)> = items
            .into_iter()
            .map(|item| {
                let hash = content_hash(&item);
                (item, hash)
            })
            .collect();

        let counts = match self.item_store.upsert_items(feed.id, &hashed, now).await {
            Ok(counts) => counts,
            Err(e) => {
                return (
                    FetchOutcome::ParseFailure {
                        reason: format!("item upsert failed: {e}"),
                    },
                    Some(status.as_u16()),
                    0,
                    0,
                    None,
                );
            }
        };

        let interval = self.interval_minutes(feed.id).await;
        (
            FetchOutcome::Success {
                interval_minutes: interval,
                etag,
                last_modified,
            },
            Some(status.as_u16()),
            counts.inserted,
            counts.updated,
            metadata,
        )
    }

    async fn interval_minutes(&self, feed_id: i64) -> i64 {
        self.subscription_store
            .min_fetch_interval_minutes(feed_id)
            .await
            .unwrap_or(crate::infrastructure::stores::subscription_store::DEFAULT_FETCH_INTERVAL_MINUTES)
    }

    async fn write_fetch_log(
        &self,
        feed_id: i64,
        outcome: &FetchOutcome,
        http_status: Option<u16>,
        now: DateTime<Utc>,
    ) {
        let message = match outcome {
            FetchOutcome::Success { .. } | FetchOutcome::NotModified { .. } => None,
            FetchOutcome::Stop { reason } | FetchOutcome::Backoff { reason } | FetchOutcome::ParseFailure { reason } => {
                Some(reason.as_str())
            }
        };

        if let Err(e) = sqlx::query(
            "INSERT INTO fetch_logs (feed_id, outcome, http_status, message, fetched_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(feed_id)
        .bind(outcome.label())
        .bind(http_status.map(i32::from))
        .bind(message)
        .bind(now)
        .execute(self.feed_store.pool())
        .await
        {
            tracing::warn!(feed_id, error = %e, "failed to write fetch log");
        }
    }
}

/// Reads the response body with a hard cap: rejects up front if
/// `Content-Length` already exceeds the cap, then stops accumulating as soon
/// as the running total would exceed it, rather than trusting a (possibly
/// absent or dishonest) `Content-Length` header alone.
async fn read_capped_bytes(response: reqwest::Response, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(FetchError::ResponseTooLarge(max_bytes));
        }
    }

    let mut buf = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(FetchError::ResponseTooLarge(max_bytes));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf)
}

/// Converts parsed feed entries into sanitized, hash-ready items. Dates
/// missing a `published` value fall back to `updated`, then to `now`, marking
/// the item's date as estimated in both fallback cases.
fn convert_entries(parsed: &feed_rs::model::Feed, now: DateTime<Utc>) -> Vec<ParsedItem> {
    parsed
        .entries
        .iter()
        .map(|entry| {
            let title = entry
                .title
                .as_ref()
                .map(|t| sanitize::strip_all_html(&t.content))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled".to_string());

            let mut link = entry.links.first().map(|l| l.href.clone());

            let mut content = entry
                .content
                .as_ref()
                .and_then(|c| c.body.as_ref())
                .map(|body| sanitize::clean_html(body));

            let summary = entry
                .summary
                .as_ref()
                .map(|s| sanitize::clean_html(&s.content));

            let author = entry
                .authors
                .first()
                .map(|p| sanitize::strip_all_html(&p.name));

            let (published_at, is_date_estimated) = match (entry.published, entry.updated) {
                (Some(published), _) => (Some(published), false),
                (None, Some(updated)) => (Some(updated), true),
                (None, None) => (Some(now), true),
            };

            // GUID if present; else link; else a stable hash of title + date.
            let guid_or_id = if !entry.id.is_empty() {
                entry.id.clone()
            } else if let Some(link) = &link {
                link.clone()
            } else {
                let mut hasher = Sha256::new();
                hasher.update(title.as_bytes());
                if let Some(published) = published_at {
                    hasher.update(published.to_rfc3339().as_bytes());
                }
                format!("{:x}", hasher.finalize())
            };

            // Content empty but summary present: summary stands in for content.
            if content.as_deref().map(str::is_empty).unwrap_or(true) {
                content = summary.clone().filter(|s| !s.is_empty()).or(content);
            }

            // Link empty but guid_or_id is itself an absolute URL: use it as link.
            if link.is_none() && (guid_or_id.starts_with("http://") || guid_or_id.starts_with("https://")) {
                link = Some(guid_or_id.clone());
            }

            ParsedItem {
                guid_or_id,
                title,
                link,
                content,
                summary,
                author,
                published_at,
                is_date_estimated,
            }
        })
        .collect()
}

/// Hashes the fields that represent an item's visible content, so a
/// republished entry with an unchanged body does not generate a spurious
/// update.
fn content_hash(item: &ParsedItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.title.as_bytes());
    hasher.update(item.link.as_deref().unwrap_or("").as_bytes());
    hasher.update(item.content.as_deref().unwrap_or("").as_bytes());
    hasher.update(item.summary.as_deref().unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}
